pub mod mock;
pub mod onnx;

use anyhow::Result;
use async_trait::async_trait;
use image::RgbImage;
use std::sync::Arc;

/// Face embedding vector produced by the embedding model.
///
/// Immutable once computed; carries no identity until matched.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEmbedding {
    values: Arc<[f32]>,
}

impl FaceEmbedding {
    pub fn new(values: impl Into<Arc<[f32]>>) -> Self {
        Self {
            values: values.into(),
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean (L2) distance to another embedding.
    ///
    /// Embeddings of different dimensionality come from different models and
    /// are infinitely far apart.
    pub fn distance(&self, other: &FaceEmbedding) -> f32 {
        if self.len() != other.len() {
            return f32::INFINITY;
        }

        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for FaceEmbedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Face detector + embedding model.
///
/// Implementations hold their models for the lifetime of the process and are
/// shared read-only between requests.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    /// Short identifier used in logs and metrics
    fn name(&self) -> &'static str;

    /// Embed the first face the detector reports in `image`.
    ///
    /// `Ok(None)` means no face was found, which is not an error.
    async fn embed(&self, image: &RgbImage) -> Result<Option<FaceEmbedding>>;

    /// Health check - verify the models are usable
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
