/// Scripted embedder for testing and demonstration purposes
use super::{FaceEmbedder, FaceEmbedding};
use anyhow::Result;
use async_trait::async_trait;
use image::RgbImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Embedder that "recognizes" images by the color of their top-left pixel.
///
/// Every color registered with [`ScriptedEmbedder::with_face`] stands for one
/// face; any other color is an image without a face.
#[derive(Debug, Default)]
pub struct ScriptedEmbedder {
    faces: HashMap<[u8; 3], FaceEmbedding>,
    failing: Vec<[u8; 3]>,
    calls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Images whose top-left pixel is `pixel` contain a face with `embedding`
    pub fn with_face(mut self, pixel: [u8; 3], embedding: impl Into<FaceEmbedding>) -> Self {
        self.faces.insert(pixel, embedding.into());
        self
    }

    /// Images whose top-left pixel is `pixel` make the model fail
    pub fn with_failure(mut self, pixel: [u8; 3]) -> Self {
        self.failing.push(pixel);
        self
    }

    /// Number of `embed` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceEmbedder for ScriptedEmbedder {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn embed(&self, image: &RgbImage) -> Result<Option<FaceEmbedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let Some(pixel) = image.get_pixel_checked(0, 0) else {
            return Ok(None);
        };
        if self.failing.contains(&pixel.0) {
            anyhow::bail!("scripted model failure for pixel {:?}", pixel.0);
        }

        Ok(self.faces.get(&pixel.0).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[tokio::test]
    async fn test_scripted_faces() {
        let embedder = ScriptedEmbedder::new()
            .with_face([10, 10, 10], vec![1.0, 0.0])
            .with_failure([99, 99, 99]);

        let face = RgbImage::from_pixel(4, 4, Rgb([10, 10, 10]));
        let blank = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let broken = RgbImage::from_pixel(4, 4, Rgb([99, 99, 99]));

        let embedding = embedder.embed(&face).await.unwrap();
        assert_eq!(embedding, Some(FaceEmbedding::from(vec![1.0, 0.0])));
        assert_eq!(embedder.embed(&blank).await.unwrap(), None);
        assert_eq!(embedder.embed(&RgbImage::new(0, 0)).await.unwrap(), None);
        assert!(embedder.embed(&broken).await.is_err());
        assert_eq!(embedder.calls(), 4);
    }
}
