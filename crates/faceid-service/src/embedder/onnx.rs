/// Face embedder backed by ONNX Runtime
///
/// Two models are loaded once at startup and shared by every request:
/// 1. Detection: locates faces in the frame (YOLO-style `[1, 5, N]` output)
/// 2. Embedding: turns the aligned crop of the first detected face into a vector
use super::{FaceEmbedder, FaceEmbedding};
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{imageops, RgbImage};
use ndarray::{Array, IxDyn};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnnxEmbedderConfig {
    /// Path to the face detection ONNX model file
    pub detection_model_path: String,

    /// Path to the face embedding ONNX model file
    pub embedding_model_path: String,

    /// Confidence threshold for face detections (0.0 to 1.0)
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,

    /// IoU (Intersection over Union) threshold for NMS
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Detection model input size (width and height)
    #[serde(default = "default_detection_input_size")]
    pub detection_input_size: u32,

    /// Embedding model input size (width and height)
    #[serde(default = "default_embedding_input_size")]
    pub embedding_input_size: u32,

    /// Extra context around the detected box, as a fraction of its longer side
    #[serde(default = "default_face_margin")]
    pub face_margin: f32,

    /// L2-normalize embeddings. Off for models whose tolerance is tuned on raw
    /// distances (0.6 for dlib-style 128-d encoders).
    #[serde(default)]
    pub normalize_embeddings: bool,

    /// Execution provider preference (CPU, CUDA, TensorRT)
    #[serde(default = "default_execution_provider")]
    pub execution_provider: String,

    /// GPU device ID (0, 1, 2, etc.)
    #[serde(default)]
    pub device_id: i32,

    /// Number of intra-operation threads
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    /// Number of inter-operation threads
    #[serde(default = "default_inter_threads")]
    pub inter_threads: usize,
}

fn default_confidence() -> f32 {
    0.6
}

fn default_iou_threshold() -> f32 {
    0.4
}

fn default_detection_input_size() -> u32 {
    640
}

fn default_embedding_input_size() -> u32 {
    150
}

fn default_face_margin() -> f32 {
    0.25
}

fn default_execution_provider() -> String {
    "CPU".to_string()
}

fn default_intra_threads() -> usize {
    4
}

fn default_inter_threads() -> usize {
    1
}

impl Default for OnnxEmbedderConfig {
    fn default() -> Self {
        Self {
            detection_model_path: "models/face_detector.onnx".to_string(),
            embedding_model_path: "models/face_embedding.onnx".to_string(),
            confidence_threshold: default_confidence(),
            iou_threshold: default_iou_threshold(),
            detection_input_size: default_detection_input_size(),
            embedding_input_size: default_embedding_input_size(),
            face_margin: default_face_margin(),
            normalize_embeddings: false,
            execution_provider: default_execution_provider(),
            device_id: 0,
            intra_threads: default_intra_threads(),
            inter_threads: default_inter_threads(),
        }
    }
}

/// Pixel-space face box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A face box with its confidence and its position in the detector output
#[derive(Debug, Clone, Copy, PartialEq)]
struct Detection {
    bbox: FaceBox,
    confidence: f32,
    rank: usize,
}

pub struct OnnxFaceEmbedder {
    config: OnnxEmbedderConfig,
    detection_session: Mutex<Session>,
    embedding_session: Mutex<Session>,
    execution_provider: String,
}

impl OnnxFaceEmbedder {
    /// Load both models. Missing model files are a startup error.
    pub fn load(config: OnnxEmbedderConfig) -> Result<Self> {
        for path in [&config.detection_model_path, &config.embedding_model_path] {
            if !Path::new(path).is_file() {
                anyhow::bail!("model file not found: {}", path);
            }
        }

        let (detection_session, execution_provider) =
            create_session(&config, &config.detection_model_path)?;
        tracing::info!(
            path = %config.detection_model_path,
            provider = %execution_provider,
            device = config.device_id,
            "initialized face detection model"
        );

        let (embedding_session, embedding_provider) =
            create_session(&config, &config.embedding_model_path)?;
        tracing::info!(
            path = %config.embedding_model_path,
            provider = %embedding_provider,
            "initialized face embedding model"
        );

        Ok(Self {
            config,
            detection_session: Mutex::new(detection_session),
            embedding_session: Mutex::new(embedding_session),
            execution_provider,
        })
    }

    pub fn execution_provider(&self) -> &str {
        &self.execution_provider
    }

    /// Locate faces, in detector output order
    async fn detect(&self, img: &RgbImage) -> Result<Vec<FaceBox>> {
        let input_array = to_nchw(img, self.config.detection_input_size, |v| v / 255.0);
        let input_tensor = Value::from_array(input_array)?;

        let output = {
            let mut session = self.detection_session.lock().await;
            let outputs = session.run(ort::inputs![input_tensor])?;
            let output_value = outputs
                .get("output0")
                .or_else(|| outputs.get("output"))
                .or_else(|| outputs.get("boxes"))
                .context("No detection output tensor found")?;
            let (shape, data) = output_value.try_extract_tensor::<f32>()?;
            let shape_usize: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
            Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec())?
        };

        let detections = decode_detections(
            &output,
            self.config.confidence_threshold,
            img.width() as f32 / self.config.detection_input_size as f32,
            img.height() as f32 / self.config.detection_input_size as f32,
            (img.width(), img.height()),
        )?;

        Ok(nms(detections, self.config.iou_threshold)
            .into_iter()
            .map(|d| d.bbox)
            .collect())
    }

    /// Extract the embedding vector of an aligned face crop
    async fn extract_embedding(&self, face: &RgbImage) -> Result<FaceEmbedding> {
        let input_array = to_nchw(face, self.config.embedding_input_size, |v| v / 127.5 - 1.0);
        let input_tensor = Value::from_array(input_array)?;

        let mut embedding = {
            let mut session = self.embedding_session.lock().await;
            let outputs = session.run(ort::inputs![input_tensor])?;
            let output_value = outputs
                .get("output")
                .or_else(|| outputs.get("output0"))
                .or_else(|| outputs.get("embedding"))
                .context("No embedding output tensor found")?;
            let (shape, data) = output_value.try_extract_tensor::<f32>()?;

            // Expected shape: [batch, embedding_dim]
            let dims: &[i64] = shape.as_ref();
            if dims.len() != 2 || dims[0] < 1 || dims[1] < 1 {
                anyhow::bail!("unexpected embedding output shape {:?}", dims);
            }
            let embedding_dim = dims[1] as usize;
            data.iter().take(embedding_dim).copied().collect::<Vec<f32>>()
        };

        if self.config.normalize_embeddings {
            let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for val in &mut embedding {
                    *val /= norm;
                }
            }
        }

        Ok(FaceEmbedding::from(embedding))
    }
}

#[async_trait]
impl FaceEmbedder for OnnxFaceEmbedder {
    fn name(&self) -> &'static str {
        "onnx"
    }

    async fn embed(&self, image: &RgbImage) -> Result<Option<FaceEmbedding>> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(None);
        }

        let faces = self.detect(image).await?;
        // First detection wins; no size or confidence preference
        let Some(face) = faces.first() else {
            return Ok(None);
        };

        let aligned = align_face(image, face, self.config.face_margin);
        let embedding = self.extract_embedding(&aligned).await?;
        Ok(Some(embedding))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Resize to `size`x`size` and lay out as normalized NCHW float input
fn to_nchw(img: &RgbImage, size: u32, normalize: impl Fn(f32) -> f32) -> Array<f32, IxDyn> {
    let resized = imageops::resize(img, size, size, imageops::FilterType::Triangle);
    let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            input[[0, channel, y as usize, x as usize]] = normalize(pixel[channel] as f32);
        }
    }

    input
}

/// Decode a `[batch, 5, num_predictions]` tensor (cx, cy, w, h, confidence)
fn decode_detections(
    output: &Array<f32, IxDyn>,
    confidence_threshold: f32,
    scale_x: f32,
    scale_y: f32,
    (image_width, image_height): (u32, u32),
) -> Result<Vec<Detection>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] < 1 || shape[1] < 5 {
        anyhow::bail!("unexpected detection output shape {:?}", shape);
    }

    let mut detections = Vec::new();
    for i in 0..shape[2] {
        let confidence = output[[0, 4, i]];
        if !(confidence >= confidence_threshold) {
            continue;
        }

        let cx = output[[0, 0, i]];
        let cy = output[[0, 1, i]];
        let w = output[[0, 2, i]];
        let h = output[[0, 3, i]];

        let x = ((cx - w / 2.0) * scale_x).max(0.0) as u32;
        let y = ((cy - h / 2.0) * scale_y).max(0.0) as u32;
        if x >= image_width || y >= image_height {
            continue;
        }
        let width = ((w * scale_x) as u32).min(image_width - x);
        let height = ((h * scale_y) as u32).min(image_height - y);
        if width == 0 || height == 0 {
            continue;
        }

        detections.push(Detection {
            bbox: FaceBox {
                x,
                y,
                width,
                height,
            },
            confidence,
            rank: detections.len(),
        });
    }

    Ok(detections)
}

/// Non-Maximum Suppression that keeps the survivors in detector order
fn nms(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut by_confidence = detections;
    by_confidence.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in by_confidence {
        if keep
            .iter()
            .all(|kept| calculate_iou(&kept.bbox, &candidate.bbox) < iou_threshold)
        {
            keep.push(candidate);
        }
    }

    keep.sort_by_key(|d| d.rank);
    keep
}

/// Calculate Intersection over Union (IoU)
fn calculate_iou(box1: &FaceBox, box2: &FaceBox) -> f32 {
    let x1 = box1.x.max(box2.x);
    let y1 = box1.y.max(box2.y);
    let x2 = (box1.x + box1.width).min(box2.x + box2.width);
    let y2 = (box1.y + box1.height).min(box2.y + box2.height);

    let intersection = if x2 > x1 && y2 > y1 {
        ((x2 - x1) * (y2 - y1)) as f32
    } else {
        0.0
    };

    let area1 = (box1.width * box1.height) as f32;
    let area2 = (box2.width * box2.height) as f32;
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Square crop centred on the face box, widened by `margin`, clamped to the image
fn align_face(img: &RgbImage, face: &FaceBox, margin: f32) -> RgbImage {
    let side = (face.width.max(face.height) as f32 * (1.0 + margin.max(0.0))) as u32;
    let side = side.clamp(1, img.width().min(img.height()).max(1));

    let cx = face.x + face.width / 2;
    let cy = face.y + face.height / 2;
    let x = cx.saturating_sub(side / 2).min(img.width().saturating_sub(side));
    let y = cy.saturating_sub(side / 2).min(img.height().saturating_sub(side));

    imageops::crop_imm(img, x, y, side, side).to_image()
}

/// Create ONNX session with execution provider fallback
fn create_session(config: &OnnxEmbedderConfig, model_path: &str) -> Result<(Session, String)> {
    match config.execution_provider.to_uppercase().as_str() {
        "TENSORRT" => {
            tracing::info!("Attempting TensorRT for {}", model_path);
            let result = Session::builder()
                .context("Failed to create session builder")?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .context("Failed to set optimization level")?
                .with_intra_threads(config.intra_threads)
                .context("Failed to set intra threads")?
                .with_inter_threads(config.inter_threads)
                .context("Failed to set inter threads")?
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CPUExecutionProvider::default().build(),
                ])
                .context("Failed to set execution providers")?
                .commit_from_file(model_path);

            match result {
                Ok(session) => Ok((session, "TensorRT".to_string())),
                Err(e) => {
                    tracing::warn!("TensorRT failed, trying CUDA: {}", e);
                    try_cuda(config, model_path)
                }
            }
        }
        "CUDA" => try_cuda(config, model_path),
        _ => try_cpu(config, model_path),
    }
}

fn try_cuda(config: &OnnxEmbedderConfig, model_path: &str) -> Result<(Session, String)> {
    tracing::info!("Attempting CUDA for {}", model_path);
    let result = Session::builder()
        .context("Failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(config.intra_threads)
        .context("Failed to set intra threads")?
        .with_inter_threads(config.inter_threads)
        .context("Failed to set inter threads")?
        .with_execution_providers([
            CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build(),
            CPUExecutionProvider::default().build(),
        ])
        .context("Failed to set execution providers")?
        .commit_from_file(model_path);

    match result {
        Ok(session) => Ok((session, "CUDA".to_string())),
        Err(e) => {
            tracing::warn!("CUDA failed, using CPU: {}", e);
            try_cpu(config, model_path)
        }
    }
}

fn try_cpu(config: &OnnxEmbedderConfig, model_path: &str) -> Result<(Session, String)> {
    let session = Session::builder()
        .context("Failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(config.intra_threads)
        .context("Failed to set intra threads")?
        .with_inter_threads(config.inter_threads)
        .context("Failed to set inter threads")?
        .commit_from_file(model_path)
        .context("Failed to load model from file")?;
    Ok((session, "CPU".to_string()))
}
