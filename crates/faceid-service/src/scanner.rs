//! Sequential scan of a video for the first matching face.

use crate::embedder::{FaceEmbedder, FaceEmbedding};
use crate::matcher::FaceMatch;
use crate::video::FrameSource;
use anyhow::Result;
use tracing::{debug, info, warn};

/// Terminal result of scanning one video
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionResult {
    /// No frame contained a detectable face
    NoFaceFound,
    /// Faces were found, none of them matched
    NoMatchFound,
    /// The first accepted match
    Matched(FaceMatch),
}

impl RecognitionResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoFaceFound => "no_face",
            Self::NoMatchFound => "no_match",
            Self::Matched(_) => "matched",
        }
    }
}

/// What a scan did, for logging and metrics
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub result: RecognitionResult,
    pub frames_scanned: u64,
    pub faces_embedded: u64,
}

pub struct FrameScanner<'a> {
    embedder: &'a dyn FaceEmbedder,
}

impl<'a> FrameScanner<'a> {
    pub fn new(embedder: &'a dyn FaceEmbedder) -> Self {
        Self { embedder }
    }

    /// Read frames in file order until `matcher` accepts a face or the stream ends.
    ///
    /// Only the first face of each frame is considered, and no frame after the
    /// matching one is decoded. A frame the embedder fails on is treated as a
    /// frame without a face.
    pub async fn scan<F>(&self, source: &mut dyn FrameSource, mut matcher: F) -> Result<ScanReport>
    where
        F: FnMut(&FaceEmbedding) -> Option<FaceMatch> + Send,
    {
        let mut frames_scanned = 0u64;
        let mut faces_embedded = 0u64;

        while let Some(frame) = source.next_frame().await? {
            frames_scanned += 1;
            telemetry::metrics::FACEID_FRAMES_SCANNED.inc();

            let embedding = match self.embedder.embed(&frame).await {
                Ok(Some(embedding)) => embedding,
                Ok(None) => {
                    record_embed("frame", "no_face");
                    continue;
                }
                Err(e) => {
                    warn!(frame = frames_scanned, error = %e, "embedding failed, skipping frame");
                    record_embed("frame", "error");
                    continue;
                }
            };
            faces_embedded += 1;
            record_embed("frame", "face");

            if let Some(found) = matcher(&embedding) {
                info!(
                    frame = frames_scanned,
                    identity = %found.identity,
                    distance = found.distance,
                    "face matched"
                );
                return Ok(ScanReport {
                    result: RecognitionResult::Matched(found),
                    frames_scanned,
                    faces_embedded,
                });
            }
            debug!(frame = frames_scanned, "face did not match any reference");
        }

        let result = if faces_embedded == 0 {
            RecognitionResult::NoFaceFound
        } else {
            RecognitionResult::NoMatchFound
        };

        Ok(ScanReport {
            result,
            frames_scanned,
            faces_embedded,
        })
    }
}

pub(crate) fn record_embed(source: &str, result: &str) {
    telemetry::metrics::FACEID_FACES_EMBEDDED
        .with_label_values(&[source, result])
        .inc();
}
