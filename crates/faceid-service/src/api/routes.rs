use crate::error::RecognitionError;
use crate::state::FaceIdState;
use crate::video::StagedUpload;
use anyhow::Context;
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use common::recognition::LoginSuccessResponse;
use serde_json::json;
use std::path::Path;
use telemetry::CorrelationId;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};

/// Multipart field carrying the video
pub const VIDEO_FIELD: &str = "video";

/// Recognize the face in an uploaded video and log its owner in
pub async fn upload_video(
    State(state): State<FaceIdState>,
    correlation: Option<Extension<CorrelationId>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<LoginSuccessResponse>, RecognitionError> {
    let correlation_id = correlation
        .map(|Extension(id)| id)
        .unwrap_or_else(CorrelationId::generate);
    let span = info_span!("upload", correlation_id = %correlation_id);

    let result = handle_upload(&state, multipart).instrument(span.clone()).await;

    let _entered = span.enter();
    match &result {
        Ok(response) => {
            record_outcome("logged_in");
            info!(email = %response.email, "face-ID login completed");
        }
        Err(e) => {
            record_outcome(e.outcome());
            info!(status = e.status().as_u16(), error = %e, "face-ID login rejected");
        }
    }
    result.map(Json)
}

async fn handle_upload(
    state: &FaceIdState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<LoginSuccessResponse, RecognitionError> {
    let mut multipart = multipart.map_err(|e| {
        debug!(error = %e, "request body is not multipart");
        RecognitionError::NoVideo
    })?;

    let upload = stage_video(state.upload_dir(), &mut multipart)
        .await?
        .ok_or(RecognitionError::NoVideo)?;

    let _permit = state.acquire_worker().await?;
    let _active = ActiveRecognition::start();

    state.recognizer().recognize(upload).await
}

/// Stream the first `video` file part to the staging directory
async fn stage_video(
    dir: &Path,
    multipart: &mut Multipart,
) -> Result<Option<StagedUpload>, RecognitionError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }
        // Plain form values are not uploads
        if field.file_name().is_none() {
            debug!("ignoring video field without a file name");
            continue;
        }

        let (staged, mut file) = StagedUpload::create(dir, field.file_name()).await?;
        let mut bytes = 0usize;
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            file.write_all(&chunk)
                .await
                .context("failed to write staged upload")?;
            bytes += chunk.len();
        }
        file.flush().await.context("failed to flush staged upload")?;

        debug!(path = %staged.path().display(), bytes, "video staged");
        return Ok(Some(staged));
    }

    Ok(None)
}

fn multipart_error(err: MultipartError) -> RecognitionError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!(error = %err, "upload rejected by body limit");
        RecognitionError::UploadTooLarge
    } else {
        debug!(error = %err, "malformed multipart body");
        RecognitionError::NoVideo
    }
}

fn record_outcome(outcome: &str) {
    telemetry::metrics::FACEID_RECOGNITIONS
        .with_label_values(&[outcome])
        .inc();
}

/// Tracks a recognition holding a worker permit, including cancelled requests
struct ActiveRecognition;

impl ActiveRecognition {
    fn start() -> Self {
        telemetry::metrics::FACEID_ACTIVE_RECOGNITIONS.inc();
        Self
    }
}

impl Drop for ActiveRecognition {
    fn drop(&mut self) {
        telemetry::metrics::FACEID_ACTIVE_RECOGNITIONS.dec();
    }
}

/// Health check endpoint
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "faceid-service"
        })),
    )
}

/// Readiness check endpoint
pub async fn readyz(State(state): State<FaceIdState>) -> impl IntoResponse {
    let embedder = state.embedder();
    let ready = match embedder.health_check().await {
        Ok(healthy) => healthy,
        Err(e) => {
            warn!(embedder = embedder.name(), error = %e, "embedder health check failed");
            false
        }
    };

    let body = Json(json!({
        "status": if ready { "ready" } else { "not ready" },
        "embedder": embedder.name(),
        "available_workers": state.available_workers(),
    }));

    if ready {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics() -> impl IntoResponse {
    match telemetry::metrics::render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics".to_string(),
            )
        }
    }
}
