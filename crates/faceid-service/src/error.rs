use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::recognition::{
    MessageResponse, MSG_DIRECTORY_UNAVAILABLE, MSG_LOGIN_FAILED, MSG_NO_RECOGNIZED_FACE,
    MSG_NO_VIDEO, MSG_PROCESSING_FAILED, MSG_SCAN_TIMED_OUT, MSG_UPLOAD_TOO_LARGE,
    MSG_VIDEO_UNREADABLE,
};
use thiserror::Error;

/// Every way a recognition request can end without a login
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("no video file provided")]
    NoVideo,

    #[error("upload exceeds the body limit")]
    UploadTooLarge,

    #[error("error opening video file: {0}")]
    VideoUnreadable(String),

    #[error("no recognized face found")]
    NoRecognizedFace,

    #[error("failed to log in {identity}: {reason}")]
    LoginFailed { identity: String, reason: String },

    #[error("reference directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("video processing timed out")]
    ScanTimedOut,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RecognitionError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoVideo | Self::VideoUnreadable(_) => StatusCode::BAD_REQUEST,
            Self::UploadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NoRecognizedFace => StatusCode::NOT_FOUND,
            Self::LoginFailed { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DirectoryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ScanTimedOut => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Client-facing message; details stay in the logs
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoVideo => MSG_NO_VIDEO,
            Self::UploadTooLarge => MSG_UPLOAD_TOO_LARGE,
            Self::VideoUnreadable(_) => MSG_VIDEO_UNREADABLE,
            Self::NoRecognizedFace => MSG_NO_RECOGNIZED_FACE,
            Self::LoginFailed { .. } => MSG_LOGIN_FAILED,
            Self::DirectoryUnavailable(_) => MSG_DIRECTORY_UNAVAILABLE,
            Self::ScanTimedOut => MSG_SCAN_TIMED_OUT,
            Self::Internal(_) => MSG_PROCESSING_FAILED,
        }
    }

    /// Metric label for the outcome
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::NoVideo => "no_video",
            Self::UploadTooLarge => "too_large",
            Self::VideoUnreadable(_) => "invalid_video",
            Self::NoRecognizedFace => "no_match",
            Self::LoginFailed { .. } => "login_failed",
            Self::DirectoryUnavailable(_) => "directory_unavailable",
            Self::ScanTimedOut => "timed_out",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for RecognitionError {
    fn into_response(self) -> Response {
        (self.status(), Json(MessageResponse::new(self.message()))).into_response()
    }
}

impl From<anyhow::Error> for RecognitionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", err))
    }
}
