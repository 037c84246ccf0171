//! Response contracts of the face-ID upload endpoint.

use serde::{Deserialize, Serialize};

pub const MSG_NO_VIDEO: &str = "No video file provided";
pub const MSG_VIDEO_UNREADABLE: &str = "Error opening video file";
pub const MSG_NO_RECOGNIZED_FACE: &str = "No recognized face found";
pub const MSG_LOGIN_SUCCEEDED: &str = "User logged in successfully";
pub const MSG_LOGIN_FAILED: &str = "Failed to log in user";
pub const MSG_DIRECTORY_UNAVAILABLE: &str = "Reference directory unavailable";
pub const MSG_SCAN_TIMED_OUT: &str = "Video processing timed out";
pub const MSG_PROCESSING_FAILED: &str = "Failed to process video";
pub const MSG_UPLOAD_TOO_LARGE: &str = "Video file too large";

/// Body returned for every non-success outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Body returned when a face was recognized and the login call succeeded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginSuccessResponse {
    pub message: String,
    pub email: String,
    /// Body of the upstream login response, forwarded verbatim
    pub login_response: serde_json::Value,
}

impl LoginSuccessResponse {
    pub fn new(email: impl Into<String>, login_response: serde_json::Value) -> Self {
        Self {
            message: MSG_LOGIN_SUCCEEDED.to_string(),
            email: email.into(),
            login_response,
        }
    }
}
