//! Contracts for the admin service that owns user identities.
//!
//! The admin service publishes the reference directory (which user owns which
//! face image) and accepts face-ID login requests for a recognized user.

use serde::{Deserialize, Serialize};

/// Status code the directory envelope carries on success
pub const DIRECTORY_STATUS_OK: u16 = 200;

/// Envelope returned by the reference directory endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEnvelope {
    /// Application-level status code (200 on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// Directory records; absent on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<DirectoryRecord>>,
}

impl DirectoryEnvelope {
    pub fn ok(records: Vec<DirectoryRecord>) -> Self {
        Self {
            status_code: Some(DIRECTORY_STATUS_OK),
            data: Some(records),
        }
    }

    /// Records of a successful envelope. Anything else yields nothing.
    pub fn into_records(self) -> Vec<DirectoryRecord> {
        match (self.status_code, self.data) {
            (Some(DIRECTORY_STATUS_OK), Some(records)) => records,
            _ => Vec::new(),
        }
    }
}

/// A single user entry in the reference directory.
///
/// Both fields are optional on the wire; records missing either one are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// Server-side path of the reference image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Identity used to trigger the login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl DirectoryRecord {
    pub fn new(image: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            email: Some(email.into()),
        }
    }

    /// Filename of the reference image: the last segment of `image`.
    ///
    /// Returns `None` for missing or blank fields and for names that would
    /// escape the download directory.
    pub fn image_filename(&self) -> Option<&str> {
        let image = self.image.as_deref()?.trim();
        let name = image.rsplit(|c| c == '/' || c == '\\').next()?;
        match name {
            "" | "." | ".." => None,
            name => Some(name),
        }
    }

    pub fn identity(&self) -> Option<&str> {
        self.email.as_deref().filter(|email| !email.trim().is_empty())
    }
}

/// Body of the face-ID login request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parses_admin_payload() {
        let payload = serde_json::json!({
            "statusCode": 200,
            "data": [
                { "image": "/var/uploads/image/alice.jpg", "email": "alice@example.com" },
                { "image": "bob.png" },
                { "email": "carol@example.com", "extra": true }
            ]
        });

        let envelope: DirectoryEnvelope = serde_json::from_value(payload).unwrap();
        let records = envelope.into_records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].image_filename(), Some("alice.jpg"));
        assert_eq!(records[0].identity(), Some("alice@example.com"));
        assert_eq!(records[1].identity(), None);
        assert_eq!(records[2].image_filename(), None);
    }

    #[test]
    fn test_envelope_without_success_status_is_empty() {
        let failed: DirectoryEnvelope =
            serde_json::from_value(serde_json::json!({ "statusCode": 500, "data": [] })).unwrap();
        assert!(failed.into_records().is_empty());

        let no_data: DirectoryEnvelope =
            serde_json::from_value(serde_json::json!({ "statusCode": 200 })).unwrap();
        assert!(no_data.into_records().is_empty());
    }

    #[test]
    fn test_image_filename_rejects_traversal() {
        assert_eq!(DirectoryRecord::new("a\\b\\face.jpg", "x").image_filename(), Some("face.jpg"));
        assert_eq!(DirectoryRecord::new("images/..", "x").image_filename(), None);
        assert_eq!(DirectoryRecord::new("images/", "x").image_filename(), None);
        assert_eq!(DirectoryRecord::new("   ", "x").image_filename(), None);
    }
}
