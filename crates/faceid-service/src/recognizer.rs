//! One recognition request from staged video to login.

use crate::embedder::FaceEmbedder;
use crate::error::RecognitionError;
use crate::login::LoginClient;
use crate::matcher::{FaceMatch, MatchEngine};
use crate::reference::ReferenceSetLoader;
use crate::scanner::{FrameScanner, RecognitionResult, ScanReport};
use crate::video::{StagedUpload, VideoOpener};
use common::recognition::LoginSuccessResponse;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub struct Recognizer {
    references: ReferenceSetLoader,
    embedder: Arc<dyn FaceEmbedder>,
    opener: Arc<dyn VideoOpener>,
    login: Arc<dyn LoginClient>,
    engine: MatchEngine,
    scan_timeout: Duration,
}

impl Recognizer {
    pub fn new(
        references: ReferenceSetLoader,
        embedder: Arc<dyn FaceEmbedder>,
        opener: Arc<dyn VideoOpener>,
        login: Arc<dyn LoginClient>,
        engine: MatchEngine,
        scan_timeout: Duration,
    ) -> Self {
        Self {
            references,
            embedder,
            opener,
            login,
            engine,
            scan_timeout,
        }
    }

    /// Recognize the face in `upload` and log its owner in.
    ///
    /// The staged file is deleted before the login call is made, and on every
    /// early return.
    pub async fn recognize(
        &self,
        upload: StagedUpload,
    ) -> Result<LoginSuccessResponse, RecognitionError> {
        let references = self
            .references
            .load()
            .await
            .map_err(|e| RecognitionError::DirectoryUnavailable(format!("{:#}", e)))?;

        let mut source = self.opener.open(upload.path()).await.map_err(|e| {
            let reason = format!("{:#}", e);
            warn!(path = %upload.path().display(), error = %reason, "cannot open uploaded video");
            RecognitionError::VideoUnreadable(reason)
        })?;

        let scanner = FrameScanner::new(self.embedder.as_ref());
        let engine = self.engine;
        let start = Instant::now();
        let scanned = tokio::time::timeout(
            self.scan_timeout,
            scanner.scan(source.as_mut(), |query| engine.find(query, &references)),
        )
        .await;
        let elapsed = start.elapsed().as_secs_f64();

        // Stop the decoder and remove the video before talking to the login service
        drop(source);
        drop(upload);

        let report = match scanned {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                observe_scan("error", elapsed);
                let reason = format!("{:#}", e);
                error!(error = %reason, "video decoding failed mid-scan");
                return Err(RecognitionError::Internal(reason));
            }
            Err(_) => {
                observe_scan("timeout", elapsed);
                warn!(timeout_secs = self.scan_timeout.as_secs(), "video scan timed out");
                return Err(RecognitionError::ScanTimedOut);
            }
        };
        observe_scan(report.result.label(), elapsed);

        let ScanReport {
            result,
            frames_scanned,
            faces_embedded,
        } = report;
        info!(
            frames_scanned,
            faces_embedded,
            references = references.len(),
            result = result.label(),
            "video scan finished"
        );

        match result {
            RecognitionResult::Matched(found) => self.log_in(found).await,
            RecognitionResult::NoFaceFound | RecognitionResult::NoMatchFound => {
                Err(RecognitionError::NoRecognizedFace)
            }
        }
    }

    async fn log_in(&self, found: FaceMatch) -> Result<LoginSuccessResponse, RecognitionError> {
        match self.login.login(&found.identity).await {
            Ok(body) if is_empty_login_body(&body) => {
                record_login("empty");
                Err(RecognitionError::LoginFailed {
                    identity: found.identity,
                    reason: format!("login service returned an empty body: {}", body),
                })
            }
            Ok(body) => {
                record_login("success");
                info!(identity = %found.identity, "user logged in");
                Ok(LoginSuccessResponse::new(found.identity, body))
            }
            Err(e) => {
                record_login("failure");
                let reason = format!("{:#}", e);
                error!(identity = %found.identity, error = %reason, "login call failed");
                Err(RecognitionError::LoginFailed {
                    identity: found.identity,
                    reason,
                })
            }
        }
    }
}

/// `null`, `false`, zero and empty strings, arrays or objects carry no session
fn is_empty_login_body(body: &serde_json::Value) -> bool {
    use serde_json::Value;
    match body {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

fn observe_scan(result: &str, elapsed: f64) {
    telemetry::metrics::FACEID_SCAN_DURATION
        .with_label_values(&[result])
        .observe(elapsed);
}

fn record_login(status: &str) {
    telemetry::metrics::FACEID_LOGIN_CALLS
        .with_label_values(&[status])
        .inc();
}
