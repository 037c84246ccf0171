use crate::embedder::onnx::OnnxEmbedderConfig;
use crate::matcher::{MatchPolicy, DEFAULT_TOLERANCE};
use crate::reference::ReferencePolicy;
use anyhow::{bail, Context, Result};
use common::frame_extractor::DEFAULT_MAX_FRAME_PIXELS;
use reqwest::Url;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FaceIdConfig {
    /// Address to bind the HTTP server to
    pub bind_addr: String,

    /// Node ID for this instance, used in logs
    pub node_id: String,

    /// Reference directory listing (`GET`)
    pub directory_url: Url,

    /// Base URL reference image filenames are appended to
    pub image_base_url: Url,

    /// Face-ID login endpoint (`POST`)
    pub login_url: Url,

    /// Staging directory for uploaded videos
    pub upload_dir: PathBuf,

    /// Scratch root for downloaded reference images
    pub known_faces_dir: PathBuf,

    pub match_tolerance: f32,
    pub match_policy: MatchPolicy,
    pub reference_policy: ReferencePolicy,

    pub http_connect_timeout: Duration,
    pub http_timeout: Duration,

    /// Upper bound on the frame scan of one upload
    pub scan_timeout: Duration,

    /// Recognitions allowed to run at once; further uploads wait for a slot
    pub max_concurrent_recognitions: usize,

    /// Largest accepted request body
    pub max_upload_bytes: usize,

    /// Largest decoded frame, in pixels, a video may have
    pub max_frame_pixels: u64,

    pub embedder: OnnxEmbedderConfig,
}

impl FaceIdConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bind_addr = var("FACEID_ADDR", "0.0.0.0:5000");

        let node_id = lookup("NODE_ID").unwrap_or_else(|| {
            format!(
                "faceid-service-{}",
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
            )
        });

        let mut admin_base_url = Url::parse(&var("ADMIN_BASE_URL", "http://localhost:1010/"))
            .context("Invalid ADMIN_BASE_URL")?;
        // Joining relative paths needs a trailing slash on the base
        if !admin_base_url.path().ends_with('/') {
            let path = format!("{}/", admin_base_url.path());
            admin_base_url.set_path(&path);
        }
        let join = |key: &str, default: &str| -> Result<Url> {
            let path = var(key, default);
            admin_base_url
                .join(path.trim_start_matches('/'))
                .with_context(|| format!("Invalid {}", key))
        };

        let directory_url = join("REFERENCE_DIRECTORY_PATH", "admin/user-images")?;
        let image_base_url = join("REFERENCE_IMAGE_PATH", "uploads/image/")?;
        let login_url = join("LOGIN_PATH", "auth/login-faceid")?;

        let match_tolerance: f32 = parse(&lookup, "MATCH_TOLERANCE", DEFAULT_TOLERANCE)?;
        if !match_tolerance.is_finite() || match_tolerance < 0.0 {
            bail!("MATCH_TOLERANCE must be a finite, non-negative number");
        }

        let max_concurrent_recognitions: usize = parse(&lookup, "MAX_CONCURRENT_RECOGNITIONS", 4)?;
        if max_concurrent_recognitions == 0 {
            bail!("MAX_CONCURRENT_RECOGNITIONS must be at least 1");
        }

        let max_frame_pixels: u64 = parse(&lookup, "MAX_FRAME_PIXELS", DEFAULT_MAX_FRAME_PIXELS)?;
        if max_frame_pixels == 0 {
            bail!("MAX_FRAME_PIXELS must be at least 1");
        }

        let embedder = OnnxEmbedderConfig {
            detection_model_path: var("DETECTION_MODEL_PATH", "models/face_detector.onnx"),
            embedding_model_path: var("EMBEDDING_MODEL_PATH", "models/face_embedding.onnx"),
            execution_provider: var("FACE_EXECUTION_PROVIDER", "CPU"),
            ..OnnxEmbedderConfig::default()
        };

        Ok(Self {
            bind_addr,
            node_id,
            directory_url,
            image_base_url,
            login_url,
            upload_dir: PathBuf::from(var("UPLOAD_DIR", "uploads")),
            known_faces_dir: PathBuf::from(var("KNOWN_FACES_DIR", "known_faces")),
            match_tolerance,
            match_policy: parse(&lookup, "MATCH_POLICY", MatchPolicy::default())?,
            reference_policy: parse(&lookup, "REFERENCE_POLICY", ReferencePolicy::default())?,
            http_connect_timeout: Duration::from_secs(parse(&lookup, "HTTP_CONNECT_TIMEOUT_SECS", 3)?),
            http_timeout: Duration::from_secs(parse(&lookup, "HTTP_TIMEOUT_SECS", 10)?),
            scan_timeout: Duration::from_secs(parse(&lookup, "SCAN_TIMEOUT_SECS", 120)?),
            max_concurrent_recognitions,
            max_upload_bytes: parse(&lookup, "MAX_UPLOAD_BYTES", 100 * 1024 * 1024)?,
            max_frame_pixels,
            embedder,
        })
    }

    /// HTTP client shared by the directory and login clients
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.http_connect_timeout)
            .timeout(self.http_timeout)
            .build()
            .context("Failed to build HTTP client")
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<FaceIdConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FaceIdConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("NODE_ID", "test-node")]).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:5000");
        assert_eq!(config.node_id, "test-node");
        assert_eq!(config.directory_url.as_str(), "http://localhost:1010/admin/user-images");
        assert_eq!(config.image_base_url.as_str(), "http://localhost:1010/uploads/image/");
        assert_eq!(config.login_url.as_str(), "http://localhost:1010/auth/login-faceid");
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.known_faces_dir, PathBuf::from("known_faces"));
        assert_eq!(config.match_tolerance, 0.6);
        assert_eq!(config.match_policy, MatchPolicy::FirstWithinTolerance);
        assert_eq!(config.reference_policy, ReferencePolicy::FailOpen);
        assert_eq!(config.scan_timeout, Duration::from_secs(120));
        assert_eq!(config.max_concurrent_recognitions, 4);
        assert_eq!(config.max_upload_bytes, 104_857_600);
        assert_eq!(config.max_frame_pixels, 16_777_216);
        assert_eq!(config.embedder.execution_provider, "CPU");
    }

    #[test]
    fn test_admin_base_url_with_prefix() {
        let config = config(&[
            ("ADMIN_BASE_URL", "https://admin.internal:8443/api"),
            ("LOGIN_PATH", "/auth/login-faceid"),
        ])
        .unwrap();

        assert_eq!(
            config.directory_url.as_str(),
            "https://admin.internal:8443/api/admin/user-images"
        );
        assert_eq!(
            config.login_url.as_str(),
            "https://admin.internal:8443/api/auth/login-faceid"
        );
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("MATCH_TOLERANCE", "0.45"),
            ("MATCH_POLICY", "nearest"),
            ("REFERENCE_POLICY", "fail_closed"),
            ("SCAN_TIMEOUT_SECS", "30"),
            ("MAX_CONCURRENT_RECOGNITIONS", "1"),
            ("MAX_FRAME_PIXELS", "921600"),
        ])
        .unwrap();

        assert_eq!(config.match_tolerance, 0.45);
        assert_eq!(config.match_policy, MatchPolicy::Nearest);
        assert_eq!(config.reference_policy, ReferencePolicy::FailClosed);
        assert_eq!(config.scan_timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_recognitions, 1);
        assert_eq!(config.max_frame_pixels, 921_600);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config(&[("MATCH_TOLERANCE", "-0.1")]).is_err());
        assert!(config(&[("MATCH_TOLERANCE", "NaN")]).is_err());
        assert!(config(&[("MATCH_TOLERANCE", "close")]).is_err());
        assert!(config(&[("MATCH_POLICY", "best")]).is_err());
        assert!(config(&[("MAX_CONCURRENT_RECOGNITIONS", "0")]).is_err());
        assert!(config(&[("MAX_FRAME_PIXELS", "0")]).is_err());
        assert!(config(&[("MAX_FRAME_PIXELS", "large")]).is_err());
        assert!(config(&[("ADMIN_BASE_URL", "not a url")]).is_err());
    }

    #[test]
    fn test_http_client_builds() {
        let config = config(&[]).unwrap();
        assert!(config.http_client().is_ok());
    }
}
