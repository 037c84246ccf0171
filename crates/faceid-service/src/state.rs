use crate::config::FaceIdConfig;
use crate::directory::{DirectoryClient, HttpDirectoryClient};
use crate::embedder::FaceEmbedder;
use crate::login::{HttpLoginClient, LoginClient};
use crate::matcher::MatchEngine;
use crate::recognizer::Recognizer;
use crate::reference::ReferenceSetLoader;
use crate::video::{FfmpegVideoOpener, VideoOpener};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

#[derive(Clone)]
pub struct FaceIdState {
    inner: Arc<FaceIdStateInner>,
}

struct FaceIdStateInner {
    config: FaceIdConfig,
    embedder: Arc<dyn FaceEmbedder>,
    recognizer: Recognizer,
    workers: Arc<Semaphore>,
}

impl FaceIdState {
    pub fn new(
        config: FaceIdConfig,
        embedder: Arc<dyn FaceEmbedder>,
        directory: Arc<dyn DirectoryClient>,
        login: Arc<dyn LoginClient>,
        opener: Arc<dyn VideoOpener>,
    ) -> Self {
        let references = ReferenceSetLoader::new(
            directory,
            embedder.clone(),
            config.known_faces_dir.clone(),
            config.reference_policy,
        );
        let recognizer = Recognizer::new(
            references,
            embedder.clone(),
            opener,
            login,
            MatchEngine::new(config.match_tolerance, config.match_policy),
            config.scan_timeout,
        );
        let workers = Arc::new(Semaphore::new(config.max_concurrent_recognitions));

        Self {
            inner: Arc::new(FaceIdStateInner {
                config,
                embedder,
                recognizer,
                workers,
            }),
        }
    }

    /// Wire the HTTP clients and the ffmpeg decoder around `embedder`
    pub fn from_config(config: FaceIdConfig, embedder: Arc<dyn FaceEmbedder>) -> Result<Self> {
        let client = config.http_client()?;
        let directory = Arc::new(HttpDirectoryClient::new(
            config.directory_url.clone(),
            config.image_base_url.clone(),
            client.clone(),
        ));
        let login = Arc::new(HttpLoginClient::new(config.login_url.clone(), client));
        let opener = Arc::new(FfmpegVideoOpener::new(config.max_frame_pixels));
        Ok(Self::new(config, embedder, directory, login, opener))
    }

    pub fn config(&self) -> &FaceIdConfig {
        &self.inner.config
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn upload_dir(&self) -> &Path {
        &self.inner.config.upload_dir
    }

    pub fn embedder(&self) -> &Arc<dyn FaceEmbedder> {
        &self.inner.embedder
    }

    pub fn recognizer(&self) -> &Recognizer {
        &self.inner.recognizer
    }

    /// Wait for a recognition slot. Requests queue here instead of being rejected.
    pub async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit> {
        if self.inner.workers.available_permits() == 0 {
            debug!("all recognition workers busy, waiting");
        }
        Ok(self.inner.workers.clone().acquire_owned().await?)
    }

    pub fn available_workers(&self) -> usize {
        self.inner.workers.available_permits()
    }

    /// Called once the shutdown signal arrives. In-flight and queued
    /// recognitions are drained by the server, not cancelled.
    pub fn shutdown(&self) {
        let busy = self
            .inner
            .config
            .max_concurrent_recognitions
            .saturating_sub(self.available_workers());
        info!(node_id = %self.node_id(), busy_workers = busy, "draining recognitions");
    }
}
