//! Per-request construction of the reference set from the admin directory.

use crate::directory::DirectoryClient;
use crate::embedder::{FaceEmbedder, FaceEmbedding};
use crate::matcher::ReferenceEntry;
use crate::scanner::record_embed;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What to do when the reference directory cannot be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferencePolicy {
    /// Carry on with an empty reference set (every scan ends without a match)
    #[default]
    FailOpen,
    /// Abort the request
    FailClosed,
}

impl FromStr for ReferencePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(Self::FailOpen),
            "fail_closed" | "closed" => Ok(Self::FailClosed),
            other => Err(anyhow!("unknown reference policy '{}'", other)),
        }
    }
}

/// Result of encoding one directory record
enum RecordOutcome {
    Loaded(FaceEmbedding),
    NoFace,
}

pub struct ReferenceSetLoader {
    directory: Arc<dyn DirectoryClient>,
    embedder: Arc<dyn FaceEmbedder>,
    cache_root: PathBuf,
    policy: ReferencePolicy,
}

impl ReferenceSetLoader {
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        embedder: Arc<dyn FaceEmbedder>,
        cache_root: impl Into<PathBuf>,
        policy: ReferencePolicy,
    ) -> Self {
        Self {
            directory,
            embedder,
            cache_root: cache_root.into(),
            policy,
        }
    }

    /// Build a fresh reference set.
    ///
    /// Records that cannot be downloaded, decoded or embedded are skipped. A
    /// failure of the directory fetch itself yields an empty set under
    /// [`ReferencePolicy::FailOpen`] and an error under
    /// [`ReferencePolicy::FailClosed`].
    pub async fn load(&self) -> Result<Vec<ReferenceEntry>> {
        let start = Instant::now();
        let result = self.fetch_and_encode().await;
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(references) => {
                telemetry::metrics::FACEID_REFERENCE_LOAD_DURATION
                    .with_label_values(&["success"])
                    .observe(elapsed);
                info!(count = references.len(), "reference set loaded");
                Ok(references)
            }
            Err(e) => {
                telemetry::metrics::FACEID_REFERENCE_LOAD_DURATION
                    .with_label_values(&["failure"])
                    .observe(elapsed);
                let reason = format!("{:#}", e);
                match self.policy {
                    ReferencePolicy::FailOpen => {
                        error!(error = %reason, "failed to load reference set, continuing without references");
                        Ok(Vec::new())
                    }
                    ReferencePolicy::FailClosed => {
                        error!(error = %reason, "failed to load reference set");
                        Err(e)
                    }
                }
            }
        }
    }

    async fn fetch_and_encode(&self) -> Result<Vec<ReferenceEntry>> {
        let records = self.directory.fetch_records().await?;
        debug!(records = records.len(), "fetched reference directory");

        tokio::fs::create_dir_all(&self.cache_root)
            .await
            .with_context(|| {
                format!("failed to create reference cache {}", self.cache_root.display())
            })?;
        // Scratch space private to this request, so concurrent requests never
        // overwrite each other's downloads
        let workdir = tempfile::Builder::new()
            .prefix("refs-")
            .tempdir_in(&self.cache_root)
            .context("failed to create reference work directory")?;

        let mut references = Vec::with_capacity(records.len());
        for record in records {
            let (Some(filename), Some(identity)) = (record.image_filename(), record.identity())
            else {
                debug!(?record, "skipping incomplete directory record");
                record_reference("skipped");
                continue;
            };

            match self.encode_record(workdir.path(), filename).await {
                Ok(RecordOutcome::Loaded(embedding)) => {
                    record_reference("loaded");
                    references.push(ReferenceEntry::new(embedding, identity));
                }
                Ok(RecordOutcome::NoFace) => {
                    debug!(filename, identity, "no face in reference image");
                    record_reference("no_face");
                }
                Err(e) => {
                    let reason = format!("{:#}", e);
                    warn!(filename, identity, error = %reason, "skipping reference image");
                    record_reference("failed");
                }
            }
        }

        let workdir_path = workdir.path().to_path_buf();
        if let Err(e) = workdir.close() {
            warn!(path = %workdir_path.display(), error = %e, "failed to remove reference work directory");
        }

        Ok(references)
    }

    async fn encode_record(&self, workdir: &Path, filename: &str) -> Result<RecordOutcome> {
        let bytes = self.directory.download_image(filename).await?;

        let path = workdir.join(filename);
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to save reference image {}", path.display()))?;

        // Format is sniffed from content; directory filenames carry no guarantees
        let image = tokio::task::spawn_blocking(move || -> Result<image::DynamicImage> {
            Ok(image::ImageReader::open(&path)?
                .with_guessed_format()?
                .decode()?)
        })
        .await
        .context("reference image decoder panicked")?
        .context("failed to decode reference image")?
        .to_rgb8();

        match self.embedder.embed(&image).await {
            Ok(Some(embedding)) => {
                record_embed("reference", "face");
                Ok(RecordOutcome::Loaded(embedding))
            }
            Ok(None) => {
                record_embed("reference", "no_face");
                Ok(RecordOutcome::NoFace)
            }
            Err(e) => {
                record_embed("reference", "error");
                Err(e.context("failed to embed reference image"))
            }
        }
    }
}

fn record_reference(status: &str) {
    telemetry::metrics::FACEID_REFERENCES
        .with_label_values(&[status])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::mock::ScriptedEmbedder;
    use async_trait::async_trait;
    use common::directory::DirectoryRecord;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::collections::HashMap;
    use std::io::Cursor;

    fn png(color: u8) -> Vec<u8> {
        let img = RgbImage::from_pixel(4, 4, Rgb([color, color, color]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[derive(Default)]
    struct FakeDirectory {
        records: Option<Vec<DirectoryRecord>>,
        images: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl DirectoryClient for FakeDirectory {
        async fn fetch_records(&self) -> Result<Vec<DirectoryRecord>> {
            self.records.clone().ok_or_else(|| anyhow!("connection refused"))
        }

        async fn download_image(&self, filename: &str) -> Result<Vec<u8>> {
            self.images
                .get(filename)
                .cloned()
                .ok_or_else(|| anyhow!("404 for {}", filename))
        }
    }

    fn embedder() -> Arc<ScriptedEmbedder> {
        Arc::new(
            ScriptedEmbedder::new()
                .with_face([1, 1, 1], vec![1.0, 0.0])
                .with_face([2, 2, 2], vec![0.0, 1.0]),
        )
    }

    fn loader(directory: FakeDirectory, root: &Path, policy: ReferencePolicy) -> ReferenceSetLoader {
        ReferenceSetLoader::new(Arc::new(directory), embedder(), root, policy)
    }

    #[tokio::test]
    async fn test_builds_reference_set_in_directory_order() {
        let cache = tempfile::tempdir().unwrap();
        let directory = FakeDirectory {
            records: Some(vec![
                DirectoryRecord::new("/srv/uploads/image/alice.png", "alice@example.com"),
                DirectoryRecord {
                    image: Some("ghost.png".to_string()),
                    email: None,
                },
                DirectoryRecord::new("missing.png", "missing@example.com"),
                DirectoryRecord::new("blank.png", "blank@example.com"),
                DirectoryRecord::new("corrupt.png", "corrupt@example.com"),
                DirectoryRecord::new("bob.png", "bob@example.com"),
            ]),
            images: HashMap::from([
                ("alice.png".to_string(), png(1)),
                ("ghost.png".to_string(), png(1)),
                ("blank.png".to_string(), png(0)),
                ("corrupt.png".to_string(), b"not an image".to_vec()),
                ("bob.png".to_string(), png(2)),
            ]),
        };

        let references = loader(directory, cache.path(), ReferencePolicy::FailOpen)
            .load()
            .await
            .unwrap();

        let identities: Vec<&str> = references.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(identities, vec!["alice@example.com", "bob@example.com"]);
        assert_eq!(references[1].embedding.as_slice(), &[0.0, 1.0]);

        // The per-request work directory is gone
        assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fail_open_yields_empty_set() {
        let cache = tempfile::tempdir().unwrap();
        let references = loader(FakeDirectory::default(), cache.path(), ReferencePolicy::FailOpen)
            .load()
            .await
            .unwrap();
        assert!(references.is_empty());
    }

    #[tokio::test]
    async fn test_fail_closed_surfaces_error() {
        let cache = tempfile::tempdir().unwrap();
        let result = loader(FakeDirectory::default(), cache.path(), ReferencePolicy::FailClosed)
            .load()
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_reference_policy_from_str() {
        assert_eq!("fail_open".parse::<ReferencePolicy>().unwrap(), ReferencePolicy::FailOpen);
        assert_eq!("Fail-Closed".parse::<ReferencePolicy>().unwrap(), ReferencePolicy::FailClosed);
        assert!("maybe".parse::<ReferencePolicy>().is_err());
    }
}
