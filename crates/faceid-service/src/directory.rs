use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use common::directory::{DirectoryEnvelope, DirectoryRecord};
use reqwest::Url;
use tracing::instrument;

/// Read access to the admin service's reference directory
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// All directory records of a successful envelope
    async fn fetch_records(&self) -> Result<Vec<DirectoryRecord>>;

    /// Raw bytes of the reference image stored under `filename`
    async fn download_image(&self, filename: &str) -> Result<Vec<u8>>;
}

pub struct HttpDirectoryClient {
    directory_url: Url,
    image_base_url: Url,
    client: reqwest::Client,
}

impl HttpDirectoryClient {
    pub fn new(directory_url: Url, image_base_url: Url, client: reqwest::Client) -> Self {
        Self {
            directory_url,
            image_base_url,
            client,
        }
    }

    /// `{image_base_url}/{filename}`, with `filename` as a single path segment
    pub fn image_url(&self, filename: &str) -> Result<Url> {
        let mut url = self.image_base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("image base URL cannot carry a path: {}", self.image_base_url))?
            .pop_if_empty()
            .push(filename);
        Ok(url)
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    #[instrument(skip_all, fields(url = %self.directory_url))]
    async fn fetch_records(&self) -> Result<Vec<DirectoryRecord>> {
        let resp = self
            .client
            .get(self.directory_url.clone())
            .send()
            .await
            .context("reference directory request failed")?;
        let resp = resp
            .error_for_status()
            .context("reference directory returned error status")?;
        let envelope: DirectoryEnvelope = resp
            .json()
            .await
            .context("failed to parse reference directory response")?;
        Ok(envelope.into_records())
    }

    #[instrument(skip(self))]
    async fn download_image(&self, filename: &str) -> Result<Vec<u8>> {
        let url = self.image_url(filename)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("reference image request failed")?;
        let resp = resp
            .error_for_status()
            .context("reference image returned error status")?;
        let bytes = resp
            .bytes()
            .await
            .context("failed to read reference image body")?;
        Ok(bytes.to_vec())
    }
}
