use anyhow::{Context, Result};
use async_trait::async_trait;
use common::directory::LoginRequest;
use reqwest::Url;
use tracing::instrument;

/// Triggers a face-ID login for a recognized identity
#[async_trait]
pub trait LoginClient: Send + Sync {
    /// Log `identity` in; returns the upstream response body verbatim
    async fn login(&self, identity: &str) -> Result<serde_json::Value>;
}

pub struct HttpLoginClient {
    login_url: Url,
    client: reqwest::Client,
}

impl HttpLoginClient {
    pub fn new(login_url: Url, client: reqwest::Client) -> Self {
        Self { login_url, client }
    }
}

#[async_trait]
impl LoginClient for HttpLoginClient {
    #[instrument(skip_all, fields(url = %self.login_url, identity = %identity))]
    async fn login(&self, identity: &str) -> Result<serde_json::Value> {
        let request = LoginRequest {
            email: identity.to_string(),
        };
        let resp = self
            .client
            .post(self.login_url.clone())
            .json(&request)
            .send()
            .await
            .context("login request failed")?;
        let resp = resp
            .error_for_status()
            .context("login returned error status")?;
        resp.json()
            .await
            .context("failed to parse login response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_login_is_an_error() {
        let client = HttpLoginClient::new(
            Url::parse("http://127.0.0.1:9/auth/login-faceid").unwrap(),
            reqwest::Client::new(),
        );
        assert!(client.login("user@example.com").await.is_err());
    }
}
