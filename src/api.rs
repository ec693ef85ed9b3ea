//! Collaborator REST surface.
//!
//! The channel layer only needs one thing from the HTTP API: before every
//! reconnect attempt it asks whether the container or conversation it was
//! serving still exists. That question is modelled as the single-method
//! [`TargetProbe`] capability so tests (and offline front-ends) can answer it
//! without a network.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::channel::{ChannelMode, Target};
use crate::constants;

/// Existence lookup for a channel target.
#[async_trait]
pub trait TargetProbe: Send + Sync {
    /// `Ok(true)` if the target exists, `Ok(false)` if it is confirmed gone.
    ///
    /// Any error is treated by the caller as "still exists".
    async fn exists(&self, target: &Target) -> Result<bool>;
}

/// A probe that always reports the same answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

#[async_trait]
impl TargetProbe for StaticProbe {
    async fn exists(&self, _target: &Target) -> Result<bool> {
        Ok(self.0)
    }
}

/// HTTP client for the container / conversation lookup endpoints.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    server_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Creates a new API client.
    pub fn new(server_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Returns the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Whether a container exists.
    pub async fn container_exists(&self, container_id: &str) -> Result<bool> {
        self.lookup(&format!("/api/containers/{container_id}")).await
    }

    /// Whether a conversation exists.
    pub async fn conversation_exists(&self, conversation_id: &str) -> Result<bool> {
        self.lookup(&format!("/api/conversations/{conversation_id}"))
            .await
    }

    async fn lookup(&self, path: &str) -> Result<bool> {
        let url = format!("{}{}", self.server_url, path);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("lookup request failed: {path}"))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                log::debug!("[Api] {} reported gone ({})", path, response.status());
                Ok(false)
            }
            status => anyhow::bail!("lookup {path} returned {status}"),
        }
    }
}

/// [`TargetProbe`] backed by the REST API.
#[derive(Debug, Clone)]
pub struct ApiProbe {
    api: Arc<ApiClient>,
}

impl ApiProbe {
    /// Wrap an API client.
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl TargetProbe for ApiProbe {
    async fn exists(&self, target: &Target) -> Result<bool> {
        match target.mode {
            ChannelMode::Terminal | ChannelMode::HeadlessContainer => {
                self.api.container_exists(&target.id).await
            }
            ChannelMode::HeadlessConversation => self.api.conversation_exists(&target.id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_container_exists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/containers/c1"))
            .and(header("Authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "c1"})))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), Some("t0ken".to_string())).unwrap();
        assert!(api.container_exists("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_container_is_gone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/containers/c2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), None).unwrap();
        assert!(!api.container_exists("c2").await.unwrap());
    }

    #[tokio::test]
    async fn test_server_error_is_inconclusive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversations/conv-1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), None).unwrap();
        assert!(api.conversation_exists("conv-1").await.is_err());
    }

    #[tokio::test]
    async fn test_existence_check_routes_by_mode() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversations/conv-9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/containers/c1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let probe = ApiProbe::new(Arc::new(ApiClient::new(server.uri(), None).unwrap()));
        assert!(!probe.exists(&Target::conversation("conv-9")).await.unwrap());
        assert!(probe.exists(&Target::headless("c1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_static_existence_answer() {
        assert!(StaticProbe(true).exists(&Target::terminal("x")).await.unwrap());
        assert!(!StaticProbe(false).exists(&Target::terminal("x")).await.unwrap());
    }
}
