//! Chat gateway client.
//!
//! Speaks the OpenAI-compatible chat-completions protocol over HTTPS with
//! bearer authentication and optional identification headers. The streaming
//! seam is a pair of small traits so the orchestrator can be driven by a
//! scripted backend in tests.

use async_trait::async_trait;
use thiserror::Error;

use crate::api::models::{ModelInfo, ModelsResponse};
use crate::api::ChatRequest;
use crate::core::chat_stream::{ChatStream, StreamChunk};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(String),

    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("gateway stream failed: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Http(err.to_string())
    }
}

/// A live, finite, non-restartable sequence of stream chunks.
#[async_trait]
pub trait ChunkSource: Send + std::fmt::Debug {
    async fn next_chunk(&mut self) -> Option<Result<StreamChunk, GatewayError>>;
}

/// Anything that can open a streaming chat completion.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn open_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<Box<dyn ChunkSource>, GatewayError>;
}

#[derive(Clone)]
pub struct Gateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    http_referer: Option<String>,
    x_title: Option<String>,
}

impl Gateway {
    pub fn new(
        base_url: String,
        api_key: String,
        http_referer: Option<String>,
        x_title: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            http_referer,
            x_title,
        }
    }

    /// Authenticated request builder for one gateway endpoint. Trailing
    /// slashes on the configured base URL are tolerated.
    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{endpoint}", self.base_url.trim_end_matches('/'));
        let mut builder = self
            .client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.api_key));
        if let Some(referer) = &self.http_referer {
            builder = builder.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.x_title {
            builder = builder.header("X-Title", title);
        }
        builder
    }

    /// List the models the gateway offers.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, GatewayError> {
        let response = self.request(reqwest::Method::GET, "models").send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let models: ModelsResponse = response.json().await?;
        Ok(models.data)
    }

    /// Cheap auth probe: a models listing that succeeds means the key works.
    pub async fn probe(&self) -> Result<(), GatewayError> {
        self.list_models().await.map(|_| ())
    }
}

#[async_trait]
impl ChatBackend for Gateway {
    async fn open_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<Box<dyn ChunkSource>, GatewayError> {
        let response = self
            .request(reqwest::Method::POST, "chat/completions")
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::new(ChatStream::new(response)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls_tolerate_trailing_slashes() {
        let gateway = Gateway::new(
            "https://api.example.com/v1///".to_string(),
            "sk-test".to_string(),
            None,
            None,
        );
        let request = gateway
            .request(reqwest::Method::GET, "models")
            .build()
            .unwrap();
        assert_eq!(request.url().as_str(), "https://api.example.com/v1/models");
        assert!(request.headers().contains_key("Authorization"));
    }
}
