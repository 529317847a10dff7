use anyhow::Context;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

type EngineRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("status code: {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Lifecycle events the engine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    Enable,
    Disable,
}

impl EngineEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineEvent::Enable => "enable",
            EngineEvent::Disable => "disable",
        }
    }
}

/// Read-only engine endpoints shown to admins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    Ping,
    Status,
    List,
}

impl Diagnostic {
    pub fn path(self) -> &'static str {
        match self {
            Diagnostic::Ping => "/ping",
            Diagnostic::Status => "/status",
            Diagnostic::List => "/list",
        }
    }
}

/// The execution engine as seen by the control plane
#[async_trait]
pub trait Engine: Send + Sync {
    /// Whether the engine currently manages the strategy
    async fn is_tracked(&self, strategy_uuid: Uuid) -> Result<bool, EngineError>;

    async fn notify(&self, event: EngineEvent, strategy_uuid: Uuid) -> Result<(), EngineError>;

    /// Raw response body of a diagnostics endpoint
    async fn diagnostic(&self, endpoint: Diagnostic) -> Result<String, EngineError>;
}

/// HTTP client for the execution engine
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct EngineClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<EngineRateLimiter>,
}

impl EngineClient {
    pub fn new(base_url: &str, timeout: Duration, requests_per_second: u32) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let per_second = NonZeroU32::new(requests_per_second).context("engine requests_per_second must be positive")?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }

    /// GET `path` and return the body of a 200 response
    async fn get(&self, path: &str) -> Result<String, EngineError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(EngineError::Status(status.as_u16()));
        }

        response.text().await.map_err(|e| EngineError::Request(e.to_string()))
    }
}

#[async_trait]
impl Engine for EngineClient {
    async fn is_tracked(&self, strategy_uuid: Uuid) -> Result<bool, EngineError> {
        let body = self.get(&format!("/show?uuid={}", strategy_uuid)).await?;

        let value: Value = serde_json::from_str(&body).map_err(|e| EngineError::Malformed(e.to_string()))?;
        value
            .get("exist")
            .and_then(Value::as_bool)
            .ok_or_else(|| EngineError::Malformed("key 'exist' missing from /show".to_string()))
    }

    async fn notify(&self, event: EngineEvent, strategy_uuid: Uuid) -> Result<(), EngineError> {
        let path = format!("/event?action={}&uuid={}", event.as_str(), strategy_uuid);
        let body = self.get(&path).await?;
        tracing::debug!("engine {} event for {}: {}", event.as_str(), strategy_uuid, body);
        Ok(())
    }

    async fn diagnostic(&self, endpoint: Diagnostic) -> Result<String, EngineError> {
        self.get(endpoint.path()).await
    }
}
