use std::time::Duration;

use async_trait::async_trait;
use banana_contracts::wire::GenerateContentRequest;
use banana_contracts::GenerateError;
use reqwest::Client as HttpClient;
use thiserror::Error;
use tracing::debug;

use crate::config::{ApiKey, ConfigError, EngineConfig};

pub const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// A timeout is treated as provider backpressure; everything else is a
    /// connectivity problem.
    pub fn classify(&self) -> GenerateError {
        match self {
            Self::Timeout => GenerateError::RateLimitExceeded,
            Self::Connect(_) | Self::Other(_) => GenerateError::NetworkError,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// One POST of a `generateContent` payload.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        payload: &GenerateContentRequest,
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    endpoint: String,
    api_key: ApiKey,
    timeout: Duration,
    http: HttpClient,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: ApiKey, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            timeout,
            http: HttpClient::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let api_key = config.require_api_key()?.clone();
        Ok(Self::new(config.endpoint(), api_key, config.request_timeout))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        payload: &GenerateContentRequest,
    ) -> Result<TransportResponse, TransportError> {
        debug!(endpoint = %self.endpoint, "posting generateContent request");
        let response = self
            .http
            .post(&self.endpoint)
            .header(API_KEY_HEADER, self.api_key.expose())
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(TransportResponse { status, body })
    }
}
