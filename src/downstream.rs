//! Clients for the downstream compute services.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::model::ServiceName;

/// Default timeout for downstream calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Error returned by a downstream call. Always data, never a panic; the
/// dispatcher records the rendering against the service request.
#[derive(Error, Debug)]
pub enum DownstreamError {
    #[error("timed out")]
    Timeout,

    #[error("request error: {0}")]
    Request(String),

    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response body: {0}")]
    MalformedBody(String),
}

/// Base URLs for the three compute services.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub revenue: String,
    pub rebates: String,
    pub specialty: String,
}

impl ServiceEndpoints {
    pub fn url_for(&self, service: ServiceName) -> &str {
        match service {
            ServiceName::Revenue => &self.revenue,
            ServiceName::Rebates => &self.rebates,
            ServiceName::Specialty => &self.specialty,
        }
    }
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            revenue: "http://revenue-service:8001/revenue".into(),
            rebates: "http://rebates-service:8002/rebates".into(),
            specialty: "http://specialty-service:8003/specialty".into(),
        }
    }
}

/// Contract for calling one named compute service with a batch of items.
#[async_trait]
pub trait DownstreamClient: Send + Sync {
    async fn call(
        &self,
        service: ServiceName,
        items: &[serde_json::Value],
    ) -> Result<serde_json::Value, DownstreamError>;
}

/// HTTP client for the compute services: one POST per call, JSON array body,
/// bounded timeout.
pub struct HttpDownstreamClient {
    client: reqwest::Client,
    endpoints: ServiceEndpoints,
}

impl HttpDownstreamClient {
    pub fn new(endpoints: ServiceEndpoints, timeout: Duration) -> Result<Self, DownstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DownstreamError::Request(e.to_string()))?;
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl DownstreamClient for HttpDownstreamClient {
    async fn call(
        &self,
        service: ServiceName,
        items: &[serde_json::Value],
    ) -> Result<serde_json::Value, DownstreamError> {
        let url = self.endpoints.url_for(service);
        debug!(service = %service, count = items.len(), "calling downstream service");

        let response = self
            .client
            .post(url)
            .json(&items)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DownstreamError::Timeout
                } else {
                    DownstreamError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DownstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| DownstreamError::MalformedBody(e.to_string()))
    }
}
