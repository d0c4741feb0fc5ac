//! Remote endpoint for fix batches.
//!
//! A batch is accepted or rejected as a whole; there is no partial
//! acknowledgement.

use crate::error::EndpointError;
use crate::queue::FixRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest server response body kept in a rejection reason
const MAX_REASON_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFix {
    #[serde(rename = "deviceUuid")]
    pub device_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres per second
    pub speed: f64,
    /// Degrees
    pub course: f64,
}

/// Request body of one flush
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixUpload {
    #[serde(rename = "deviceUuid")]
    pub device_id: String,
    pub fixes: Vec<WireFix>,
}

impl FixUpload {
    /// Build an upload preserving the order of `records`
    pub fn from_records(device_id: &str, records: &[FixRecord]) -> Self {
        let fixes = records
            .iter()
            .map(|r| WireFix {
                device_id: r.fix.device_id.clone(),
                timestamp: r.fix.timestamp_ms,
                latitude: r.fix.latitude,
                longitude: r.fix.longitude,
                speed: r.fix.speed,
                course: r.fix.bearing,
            })
            .collect();

        Self {
            device_id: device_id.to_string(),
            fixes,
        }
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }
}

#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Deliver a batch. Must not block the calling thread.
    async fn submit(&self, upload: &FixUpload) -> Result<(), EndpointError>;
}

/// JSON-over-HTTP endpoint: any 2xx accepts the batch.
pub struct HttpEndpoint {
    client: reqwest::Client,
    url: String,
}

impl HttpEndpoint {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, EndpointError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EndpointError::Network(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn classify(err: reqwest::Error) -> EndpointError {
    if err.is_timeout() {
        EndpointError::Timeout
    } else {
        EndpointError::Network(err.to_string())
    }
}

#[async_trait]
impl RemoteEndpoint for HttpEndpoint {
    async fn submit(&self, upload: &FixUpload) -> Result<(), EndpointError> {
        let response = self
            .client
            .post(&self.url)
            .json(upload)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let mut reason: String = body.trim().chars().take(MAX_REASON_LEN).collect();
        if reason.is_empty() {
            reason = status.canonical_reason().unwrap_or("unknown").to_string();
        }

        Err(EndpointError::Rejected {
            status: status.as_u16(),
            reason,
        })
    }
}
