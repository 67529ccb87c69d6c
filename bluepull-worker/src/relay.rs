//! The downstream relay client.
//!
//! Normalized records and error payloads are POSTed to the Bluelock relay
//! under `/api/v1/bluelock/<orgCode>/<activeService>/`. A `200` is the only
//! acceptable answer; anything else is reported to the caller, which treats
//! relay failures as non-critical and retries on the next cron tick.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use bluepull_core::ServiceKey;

const RELAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RelayError {
    /// `send_data_and_error` was handed no data payload.
    #[error("data payload is nil")]
    MissingDataPayload,

    #[error("relay transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("relay rejected {endpoint}: status code {status}")]
    Rejected { endpoint: String, status: u16 },

    #[error("failed to send data and error: {0}")]
    Combined(String),
}

/// Contract between the pull phases and the downstream relay.
#[async_trait]
pub trait DataRelayer: Send + Sync {
    /// POSTs `{"data": payload}` to the pull-data endpoint.
    async fn send_collected_data(
        &self,
        payload: Value,
        query_params: &[(&str, &str)],
    ) -> Result<(), RelayError>;

    /// POSTs `{"error": payload}` to the pull-error endpoint.
    async fn send_pull_error(
        &self,
        payload: Value,
        query_params: &[(&str, &str)],
    ) -> Result<(), RelayError>;

    /// Sends data, then the error payload when one is present. A missing
    /// data payload is itself an error; failures of both legs are combined.
    async fn send_data_and_error(
        &self,
        data_payload: Option<Value>,
        error_payload: Option<Value>,
        query_params: &[(&str, &str)],
    ) -> Result<(), RelayError>;
}

/// HTTP implementation against the Bluelock relay.
pub struct BluelockRelayService {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl BluelockRelayService {
    pub fn new(
        relay_base_url: &str,
        org_code: &str,
        active_service: ServiceKey,
        api_key: impl Into<String>,
    ) -> Self {
        let base_url = format!("{relay_base_url}/api/v1/bluelock/{org_code}/{active_service}");
        let http = reqwest::Client::builder()
            .timeout(RELAY_REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        BluelockRelayService {
            base_url,
            api_key: api_key.into(),
            http,
        }
    }

    async fn post(
        &self,
        endpoint: &str,
        body: Value,
        query_params: &[(&str, &str)],
    ) -> Result<(), RelayError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let response = self
            .http
            .post(&url)
            .query(query_params)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(RelayError::Rejected {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        info!(endpoint, "relayed payload");
        Ok(())
    }
}

#[async_trait]
impl DataRelayer for BluelockRelayService {
    async fn send_collected_data(
        &self,
        payload: Value,
        query_params: &[(&str, &str)],
    ) -> Result<(), RelayError> {
        self.post("pull-data", serde_json::json!({ "data": payload }), query_params)
            .await
    }

    async fn send_pull_error(
        &self,
        payload: Value,
        query_params: &[(&str, &str)],
    ) -> Result<(), RelayError> {
        self.post("pull-error", serde_json::json!({ "error": payload }), query_params)
            .await
    }

    async fn send_data_and_error(
        &self,
        data_payload: Option<Value>,
        error_payload: Option<Value>,
        query_params: &[(&str, &str)],
    ) -> Result<(), RelayError> {
        let data_payload = data_payload.ok_or(RelayError::MissingDataPayload)?;

        let mut failures = Vec::new();
        if let Err(e) = self.send_collected_data(data_payload, query_params).await {
            failures.push(format!("data: {e}"));
        }
        if let Some(error_payload) = error_payload {
            if let Err(e) = self.send_pull_error(error_payload, query_params).await {
                failures.push(format!("error: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Combined(failures.join(", ")))
        }
    }
}
