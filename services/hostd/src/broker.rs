//! Remote connection broker client.
//!
//! The broker fronts remote-desktop sessions for clients: each running
//! node gets a named connection record pointing the broker at the node's
//! display port. Access is token-authenticated via its REST API.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Delay before the single authentication retry.
const AUTH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Bound on any single broker request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker authentication failed: {0}")]
    AuthFailed(#[source] reqwest::Error),

    #[error("broker request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("broker returned {status} to {operation}")]
    Status {
        operation: &'static str,
        status: reqwest::StatusCode,
    },
}

/// Connection settings for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Base URL of the broker, e.g. `http://127.0.0.1:8080/guacamole`.
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// The broker-side data source connections are stored in.
    pub data_source: String,
    /// Hostname the broker dials to reach a node's display port.
    pub vnc_host: String,
}

/// Token-authenticated REST client for the connection broker.
pub struct BrokerClient {
    client: reqwest::Client,
    config: BrokerConfig,
    auth_retry_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "authToken")]
    auth_token: String,
}

#[derive(Debug, Deserialize)]
struct ConnectionResponse {
    identifier: String,
}

impl BrokerClient {
    pub fn new(config: BrokerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            config,
            auth_retry_delay: AUTH_RETRY_DELAY,
        }
    }

    /// Override the delay before the authentication retry. Tests use a zero
    /// delay to keep the retry path fast.
    pub fn with_auth_retry_delay(mut self, delay: Duration) -> Self {
        self.auth_retry_delay = delay;
        self
    }

    /// The data source connections live in.
    pub fn data_source(&self) -> &str {
        &self.config.data_source
    }

    async fn request_token(&self) -> Result<String, reqwest::Error> {
        let url = format!("{}/api/tokens", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let token: TokenResponse = response.json().await?;
        Ok(token.auth_token)
    }

    /// Obtain an auth token, retrying once after a short delay.
    pub async fn authenticate(&self) -> Result<String, BrokerError> {
        match self.request_token().await {
            Ok(token) => Ok(token),
            Err(e) => {
                warn!(error = %e, "broker authentication failed, retrying once");
                tokio::time::sleep(self.auth_retry_delay).await;
                self.request_token().await.map_err(BrokerError::AuthFailed)
            }
        }
    }

    /// Register a connection record pointing at a node's display port.
    ///
    /// Protocol and target host are fixed; the record carries no
    /// credentials.
    pub async fn create_connection(
        &self,
        token: &str,
        name: &str,
        port: u16,
    ) -> Result<String, BrokerError> {
        let url = format!(
            "{}/api/session/data/{}/connections",
            self.config.base_url, self.config.data_source
        );

        let body = serde_json::json!({
            "parentIdentifier": "ROOT",
            "name": name,
            "protocol": "vnc",
            "parameters": {
                "hostname": self.config.vnc_host,
                "port": port.to_string(),
                "username": "",
                "password": "",
            },
            "attributes": {},
        });

        let response = self
            .client
            .post(&url)
            .query(&[("token", token)])
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BrokerError::Status {
                operation: "create connection",
                status: response.status(),
            });
        }

        let created: ConnectionResponse = response.json().await?;
        debug!(connection_id = %created.identifier, name, port, "created broker connection");
        Ok(created.identifier)
    }

    /// Delete a connection record.
    ///
    /// Callers treat failure here as non-fatal to the node operation: the
    /// node's own transition must complete even if the record lingers.
    pub async fn delete_connection(
        &self,
        token: &str,
        connection_id: &str,
    ) -> Result<(), BrokerError> {
        // Hierarchical connection ids contain slashes.
        let encoded = connection_id.replace('/', "%2F");
        let url = format!(
            "{}/api/session/data/{}/connections/{}",
            self.config.base_url, self.config.data_source, encoded
        );

        let response = self
            .client
            .delete(&url)
            .query(&[("token", token)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BrokerError::Status {
                operation: "delete connection",
                status: response.status(),
            });
        }

        debug!(connection_id, "deleted broker connection");
        Ok(())
    }
}
