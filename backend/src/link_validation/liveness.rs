//! Reachability checks for asset links

use std::time::Duration;

use async_trait::async_trait;

use super::{LivenessError, LivenessResult};

/// Decides whether a link still serves content
#[async_trait]
pub trait LivenessChecker: Send + Sync {
    /// Returns `Ok(true)` when `url` answers with a success status within `timeout`
    ///
    /// # Errors
    ///
    /// Returns `LivenessError` when no response arrives at all
    async fn check(&self, url: &str, timeout: Duration) -> LivenessResult<bool>;
}

/// Liveness checker issuing `HEAD` requests
#[derive(Debug, Clone, Default)]
pub struct HttpLivenessChecker {
    client: reqwest::Client,
}

impl HttpLivenessChecker {
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LivenessChecker for HttpLivenessChecker {
    async fn check(&self, url: &str, timeout: Duration) -> LivenessResult<bool> {
        let response = self
            .client
            .head(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LivenessError::Timeout(url.to_string())
                } else {
                    LivenessError::Request(e.to_string())
                }
            })?;

        Ok(response.status().is_success())
    }
}
