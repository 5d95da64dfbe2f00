//! HTTP client for the lease broker.
//!
//! The broker itself is an external service; this binding speaks its
//! small resource-name API: acquire (blocking, by polling), immediate
//! acquire, release, and pool metrics.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use gantry_core::{Error, Result};
use gantry_steps::lease::{LeaseClient, LeaseMetrics};

const ACQUIRE_POLL: Duration = Duration::from_secs(5);

pub struct HttpLeaseClient {
    base: String,
    owner: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct MetricsResponse {
    free: u64,
    leased: u64,
}

impl HttpLeaseClient {
    pub fn new(base: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn try_acquire(&self, resource_type: &str, count: u32) -> Result<Vec<String>> {
        let url = format!(
            "{}/acquire?type={resource_type}&count={count}&owner={}",
            self.base, self.owner
        );
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("lease broker unreachable: {e}")))?;
        match response.status().as_u16() {
            404 => Err(Error::NotFound(format!(
                "no free {resource_type} leases"
            ))),
            code if code >= 400 => Err(Error::Transient(format!(
                "lease broker returned {code}"
            ))),
            _ => response
                .json::<Vec<String>>()
                .await
                .map_err(|e| Error::Internal(format!("malformed broker response: {e}"))),
        }
    }
}

#[async_trait]
impl LeaseClient for HttpLeaseClient {
    async fn acquire(
        &self,
        resource_type: &str,
        count: u32,
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.try_acquire(resource_type, count).await {
                Ok(names) => return Ok(names),
                Err(e) if e.is_transient() => {
                    debug!(resource_type, error = %e, "lease not granted yet, waiting");
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(ACQUIRE_POLL) => {}
            }
        }
    }

    async fn acquire_if_available_immediately(
        &self,
        resource_type: &str,
        count: u32,
    ) -> Result<Vec<String>> {
        self.try_acquire(resource_type, count).await
    }

    async fn release(&self, name: &str) -> Result<()> {
        let url = format!("{}/release?name={name}&owner={}", self.base, self.owner);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("lease broker unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::LeaseRelease(format!(
                "broker returned {} for {name}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn metrics(&self, resource_type: &str) -> Result<LeaseMetrics> {
        let url = format!("{}/metrics?type={resource_type}", self.base);
        let response: MetricsResponse = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("lease broker unreachable: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed metrics response: {e}")))?;
        Ok(LeaseMetrics {
            free: response.free,
            leased: response.leased,
        })
    }
}
