//! Lease decorator.
//!
//! Wraps a step with acquisition and release of broker-issued resource
//! names. Acquisition happens in resource-type order so concurrent
//! decorators in one graph cannot deadlock against each other; release
//! happens exactly once on every exit path, and release errors are
//! aggregated with the wrapped result, never hiding it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gantry_core::config::LeaseConfig;
use gantry_core::params::Resolver;
use gantry_core::step::{InputDefinition, ObjectReference, Parameter, Step, SubtestReporter};
use gantry_core::{Error, Result, StepLink};

/// The broker issuing time-bounded claims on named resources.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Block until `count` names of `resource_type` are held.
    async fn acquire(
        &self,
        resource_type: &str,
        count: u32,
        token: &CancellationToken,
    ) -> Result<Vec<String>>;

    /// Acquire without blocking; an unknown resource type is reported
    /// as `NotFound`.
    async fn acquire_if_available_immediately(
        &self,
        resource_type: &str,
        count: u32,
    ) -> Result<Vec<String>>;

    async fn release(&self, name: &str) -> Result<()>;

    async fn metrics(&self, resource_type: &str) -> Result<LeaseMetrics>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseMetrics {
    pub free: u64,
    pub leased: u64,
}

/// Broker names may carry an instance suffix after `--`; the wrapped
/// step only ever sees the bare resource name.
pub(crate) fn strip_suffix(name: &str) -> &str {
    name.split("--").next().unwrap_or(name)
}

pub(crate) fn joined_names(names: &[String]) -> String {
    names
        .iter()
        .map(|n| strip_suffix(n))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct LeaseStep {
    wrapped: Box<dyn Step>,
    client: Option<Arc<dyn LeaseClient>>,
    /// Sorted by resource type; the ordering is the deadlock guard.
    leases: Vec<LeaseConfig>,
    /// Names per lease, in `leases` order. Survives release so late
    /// parameter reads (the parameter file) still see the values.
    acquired: Arc<Mutex<Vec<Vec<String>>>>,
    /// Names still owed back to the broker.
    held: Mutex<Vec<String>>,
}

impl LeaseStep {
    pub fn wrap(
        wrapped: Box<dyn Step>,
        mut leases: Vec<LeaseConfig>,
        client: Option<Arc<dyn LeaseClient>>,
    ) -> Self {
        leases.sort_by(|a, b| a.resource_type.cmp(&b.resource_type));
        let acquired = Arc::new(Mutex::new(vec![Vec::new(); leases.len()]));
        Self {
            wrapped,
            client,
            leases,
            acquired,
            held: Mutex::new(Vec::new()),
        }
    }

    async fn acquire_all(
        &self,
        client: &Arc<dyn LeaseClient>,
        token: &CancellationToken,
    ) -> Result<()> {
        for (i, lease) in self.leases.iter().enumerate() {
            info!(
                step = self.wrapped.name(),
                resource_type = %lease.resource_type,
                count = lease.count,
                "acquiring leases"
            );
            log_metrics(client, &lease.resource_type).await;
            match client.acquire(&lease.resource_type, lease.count, token).await {
                Ok(names) => {
                    self.held.lock().unwrap().extend(names.iter().cloned());
                    self.acquired.lock().unwrap()[i] = names;
                }
                Err(e) => {
                    // Partial acquisition: give back what is held.
                    if let Err(release_err) = self.release_all(client).await {
                        warn!(
                            step = self.wrapped.name(),
                            error = %release_err,
                            "failed to roll back partially acquired leases"
                        );
                    }
                    return Err(Error::LeaseAcquire(format!(
                        "{} x{}: {e}",
                        lease.resource_type, lease.count
                    )));
                }
            }
        }
        Ok(())
    }

    async fn release_all(&self, client: &Arc<dyn LeaseClient>) -> Result<()> {
        // Take the held names so a second call releases nothing.
        let held: Vec<String> = std::mem::take(&mut *self.held.lock().unwrap());
        let mut errors = Vec::new();
        for name in held {
            if let Err(e) = client.release(&name).await {
                errors.push(format!("{name}: {e}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::LeaseRelease(errors.join("; ")))
        }
    }
}

#[async_trait]
impl Step for LeaseStep {
    fn name(&self) -> &str {
        self.wrapped.name()
    }

    fn requires(&self) -> Vec<StepLink> {
        self.wrapped.requires()
    }

    fn creates(&self) -> Vec<StepLink> {
        self.wrapped.creates()
    }

    fn provides(&self) -> Vec<Parameter> {
        let mut parameters = self.wrapped.provides();
        for (i, lease) in self.leases.iter().enumerate() {
            let acquired = self.acquired.clone();
            let env = lease.env.clone();
            let resolver: Resolver = Arc::new(move || {
                let acquired = acquired.clone();
                let env = env.clone();
                Box::pin(async move {
                    let names = acquired.lock().unwrap()[i].clone();
                    if names.is_empty() {
                        return Err(Error::Internal(format!(
                            "lease parameter {env} read before acquisition"
                        )));
                    }
                    Ok(joined_names(&names))
                })
            });
            parameters.push(Parameter {
                name: lease.env.clone(),
                link: None,
                resolver,
            });
        }
        parameters
    }

    async fn inputs(&self) -> Result<InputDefinition> {
        self.wrapped.inputs().await
    }

    fn validate(&self) -> Result<()> {
        if !self.leases.is_empty() && self.client.is_none() {
            return Err(Error::NoLeaseClient);
        }
        self.wrapped.validate()
    }

    async fn run(&self, token: &CancellationToken) -> Result<()> {
        let client = self.client.clone().ok_or(Error::NoLeaseClient)?;
        self.acquire_all(&client, token).await?;
        let result = self.wrapped.run(token).await;
        let release = self.release_all(&client).await;
        Error::aggregate(self.wrapped.name(), result, release)
    }

    fn objects(&self) -> Vec<ObjectReference> {
        self.wrapped.objects()
    }

    fn as_subtest_reporter(&self) -> Option<&dyn SubtestReporter> {
        self.wrapped.as_subtest_reporter()
    }
}

/// Reported alongside acquisition for observability parity with the
/// broker's own accounting.
pub async fn log_metrics(client: &Arc<dyn LeaseClient>, resource_type: &str) {
    match client.metrics(resource_type).await {
        Ok(metrics) => info!(
            resource_type,
            free = metrics.free,
            leased = metrics.leased,
            "lease pool state"
        ),
        Err(e) => warn!(resource_type, error = %e, "failed to read lease metrics"),
    }
}
