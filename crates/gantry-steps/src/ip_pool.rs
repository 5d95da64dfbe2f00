//! IP-pool lease decorator.
//!
//! Unlike the blocking lease decorator, this variant asks the broker
//! for whatever is available right now: an unknown or exhausted pool
//! is a benign zero-resource condition, not an error. The exposed
//! parameter is the count of acquired names; the names themselves are
//! exported alongside for debugging parity.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gantry_core::config::LeaseConfig;
use gantry_core::params::Resolver;
use gantry_core::step::{InputDefinition, ObjectReference, Parameter, Step, SubtestReporter};
use gantry_core::{Error, Result, StepLink};

use crate::lease::{LeaseClient, joined_names};

pub struct IpPoolStep {
    wrapped: Box<dyn Step>,
    client: Option<Arc<dyn LeaseClient>>,
    config: LeaseConfig,
    /// Survives release for late parameter reads.
    acquired: Arc<Mutex<Option<Vec<String>>>>,
    held: Mutex<Vec<String>>,
}

impl IpPoolStep {
    pub fn wrap(
        wrapped: Box<dyn Step>,
        config: LeaseConfig,
        client: Option<Arc<dyn LeaseClient>>,
    ) -> Self {
        Self {
            wrapped,
            client,
            config,
            acquired: Arc::new(Mutex::new(None)),
            held: Mutex::new(Vec::new()),
        }
    }

    async fn acquire(&self, client: &Arc<dyn LeaseClient>) -> Result<()> {
        let names = match client
            .acquire_if_available_immediately(&self.config.resource_type, self.config.count)
            .await
        {
            Ok(names) => names,
            Err(Error::NotFound(_)) => {
                info!(
                    step = self.wrapped.name(),
                    resource_type = %self.config.resource_type,
                    "zero resources available, continuing without"
                );
                Vec::new()
            }
            Err(e) => {
                return Err(Error::LeaseAcquire(format!(
                    "{}: {e}",
                    self.config.resource_type
                )));
            }
        };
        self.held.lock().unwrap().extend(names.iter().cloned());
        *self.acquired.lock().unwrap() = Some(names);
        Ok(())
    }

    async fn release_all(&self, client: &Arc<dyn LeaseClient>) -> Result<()> {
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
impl Step for IpPoolStep {
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

        let acquired = self.acquired.clone();
        let env = self.config.env.clone();
        let count_resolver: Resolver = Arc::new(move || {
            let acquired = acquired.clone();
            let env = env.clone();
            Box::pin(async move {
                match &*acquired.lock().unwrap() {
                    Some(names) => Ok(names.len().to_string()),
                    None => Err(Error::Internal(format!(
                        "ip-pool parameter {env} read before acquisition"
                    ))),
                }
            })
        });
        parameters.push(Parameter {
            name: self.config.env.clone(),
            link: None,
            resolver: count_resolver,
        });

        let acquired = self.acquired.clone();
        let names_resolver: Resolver = Arc::new(move || {
            let acquired = acquired.clone();
            Box::pin(async move {
                let names = acquired.lock().unwrap().clone().unwrap_or_default();
                Ok(joined_names(&names))
            })
        });
        parameters.push(Parameter {
            name: format!("{}_NAMES", self.config.env),
            link: None,
            resolver: names_resolver,
        });

        parameters
    }

    async fn inputs(&self) -> Result<InputDefinition> {
        self.wrapped.inputs().await
    }

    fn validate(&self) -> Result<()> {
        if self.client.is_none() {
            return Err(Error::NoLeaseClient);
        }
        self.wrapped.validate()
    }

    async fn run(&self, token: &CancellationToken) -> Result<()> {
        let client = self.client.clone().ok_or(Error::NoLeaseClient)?;
        self.acquire(&client).await?;
        let result = self.wrapped.run(token).await;
        let release = self.release_all(&client).await;
        if let Err(e) = &release {
            warn!(step = self.wrapped.name(), error = %e, "ip-pool release failed");
        }
        Error::aggregate(self.wrapped.name(), result, release)
    }

    fn objects(&self) -> Vec<ObjectReference> {
        self.wrapped.objects()
    }

    fn as_subtest_reporter(&self) -> Option<&dyn SubtestReporter> {
        self.wrapped.as_subtest_reporter()
    }
}
