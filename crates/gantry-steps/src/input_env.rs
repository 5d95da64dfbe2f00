//! Static input parameters.
//!
//! Publishes operator-supplied values into the parameter store and
//! declares the links those values stand in for, letting externally
//! provided state satisfy graph edges without running anything.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gantry_core::params::static_resolver;
use gantry_core::step::{Parameter, Step};
use gantry_core::{Result, StepLink};

pub struct InputEnvStep {
    values: BTreeMap<String, String>,
    creates: Vec<StepLink>,
}

impl InputEnvStep {
    pub fn new(values: BTreeMap<String, String>, creates: Vec<StepLink>) -> Self {
        Self { values, creates }
    }
}

#[async_trait]
impl Step for InputEnvStep {
    fn name(&self) -> &str {
        "[input]"
    }

    fn requires(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn creates(&self) -> Vec<StepLink> {
        self.creates.clone()
    }

    fn provides(&self) -> Vec<Parameter> {
        self.values
            .iter()
            .map(|(name, value)| Parameter {
                name: name.clone(),
                link: None,
                resolver: static_resolver(value.clone()),
            })
            .collect()
    }

    async fn run(&self, _token: &CancellationToken) -> Result<()> {
        Ok(())
    }
}
