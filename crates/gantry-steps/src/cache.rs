//! Pipeline image cache step: layers commands over a base tag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gantry_core::config::CacheConfig;
use gantry_core::labels::standard_labels;
use gantry_core::step::{InputDefinition, JobContext, ObjectReference, Step};
use gantry_core::{Error, Result, StepLink};
use gantry_executor::api::{PIPELINE_IMAGE_STREAM, pipeline_pullspec, tag_resource_name};
use gantry_executor::build::{BuildDriver, cache_dockerfile, dockerfile_build};
use gantry_executor::client::{BuildClient, ImageTagClient};

use crate::StepDeps;

pub struct CacheStep {
    config: CacheConfig,
    builds: Arc<dyn BuildClient>,
    tags: Arc<dyn ImageTagClient>,
    job: Arc<JobContext>,
    poll_interval: Duration,
}

impl CacheStep {
    pub fn new(config: CacheConfig, deps: &StepDeps) -> Self {
        Self::from_parts(
            config,
            deps.clients.builds.clone(),
            deps.clients.tags.clone(),
            deps.job.clone(),
        )
    }

    pub fn from_parts(
        config: CacheConfig,
        builds: Arc<dyn BuildClient>,
        tags: Arc<dyn ImageTagClient>,
        job: Arc<JobContext>,
    ) -> Self {
        Self {
            config,
            builds,
            tags,
            job,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn dockerfile(&self) -> String {
        cache_dockerfile(
            &pipeline_pullspec(&self.job.namespace, &self.config.from),
            &self.config.commands,
        )
    }
}

#[async_trait]
impl Step for CacheStep {
    fn name(&self) -> &str {
        &self.config.to
    }

    fn requires(&self) -> Vec<StepLink> {
        vec![StepLink::internal(&self.config.from)]
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::internal(&self.config.to)]
    }

    async fn inputs(&self) -> Result<InputDefinition> {
        Ok(InputDefinition::new(vec![self.dockerfile()]))
    }

    fn validate(&self) -> Result<()> {
        if self.config.commands.is_empty() {
            return Err(Error::Validation(format!(
                "cache image {} has no commands",
                self.config.to
            )));
        }
        Ok(())
    }

    async fn run(&self, token: &CancellationToken) -> Result<()> {
        let build = dockerfile_build(
            &self.config.to,
            self.dockerfile(),
            Some(pipeline_pullspec(&self.job.namespace, &self.config.from)),
            &tag_resource_name(PIPELINE_IMAGE_STREAM, &self.config.to),
            Vec::new(),
            standard_labels(&self.job.spec),
        );
        BuildDriver::new(self.builds.clone(), self.tags.clone())
            .with_poll_interval(self.poll_interval)
            .run_build(build, token)
            .await
    }

    fn objects(&self) -> Vec<ObjectReference> {
        vec![ObjectReference {
            kind: "Build".into(),
            namespace: self.job.namespace.clone(),
            name: self.config.to.clone(),
        }]
    }
}
