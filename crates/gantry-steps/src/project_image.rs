//! Project image build step: a Dockerfile from the source tree.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gantry_core::config::ProjectImageConfig;
use gantry_core::labels::standard_labels;
use gantry_core::step::{InputDefinition, JobContext, ObjectReference, Step};
use gantry_core::{Result, StepLink};
use gantry_executor::api::{
    ImageSource, ImageSourcePath, PIPELINE_IMAGE_STREAM, pipeline_pullspec, tag_resource_name,
};
use gantry_executor::build::{BuildDriver, dockerfile_build};
use gantry_executor::client::{BuildClient, ImageTagClient};

use crate::StepDeps;
use crate::source::SOURCE_TAG;

pub struct ProjectImageStep {
    config: ProjectImageConfig,
    builds: Arc<dyn BuildClient>,
    tags: Arc<dyn ImageTagClient>,
    job: Arc<JobContext>,
    poll_interval: Duration,
}

impl ProjectImageStep {
    pub fn new(config: ProjectImageConfig, deps: &StepDeps) -> Self {
        Self::from_parts(
            config,
            deps.clients.builds.clone(),
            deps.clients.tags.clone(),
            deps.job.clone(),
        )
    }

    pub fn from_parts(
        config: ProjectImageConfig,
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
}

#[async_trait]
impl Step for ProjectImageStep {
    fn name(&self) -> &str {
        &self.config.to
    }

    fn requires(&self) -> Vec<StepLink> {
        let mut links = vec![StepLink::internal(SOURCE_TAG)];
        if let Some(from) = &self.config.from {
            links.push(StepLink::internal(from));
        }
        crate::dedup_links(links)
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::internal(&self.config.to)]
    }

    async fn inputs(&self) -> Result<InputDefinition> {
        Ok(InputDefinition::new(vec![
            self.config.dockerfile_path.clone(),
            self.config.context_dir.clone(),
        ]))
    }

    async fn run(&self, token: &CancellationToken) -> Result<()> {
        // The build context is the source image's tree.
        let source_images = vec![ImageSource {
            from: pipeline_pullspec(&self.job.namespace, SOURCE_TAG),
            paths: vec![ImageSourcePath {
                source_path: ".".into(),
                destination_dir: ".".into(),
            }],
        }];
        let from = self
            .config
            .from
            .as_ref()
            .map(|f| pipeline_pullspec(&self.job.namespace, f));

        let mut build = dockerfile_build(
            &self.config.to,
            String::new(),
            from,
            &tag_resource_name(PIPELINE_IMAGE_STREAM, &self.config.to),
            source_images,
            standard_labels(&self.job.spec),
        );
        build.spec.source.dockerfile = None;
        build.spec.source.context_dir = (!self.config.context_dir.is_empty())
            .then(|| self.config.context_dir.clone());
        build.spec.strategy.dockerfile_path = Some(self.config.dockerfile_path.clone());

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
