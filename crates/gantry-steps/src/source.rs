//! Source step: builds the `src` pipeline image from the job's refs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gantry_core::config::SourceConfig;
use gantry_core::labels::standard_labels;
use gantry_core::step::{InputDefinition, JobContext, ObjectReference, Step};
use gantry_core::{Error, Result, StepLink};
use gantry_executor::api::{PIPELINE_IMAGE_STREAM, pipeline_pullspec, tag_resource_name};
use gantry_executor::build::{BuildDriver, git_build};
use gantry_executor::client::{BuildClient, ImageTagClient};

use crate::StepDeps;

/// Pipeline tag every source-consuming step builds on.
pub const SOURCE_TAG: &str = "src";

pub struct SourceStep {
    config: SourceConfig,
    builds: Arc<dyn BuildClient>,
    tags: Arc<dyn ImageTagClient>,
    job: Arc<JobContext>,
    poll_interval: Duration,
}

impl SourceStep {
    pub fn new(config: SourceConfig, deps: &StepDeps) -> Self {
        Self::from_parts(
            config,
            deps.clients.builds.clone(),
            deps.clients.tags.clone(),
            deps.job.clone(),
        )
    }

    pub fn from_parts(
        config: SourceConfig,
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
impl Step for SourceStep {
    fn name(&self) -> &str {
        SOURCE_TAG
    }

    fn requires(&self) -> Vec<StepLink> {
        vec![StepLink::internal(&self.config.from)]
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::internal(SOURCE_TAG)]
    }

    async fn inputs(&self) -> Result<InputDefinition> {
        let refs = self
            .job
            .spec
            .refs
            .as_ref()
            .ok_or_else(|| Error::Validation("source step requires job refs".into()))?;
        let mut inputs = vec![format!("{}/{}@{}", refs.org, refs.repo, refs.base_sha)];
        inputs.extend(refs.pulls.iter().map(|p| format!("pull/{}@{}", p.number, p.sha)));
        Ok(InputDefinition::new(inputs))
    }

    fn validate(&self) -> Result<()> {
        if self.job.spec.refs.is_none() {
            return Err(Error::Validation(
                "source step requires job refs to clone from".into(),
            ));
        }
        Ok(())
    }

    async fn run(&self, token: &CancellationToken) -> Result<()> {
        let refs = self
            .job
            .spec
            .refs
            .as_ref()
            .ok_or_else(|| Error::Validation("source step requires job refs".into()))?;
        let build = git_build(
            SOURCE_TAG,
            refs,
            Some(pipeline_pullspec(&self.job.namespace, &self.config.from)),
            &tag_resource_name(PIPELINE_IMAGE_STREAM, SOURCE_TAG),
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
            name: SOURCE_TAG.into(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeBuilds, FakeTags, job_context};

    fn step(builds: Arc<FakeBuilds>) -> SourceStep {
        SourceStep::from_parts(
            SourceConfig { from: "root".into() },
            builds,
            Arc::new(FakeTags::default()),
            job_context(),
        )
        .with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn builds_from_the_pull_sha() {
        let builds = Arc::new(FakeBuilds::default());
        step(builds.clone()).run(&CancellationToken::new()).await.unwrap();

        let created = builds.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        let git = created[0].spec.source.git.as_ref().unwrap();
        assert_eq!(git.uri, "https://github.com/org/repo.git");
        assert_eq!(git.git_ref, "def456");
        assert_eq!(created[0].spec.output_to, "pipeline.src");
        assert_eq!(
            created[0].spec.strategy.from.as_deref(),
            Some("image-registry.gantry.svc:5000/ci-op-1234/pipeline:root")
        );
    }

    #[tokio::test]
    async fn inputs_fingerprint_refs() {
        let inputs = step(Arc::new(FakeBuilds::default())).inputs().await.unwrap();
        assert_eq!(inputs.values(), ["org/repo@abc123", "pull/7@def456"]);
    }

    #[test]
    fn links_connect_base_to_source() {
        let step = step(Arc::new(FakeBuilds::default()));
        assert_eq!(step.requires(), vec![StepLink::internal("root")]);
        assert_eq!(step.creates(), vec![StepLink::internal("src")]);
    }
}
