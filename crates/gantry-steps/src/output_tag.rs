//! Output tag step: promotes a pipeline image to an output stream.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gantry_core::config::OutputTagConfig;
use gantry_core::labels::standard_labels;
use gantry_core::params::Resolver;
use gantry_core::step::{InputDefinition, JobContext, ObjectReference, Parameter, Step};
use gantry_core::{Result, StepLink};
use gantry_executor::api::{
    INTERNAL_REGISTRY, ImageStreamTag, ImageStreamTagSpec, PIPELINE_IMAGE_STREAM,
    tag_resource_name,
};
use gantry_executor::build::BuildDriver;
use gantry_executor::client::{BuildClient, ImageTagClient};

use crate::StepDeps;

pub struct OutputTagStep {
    config: OutputTagConfig,
    builds: Arc<dyn BuildClient>,
    tags: Arc<dyn ImageTagClient>,
    job: Arc<JobContext>,
    objects: Mutex<Vec<ObjectReference>>,
}

impl OutputTagStep {
    pub fn new(config: OutputTagConfig, deps: &StepDeps) -> Self {
        Self::from_parts(
            config,
            deps.clients.builds.clone(),
            deps.clients.tags.clone(),
            deps.job.clone(),
        )
    }

    pub fn from_parts(
        config: OutputTagConfig,
        builds: Arc<dyn BuildClient>,
        tags: Arc<dyn ImageTagClient>,
        job: Arc<JobContext>,
    ) -> Self {
        Self {
            config,
            builds,
            tags,
            job,
            objects: Mutex::new(Vec::new()),
        }
    }

    fn published_pullspec(&self) -> String {
        let to = &self.config.to;
        format!("{INTERNAL_REGISTRY}/{}/{}:{}", to.namespace, to.name, to.tag)
    }
}

#[async_trait]
impl Step for OutputTagStep {
    fn name(&self) -> &str {
        &self.config.to.name
    }

    fn requires(&self) -> Vec<StepLink> {
        vec![StepLink::internal(&self.config.from)]
    }

    fn creates(&self) -> Vec<StepLink> {
        let to = &self.config.to;
        vec![StepLink::external(&to.namespace, &to.name, &to.tag)]
    }

    fn provides(&self) -> Vec<Parameter> {
        let to = &self.config.to;
        let name = format!(
            "IMAGE_{}",
            to.name
                .to_ascii_uppercase()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect::<String>()
        );
        let pullspec = self.published_pullspec();
        let resolver: Resolver = Arc::new(move || {
            let pullspec = pullspec.clone();
            Box::pin(async move { Ok(pullspec) })
        });
        vec![Parameter {
            name,
            link: Some(StepLink::external(&to.namespace, &to.name, &to.tag)),
            resolver,
        }]
    }

    async fn inputs(&self) -> Result<InputDefinition> {
        Ok(InputDefinition::new(vec![format!(
            "{} -> {}",
            self.config.from, self.config.to
        )]))
    }

    async fn run(&self, _token: &CancellationToken) -> Result<()> {
        let source_name = tag_resource_name(PIPELINE_IMAGE_STREAM, &self.config.from);
        let driver = BuildDriver::new(self.builds.clone(), self.tags.clone());
        let digest = driver.resolve_tag_digest(&source_name).await?;

        let to = &self.config.to;
        let dest_name = tag_resource_name(&to.name, &to.tag);
        if let Some(existing) = self.tags.get_in(&to.namespace, &dest_name).await? {
            let current = existing.status.as_ref().and_then(|s| s.digest.as_deref());
            if current == Some(digest.as_str()) {
                debug!(tag = %dest_name, "output tag already points at the digest");
                return Ok(());
            }
        }

        let by_digest = format!(
            "{INTERNAL_REGISTRY}/{}/{PIPELINE_IMAGE_STREAM}@{digest}",
            self.job.namespace
        );
        info!(tag = %dest_name, digest = %digest, "publishing output tag");
        let mut tag = ImageStreamTag::new(&dest_name, ImageStreamTagSpec { from: by_digest });
        tag.metadata.namespace = Some(to.namespace.clone());
        tag.metadata.labels = Some(standard_labels(&self.job.spec));
        self.tags.apply(&tag).await?;
        self.objects.lock().unwrap().push(ObjectReference {
            kind: "ImageStreamTag".into(),
            namespace: to.namespace.clone(),
            name: dest_name,
        });
        Ok(())
    }

    fn objects(&self) -> Vec<ObjectReference> {
        self.objects.lock().unwrap().clone()
    }
}
