//! Tags an external image into the per-job pipeline stream.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gantry_core::config::ImageStreamTagReference;
use gantry_core::labels::standard_labels;
use gantry_core::step::{InputDefinition, JobContext, ObjectReference, Step};
use gantry_core::{Result, StepLink};
use gantry_executor::api::{
    INTERNAL_REGISTRY, ImageStreamTag, ImageStreamTagSpec, PIPELINE_IMAGE_STREAM, tag_resource_name,
};
use gantry_executor::client::ImageTagClient;

use crate::StepDeps;

pub struct InputImageStep {
    to: String,
    from: ImageStreamTagReference,
    tags: Arc<dyn ImageTagClient>,
    job: Arc<JobContext>,
    objects: Mutex<Vec<ObjectReference>>,
}

impl InputImageStep {
    pub fn new(to: String, from: ImageStreamTagReference, deps: &StepDeps) -> Self {
        Self::from_parts(to, from, deps.clients.tags.clone(), deps.job.clone())
    }

    pub fn from_parts(
        to: String,
        from: ImageStreamTagReference,
        tags: Arc<dyn ImageTagClient>,
        job: Arc<JobContext>,
    ) -> Self {
        Self {
            to,
            from,
            tags,
            job,
            objects: Mutex::new(Vec::new()),
        }
    }

    fn source_pullspec(&self) -> String {
        format!(
            "{INTERNAL_REGISTRY}/{}/{}:{}",
            self.from.namespace, self.from.name, self.from.tag
        )
    }
}

#[async_trait]
impl Step for InputImageStep {
    fn name(&self) -> &str {
        &self.to
    }

    fn requires(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::internal(&self.to)]
    }

    async fn inputs(&self) -> Result<InputDefinition> {
        Ok(InputDefinition::new(vec![self.source_pullspec()]))
    }

    async fn run(&self, _token: &CancellationToken) -> Result<()> {
        let dest = tag_resource_name(PIPELINE_IMAGE_STREAM, &self.to);
        let pullspec = self.source_pullspec();

        if let Some(existing) = self.tags.get(&dest).await? {
            if existing.spec.from == pullspec {
                debug!(tag = %dest, "input tag already current");
                return Ok(());
            }
        }

        info!(tag = %dest, from = %pullspec, "importing base image");
        let mut tag = ImageStreamTag::new(&dest, ImageStreamTagSpec { from: pullspec });
        tag.metadata.namespace = Some(self.job.namespace.clone());
        tag.metadata.labels = Some(standard_labels(&self.job.spec));
        self.tags.apply(&tag).await?;
        self.objects.lock().unwrap().push(ObjectReference {
            kind: "ImageStreamTag".into(),
            namespace: self.job.namespace.clone(),
            name: dest,
        });
        Ok(())
    }

    fn objects(&self) -> Vec<ObjectReference> {
        self.objects.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeTags, job_context};

    fn reference() -> ImageStreamTagReference {
        ImageStreamTagReference {
            namespace: "ocp".into(),
            name: "builder".into(),
            tag: "golang-1.20".into(),
        }
    }

    #[tokio::test]
    async fn imports_and_is_idempotent() {
        let tags = Arc::new(FakeTags::default());
        let step = InputImageStep::from_parts("root".into(), reference(), tags.clone(), job_context());
        step.run(&CancellationToken::new()).await.unwrap();

        let applied = tags.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].metadata.name.as_deref(), Some("pipeline.root"));
        assert_eq!(
            applied[0].spec.from,
            "image-registry.gantry.svc:5000/ocp/builder:golang-1.20"
        );

        // Second run sees the tag and does nothing.
        step.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(tags.applied.lock().unwrap().len(), 1);
    }

    #[test]
    fn creates_the_pipeline_link() {
        let step = InputImageStep::from_parts(
            "root".into(),
            reference(),
            Arc::new(FakeTags::default()),
            job_context(),
        );
        assert_eq!(step.creates(), vec![StepLink::internal("root")]);
    }
}
