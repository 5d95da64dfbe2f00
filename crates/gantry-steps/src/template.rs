//! Template step: instantiates a set of embedded objects, transforming
//! pods before submission and passing everything else through
//! untouched.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tokio_util::sync::CancellationToken;
use tracing::info;

use gantry_core::config::{ResourceTable, TemplateConfig};
use gantry_core::junit::TestCase;
use gantry_core::labels::{REFS_BRANCH_LABEL, REFS_ORG_LABEL, REFS_REPO_LABEL, standard_labels};
use gantry_core::jobspec::JobSpec;
use gantry_core::step::{JobContext, ObjectReference, Step, SubtestReporter};
use gantry_core::{Error, Result, StepLink};
use gantry_executor::artifacts::{ArtifactSpec, ArtifactWorker, add_artifacts_sidecar, pod_wants_artifacts};
use gantry_executor::client::{DynamicClient, PodClient};
use gantry_executor::pod::{ContainerNotifier, NopNotifier, PodDriver};
use gantry_executor::subtest::subtests_for_pod;

use crate::StepDeps;

/// The container name resource injection applies to.
const TEST_CONTAINER: &str = "test";

pub struct TemplateStep {
    config: TemplateConfig,
    pods: Arc<dyn PodClient>,
    dynamic: Arc<dyn DynamicClient>,
    job: Arc<JobContext>,
    artifacts: ArtifactSpec,
    poll_interval: Duration,
    results: Mutex<Vec<TestCase>>,
    objects: Mutex<Vec<ObjectReference>>,
}

impl TemplateStep {
    pub fn new(config: TemplateConfig, deps: &StepDeps) -> Self {
        Self::from_parts(
            config,
            deps.clients.pods.clone(),
            deps.clients.dynamic.clone(),
            deps.job.clone(),
            deps.artifacts.clone(),
        )
    }

    pub fn from_parts(
        config: TemplateConfig,
        pods: Arc<dyn PodClient>,
        dynamic: Arc<dyn DynamicClient>,
        job: Arc<JobContext>,
        artifacts: ArtifactSpec,
    ) -> Self {
        Self {
            config,
            pods,
            dynamic,
            job,
            artifacts,
            poll_interval: Duration::from_secs(1),
            results: Mutex::new(Vec::new()),
            objects: Mutex::new(Vec::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn run_pod_object(&self, manifest: &serde_json::Value, token: &CancellationToken) -> Result<()> {
        let mut pod: Pod = serde_json::from_value(manifest.clone())
            .map_err(|e| Error::Validation(format!("template {} embeds a malformed pod: {e}", self.config.name)))?;
        inject_resources(&mut pod, &self.config.resources);
        inject_refs_labels(&mut pod, &self.job.spec);
        if self.job.artifact_dir.is_some() {
            add_artifacts_sidecar(&mut pod, &self.artifacts);
        }
        pod.metadata.namespace = Some(self.job.namespace.clone());
        pod.metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(standard_labels(&self.job.spec));

        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        self.objects.lock().unwrap().push(ObjectReference {
            kind: "Pod".into(),
            namespace: self.job.namespace.clone(),
            name: pod_name.clone(),
        });

        let driver = PodDriver::new(self.pods.clone()).with_poll_interval(self.poll_interval);
        let worker;
        let notifier: &dyn ContainerNotifier = match (&self.job.artifact_dir, pod_wants_artifacts(&pod)) {
            (Some(dir), true) => {
                worker = ArtifactWorker::new(self.pods.clone(), dir.join(&self.config.name));
                &worker
            }
            _ => &NopNotifier,
        };

        info!(template = %self.config.name, pod = %pod_name, "running template pod");
        let result = driver.run_pod(pod, notifier, token).await;
        match result {
            Ok(final_pod) => {
                self.results.lock().unwrap().extend(subtests_for_pod(&final_pod));
                Ok(())
            }
            Err(e) => {
                // A failed pod may still carry reportable sub-tests.
                if let Ok(Some(final_pod)) = self.pods.get(&pod_name).await {
                    self.results.lock().unwrap().extend(subtests_for_pod(&final_pod));
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Step for TemplateStep {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn requires(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn creates(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn validate(&self) -> Result<()> {
        for object in &self.config.objects {
            if object["kind"].as_str().is_none() {
                return Err(Error::Validation(format!(
                    "template {} embeds an object without a kind",
                    self.config.name
                )));
            }
        }
        Ok(())
    }

    async fn run(&self, token: &CancellationToken) -> Result<()> {
        for object in &self.config.objects {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if object["kind"].as_str() == Some("Pod") {
                self.run_pod_object(object, token).await?;
            } else {
                // Non-pod objects pass through unchanged.
                let reference = self.dynamic.create(object).await?;
                self.objects.lock().unwrap().push(reference);
            }
        }
        Ok(())
    }

    fn objects(&self) -> Vec<ObjectReference> {
        self.objects.lock().unwrap().clone()
    }

    fn as_subtest_reporter(&self) -> Option<&dyn SubtestReporter> {
        Some(self)
    }
}

impl SubtestReporter for TemplateStep {
    fn subtests(&self) -> Vec<TestCase> {
        self.results.lock().unwrap().clone()
    }
}

/// Merge the template's resource table into any container literally
/// named `test`. A `*` entry supplies defaults; the container's own
/// entry overrides them key by key.
pub fn inject_resources(pod: &mut Pod, table: &ResourceTable) {
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };
    for container in spec.containers.iter_mut().filter(|c| c.name == TEST_CONTAINER) {
        let mut requests = table.get("*").map(|r| r.requests.clone()).unwrap_or_default();
        let mut limits = table.get("*").map(|r| r.limits.clone()).unwrap_or_default();
        if let Some(explicit) = table.get(TEST_CONTAINER) {
            requests.extend(explicit.requests.clone());
            limits.extend(explicit.limits.clone());
        }
        if requests.is_empty() && limits.is_empty() {
            continue;
        }
        let resources = container.resources.get_or_insert_with(Default::default);
        if !requests.is_empty() {
            resources.requests = Some(
                requests
                    .into_iter()
                    .map(|(k, v)| (k, Quantity(v)))
                    .collect(),
            );
        }
        if !limits.is_empty() {
            resources.limits = Some(limits.into_iter().map(|(k, v)| (k, Quantity(v))).collect());
        }
    }
}

/// Stamp origin-ref labels when the job carries refs.
pub fn inject_refs_labels(pod: &mut Pod, spec: &JobSpec) {
    let Some(refs) = &spec.refs else {
        return;
    };
    let labels = pod.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(REFS_ORG_LABEL.to_string(), refs.org.clone());
    labels.insert(REFS_REPO_LABEL.to_string(), refs.repo.clone());
    labels.insert(REFS_BRANCH_LABEL.to_string(), refs.base_ref.clone());
}
