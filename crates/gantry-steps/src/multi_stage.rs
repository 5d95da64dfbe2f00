//! Multi-stage test step: an ordered pre -> test -> post sequence of
//! container sub-steps.
//!
//! `pre` and `test` short-circuit on the first failure; `post` always
//! runs so environments are torn down. A shared secret named after the
//! step carries cross-stage data; every pod is labelled with the step
//! name so cancellation can delete the whole family at once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, Secret, SecretVolumeSource, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gantry_core::config::{MultiStageTestConfig, TestStageConfig};
use gantry_core::junit::TestCase;
use gantry_core::labels::{JOB_SPEC_ANNOTATION, MULTI_STAGE_TEST_LABEL, standard_labels};
use gantry_core::params::ParameterStore;
use gantry_core::step::{JobContext, ObjectReference, Step, SubtestReporter};
use gantry_core::{Error, Result, StepLink};
use gantry_executor::api::pipeline_pullspec;
use gantry_executor::artifacts::{
    ARTIFACTS_MOUNT_PATH, ARTIFACTS_VOLUME, ArtifactSpec, ArtifactWorker, add_artifacts_sidecar,
};
use gantry_executor::client::{PodClient, SecretClient};
use gantry_executor::pod::{ContainerNotifier, NopNotifier, PodDriver};

use crate::StepDeps;

/// Mount path of the shared cross-stage secret.
pub const SHARED_DIR: &str = "/var/run/secrets/ci.openshift.io/multi-stage";
/// Mount path of the cluster-profile secret, when configured.
pub const CLUSTER_PROFILE_DIR: &str = "/var/run/secrets/ci.openshift.io/cluster-profile";

pub struct MultiStageStep {
    config: MultiStageTestConfig,
    pods: Arc<dyn PodClient>,
    secrets: Arc<dyn SecretClient>,
    params: Arc<ParameterStore>,
    job: Arc<JobContext>,
    artifacts: ArtifactSpec,
    poll_interval: Duration,
    results: Mutex<Vec<TestCase>>,
    objects: Mutex<Vec<ObjectReference>>,
}

impl MultiStageStep {
    pub fn new(config: MultiStageTestConfig, deps: &StepDeps) -> Self {
        Self::from_parts(
            config,
            deps.clients.pods.clone(),
            deps.clients.secrets.clone(),
            deps.params.clone(),
            deps.job.clone(),
            deps.artifacts.clone(),
        )
    }

    pub fn from_parts(
        config: MultiStageTestConfig,
        pods: Arc<dyn PodClient>,
        secrets: Arc<dyn SecretClient>,
        params: Arc<ParameterStore>,
        job: Arc<JobContext>,
        artifacts: ArtifactSpec,
    ) -> Self {
        Self {
            config,
            pods,
            secrets,
            params,
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

    /// Create the empty secret sub-steps share state through.
    async fn ensure_shared_secret(&self) -> Result<()> {
        let mut secret = Secret::default();
        secret.metadata.name = Some(self.config.name.clone());
        secret.metadata.namespace = Some(self.job.namespace.clone());
        secret.metadata.labels = Some(standard_labels(&self.job.spec));
        match self.secrets.create(&secret).await {
            Ok(_) => Ok(()),
            Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Values the lease decorators published for this test; resolved
    /// here so sub-step containers see them in their environment.
    async fn decorator_env(&self) -> Result<BTreeMap<String, String>> {
        let mut names: Vec<&str> = self.config.leases.iter().map(|l| l.env.as_str()).collect();
        if let Some(pool) = &self.config.ip_pool {
            names.push(pool.env.as_str());
        }
        let mut env = BTreeMap::new();
        for name in names {
            if self.params.has(name) {
                env.insert(name.to_string(), self.params.get(name).await?);
            }
        }
        Ok(env)
    }

    fn build_pod(&self, sub: &TestStageConfig, extra_env: &BTreeMap<String, String>) -> Pod {
        let pod_name = format!("{}-{}", self.config.name, sub.name);

        let mut env = vec![
            env_var("NAMESPACE", &self.job.namespace),
            env_var("JOB_NAME_SAFE", &self.job.spec.job_name_safe()),
            env_var("JOB_NAME_HASH", &self.job.spec.job_name_hash()),
            env_var(
                "CLUSTER_TYPE",
                self.config.cluster_profile.as_deref().unwrap_or_default(),
            ),
            env_var("SHARED_DIR", SHARED_DIR),
        ];
        if self.config.cluster_profile.is_some() {
            env.push(env_var("KUBECONFIG", &format!("{CLUSTER_PROFILE_DIR}/kubeconfig")));
        }
        for (name, value) in extra_env {
            env.push(env_var(name, value));
        }
        for (name, value) in &sub.env {
            env.push(env_var(name, value));
        }

        let mut volume_mounts = vec![VolumeMount {
            name: "shared-dir".into(),
            mount_path: SHARED_DIR.into(),
            ..Default::default()
        }];
        let mut volumes = vec![Volume {
            name: "shared-dir".into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.config.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }];
        if let Some(profile) = &self.config.cluster_profile {
            volume_mounts.push(VolumeMount {
                name: "cluster-profile".into(),
                mount_path: CLUSTER_PROFILE_DIR.into(),
                ..Default::default()
            });
            volumes.push(Volume {
                name: "cluster-profile".into(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(profile.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        if sub.artifacts {
            volume_mounts.push(VolumeMount {
                name: ARTIFACTS_VOLUME.into(),
                mount_path: ARTIFACTS_MOUNT_PATH.into(),
                ..Default::default()
            });
            volumes.push(Volume {
                name: ARTIFACTS_VOLUME.into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }

        let resources = sub.resources.as_ref().map(|r| {
            k8s_openapi::api::core::v1::ResourceRequirements {
                requests: quantities(&r.requests),
                limits: quantities(&r.limits),
                ..Default::default()
            }
        });

        let container = Container {
            name: sub.name.clone(),
            image: Some(pipeline_pullspec(&self.job.namespace, &sub.from)),
            command: Some(vec!["/bin/sh".into(), "-c".into(), sub.commands.clone()]),
            env: Some(env),
            volume_mounts: Some(volume_mounts),
            resources,
            ..Default::default()
        };

        let mut pod = Pod::default();
        pod.metadata.name = Some(pod_name);
        pod.metadata.namespace = Some(self.job.namespace.clone());
        let mut labels = standard_labels(&self.job.spec);
        labels.insert(MULTI_STAGE_TEST_LABEL.to_string(), self.config.name.clone());
        pod.metadata.labels = Some(labels);
        pod.metadata.annotations = Some(
            [(JOB_SPEC_ANNOTATION.to_string(), self.job.spec.raw().to_string())]
                .into_iter()
                .collect(),
        );
        pod.spec = Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            restart_policy: Some("Never".into()),
            ..Default::default()
        });
        add_artifacts_sidecar(&mut pod, &self.artifacts);
        pod
    }

    async fn run_substep(
        &self,
        sub: &TestStageConfig,
        extra_env: &BTreeMap<String, String>,
        token: &CancellationToken,
    ) -> Result<()> {
        let case_name = format!("{} - {}", self.config.name, sub.name);
        let pod = self.build_pod(sub, extra_env);
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        self.objects.lock().unwrap().push(ObjectReference {
            kind: "Pod".into(),
            namespace: self.job.namespace.clone(),
            name: pod_name.clone(),
        });

        let driver = PodDriver::new(self.pods.clone()).with_poll_interval(self.poll_interval);
        let worker;
        let notifier: &dyn ContainerNotifier = match (&self.job.artifact_dir, sub.artifacts) {
            (Some(dir), true) => {
                worker = ArtifactWorker::new(self.pods.clone(), dir.join(&self.config.name));
                &worker
            }
            _ => &NopNotifier,
        };

        info!(test = %self.config.name, sub = %sub.name, pod = %pod_name, "running sub-step");
        let started = Instant::now();
        let result = driver.run_pod(pod, notifier, token).await;
        let duration = started.elapsed().as_secs_f64();
        match &result {
            Ok(_) => self
                .results
                .lock()
                .unwrap()
                .push(TestCase::passed(case_name, duration)),
            Err(e) => {
                let mut case = TestCase::failed(case_name, duration, e.to_string());
                // Attach the container's log so the report stands alone.
                case.system_out = self.pods.logs(&pod_name, &sub.name).await.ok();
                self.results.lock().unwrap().push(case);
            }
        }
        result.map(|_| ())
    }

    fn record_skipped(&self, sub: &TestStageConfig, reason: &str) {
        self.results.lock().unwrap().push(TestCase::skipped(
            format!("{} - {}", self.config.name, sub.name),
            reason,
        ));
    }
}

#[async_trait]
impl Step for MultiStageStep {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn requires(&self) -> Vec<StepLink> {
        let links = self
            .config
            .pre
            .iter()
            .chain(&self.config.test)
            .chain(&self.config.post)
            .map(|sub| StepLink::internal(&sub.from))
            .collect();
        crate::dedup_links(links)
    }

    fn creates(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for sub in self
            .config
            .pre
            .iter()
            .chain(&self.config.test)
            .chain(&self.config.post)
        {
            if !seen.insert(sub.name.as_str()) {
                return Err(Error::Validation(format!(
                    "test {} has duplicate sub-step \"{}\"",
                    self.config.name, sub.name
                )));
            }
        }
        Ok(())
    }

    async fn run(&self, token: &CancellationToken) -> Result<()> {
        self.ensure_shared_secret().await?;
        let extra_env = self.decorator_env().await?;

        let mut primary: Result<()> = Ok(());
        'stages: for subs in [&self.config.pre, &self.config.test] {
            for sub in subs.iter() {
                if token.is_cancelled() {
                    self.record_skipped(sub, "run was cancelled");
                    primary = Err(Error::Cancelled);
                    break 'stages;
                }
                if let Err(e) = self.run_substep(sub, &extra_env, token).await {
                    primary = Err(e);
                    break 'stages;
                }
            }
        }

        let mut post: Result<()> = Ok(());
        for sub in &self.config.post {
            if token.is_cancelled() {
                self.record_skipped(sub, "run was cancelled");
                continue;
            }
            if let Err(e) = self.run_substep(sub, &extra_env, token).await {
                warn!(test = %self.config.name, sub = %sub.name, error = %e, "post sub-step failed");
                if post.is_ok() {
                    post = Err(e);
                }
            }
        }

        if token.is_cancelled() {
            let selector = format!("{MULTI_STAGE_TEST_LABEL}={}", self.config.name);
            if let Err(e) = self.pods.delete_by_selector(&selector).await {
                warn!(selector = %selector, error = %e, "failed to delete test pods on cancel");
            }
        }

        Error::aggregate(&self.config.name, primary, post)
    }

    fn objects(&self) -> Vec<ObjectReference> {
        self.objects.lock().unwrap().clone()
    }

    fn as_subtest_reporter(&self) -> Option<&dyn SubtestReporter> {
        Some(self)
    }
}

impl SubtestReporter for MultiStageStep {
    fn subtests(&self) -> Vec<TestCase> {
        self.results.lock().unwrap().clone()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}
