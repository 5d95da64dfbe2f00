//! Pod lifecycle driver.
//!
//! Creates (or adopts) a pod, polls it to a terminal phase, reports
//! container completions to a notifier, and tears the pod down on
//! cancellation. Artifact egress rides on the notifier (see
//! `artifacts`).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_core::jobspec::short_hash;
use gantry_core::labels::MULTI_STAGE_TEST_LABEL;
use gantry_core::{Error, Result};

use crate::client::PodClient;

/// Annotation recording the hash of the submitted pod spec, used to
/// detect semantic drift on adoption.
pub const SPEC_HASH_ANNOTATION: &str = "gantry.dev/spec-hash";

/// Callback capability through which the driver informs its owner of
/// container completions and cancellation.
#[async_trait]
pub trait ContainerNotifier: Send + Sync {
    /// A container in the pod reached a terminal state.
    async fn notify(&self, pod: &Pod, container: &str);
    /// The pod reached a terminal state or the driver is shutting
    /// down; flush anything partial.
    async fn complete(&self, pod_name: &str);
}

pub struct NopNotifier;

#[async_trait]
impl ContainerNotifier for NopNotifier {
    async fn notify(&self, _pod: &Pod, _container: &str) {}
    async fn complete(&self, _pod_name: &str) {}
}

/// Observed pod phase, plus a synthetic eviction reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Evicted,
    Unknown,
}

pub fn observed_phase(pod: &Pod) -> PodPhase {
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("");
    let reason = status.and_then(|s| s.reason.as_deref()).unwrap_or("");
    match (phase, reason) {
        ("Failed", "Evicted") => PodPhase::Evicted,
        ("Pending", _) => PodPhase::Pending,
        ("Running", _) => PodPhase::Running,
        ("Succeeded", _) => PodPhase::Succeeded,
        ("Failed", _) => PodPhase::Failed,
        _ => PodPhase::Unknown,
    }
}

pub fn is_terminal(phase: PodPhase) -> bool {
    matches!(
        phase,
        PodPhase::Succeeded | PodPhase::Failed | PodPhase::Evicted
    )
}

/// Stamp the spec-hash annotation used for drift detection.
pub fn ensure_spec_hash(pod: &mut Pod) {
    let hash = spec_hash(pod);
    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
}

fn spec_hash(pod: &Pod) -> String {
    let serialized = serde_json::to_string(&pod.spec).unwrap_or_default();
    short_hash(&serialized)
}

fn recorded_spec_hash(pod: &Pod) -> Option<&String> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
}

pub struct PodDriver {
    pods: Arc<dyn PodClient>,
    poll_interval: Duration,
    /// Ceiling on post-cancel cleanup.
    cleanup_grace: Duration,
}

impl PodDriver {
    pub fn new(pods: Arc<dyn PodClient>) -> Self {
        Self {
            pods,
            poll_interval: Duration::from_secs(1),
            cleanup_grace: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Drive one pod to completion. Returns the final pod on success so
    /// callers can derive sub-tests from it.
    pub async fn run_pod(
        &self,
        mut pod: Pod,
        notifier: &dyn ContainerNotifier,
        token: &CancellationToken,
    ) -> Result<Pod> {
        ensure_spec_hash(&mut pod);
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Validation("pod without a name".into()))?;

        self.ensure_created(&name, &pod).await?;

        let mut notified: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return self.cancel(&name, &pod, notifier).await;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let current = match self.pods.get(&name).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    return Err(Error::PodFailed {
                        name: name.clone(),
                        message: "pod was deleted while the step was waiting on it".into(),
                    });
                }
                Err(e) if e.is_transient() => {
                    debug!(pod = %name, error = %e, "transient error reading pod");
                    continue;
                }
                Err(e) => return Err(e),
            };

            for status in container_statuses(&current) {
                let terminated = status
                    .state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .is_some();
                if terminated && notified.insert(status.name.clone()) {
                    notifier.notify(&current, &status.name).await;
                }
            }

            let phase = observed_phase(&current);
            if !is_terminal(phase) {
                continue;
            }
            notifier.complete(&name).await;
            return match phase {
                PodPhase::Succeeded => {
                    info!(pod = %name, "pod succeeded");
                    Ok(current)
                }
                _ => Err(classify_failure(&name, &current, phase)),
            };
        }
    }

    /// Create the pod, adopting an existing one when its spec matches
    /// and recreating it when it drifted.
    async fn ensure_created(&self, name: &str, pod: &Pod) -> Result<()> {
        if let Some(existing) = self.pods.get(name).await? {
            if recorded_spec_hash(&existing) == recorded_spec_hash(pod) {
                info!(pod = %name, "adopting existing pod");
                return Ok(());
            }
            warn!(pod = %name, "existing pod differs, recreating");
            self.pods.delete(name).await?;
            self.await_deletion(name).await?;
        }
        match self.pods.create(pod).await {
            Ok(_) => Ok(()),
            // Lost a create race; the winner's pod is adopted.
            Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn await_deletion(&self, name: &str) -> Result<()> {
        let wait = async {
            while self.pods.get(name).await?.is_some() {
                tokio::time::sleep(self.poll_interval).await;
            }
            Ok(())
        };
        tokio::time::timeout(self.cleanup_grace, wait)
            .await
            .map_err(|_| Error::Transient(format!("pod {name} was not deleted in time")))?
    }

    async fn cancel(
        &self,
        name: &str,
        pod: &Pod,
        notifier: &dyn ContainerNotifier,
    ) -> Result<Pod> {
        info!(pod = %name, "cancel requested, deleting pod");
        let cleanup = async {
            notifier.complete(name).await;
            // Pods owned by a multi-stage step are deleted as a group.
            let multi_stage = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(MULTI_STAGE_TEST_LABEL));
            match multi_stage {
                Some(owner) => {
                    self.pods
                        .delete_by_selector(&format!("{MULTI_STAGE_TEST_LABEL}={owner}"))
                        .await
                }
                None => self.pods.delete(name).await,
            }
        };
        if let Err(e) = tokio::time::timeout(self.cleanup_grace, cleanup)
            .await
            .unwrap_or_else(|_| Err(Error::Transient("cleanup timed out".into())))
        {
            warn!(pod = %name, error = %e, "cleanup after cancel failed");
        }
        Err(Error::Cancelled)
    }
}

pub(crate) fn container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    pod.status
        .iter()
        .flat_map(|s| s.container_statuses.iter().flatten())
}

/// Concise description of the first failing container.
fn classify_failure(name: &str, pod: &Pod, phase: PodPhase) -> Error {
    if phase == PodPhase::Evicted {
        let message = pod
            .status
            .as_ref()
            .and_then(|s| s.message.clone())
            .unwrap_or_else(|| "pod was evicted".to_string());
        return Error::PodFailed {
            name: name.to_string(),
            message,
        };
    }

    let mut failed: Vec<_> = container_statuses(pod)
        .filter_map(|status| {
            let term = status.state.as_ref()?.terminated.as_ref()?;
            (term.exit_code != 0).then_some((status.name.clone(), term))
        })
        .collect();
    failed.sort_by_key(|(name, term)| (term.finished_at.clone().map(|t| t.0), name.clone()));

    let message = match failed.first() {
        Some((container, term)) => {
            let detail = term
                .message
                .clone()
                .or_else(|| term.reason.clone())
                .unwrap_or_default();
            if detail.is_empty() {
                format!("container {container} exited with code {}", term.exit_code)
            } else {
                format!(
                    "container {container} exited with code {}: {detail}",
                    term.exit_code
                )
            }
        }
        None => "pod failed without a failing container status".to_string(),
    };
    Error::PodFailed {
        name: name.to_string(),
        message,
    }
}
