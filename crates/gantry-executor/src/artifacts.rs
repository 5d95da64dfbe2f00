//! Artifact sidecar and egress worker.
//!
//! Pods that declare an `artifacts` emptyDir volume get a sidecar
//! container holding the pod open behind a sentinel file. When the
//! mounting container terminates, the worker streams a tarball out of
//! the mount, then removes the sentinel so the sidecar can exit.
//! Capture is best-effort on every exit path, cancellation included.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::{Container, Pod, VolumeMount};
use tracing::{info, warn};

use gantry_core::Result;

use crate::client::PodClient;
use crate::pod::ContainerNotifier;

pub const ARTIFACTS_CONTAINER: &str = "artifacts";
pub const ARTIFACTS_VOLUME: &str = "artifacts";
pub const ARTIFACTS_MOUNT_PATH: &str = "/tmp/artifacts";
const SENTINEL: &str = "/tmp/done";

/// Sidecar image and behavior, stable per graph.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    pub sidecar_image: String,
}

impl Default for ArtifactSpec {
    fn default() -> Self {
        Self {
            sidecar_image: "docker.io/library/busybox:1.36".to_string(),
        }
    }
}

fn sidecar_command() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("touch {SENTINEL}; while [ -f {SENTINEL} ]; do sleep 1; done; sleep 30"),
    ]
}

fn has_artifacts_volume(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|vols| vols.iter().any(|v| v.name == ARTIFACTS_VOLUME))
        .unwrap_or(false)
}

fn container_mounts_artifacts(container: &Container) -> bool {
    container
        .volume_mounts
        .iter()
        .flatten()
        .any(|m| m.name == ARTIFACTS_VOLUME)
}

/// Whether the pod wants artifact capture at all.
pub fn pod_wants_artifacts(pod: &Pod) -> bool {
    has_artifacts_volume(pod)
        && pod
            .spec
            .as_ref()
            .map(|s| {
                s.containers
                    .iter()
                    .filter(|c| c.name != ARTIFACTS_CONTAINER)
                    .any(container_mounts_artifacts)
            })
            .unwrap_or(false)
}

/// Inject the sidecar when the pod declares the artifacts volume and
/// some container mounts it. Pods without either are left unchanged.
/// Returns whether the sidecar was added.
pub fn add_artifacts_sidecar(pod: &mut Pod, spec: &ArtifactSpec) -> bool {
    if !pod_wants_artifacts(pod) {
        return false;
    }
    let Some(pod_spec) = pod.spec.as_mut() else {
        return false;
    };
    if pod_spec.containers.iter().any(|c| c.name == ARTIFACTS_CONTAINER) {
        return false;
    }
    pod_spec.containers.push(Container {
        name: ARTIFACTS_CONTAINER.to_string(),
        image: Some(spec.sidecar_image.clone()),
        command: Some(sidecar_command()),
        volume_mounts: Some(vec![VolumeMount {
            name: ARTIFACTS_VOLUME.to_string(),
            mount_path: ARTIFACTS_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    true
}

/// Streams artifacts out of completed pods. One capture per pod.
pub struct ArtifactWorker {
    pods: Arc<dyn PodClient>,
    local_dir: PathBuf,
    collected: Mutex<HashSet<String>>,
}

impl ArtifactWorker {
    pub fn new(pods: Arc<dyn PodClient>, local_dir: PathBuf) -> Self {
        Self {
            pods,
            local_dir,
            collected: Mutex::new(HashSet::new()),
        }
    }

    async fn collect(&self, pod_name: &str) {
        if !self.collected.lock().unwrap().insert(pod_name.to_string()) {
            return;
        }
        match self.download(pod_name).await {
            Ok(()) => info!(pod = pod_name, "artifacts collected"),
            Err(e) => warn!(pod = pod_name, error = %e, "artifact collection failed"),
        }
        // Remove the sentinel regardless, so the sidecar can exit.
        let release = ["rm", "-f", SENTINEL].map(String::from);
        if let Err(e) = self.pods.exec(pod_name, ARTIFACTS_CONTAINER, &release).await {
            warn!(pod = pod_name, error = %e, "failed to release artifact sidecar");
        }
    }

    async fn download(&self, pod_name: &str) -> Result<()> {
        let archive = ["tar", "czf", "-", "-C", ARTIFACTS_MOUNT_PATH, "."].map(String::from);
        let bytes = self.pods.exec(pod_name, ARTIFACTS_CONTAINER, &archive).await?;
        let dest = self.local_dir.join(pod_name);
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest)
                .map_err(|e| gantry_core::Error::Internal(format!("creating {dest:?}: {e}")))?;
            let mut archive = tar::Archive::new(GzDecoder::new(&bytes[..]));
            archive
                .unpack(&dest)
                .map_err(|e| gantry_core::Error::Internal(format!("unpacking artifacts: {e}")))
        })
        .await
        .map_err(|e| gantry_core::Error::Internal(format!("artifact unpack task: {e}")))?
    }
}

#[async_trait]
impl ContainerNotifier for ArtifactWorker {
    async fn notify(&self, pod: &Pod, container: &str) {
        if container == ARTIFACTS_CONTAINER {
            return;
        }
        let mounts_artifacts = pod
            .spec
            .as_ref()
            .map(|s| {
                s.containers
                    .iter()
                    .filter(|c| c.name == container)
                    .any(container_mounts_artifacts)
            })
            .unwrap_or(false);
        if !mounts_artifacts {
            return;
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.collect(&name).await;
    }

    async fn complete(&self, pod_name: &str) {
        self.collect(pod_name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, Volume};

    fn pod_with_volume(mount: bool) -> Pod {
        let mut container = Container {
            name: "test".to_string(),
            ..Default::default()
        };
        if mount {
            container.volume_mounts = Some(vec![VolumeMount {
                name: ARTIFACTS_VOLUME.to_string(),
                mount_path: ARTIFACTS_MOUNT_PATH.to_string(),
                ..Default::default()
            }]);
        }
        Pod {
            spec: Some(PodSpec {
                containers: vec![container],
                volumes: Some(vec![Volume {
                    name: ARTIFACTS_VOLUME.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn sidecar_added_exactly_once_for_mounting_pod() {
        let spec = ArtifactSpec::default();
        let mut pod = pod_with_volume(true);
        assert!(add_artifacts_sidecar(&mut pod, &spec));

        let containers = &pod.spec.as_ref().unwrap().containers;
        assert_eq!(containers.len(), 2);
        let sidecar = containers.last().unwrap();
        assert_eq!(sidecar.name, ARTIFACTS_CONTAINER);
        assert_eq!(sidecar.image.as_deref(), Some("docker.io/library/busybox:1.36"));
        let command = sidecar.command.as_ref().unwrap();
        assert!(command[2].contains("touch /tmp/done"));

        // Re-injection is a no-op.
        assert!(!add_artifacts_sidecar(&mut pod, &spec));
        assert_eq!(pod.spec.as_ref().unwrap().containers.len(), 2);
    }

    #[test]
    fn pod_without_volume_is_unchanged() {
        let spec = ArtifactSpec::default();
        let mut pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "test".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!add_artifacts_sidecar(&mut pod, &spec));
        assert_eq!(pod.spec.as_ref().unwrap().containers.len(), 1);
    }

    #[test]
    fn pod_with_volume_but_no_mount_is_unchanged() {
        let spec = ArtifactSpec::default();
        let mut pod = pod_with_volume(false);
        assert!(!add_artifacts_sidecar(&mut pod, &spec));
        assert_eq!(pod.spec.as_ref().unwrap().containers.len(), 1);
    }
}
