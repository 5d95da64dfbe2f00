//! Custom resources the engine drives on the cluster.
//!
//! Builds and image stream tags are fulfilled by the cluster's image
//! builder; cluster pools and claims by the fleet controller. Both are
//! external collaborators - the engine only creates, reads and deletes
//! these objects.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The per-job image stream every pipeline tag lives in.
pub const PIPELINE_IMAGE_STREAM: &str = "pipeline";

/// In-cluster registry serving pipeline images.
pub const INTERNAL_REGISTRY: &str = "image-registry.gantry.svc:5000";

/// Pull spec of a pipeline tag in a job namespace.
pub fn pipeline_pullspec(namespace: &str, tag: &str) -> String {
    format!("{INTERNAL_REGISTRY}/{namespace}/{PIPELINE_IMAGE_STREAM}:{tag}")
}

/// Resource name of a tag within a stream (names cannot carry `:`).
pub fn tag_resource_name(stream: &str, tag: &str) -> String {
    format!("{stream}.{tag}")
}

// --- builds ---

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gantry.dev",
    version = "v1",
    kind = "Build",
    namespaced,
    status = "BuildStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    pub source: BuildSource,
    pub strategy: DockerStrategy,
    /// Image stream tag the result is pushed to.
    pub output_to: String,
}

/// Where the build's context comes from: an inline Dockerfile, a git
/// checkout, or both, optionally overlaid with content from images.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitBuildSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_dir: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitBuildSource {
    pub uri: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
}

/// Content copied out of an image into the build context.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Pull spec of the source image.
    pub from: String,
    #[serde(default)]
    pub paths: Vec<ImageSourcePath>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSourcePath {
    pub source_path: String,
    pub destination_dir: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DockerStrategy {
    /// Pull spec substituted for the Dockerfile's FROM, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub build_args: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default)]
    pub phase: BuildPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum BuildPhase {
    #[default]
    New,
    Pending,
    Running,
    Complete,
    Failed,
    Error,
    Cancelled,
}

impl BuildPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildPhase::Complete | BuildPhase::Failed | BuildPhase::Error | BuildPhase::Cancelled
        )
    }
}

// --- image stream tags ---

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gantry.dev",
    version = "v1",
    kind = "ImageStreamTag",
    namespaced,
    status = "ImageStreamTagStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamTagSpec {
    /// Pull spec the tag points at.
    pub from: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamTagStatus {
    /// Content digest of the resolved image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Canonical pull spec including the digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_spec: Option<String>,
}

// --- cluster pools and claims ---

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hive.gantry.dev",
    version = "v1",
    kind = "ClusterPool",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPoolSpec {
    #[serde(default)]
    pub size: u32,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hive.gantry.dev",
    version = "v1",
    kind = "ClusterClaim",
    namespaced,
    status = "ClusterClaimStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterClaimSpec {
    pub cluster_pool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterClaimStatus {
    #[serde(default)]
    pub conditions: Vec<ClaimCondition>,
    /// Namespace holding the claimed cluster's admin secrets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClusterClaim {
    /// Whether the claim's Running condition is true.
    pub fn is_running(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.condition_type == "Running" && c.status == "True")
            })
            .unwrap_or(false)
    }
}
