//! Declarative step configuration.
//!
//! The loader and its schema validator live outside this system; these
//! are the already-validated shapes the graph is assembled from.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// A tag in an image stream outside the per-job pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[display("{namespace}/{name}:{tag}")]
pub struct ImageStreamTagReference {
    pub namespace: String,
    pub name: String,
    pub tag: String,
}

/// Everything needed to materialize one job's step graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    /// External images tagged into the pipeline, keyed by pipeline tag.
    #[serde(default)]
    pub base_images: BTreeMap<String, ImageStreamTagReference>,
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub caches: Vec<CacheConfig>,
    #[serde(default)]
    pub images: Vec<ProjectImageConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputTagConfig>,
    /// Static values published as parameters at graph assembly.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub tests: Vec<MultiStageTestConfig>,
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
    /// When set, a terminal step writes every parameter here.
    #[serde(default)]
    pub parameters_path: Option<PathBuf>,
}

/// Builds the `src` pipeline image from the job's refs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Pipeline tag of the image the clone runs on.
    pub from: String,
}

/// Layers `RUN` commands over a base pipeline tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub from: String,
    pub to: String,
    pub commands: Vec<String>,
}

/// Builds an image from a Dockerfile in the source tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectImageConfig {
    /// Pipeline tag the Dockerfile's FROM is rewritten to, if any.
    #[serde(default)]
    pub from: Option<String>,
    pub to: String,
    #[serde(default = "default_dockerfile_path")]
    pub dockerfile_path: String,
    #[serde(default)]
    pub context_dir: String,
}

fn default_dockerfile_path() -> String {
    "Dockerfile".to_string()
}

/// Promotes a pipeline tag to an output image stream tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputTagConfig {
    pub from: String,
    pub to: ImageStreamTagReference,
}

/// Requests/limits applied to a container. A `*` key in a resource
/// table supplies defaults; explicit container entries override them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

pub type ResourceTable = BTreeMap<String, ResourceRequirements>;

/// One container-shaped sub-step of a multi-stage test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStageConfig {
    pub name: String,
    /// Pipeline tag the sub-step container runs.
    pub from: String,
    pub commands: String,
    /// Collect `/tmp/artifacts` from this sub-step's pod.
    #[serde(default)]
    pub artifacts: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// An ordered pre -> test -> post sequence of container sub-steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiStageTestConfig {
    pub name: String,
    #[serde(default)]
    pub pre: Vec<TestStageConfig>,
    #[serde(default)]
    pub test: Vec<TestStageConfig>,
    #[serde(default)]
    pub post: Vec<TestStageConfig>,
    /// Secret mounted for cluster access, with KUBECONFIG pointing in.
    #[serde(default)]
    pub cluster_profile: Option<String>,
    #[serde(default)]
    pub leases: Vec<LeaseConfig>,
    #[serde(default)]
    pub ip_pool: Option<LeaseConfig>,
    #[serde(default)]
    pub claim: Option<ClusterClaimConfig>,
}

/// A leased external resource requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub resource_type: String,
    #[serde(default = "default_lease_count")]
    pub count: u32,
    /// Environment variable the acquired names are exposed under.
    pub env: String,
}

fn default_lease_count() -> u32 {
    1
}

/// A claim against a pool of pre-provisioned clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterClaimConfig {
    pub product: String,
    pub version: String,
    pub architecture: String,
    pub cloud: String,
    pub owner: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_claim_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_claim_timeout_seconds() -> u64 {
    3600
}

impl ClusterClaimConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Labels a matching pool must carry.
    pub fn pool_selector(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            ("product".to_string(), self.product.clone()),
            ("version".to_string(), self.version.clone()),
            ("architecture".to_string(), self.architecture.clone()),
            ("cloud".to_string(), self.cloud.clone()),
            ("owner".to_string(), self.owner.clone()),
        ]);
        if let Some(region) = &self.region {
            labels.insert("region".to_string(), region.clone());
        }
        labels
    }
}

/// A server-side template instantiated with embedded objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub name: String,
    /// Embedded objects as loaded; pods are transformed before
    /// submission, anything else passes through unchanged.
    #[serde(default)]
    pub objects: Vec<serde_json::Value>,
    /// Per-container resource table applied to containers named `test`.
    #[serde(default)]
    pub resources: ResourceTable,
}
