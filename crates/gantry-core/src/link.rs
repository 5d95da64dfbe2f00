//! Step links - typed dependency edges between steps.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// A typed edge in the step graph. A step's `requires()` link is
/// satisfied iff an equal link appears in the `creates()` of a step
/// that already completed; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum StepLink {
    /// A tag in the per-job pipeline image stream.
    #[display("pipeline image {tag}")]
    InternalImage { tag: String },
    /// A published image outside the pipeline stream.
    #[display("image {namespace}/{name}:{tag}")]
    ExternalImage {
        namespace: String,
        name: String,
        tag: String,
    },
    /// All configured output tags have been pushed.
    #[display("images ready")]
    ImagesReady,
    #[display("stable image {name}")]
    StableImages { name: String },
    #[display("release images")]
    ReleaseImages,
    #[display("RPM repository")]
    RpmRepo,
    #[display("lease proxy")]
    LeaseProxy,
    /// Sentinel requirement satisfied only once every other step is
    /// terminal. No step may create it.
    #[display("all steps")]
    AllSteps,
    #[display("cluster claim {id}")]
    ClusterClaim { id: String },
}

impl StepLink {
    pub fn internal(tag: impl Into<String>) -> Self {
        StepLink::InternalImage { tag: tag.into() }
    }

    pub fn external(
        namespace: impl Into<String>,
        name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        StepLink::ExternalImage {
            namespace: namespace.into(),
            name: name.into(),
            tag: tag.into(),
        }
    }

    pub fn cluster_claim(id: impl Into<String>) -> Self {
        StepLink::ClusterClaim { id: id.into() }
    }
}
