//! The Step trait - the polymorphic unit the scheduler drives.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::jobspec::JobSpec;
use crate::junit::TestCase;
use crate::link::StepLink;
use crate::params::Resolver;

/// Per-invocation context shared by every step constructor.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub spec: JobSpec,
    /// Namespace all per-job resources live in.
    pub namespace: String,
    /// Local directory artifacts are egressed into, when configured.
    pub artifact_dir: Option<PathBuf>,
}

/// A lazy value a step exposes to its dependents.
pub struct Parameter {
    pub name: String,
    /// Link hint recorded in the parameter store; the write-parameters
    /// step derives its requirements from these.
    pub link: Option<StepLink>,
    pub resolver: Resolver,
}

/// Content-addressed inputs contributing to a step's build cache key.
/// Ordering is stable so equal inputs hash equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputDefinition(Vec<String>);

impl InputDefinition {
    pub fn new(mut inputs: Vec<String>) -> Self {
        inputs.sort();
        Self(inputs)
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }
}

/// A cluster resource a step created, kept for post-run inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Optional capability: a step that derives JUnit sub-tests from its
/// run (probed explicitly, never via downcast guessing).
pub trait SubtestReporter: Send + Sync {
    fn subtests(&self) -> Vec<TestCase>;
}

/// A single unit of work with declared edges and a run operation.
///
/// Contract:
/// - `name` is unique within a graph;
/// - for any two distinct steps, `creates()` sets are disjoint;
/// - `run` begins only after every link in `requires()` was created by
///   a successfully completed step, and must honor cancellation.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Edges this step consumes.
    fn requires(&self) -> Vec<StepLink>;

    /// Edges this step produces. Each link has a unique producer.
    fn creates(&self) -> Vec<StepLink>;

    /// Lazy values exposed to downstream steps.
    fn provides(&self) -> Vec<Parameter> {
        Vec::new()
    }

    /// Content-addressed inputs for build caching.
    async fn inputs(&self) -> Result<InputDefinition> {
        Ok(InputDefinition::default())
    }

    /// Structural precheck, run on every step before the graph starts.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Perform the work. Must return promptly once `token` is
    /// cancelled, releasing anything it acquired.
    async fn run(&self, token: &CancellationToken) -> Result<()>;

    /// Resources created during `run`, for post-run inspection.
    fn objects(&self) -> Vec<ObjectReference> {
        Vec::new()
    }

    /// Explicit capability probe for sub-test reporting.
    fn as_subtest_reporter(&self) -> Option<&dyn SubtestReporter> {
        None
    }
}

impl std::fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_definition_orders_stably() {
        let a = InputDefinition::new(vec!["b".into(), "a".into()]);
        let b = InputDefinition::new(vec!["a".into(), "b".into()]);
        assert_eq!(a, b);
        assert_eq!(a.values(), ["a", "b"]);
    }
}
