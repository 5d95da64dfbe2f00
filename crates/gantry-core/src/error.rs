//! Error types for Gantry.
//!
//! Every failure carries a stable reason kind so callers can branch on
//! classification instead of message text. Cleanup failures are
//! aggregated next to the error they accompany, never in place of it.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network hiccups, read-after-create races and the like. The only
    /// kind the drivers retry.
    #[error("transient: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Benign for idempotent creators: the resource is re-read and
    /// reconciled instead.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("build {name} failed: {message}")]
    BuildFailed { name: String, message: String },

    #[error("pod {name} failed: {message}")]
    PodFailed { name: String, message: String },

    #[error("bundle is invalid: {0}")]
    InvalidBundle(String),

    #[error("failed to acquire lease: {0}")]
    LeaseAcquire(String),

    #[error("failed to release lease: {0}")]
    LeaseRelease(String),

    #[error("cluster claim was not running within {0:?}")]
    ClaimTimeout(Duration),

    #[error("no cluster pool matches {0}")]
    PoolNotFound(String),

    #[error("failed to propagate claim secrets: {0}")]
    PropagateSecrets(String),

    #[error("cancelled")]
    Cancelled,

    #[error("parameter {0} is already registered")]
    DuplicateParameter(String),

    #[error("parameter {0} is not registered")]
    UnresolvedParameter(String),

    #[error("parameter {name} failed to resolve: {message}")]
    ResolverError { name: String, message: String },

    #[error("step requires leases but no lease client is configured")]
    NoLeaseClient,

    #[error("skipped: {0}")]
    Skipped(String),

    #[error("{} step(s) did not complete", .0.len())]
    Aggregate(Vec<StepFailure>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable reason code, independent of message content.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Transient(_) => "transient",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::BuildFailed { .. } => "build_failed",
            Error::PodFailed { .. } => "pod_failed",
            Error::InvalidBundle(_) => "invalid_bundle",
            Error::LeaseAcquire(_) => "lease_acquire",
            Error::LeaseRelease(_) => "lease_release",
            Error::ClaimTimeout(_) => "claim_timeout",
            Error::PoolNotFound(_) => "pool_not_found",
            Error::PropagateSecrets(_) => "propagate_secrets",
            Error::Cancelled => "cancelled",
            Error::DuplicateParameter(_) => "duplicate_parameter",
            Error::UnresolvedParameter(_) => "unresolved_parameter",
            Error::ResolverError { .. } => "resolver_error",
            Error::NoLeaseClient => "no_lease_client",
            Error::Skipped(_) => "skipped",
            Error::Aggregate(_) => "aggregate_failure",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether a bounded retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::NotFound(_))
    }

    /// Combine a primary outcome with a cleanup outcome so that neither
    /// masks the other.
    pub fn aggregate(step: &str, primary: Result<()>, cleanup: Result<()>) -> Result<()> {
        match (primary, cleanup) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Err(primary), Err(cleanup)) => Err(Error::Aggregate(vec![
                StepFailure::new(step, primary),
                StepFailure::new(step, cleanup),
            ])),
        }
    }
}

/// A failed step together with its reason, preserved through aggregation.
#[derive(Debug, Error)]
#[error("step {step} failed: {error}")]
pub struct StepFailure {
    pub step: String,
    pub error: Box<Error>,
}

impl StepFailure {
    pub fn new(step: impl Into<String>, error: Error) -> Self {
        Self {
            step: step.into(),
            error: Box::new(error),
        }
    }

    pub fn reason(&self) -> &'static str {
        self.error.reason()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
