//! Core domain types and traits for the Gantry CI engine.
//!
//! This crate contains:
//! - The job spec envelope and derived identifiers
//! - Step links (typed dependency edges) and the Step trait
//! - The deferred parameter store
//! - JUnit test case/suite model
//! - Error taxonomy shared by every crate
//! - Declarative step configuration types

pub mod config;
pub mod error;
pub mod jobspec;
pub mod junit;
pub mod labels;
pub mod link;
pub mod params;
pub mod step;

pub use error::{Error, Result, StepFailure};
pub use jobspec::JobSpec;
pub use link::StepLink;
pub use params::ParameterStore;
pub use step::Step;
