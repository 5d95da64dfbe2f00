//! Cluster workload drivers for the Gantry CI engine.
//!
//! This crate contains:
//! - Custom resource definitions for builds, image tags and claims
//! - Narrow capability traits over the cluster, with kube-backed
//!   implementations
//! - The pod lifecycle driver (watch, sub-tests, artifacts, cancel)
//! - The build lifecycle driver (watch, classification, digests)

pub mod api;
pub mod artifacts;
pub mod build;
pub mod client;
pub mod pod;
pub mod subtest;

pub use client::{BuildClient, ClaimClient, ClusterClients, DynamicClient, ImageTagClient, PodClient, SecretClient};
pub use pod::{ContainerNotifier, NopNotifier, PodDriver};
