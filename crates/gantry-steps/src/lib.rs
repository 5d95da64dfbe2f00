//! Concrete step kinds and decorators for the Gantry CI engine.
//!
//! Each step kind binds its clients and configuration at construction;
//! `build_graph` assembles the full step set for a job and registers
//! every published parameter.

pub mod cache;
pub mod claim;
pub mod images_ready;
pub mod input_env;
pub mod input_image;
pub mod ip_pool;
pub mod lease;
pub mod multi_stage;
pub mod output_tag;
pub mod project_image;
pub mod source;
pub mod template;
pub mod write_params;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use gantry_core::config::GraphConfig;
use gantry_core::params::ParameterStore;
use gantry_core::step::{JobContext, Step};
use gantry_core::{Result, StepLink};
use gantry_executor::artifacts::ArtifactSpec;
use gantry_executor::client::ClusterClients;

use crate::lease::LeaseClient;

/// Everything a step constructor may need, injected explicitly.
#[derive(Clone)]
pub struct StepDeps {
    pub job: Arc<JobContext>,
    pub clients: ClusterClients,
    pub params: Arc<ParameterStore>,
    pub artifacts: ArtifactSpec,
    pub leases: Option<Arc<dyn LeaseClient>>,
}

/// Materialize the step graph for one job and register every published
/// parameter in the store.
pub fn build_graph(config: &GraphConfig, deps: &StepDeps) -> Result<Vec<Box<dyn Step>>> {
    let mut steps: Vec<Box<dyn Step>> = Vec::new();

    for (to, from) in &config.base_images {
        steps.push(Box::new(input_image::InputImageStep::new(
            to.clone(),
            from.clone(),
            deps,
        )));
    }
    if let Some(source) = &config.source {
        steps.push(Box::new(source::SourceStep::new(source.clone(), deps)));
    }
    for cache in &config.caches {
        steps.push(Box::new(cache::CacheStep::new(cache.clone(), deps)));
    }
    for image in &config.images {
        steps.push(Box::new(project_image::ProjectImageStep::new(
            image.clone(),
            deps,
        )));
    }

    let mut output_links = Vec::new();
    for output in &config.outputs {
        let step = output_tag::OutputTagStep::new(output.clone(), deps);
        output_links.extend(step.creates());
        steps.push(Box::new(step));
    }
    if !output_links.is_empty() {
        steps.push(Box::new(images_ready::ImagesReadyStep::new(output_links)));
    }

    if !config.env.is_empty() {
        steps.push(Box::new(input_env::InputEnvStep::new(
            config.env.clone(),
            Vec::new(),
        )));
    }

    for test in &config.tests {
        let mut step: Box<dyn Step> =
            Box::new(multi_stage::MultiStageStep::new(test.clone(), deps));
        if let Some(claim) = &test.claim {
            step = Box::new(claim::ClusterClaimStep::wrap(step, claim.clone(), deps));
        }
        if let Some(pool) = &test.ip_pool {
            step = Box::new(ip_pool::IpPoolStep::wrap(
                step,
                pool.clone(),
                deps.leases.clone(),
            ));
        }
        if !test.leases.is_empty() {
            step = Box::new(lease::LeaseStep::wrap(
                step,
                test.leases.clone(),
                deps.leases.clone(),
            ));
        }
        steps.push(step);
    }

    for template in &config.templates {
        steps.push(Box::new(template::TemplateStep::new(
            template.clone(),
            deps,
        )));
    }

    if let Some(path) = &config.parameters_path {
        steps.push(Box::new(write_params::WriteParametersStep::new(
            path.clone(),
            deps.params.clone(),
        )));
    }

    register_provides(&steps, &deps.params)?;
    Ok(steps)
}

/// Register every step-published parameter; duplicate names across
/// steps are a configuration error.
fn register_provides(steps: &[Box<dyn Step>], params: &ParameterStore) -> Result<()> {
    for step in steps {
        for parameter in step.provides() {
            params.add(parameter.name, parameter.link, parameter.resolver)?;
        }
    }
    Ok(())
}

pub(crate) fn dedup_links(links: Vec<StepLink>) -> Vec<StepLink> {
    let mut seen = std::collections::HashSet::new();
    links.into_iter().filter(|l| seen.insert(l.clone())).collect()
}
