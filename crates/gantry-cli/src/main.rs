//! Gantry: drives one job's step graph to completion.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gantry_core::config::GraphConfig;
use gantry_core::step::JobContext;
use gantry_core::{Error, JobSpec, ParameterStore};
use gantry_executor::artifacts::ArtifactSpec;
use gantry_executor::client::ClusterClients;
use gantry_scheduler::{Reporter, run_graph};
use gantry_steps::{StepDeps, build_graph};

mod broker;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "CI step graph execution engine", long_about = None)]
struct Options {
    /// Path to the step graph configuration (JSON)
    #[arg(long, env = "GANTRY_CONFIG")]
    config: PathBuf,

    /// Namespace the job's resources live in; derived from the job
    /// spec when omitted
    #[arg(long, env = "NAMESPACE")]
    namespace: Option<String>,

    /// Local directory pod artifacts are collected into
    #[arg(long, env = "ARTIFACT_DIR")]
    artifact_dir: Option<PathBuf>,

    /// Lease broker URL; graphs that lease resources require it
    #[arg(long, env = "LEASE_SERVER")]
    lease_server: Option<String>,

    /// Artifact sidecar image override
    #[arg(long)]
    sidecar_image: Option<String>,

    /// Where the JUnit suite is written
    #[arg(long, default_value = "junit_operator.xml")]
    junit: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = Options::parse();
    let spec = JobSpec::from_env().context("reading JOB_SPEC")?;
    let namespace = options
        .namespace
        .clone()
        .unwrap_or_else(|| format!("ci-op-{}", spec.id()));
    info!(job = %spec.job, buildid = %spec.buildid, namespace = %namespace, "starting job");

    let raw = tokio::fs::read_to_string(&options.config)
        .await
        .with_context(|| format!("reading {}", options.config.display()))?;
    let config: GraphConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", options.config.display()))?;

    let client = kube::Client::try_default()
        .await
        .context("connecting to the cluster")?;
    let job = Arc::new(JobContext {
        spec: spec.clone(),
        namespace: namespace.clone(),
        artifact_dir: options.artifact_dir.clone(),
    });
    let mut artifacts = ArtifactSpec::default();
    if let Some(image) = &options.sidecar_image {
        artifacts.sidecar_image = image.clone();
    }
    let deps = StepDeps {
        job,
        clients: ClusterClients::new(client, &namespace),
        params: Arc::new(ParameterStore::new()),
        artifacts,
        leases: options.lease_server.as_ref().map(|base| {
            Arc::new(broker::HttpLeaseClient::new(base.as_str(), spec.job_name_safe()))
                as Arc<dyn gantry_steps::lease::LeaseClient>
        }),
    };

    let steps = build_graph(&config, &deps).context("assembling the step graph")?;
    info!(steps = steps.len(), "graph assembled");

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("interrupt received, cancelling all steps");
            interrupt.cancel();
        }
    });

    let reporter = Reporter::new(spec.job_name_safe());
    let result = run_graph(steps, &token, &reporter).await;

    // The JUnit suite is written regardless of the outcome.
    if let Err(e) = reporter.write_to(&options.junit) {
        error!(path = %options.junit.display(), error = %e, "failed to write JUnit output");
    }

    match result {
        Ok(()) => {
            info!("all steps succeeded");
            Ok(())
        }
        Err(Error::Aggregate(failures)) => {
            for failure in &failures {
                error!(step = %failure.step, reason = failure.reason(), "{failure}");
            }
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "graph execution failed");
            std::process::exit(1);
        }
    }
}
