//! Cluster-claim decorator.
//!
//! Claims a pre-provisioned cluster from a pool matched by labels,
//! waits for the claim to run, copies its admin credentials into the
//! job namespace, and releases the claim on every outcome of the
//! wrapped step.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gantry_core::config::ClusterClaimConfig;
use gantry_core::labels::standard_labels;
use gantry_core::step::{InputDefinition, JobContext, ObjectReference, Parameter, Step, SubtestReporter};
use gantry_core::{Error, Result, StepLink};
use gantry_executor::api::{ClusterClaim, ClusterClaimSpec};
use gantry_executor::client::{ClaimClient, SecretClient};

use crate::StepDeps;

/// Admin credentials copied into the job namespace.
pub const HIVE_ADMIN_KUBECONFIG_SECRET: &str = "hive-admin-kubeconfig";
pub const HIVE_ADMIN_PASSWORD_SECRET: &str = "hive-admin-password";

pub struct ClusterClaimStep {
    wrapped: Box<dyn Step>,
    config: ClusterClaimConfig,
    claims: Arc<dyn ClaimClient>,
    secrets: Arc<dyn SecretClient>,
    job: Arc<JobContext>,
    claim_name: Mutex<Option<String>>,
    poll_interval: Duration,
}

impl ClusterClaimStep {
    pub fn wrap(wrapped: Box<dyn Step>, config: ClusterClaimConfig, deps: &StepDeps) -> Self {
        Self::from_parts(
            wrapped,
            config,
            deps.clients.claims.clone(),
            deps.clients.secrets.clone(),
            deps.job.clone(),
        )
    }

    pub fn from_parts(
        wrapped: Box<dyn Step>,
        config: ClusterClaimConfig,
        claims: Arc<dyn ClaimClient>,
        secrets: Arc<dyn SecretClient>,
        job: Arc<JobContext>,
    ) -> Self {
        Self {
            wrapped,
            config,
            claims,
            secrets,
            job,
            claim_name: Mutex::new(None),
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn acquire(&self, token: &CancellationToken) -> Result<()> {
        let selector = self.config.pool_selector();
        let pools = self.claims.list_pools(&selector).await?;
        let Some(pool) = pools.first() else {
            let description = selector
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            return Err(Error::PoolNotFound(description));
        };
        let pool_name = pool
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Internal("cluster pool without a name".into()))?;

        let claim_name = format!(
            "{}-{}",
            self.wrapped.name(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut claim = ClusterClaim::new(
            &claim_name,
            ClusterClaimSpec {
                cluster_pool_name: pool_name.clone(),
                lifetime: None,
            },
        );
        let mut labels = standard_labels(&self.job.spec);
        labels.extend(self.config.labels.clone());
        claim.metadata.labels = Some(labels);

        info!(step = self.wrapped.name(), pool = %pool_name, claim = %claim_name, "claiming cluster");
        self.claims.create_claim(&claim).await?;
        *self.claim_name.lock().unwrap() = Some(claim_name.clone());

        let deadline = Instant::now() + self.config.timeout();
        let running = loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(Error::ClaimTimeout(self.config.timeout()));
            }
            tokio::time::sleep(self.poll_interval).await;
            match self.claims.get_claim(&claim_name).await? {
                Some(claim) if claim.is_running() => break claim,
                _ => continue,
            }
        };

        self.propagate_secrets(&running).await
    }

    async fn propagate_secrets(&self, claim: &ClusterClaim) -> Result<()> {
        let status = claim
            .status
            .as_ref()
            .ok_or_else(|| Error::PropagateSecrets("claim has no status".into()))?;
        let namespace = status
            .namespace
            .as_deref()
            .ok_or_else(|| Error::PropagateSecrets("claim has no namespace".into()))?;
        let kubeconfig_secret = status
            .kubeconfig_secret_name
            .as_deref()
            .ok_or_else(|| Error::PropagateSecrets("claim names no kubeconfig secret".into()))?;
        let password_secret = status
            .password_secret_name
            .as_deref()
            .ok_or_else(|| Error::PropagateSecrets("claim names no password secret".into()))?;

        self.copy_secret(namespace, kubeconfig_secret, HIVE_ADMIN_KUBECONFIG_SECRET, "kubeconfig")
            .await?;
        self.copy_secret(namespace, password_secret, HIVE_ADMIN_PASSWORD_SECRET, "password")
            .await
    }

    /// Copy one credential key into a fresh immutable secret in the
    /// job namespace.
    async fn copy_secret(&self, namespace: &str, from: &str, to: &str, key: &str) -> Result<()> {
        let source = self
            .claims
            .read_secret(namespace, from)
            .await?
            .ok_or_else(|| Error::PropagateSecrets(format!("secret {namespace}/{from} not found")))?;
        let value: ByteString = source
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .cloned()
            .ok_or_else(|| {
                Error::PropagateSecrets(format!("secret {namespace}/{from} has no {key} key"))
            })?;

        let mut secret = Secret::default();
        secret.metadata.name = Some(to.to_string());
        secret.metadata.namespace = Some(self.job.namespace.clone());
        secret.metadata.labels = Some(standard_labels(&self.job.spec));
        secret.immutable = Some(true);
        secret.data = Some([(key.to_string(), value)].into_iter().collect());

        match self.secrets.create(&secret).await {
            Ok(_) => Ok(()),
            Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(Error::PropagateSecrets(e.to_string())),
        }
    }

    async fn release(&self) -> Result<()> {
        let claim_name = self.claim_name.lock().unwrap().take();
        let Some(claim_name) = claim_name else {
            return Ok(());
        };
        info!(claim = %claim_name, "releasing cluster claim");
        self.claims.delete_claim(&claim_name).await
    }
}

#[async_trait]
impl Step for ClusterClaimStep {
    fn name(&self) -> &str {
        self.wrapped.name()
    }

    fn requires(&self) -> Vec<StepLink> {
        self.wrapped.requires()
    }

    fn creates(&self) -> Vec<StepLink> {
        let mut links = self.wrapped.creates();
        links.push(StepLink::cluster_claim(self.wrapped.name()));
        links
    }

    fn provides(&self) -> Vec<Parameter> {
        self.wrapped.provides()
    }

    async fn inputs(&self) -> Result<InputDefinition> {
        self.wrapped.inputs().await
    }

    fn validate(&self) -> Result<()> {
        if self.config.timeout_seconds == 0 {
            return Err(Error::Validation("claim timeout must be positive".into()));
        }
        self.wrapped.validate()
    }

    async fn run(&self, token: &CancellationToken) -> Result<()> {
        if let Err(e) = self.acquire(token).await {
            // The claim may exist even when acquisition failed.
            let release = self.release().await;
            if let Err(release_err) = &release {
                warn!(step = self.wrapped.name(), error = %release_err, "claim release failed");
            }
            return Error::aggregate(self.wrapped.name(), Err(e), release);
        }
        let result = self.wrapped.run(token).await;
        let release = self.release().await;
        Error::aggregate(self.wrapped.name(), result, release)
    }

    fn objects(&self) -> Vec<ObjectReference> {
        self.wrapped.objects()
    }

    fn as_subtest_reporter(&self) -> Option<&dyn SubtestReporter> {
        self.wrapped.as_subtest_reporter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::tests::InnerStep;
    use gantry_core::JobSpec;
    use gantry_executor::api::{ClaimCondition, ClusterClaimStatus, ClusterPool, ClusterPoolSpec};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeClaims {
        pool: Option<ClusterPool>,
        becomes_running: bool,
        created: Mutex<Vec<ClusterClaim>>,
        deleted: Mutex<Vec<String>>,
    }

    impl FakeClaims {
        fn new(pool: bool, becomes_running: bool) -> Self {
            let pool = pool.then(|| {
                let mut p = ClusterPool::new("aws-pool", ClusterPoolSpec { size: 3 });
                p.metadata.name = Some("aws-pool".to_string());
                p
            });
            Self {
                pool,
                becomes_running,
                created: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ClaimClient for FakeClaims {
        async fn list_pools(&self, _selector: &BTreeMap<String, String>) -> Result<Vec<ClusterPool>> {
            Ok(self.pool.clone().into_iter().collect())
        }

        async fn create_claim(&self, claim: &ClusterClaim) -> Result<ClusterClaim> {
            self.created.lock().unwrap().push(claim.clone());
            Ok(claim.clone())
        }

        async fn get_claim(&self, name: &str) -> Result<Option<ClusterClaim>> {
            let mut claim = self
                .created
                .lock()
                .unwrap()
                .first()
                .cloned()
                .unwrap_or_else(|| ClusterClaim::new(name, ClusterClaimSpec::default()));
            if self.becomes_running {
                claim.status = Some(ClusterClaimStatus {
                    conditions: vec![ClaimCondition {
                        condition_type: "Running".into(),
                        status: "True".into(),
                        reason: None,
                        message: None,
                    }],
                    namespace: Some("pool-cluster-1".into()),
                    kubeconfig_secret_name: Some("admin-kubeconfig".into()),
                    password_secret_name: Some("admin-password".into()),
                });
            }
            Ok(Some(claim))
        }

        async fn delete_claim(&self, name: &str) -> Result<()> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn read_secret(&self, _namespace: &str, name: &str) -> Result<Option<Secret>> {
            let (key, value) = match name {
                "admin-kubeconfig" => ("kubeconfig", b"kubeconfig-bytes".to_vec()),
                "admin-password" => ("password", b"hunter2".to_vec()),
                _ => return Ok(None),
            };
            let mut secret = Secret::default();
            secret.data = Some([(key.to_string(), ByteString(value))].into_iter().collect());
            Ok(Some(secret))
        }
    }

    #[derive(Default)]
    struct FakeSecrets {
        created: Mutex<Vec<Secret>>,
    }

    #[async_trait]
    impl SecretClient for FakeSecrets {
        async fn get(&self, name: &str) -> Result<Option<Secret>> {
            Ok(self
                .created
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.metadata.name.as_deref() == Some(name))
                .cloned())
        }

        async fn create(&self, secret: &Secret) -> Result<Secret> {
            self.created.lock().unwrap().push(secret.clone());
            Ok(secret.clone())
        }
    }

    fn job() -> Arc<JobContext> {
        Arc::new(JobContext {
            spec: JobSpec::parse(r#"{"type":"periodic","job":"nightly","buildid":"1","prowjobid":"x"}"#)
                .unwrap(),
            namespace: "ci-op-1234".into(),
            artifact_dir: None,
        })
    }

    fn config(timeout_seconds: u64) -> ClusterClaimConfig {
        ClusterClaimConfig {
            product: "ocp".into(),
            version: "4.7.0".into(),
            architecture: "amd64".into(),
            cloud: "aws".into(),
            owner: "dpp".into(),
            region: None,
            timeout_seconds,
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_copies_immutable_admin_secrets() {
        let claims = Arc::new(FakeClaims::new(true, true));
        let secrets = Arc::new(FakeSecrets::default());
        let step = ClusterClaimStep::from_parts(
            Box::new(InnerStep::new(false)),
            config(60),
            claims.clone(),
            secrets.clone(),
            job(),
        )
        .with_poll_interval(Duration::from_millis(5));

        step.run(&CancellationToken::new()).await.unwrap();

        let created = secrets.created.lock().unwrap();
        assert_eq!(created.len(), 2);
        let kubeconfig = created
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some(HIVE_ADMIN_KUBECONFIG_SECRET))
            .unwrap();
        assert_eq!(kubeconfig.immutable, Some(true));
        assert_eq!(
            kubeconfig.data.as_ref().unwrap()["kubeconfig"],
            ByteString(b"kubeconfig-bytes".to_vec())
        );
        let password = created
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some(HIVE_ADMIN_PASSWORD_SECRET))
            .unwrap();
        assert_eq!(password.immutable, Some(true));
        assert_eq!(
            password.data.as_ref().unwrap()["password"],
            ByteString(b"hunter2".to_vec())
        );

        // Released exactly once.
        assert_eq!(claims.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_stuck_pending_times_out_without_secrets() {
        let claims = Arc::new(FakeClaims::new(true, false));
        let secrets = Arc::new(FakeSecrets::default());
        let wrapped_ran = Arc::new(AtomicBool::new(false));

        struct Probe(Arc<AtomicBool>);
        #[async_trait]
        impl Step for Probe {
            fn name(&self) -> &str {
                "claimed"
            }
            fn requires(&self) -> Vec<StepLink> {
                Vec::new()
            }
            fn creates(&self) -> Vec<StepLink> {
                Vec::new()
            }
            async fn run(&self, _token: &CancellationToken) -> Result<()> {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let step = ClusterClaimStep::from_parts(
            Box::new(Probe(wrapped_ran.clone())),
            config(1),
            claims.clone(),
            secrets.clone(),
            job(),
        )
        .with_poll_interval(Duration::from_millis(50));

        let err = step.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.reason(), "claim_timeout");
        assert!(secrets.created.lock().unwrap().is_empty());
        assert!(!wrapped_ran.load(Ordering::SeqCst));
        // The pending claim is still cleaned up.
        assert_eq!(claims.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_pool_is_reported() {
        let claims = Arc::new(FakeClaims::new(false, false));
        let step = ClusterClaimStep::from_parts(
            Box::new(InnerStep::new(false)),
            config(60),
            claims,
            Arc::new(FakeSecrets::default()),
            job(),
        );
        let err = step.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.reason(), "pool_not_found");
        assert!(err.to_string().contains("product=ocp"));
    }
}
