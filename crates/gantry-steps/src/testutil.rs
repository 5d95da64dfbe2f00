//! Shared fakes for step tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};

use gantry_core::step::{JobContext, ObjectReference};
use gantry_core::{JobSpec, Result};
use gantry_executor::api::{
    Build, BuildPhase, BuildStatus, ClusterClaim, ClusterPool, ImageStreamTag, ImageStreamTagStatus,
};
use gantry_executor::artifacts::ArtifactSpec;
use gantry_executor::client::{
    BuildClient, ClaimClient, ClusterClients, DynamicClient, ImageTagClient, PodClient, SecretClient,
};
use gantry_core::params::ParameterStore;

use crate::StepDeps;

pub(crate) fn job_context() -> Arc<JobContext> {
    Arc::new(JobContext {
        spec: JobSpec::parse(
            r#"{
                "type": "presubmit",
                "job": "pull-ci-org-repo-master-e2e",
                "buildid": "42",
                "prowjobid": "p1",
                "refs": {
                    "org": "org", "repo": "repo",
                    "base_ref": "master", "base_sha": "abc123",
                    "pulls": [{"number": 7, "author": "dev", "sha": "def456"}]
                }
            }"#,
        )
        .unwrap(),
        namespace: "ci-op-1234".into(),
        artifact_dir: None,
    })
}

/// Image tag store; applied tags immediately resolve to a digest.
#[derive(Default)]
pub(crate) struct FakeTags {
    pub store: Mutex<HashMap<String, ImageStreamTag>>,
    pub applied: Mutex<Vec<ImageStreamTag>>,
}

impl FakeTags {
    pub fn insert_resolved(&self, name: &str, digest: &str) {
        let mut tag = ImageStreamTag::new(name, Default::default());
        tag.status = Some(ImageStreamTagStatus {
            digest: Some(digest.to_string()),
            pull_spec: None,
        });
        self.store.lock().unwrap().insert(name.to_string(), tag);
    }
}

#[async_trait]
impl ImageTagClient for FakeTags {
    async fn get(&self, name: &str) -> Result<Option<ImageStreamTag>> {
        Ok(self.store.lock().unwrap().get(name).cloned())
    }

    async fn get_in(&self, namespace: &str, name: &str) -> Result<Option<ImageStreamTag>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned())
    }

    async fn apply(&self, tag: &ImageStreamTag) -> Result<ImageStreamTag> {
        self.applied.lock().unwrap().push(tag.clone());
        let name = tag.metadata.name.clone().unwrap_or_default();
        let key = match tag.metadata.namespace.as_deref() {
            Some("ci-op-1234") | None => name,
            Some(ns) => format!("{ns}/{name}"),
        };
        let mut stored = tag.clone();
        stored.status = Some(ImageStreamTagStatus {
            digest: Some(format!("sha256:{key}")),
            pull_spec: None,
        });
        self.store.lock().unwrap().insert(key, stored.clone());
        Ok(stored)
    }
}

/// Build store whose builds complete as soon as they are read back.
#[derive(Default)]
pub(crate) struct FakeBuilds {
    pub created: Mutex<Vec<Build>>,
    pub fail_with: Mutex<Option<String>>,
}

#[async_trait]
impl BuildClient for FakeBuilds {
    async fn get(&self, name: &str) -> Result<Option<Build>> {
        let created = self.created.lock().unwrap();
        let Some(build) = created.iter().find(|b| b.metadata.name.as_deref() == Some(name))
        else {
            return Ok(None);
        };
        let mut build = build.clone();
        build.status = Some(match self.fail_with.lock().unwrap().clone() {
            Some(message) => BuildStatus {
                phase: BuildPhase::Failed,
                message: Some(message),
                reason: None,
            },
            None => BuildStatus {
                phase: BuildPhase::Complete,
                message: None,
                reason: None,
            },
        });
        Ok(Some(build))
    }

    async fn create(&self, build: &Build) -> Result<Build> {
        self.created.lock().unwrap().push(build.clone());
        Ok(build.clone())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.created
            .lock()
            .unwrap()
            .retain(|b| b.metadata.name.as_deref() != Some(name));
        Ok(())
    }
}

/// Inert clients for assembly tests that never run steps.
pub(crate) struct NopClients;

#[async_trait]
impl PodClient for NopClients {
    async fn get(&self, _name: &str) -> Result<Option<Pod>> {
        Ok(None)
    }
    async fn create(&self, pod: &Pod) -> Result<Pod> {
        Ok(pod.clone())
    }
    async fn delete(&self, _name: &str) -> Result<()> {
        Ok(())
    }
    async fn delete_by_selector(&self, _selector: &str) -> Result<()> {
        Ok(())
    }
    async fn exec(&self, _p: &str, _c: &str, _cmd: &[String]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
    async fn logs(&self, _p: &str, _c: &str) -> Result<String> {
        Ok(String::new())
    }
}

#[async_trait]
impl SecretClient for NopClients {
    async fn get(&self, _name: &str) -> Result<Option<Secret>> {
        Ok(None)
    }
    async fn create(&self, secret: &Secret) -> Result<Secret> {
        Ok(secret.clone())
    }
}

#[async_trait]
impl ClaimClient for NopClients {
    async fn list_pools(&self, _selector: &BTreeMap<String, String>) -> Result<Vec<ClusterPool>> {
        Ok(Vec::new())
    }
    async fn create_claim(&self, claim: &ClusterClaim) -> Result<ClusterClaim> {
        Ok(claim.clone())
    }
    async fn get_claim(&self, _name: &str) -> Result<Option<ClusterClaim>> {
        Ok(None)
    }
    async fn delete_claim(&self, _name: &str) -> Result<()> {
        Ok(())
    }
    async fn read_secret(&self, _namespace: &str, _name: &str) -> Result<Option<Secret>> {
        Ok(None)
    }
}

#[async_trait]
impl DynamicClient for NopClients {
    async fn create(&self, manifest: &serde_json::Value) -> Result<ObjectReference> {
        Ok(ObjectReference {
            kind: manifest["kind"].as_str().unwrap_or_default().to_string(),
            namespace: String::new(),
            name: String::new(),
        })
    }
}

pub(crate) fn fake_deps() -> StepDeps {
    StepDeps {
        job: job_context(),
        clients: ClusterClients {
            pods: Arc::new(NopClients),
            builds: Arc::new(FakeBuilds::default()),
            tags: Arc::new(FakeTags::default()),
            secrets: Arc::new(NopClients),
            claims: Arc::new(NopClients),
            dynamic: Arc::new(NopClients),
        },
        params: Arc::new(ParameterStore::new()),
        artifacts: ArtifactSpec::default(),
        leases: None,
    }
}
