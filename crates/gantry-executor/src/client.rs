//! Narrow capability surfaces over the cluster.
//!
//! Steps never hold a raw cluster handle; they receive exactly the
//! capabilities they call, which keeps every driver mockable.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use tokio::io::AsyncReadExt;
use tracing::info;

use gantry_core::step::ObjectReference;
use gantry_core::{Error, Result};

use crate::api::{Build, ClusterClaim, ClusterPool, ImageStreamTag};

/// Field manager for server-side applies.
const FIELD_MANAGER: &str = "gantry";

#[async_trait]
pub trait PodClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Pod>>;
    async fn create(&self, pod: &Pod) -> Result<Pod>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn delete_by_selector(&self, selector: &str) -> Result<()>;
    /// Run a command in a container and collect its stdout.
    async fn exec(&self, pod: &str, container: &str, command: &[String]) -> Result<Vec<u8>>;
    async fn logs(&self, pod: &str, container: &str) -> Result<String>;
}

#[async_trait]
pub trait BuildClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Build>>;
    async fn create(&self, build: &Build) -> Result<Build>;
    async fn delete(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait ImageTagClient: Send + Sync {
    /// Read a tag from the job namespace.
    async fn get(&self, name: &str) -> Result<Option<ImageStreamTag>>;
    /// Read a tag from another namespace (output streams).
    async fn get_in(&self, namespace: &str, name: &str) -> Result<Option<ImageStreamTag>>;
    /// Create or update, server-side; the namespace comes from the
    /// tag's metadata, defaulting to the job namespace.
    async fn apply(&self, tag: &ImageStreamTag) -> Result<ImageStreamTag>;
}

#[async_trait]
pub trait SecretClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Secret>>;
    async fn create(&self, secret: &Secret) -> Result<Secret>;
}

#[async_trait]
pub trait ClaimClient: Send + Sync {
    async fn list_pools(&self, selector: &BTreeMap<String, String>) -> Result<Vec<ClusterPool>>;
    async fn create_claim(&self, claim: &ClusterClaim) -> Result<ClusterClaim>;
    async fn get_claim(&self, name: &str) -> Result<Option<ClusterClaim>>;
    async fn delete_claim(&self, name: &str) -> Result<()>;
    /// Read a secret from the claimed cluster's namespace.
    async fn read_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// Creates arbitrary manifests, for template objects that are not pods.
#[async_trait]
pub trait DynamicClient: Send + Sync {
    async fn create(&self, manifest: &serde_json::Value) -> Result<ObjectReference>;
}

/// Every capability a graph may need, bundled for injection into step
/// constructors.
#[derive(Clone)]
pub struct ClusterClients {
    pub pods: Arc<dyn PodClient>,
    pub builds: Arc<dyn BuildClient>,
    pub tags: Arc<dyn ImageTagClient>,
    pub secrets: Arc<dyn SecretClient>,
    pub claims: Arc<dyn ClaimClient>,
    pub dynamic: Arc<dyn DynamicClient>,
}

impl ClusterClients {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Arc::new(KubePodClient::new(client.clone(), namespace)),
            builds: Arc::new(KubeBuildClient::new(client.clone(), namespace)),
            tags: Arc::new(KubeImageTagClient::new(client.clone(), namespace)),
            secrets: Arc::new(KubeSecretClient::new(client.clone(), namespace)),
            claims: Arc::new(KubeClaimClient::new(client.clone(), namespace)),
            dynamic: Arc::new(KubeDynamicClient::new(client, namespace)),
        }
    }
}

/// Map a cluster error onto the engine taxonomy.
pub(crate) fn kube_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => Error::AlreadyExists(ae.message),
        kube::Error::Api(ae) if ae.code >= 500 => Error::Transient(ae.message),
        kube::Error::Api(ae) => Error::Internal(format!("api error {}: {}", ae.code, ae.message)),
        other => Error::Transient(other.to_string()),
    }
}

fn flatten_not_found<K>(res: std::result::Result<K, kube::Error>) -> Result<Option<K>> {
    match res {
        Ok(obj) => Ok(Some(obj)),
        Err(err) => match kube_error(err) {
            Error::NotFound(_) => Ok(None),
            other => Err(other),
        },
    }
}

pub struct KubePodClient {
    api: Api<Pod>,
}

impl KubePodClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn get(&self, name: &str) -> Result<Option<Pod>> {
        flatten_not_found(self.api.get(name).await)
    }

    async fn create(&self, pod: &Pod) -> Result<Pod> {
        self.api
            .create(&PostParams::default(), pod)
            .await
            .map_err(kube_error)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(err) => match kube_error(err) {
                Error::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn delete_by_selector(&self, selector: &str) -> Result<()> {
        info!(selector, "deleting pods by selector");
        let list = ListParams::default().labels(selector);
        self.api
            .delete_collection(&DeleteParams::background(), &list)
            .await
            .map_err(kube_error)?;
        Ok(())
    }

    async fn exec(&self, pod: &str, container: &str, command: &[String]) -> Result<Vec<u8>> {
        let params = AttachParams::default()
            .container(container)
            .stdout(true)
            .stderr(false);
        let mut attached = self
            .api
            .exec(pod, command.iter().map(String::as_str), &params)
            .await
            .map_err(kube_error)?;
        let mut stdout = attached
            .stdout()
            .ok_or_else(|| Error::Internal(format!("no stdout stream from {pod}/{container}")))?;
        let mut out = Vec::with_capacity(4096);
        stdout
            .read_to_end(&mut out)
            .await
            .map_err(|e| Error::Transient(format!("reading exec stream from {pod}: {e}")))?;
        attached
            .join()
            .await
            .map_err(|e| Error::Internal(format!("exec in {pod}/{container} failed: {e}")))?;
        Ok(out)
    }

    async fn logs(&self, pod: &str, container: &str) -> Result<String> {
        let params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        self.api.logs(pod, &params).await.map_err(kube_error)
    }
}

pub struct KubeBuildClient {
    api: Api<Build>,
}

impl KubeBuildClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl BuildClient for KubeBuildClient {
    async fn get(&self, name: &str) -> Result<Option<Build>> {
        flatten_not_found(self.api.get(name).await)
    }

    async fn create(&self, build: &Build) -> Result<Build> {
        self.api
            .create(&PostParams::default(), build)
            .await
            .map_err(kube_error)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(err) => match kube_error(err) {
                Error::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}

pub struct KubeImageTagClient {
    client: Client,
    namespace: String,
}

impl KubeImageTagClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api(&self, namespace: &str) -> Api<ImageStreamTag> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ImageTagClient for KubeImageTagClient {
    async fn get(&self, name: &str) -> Result<Option<ImageStreamTag>> {
        flatten_not_found(self.api(&self.namespace).get(name).await)
    }

    async fn get_in(&self, namespace: &str, name: &str) -> Result<Option<ImageStreamTag>> {
        flatten_not_found(self.api(namespace).get(name).await)
    }

    async fn apply(&self, tag: &ImageStreamTag) -> Result<ImageStreamTag> {
        let name = tag
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::Internal("image stream tag without a name".into()))?;
        let namespace = tag.metadata.namespace.as_deref().unwrap_or(&self.namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api(namespace)
            .patch(name, &params, &Patch::Apply(tag))
            .await
            .map_err(kube_error)
    }
}

pub struct KubeSecretClient {
    api: Api<Secret>,
}

impl KubeSecretClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl SecretClient for KubeSecretClient {
    async fn get(&self, name: &str) -> Result<Option<Secret>> {
        flatten_not_found(self.api.get(name).await)
    }

    async fn create(&self, secret: &Secret) -> Result<Secret> {
        self.api
            .create(&PostParams::default(), secret)
            .await
            .map_err(kube_error)
    }
}

pub struct KubeClaimClient {
    client: Client,
    claims: Api<ClusterClaim>,
    pools: Api<ClusterPool>,
}

impl KubeClaimClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            claims: Api::namespaced(client.clone(), namespace),
            pools: Api::namespaced(client.clone(), namespace),
            client,
        }
    }
}

#[async_trait]
impl ClaimClient for KubeClaimClient {
    async fn list_pools(&self, selector: &BTreeMap<String, String>) -> Result<Vec<ClusterPool>> {
        let labels = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let params = ListParams::default().labels(&labels);
        let pools = self.pools.list(&params).await.map_err(kube_error)?;
        Ok(pools.items)
    }

    async fn create_claim(&self, claim: &ClusterClaim) -> Result<ClusterClaim> {
        self.claims
            .create(&PostParams::default(), claim)
            .await
            .map_err(kube_error)
    }

    async fn get_claim(&self, name: &str) -> Result<Option<ClusterClaim>> {
        flatten_not_found(self.claims.get(name).await)
    }

    async fn delete_claim(&self, name: &str) -> Result<()> {
        match self.claims.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(err) => match kube_error(err) {
                Error::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn read_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        flatten_not_found(api.get(name).await)
    }
}

pub struct KubeDynamicClient {
    client: Client,
    namespace: String,
}

impl KubeDynamicClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl DynamicClient for KubeDynamicClient {
    async fn create(&self, manifest: &serde_json::Value) -> Result<ObjectReference> {
        let api_version = manifest["apiVersion"]
            .as_str()
            .ok_or_else(|| Error::Validation("object without apiVersion".into()))?;
        let kind = manifest["kind"]
            .as_str()
            .ok_or_else(|| Error::Validation("object without kind".into()))?;
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, caps) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(kube_error)?;

        let object: DynamicObject = serde_json::from_value(manifest.clone())
            .map_err(|e| Error::Validation(format!("malformed {kind} object: {e}")))?;
        let api: Api<DynamicObject> = if matches!(caps.scope, kube::discovery::Scope::Namespaced) {
            Api::namespaced_with(self.client.clone(), &self.namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        };

        let created = match api.create(&PostParams::default(), &object).await {
            Ok(created) => created,
            Err(err) => match kube_error(err) {
                // Reconciled elsewhere; creation is idempotent.
                Error::AlreadyExists(_) => object,
                other => return Err(other),
            },
        };
        Ok(ObjectReference {
            kind: kind.to_string(),
            namespace: self.namespace.clone(),
            name: created.metadata.name.unwrap_or_default(),
        })
    }
}
