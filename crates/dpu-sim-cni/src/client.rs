//! Cluster API client abstraction
//!
//! The installers talk to Kubernetes only through [`ClusterApi`], so install
//! ordering and redeploy behaviour can be exercised against fakes.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::discovery::{Discovery, Scope};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use dpu_sim_common::kube_utils::{
    describe_document, is_pod_ready, parse_api_version, parse_yaml_documents, run_discovery,
};
use dpu_sim_common::{Error, Result, FIELD_MANAGER};

/// Timeout for metadata-style API calls
pub const API_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for applying one manifest file (all of its documents)
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Annotation `kubectl rollout restart` sets on the pod template
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// A node with its labels
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
}

/// Readiness of a single pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodReadiness {
    /// Pod name
    pub name: String,
    /// Whether the pod reports `Ready=True`
    pub ready: bool,
}

/// Operations the CNI installers need from a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Server-side apply every document of a (multi-document) YAML manifest
    async fn apply_manifest(&self, manifest: &[u8]) -> Result<()>;

    /// Fetch a manifest over HTTP(S) and apply it
    async fn apply_manifest_from_url(&self, url: &str) -> Result<()>;

    /// Forget cached API discovery so newly created CRD kinds resolve
    async fn invalidate_discovery_cache(&self);

    /// Data of a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<BTreeMap<String, String>>;

    /// Overwrite keys of a ConfigMap's data
    async fn update_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Pods in `namespace` matching `label_selector` (empty selects all)
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodReadiness>>;

    /// All nodes of the cluster
    async fn get_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Add or overwrite labels on a node
    async fn label_node(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()>;

    /// Remove a taint with the given key and effect; absent taints are ignored
    async fn remove_node_taint(&self, name: &str, key: &str, effect: &str) -> Result<()>;

    /// Delete a DaemonSet; an already missing DaemonSet is not an error
    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()>;

    /// Force-delete every pod matching `label_selector`
    async fn delete_pods_by_label(&self, namespace: &str, label_selector: &str) -> Result<()>;

    /// Restart a DaemonSet's pods the way `kubectl rollout restart` does
    async fn rollout_restart_daemonset(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ClusterApi`] backed by kube-rs
pub struct KubeClusterApi {
    client: Client,
    http: reqwest::Client,
    discovery: Mutex<Option<Arc<Discovery>>>,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            http: reqwest::Client::new(),
            discovery: Mutex::new(None),
        }
    }

    async fn discovery(&self) -> Result<Arc<Discovery>> {
        let mut cached = self.discovery.lock().await;
        if let Some(discovery) = cached.as_ref() {
            return Ok(discovery.clone());
        }
        debug!("Running API discovery");
        let discovery = Arc::new(run_discovery(&self.client).await?);
        *cached = Some(discovery.clone());
        Ok(discovery)
    }

    async fn apply_document(
        &self,
        discovery: &Discovery,
        document: &serde_json::Value,
    ) -> Result<()> {
        let what = describe_document(document);
        let kind = document
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization(format!("{}: missing kind", what)))?;
        let api_version = document
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization(format!("{}: missing apiVersion", what)))?;
        let name = document
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization(format!("{}: missing metadata.name", what)))?;

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind {
            group,
            version,
            kind: kind.to_string(),
        };

        let Some((resource, capabilities)) = discovery.resolve_gvk(&gvk) else {
            return Err(Error::internal_with_context(
                "apply_manifest",
                format!(
                    "unknown resource type {}/{} (is its CRD installed?)",
                    api_version, kind
                ),
            ));
        };

        let api: Api<DynamicObject> = if matches!(capabilities.scope, Scope::Namespaced) {
            let namespace = document
                .pointer("/metadata/namespace")
                .and_then(|v| v.as_str())
                .unwrap_or("default");
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(document)).await?;
        trace!(resource = %what, "Applied");
        Ok(())
    }
}

/// Bound an API call by `timeout`
async fn bounded<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut).await.map_err(|_| {
        Error::internal_with_context(
            operation,
            format!("timed out after {}s", timeout.as_secs()),
        )
    })?
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn apply_manifest(&self, manifest: &[u8]) -> Result<()> {
        let content = std::str::from_utf8(manifest)
            .map_err(|e| Error::serialization(format!("manifest is not UTF-8: {}", e)))?;
        let documents = parse_yaml_documents(content)?;

        bounded("apply_manifest", APPLY_TIMEOUT, async {
            let discovery = self.discovery().await?;
            for document in &documents {
                self.apply_document(&discovery, document).await?;
            }
            Ok(())
        })
        .await
    }

    async fn apply_manifest_from_url(&self, url: &str) -> Result<()> {
        let body = bounded("fetch_manifest", API_TIMEOUT, async {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| Error::internal_with_context("fetch_manifest", e.to_string()))?;
            response
                .bytes()
                .await
                .map_err(|e| Error::internal_with_context("fetch_manifest", e.to_string()))
        })
        .await?;
        debug!(url = %url, bytes = body.len(), "Fetched manifest");
        self.apply_manifest(&body).await
    }

    async fn invalidate_discovery_cache(&self) {
        *self.discovery.lock().await = None;
        debug!("Discovery cache invalidated");
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = bounded("get_config_map", API_TIMEOUT, async {
            api.get(name).await.map_err(Error::from)
        })
        .await?;
        Ok(cm.data.unwrap_or_default())
    }

    async fn update_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "data": data });
        bounded("update_config_map", API_TIMEOUT, async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(Error::from)
        })
        .await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodReadiness>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        let pods = bounded("list_pods", API_TIMEOUT, async {
            api.list(&params).await.map_err(Error::from)
        })
        .await?;
        Ok(pods
            .items
            .iter()
            .map(|pod| PodReadiness {
                name: pod.metadata.name.clone().unwrap_or_default(),
                ready: is_pod_ready(pod),
            })
            .collect())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = bounded("get_nodes", API_TIMEOUT, async {
            api.list(&ListParams::default()).await.map_err(Error::from)
        })
        .await?;
        Ok(nodes
            .items
            .into_iter()
            .map(|node| NodeInfo {
                name: node.metadata.name.unwrap_or_default(),
                labels: node.metadata.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn label_node(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        bounded("label_node", API_TIMEOUT, async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(Error::from)
        })
        .await?;
        Ok(())
    }

    async fn remove_node_taint(&self, name: &str, key: &str, effect: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        bounded("remove_node_taint", API_TIMEOUT, async {
            let node = api.get(name).await?;
            let taints = node.spec.and_then(|s| s.taints).unwrap_or_default();
            let before = taints.len();
            let remaining: Vec<_> = taints
                .into_iter()
                .filter(|t| !(t.key == key && t.effect == effect))
                .collect();
            if remaining.len() == before {
                trace!(node = %name, taint = %key, "Taint not present");
                return Ok(());
            }
            let patch = serde_json::json!({ "spec": { "taints": remaining } });
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        bounded("delete_daemonset", API_TIMEOUT, async {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => {
                    debug!(namespace = %namespace, daemonset = %name, "DaemonSet already absent");
                    Ok(())
                }
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }

    async fn delete_pods_by_label(&self, namespace: &str, label_selector: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let delete = DeleteParams::default().grace_period(0);
        let list = ListParams::default().labels(label_selector);
        bounded("delete_pods_by_label", API_TIMEOUT, async {
            api.delete_collection(&delete, &list)
                .await
                .map_err(Error::from)
        })
        .await?;
        info!(namespace = %namespace, selector = %label_selector, "Deleted pods");
        Ok(())
    }

    async fn rollout_restart_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "template": { "metadata": { "annotations": {
                RESTARTED_AT_ANNOTATION: chrono::Utc::now().to_rfc3339()
            }}}}
        });
        bounded("rollout_restart_daemonset", API_TIMEOUT, async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(Error::from)
        })
        .await?;
        Ok(())
    }
}
