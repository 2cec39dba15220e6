//! Kubernetes helpers shared by the installers

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodCondition};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::Discovery;
use kube::{Client, Config};
use serde::Deserialize;

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Condition status value meaning the condition holds
const STATUS_TRUE: &str = "True";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients, bounding metadata calls
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(Error::from)
}

/// Split an apiVersion into (group, version); the core group is empty
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Parse a multi-document YAML manifest into JSON objects.
///
/// Empty documents (a bare `---`, comment-only sections) are skipped.
pub fn parse_yaml_documents(content: &str) -> Result<Vec<serde_json::Value>, Error> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_json::Value::deserialize(document)?;
        match value.as_object() {
            Some(object) if !object.is_empty() => documents.push(value),
            _ => continue,
        }
    }
    Ok(documents)
}

/// The `kind` of a parsed manifest document
pub fn document_kind(document: &serde_json::Value) -> Option<&str> {
    document.get("kind").and_then(|v| v.as_str())
}

/// `Kind/name` of a parsed manifest document, for logs
pub fn describe_document(document: &serde_json::Value) -> String {
    let name = document
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .unwrap_or("<unnamed>");
    format!("{}/{}", document_kind(document).unwrap_or("<unknown>"), name)
}

/// Run API discovery with bounded retry.
///
/// Right after CRDs are created the aggregated discovery endpoints can lag,
/// so transient failures are retried with [`RetryConfig::discovery`].
pub async fn run_discovery(client: &Client) -> Result<Discovery, Error> {
    let client = client.clone();
    retry_with_backoff(&RetryConfig::discovery(), "api-discovery", || {
        let client = client.clone();
        async move { Discovery::new(client).run().await.map_err(Error::from) }
    })
    .await
}

/// Whether a condition of the given type has status `True`
pub fn has_condition(conditions: Option<&[PodCondition]>, condition_type: &str) -> bool {
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == condition_type && c.status == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Whether a pod reports `Ready=True`
pub fn is_pod_ready(pod: &Pod) -> bool {
    has_condition(
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref()),
        "Ready",
    )
}
