//! Phase-ordered manifest application for OVN-Kubernetes
//!
//! CRDs go in first, then the external network-policy CRDs, then discovery is
//! refreshed so the new kinds resolve, then setup/RBAC, control-plane node
//! labels, and finally the deployments. Later phases depend on earlier ones,
//! so the order is fixed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use dpu_sim_common::{CommandExecutor, Error, Result};

use crate::client::ClusterApi;
use crate::cluster::{ClusterRole, NodeRoleAssignment};

/// Namespace the OVN-Kubernetes components run in
pub const OVN_NAMESPACE: &str = "ovn-kubernetes";

/// Label marking nodes that host the OVN databases
pub const OVN_DB_NODE_LABEL: &str = "k8s.ovn.org/ovnkube-db";
/// Standard control-plane role label
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";
/// Legacy master role taint key
pub const MASTER_TAINT_KEY: &str = "node-role.kubernetes.io/master";
/// Effect of the control-plane taints removed from master nodes
pub const NO_SCHEDULE: &str = "NoSchedule";

/// OVN CRD manifests under `dist/yaml`, in apply order
pub const OVN_CRD_MANIFESTS: [&str; 10] = [
    "k8s.ovn.org_egressfirewalls.yaml",
    "k8s.ovn.org_egressips.yaml",
    "k8s.ovn.org_egressqoses.yaml",
    "k8s.ovn.org_egressservices.yaml",
    "k8s.ovn.org_adminpolicybasedexternalroutes.yaml",
    "k8s.ovn.org_networkqoses.yaml",
    "k8s.ovn.org_userdefinednetworks.yaml",
    "k8s.ovn.org_clusteruserdefinednetworks.yaml",
    "k8s.ovn.org_routeadvertisements.yaml",
    "k8s.ovn.org_clusternetworkconnects.yaml",
];

/// AdminNetworkPolicy and BaselineAdminNetworkPolicy CRDs
pub const NETWORK_POLICY_API_CRD_URLS: [&str; 2] = [
    "https://raw.githubusercontent.com/kubernetes-sigs/network-policy-api/v0.1.5/config/crd/experimental/policy.networking.k8s.io_adminnetworkpolicies.yaml",
    "https://raw.githubusercontent.com/kubernetes-sigs/network-policy-api/v0.1.5/config/crd/experimental/policy.networking.k8s.io_baselineadminnetworkpolicies.yaml",
];

/// Namespace, config and RBAC manifests, in apply order
pub const OVN_SETUP_MANIFESTS: [&str; 6] = [
    "ovn-setup.yaml",
    "rbac-ovnkube-identity.yaml",
    "rbac-ovnkube-cluster-manager.yaml",
    "rbac-ovnkube-master.yaml",
    "rbac-ovnkube-node.yaml",
    "rbac-ovnkube-db.yaml",
];

/// Standalone OVS daemonset, used when nodes do not run OVS themselves (Kind)
pub const OVS_NODE_MANIFEST: &str = "ovs-node.yaml";

/// A named group of manifests applied together
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManifestPhase {
    /// OVN CRDs from the source tree
    Crds,
    /// CRDs fetched by URL
    ExternalCrds,
    /// Namespace, config and RBAC
    Setup,
    /// Control-plane components and node agents
    Deployment,
}

impl fmt::Display for ManifestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Crds => "crds",
            Self::ExternalCrds => "external-crds",
            Self::Setup => "setup",
            Self::Deployment => "deployment",
        })
    }
}

/// Deployment manifests in apply order
pub fn deployment_manifests(ovs_node: bool) -> Vec<String> {
    let mut manifests = vec!["ovnkube-identity.yaml".to_string()];
    if ovs_node {
        manifests.push(OVS_NODE_MANIFEST.to_string());
    }
    manifests.extend(
        ["ovnkube-db.yaml", "ovnkube-master.yaml", "ovnkube-node.yaml"]
            .iter()
            .map(|s| s.to_string()),
    );
    manifests
}

/// Manifests of every phase, each list in apply order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    /// Files under the yaml directory
    pub crds: Vec<String>,
    /// URLs
    pub external_crds: Vec<String>,
    /// Files under the yaml directory
    pub setup: Vec<String>,
    /// Files under the yaml directory
    pub deployments: Vec<String>,
}

impl PhasePlan {
    /// Full OVN-Kubernetes install
    pub fn ovn_kubernetes(ovs_node: bool) -> Self {
        Self {
            crds: OVN_CRD_MANIFESTS.iter().map(|s| s.to_string()).collect(),
            external_crds: NETWORK_POLICY_API_CRD_URLS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            setup: OVN_SETUP_MANIFESTS.iter().map(|s| s.to_string()).collect(),
            deployments: deployment_manifests(ovs_node),
        }
    }
}

/// Applies manifest phases to one cluster
pub struct ManifestDeployer {
    api: Arc<dyn ClusterApi>,
    exec: Arc<dyn CommandExecutor>,
}

impl ManifestDeployer {
    /// Deployer reading manifests through `exec` and applying them through `api`
    pub fn new(api: Arc<dyn ClusterApi>, exec: Arc<dyn CommandExecutor>) -> Self {
        Self { api, exec }
    }

    /// Apply every phase of `plan` in order.
    ///
    /// Control-plane nodes are labeled between the setup and deployment
    /// phases so the database pods have somewhere to schedule.
    pub async fn apply_all(
        &self,
        yaml_dir: &Path,
        plan: &PhasePlan,
        cluster: &str,
        roles: &NodeRoleAssignment,
    ) -> Result<()> {
        self.apply_files(ManifestPhase::Crds, yaml_dir, &plan.crds, cluster)
            .await?;
        self.apply_urls(ManifestPhase::ExternalCrds, &plan.external_crds, cluster)
            .await?;

        // New CRD kinds only resolve after discovery is refreshed
        self.api.invalidate_discovery_cache().await;

        self.apply_files(ManifestPhase::Setup, yaml_dir, &plan.setup, cluster)
            .await?;

        let control_plane = self.control_plane_nodes(cluster, roles).await?;
        self.label_control_plane_nodes(cluster, &control_plane)
            .await?;

        self.apply_files(ManifestPhase::Deployment, yaml_dir, &plan.deployments, cluster)
            .await?;

        info!(cluster = %cluster, "All OVN-Kubernetes manifests applied");
        Ok(())
    }

    /// Apply only the deployment phase
    pub async fn apply_deployments(
        &self,
        yaml_dir: &Path,
        deployments: &[String],
        cluster: &str,
    ) -> Result<()> {
        self.apply_files(ManifestPhase::Deployment, yaml_dir, deployments, cluster)
            .await
    }

    async fn apply_files(
        &self,
        phase: ManifestPhase,
        yaml_dir: &Path,
        files: &[String],
        cluster: &str,
    ) -> Result<()> {
        info!(cluster = %cluster, phase = %phase, count = files.len(), "Applying manifests");
        for file in files {
            let path = yaml_dir.join(file);
            let content = self
                .exec
                .read_file(&path)
                .await
                .map_err(|e| {
                    Error::manifest_read(
                        path.display().to_string(),
                        phase.to_string(),
                        e.to_string(),
                    )
                })?;
            self.api
                .apply_manifest(&content)
                .await
                .map_err(|e| {
                    Error::manifest_apply(file, phase.to_string(), cluster, e.to_string())
                })?;
            debug!(cluster = %cluster, phase = %phase, manifest = %file, "Applied");
        }
        Ok(())
    }

    async fn apply_urls(&self, phase: ManifestPhase, urls: &[String], cluster: &str) -> Result<()> {
        info!(cluster = %cluster, phase = %phase, count = urls.len(), "Applying manifests");
        for url in urls {
            self.api
                .apply_manifest_from_url(url)
                .await
                .map_err(|e| {
                    Error::manifest_apply(url, phase.to_string(), cluster, e.to_string())
                })?;
            debug!(cluster = %cluster, phase = %phase, manifest = %url, "Applied");
        }
        Ok(())
    }

    /// Control-plane nodes of `cluster`.
    ///
    /// Uses the configured master nodes; when the config assigns none (Kind
    /// clusters) falls back to nodes already carrying the control-plane label.
    pub async fn control_plane_nodes(
        &self,
        cluster: &str,
        roles: &NodeRoleAssignment,
    ) -> Result<Vec<String>> {
        let assigned = roles.nodes(cluster, ClusterRole::Master);
        if !assigned.is_empty() {
            return Ok(assigned.to_vec());
        }
        let nodes = self.api.get_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.labels.contains_key(CONTROL_PLANE_LABEL))
            .map(|n| n.name)
            .collect())
    }

    /// Label `nodes` for the OVN databases and let them schedule workloads.
    ///
    /// Labeling failures are fatal. Taint removal is best effort since the
    /// taints are often already absent.
    pub async fn label_control_plane_nodes(&self, cluster: &str, nodes: &[String]) -> Result<()> {
        if nodes.is_empty() {
            warn!(cluster = %cluster, "No control-plane nodes found to label");
            return Ok(());
        }

        for node in nodes {
            let labels = BTreeMap::from([
                (OVN_DB_NODE_LABEL.to_string(), "true".to_string()),
                (CONTROL_PLANE_LABEL.to_string(), String::new()),
            ]);
            self.api
                .label_node(node, labels)
                .await
                .map_err(|e| Error::node_label(node, cluster, e.to_string()))?;

            for taint in [MASTER_TAINT_KEY, CONTROL_PLANE_LABEL] {
                if let Err(e) = self.api.remove_node_taint(node, taint, NO_SCHEDULE).await {
                    debug!(node = %node, taint = %taint, error = %e, "Taint removal failed");
                }
            }
            debug!(cluster = %cluster, node = %node, "Labeled control-plane node");
        }

        info!(cluster = %cluster, count = nodes.len(), "Control-plane nodes labeled");
        Ok(())
    }
}
