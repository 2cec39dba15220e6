//! Cluster targets and node role assignments

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use dpu_sim_common::Error;

/// Port the Kubernetes API server listens on in dpu-sim clusters
pub const API_SERVER_PORT: u16 = 6443;

/// Cluster a CNI install or redeploy runs against.
///
/// Immutable for the duration of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTarget {
    /// Cluster name from the config
    pub name: String,
    /// Pod network CIDR
    pub pod_cidr: String,
    /// Service network CIDR
    pub service_cidr: String,
    /// API server URL reachable from cluster nodes
    pub api_server_url: String,
}

impl ClusterTarget {
    /// Build a target whose API server listens on `api_server_ip`
    pub fn new(
        name: impl Into<String>,
        pod_cidr: impl Into<String>,
        service_cidr: impl Into<String>,
        api_server_ip: &str,
    ) -> Self {
        Self {
            name: name.into(),
            pod_cidr: pod_cidr.into(),
            service_cidr: service_cidr.into(),
            api_server_url: api_server_url(api_server_ip),
        }
    }
}

/// API server URL for a node IP
pub fn api_server_url(ip: &str) -> String {
    format!("https://{}:{}", ip, API_SERVER_PORT)
}

/// Kubernetes role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    /// Control-plane node
    Master,
    /// Worker node
    Worker,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

impl FromStr for ClusterRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            other => Err(Error::config(format!(
                "invalid k8s role '{}', expected master or worker",
                other
            ))),
        }
    }
}

/// Which nodes play which role in each cluster.
///
/// Restricts control-plane labeling and taint removal to the nodes the
/// config says are masters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRoleAssignment {
    clusters: BTreeMap<String, BTreeMap<ClusterRole, Vec<String>>>,
}

impl NodeRoleAssignment {
    /// Empty assignment
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `node` as having `role` in `cluster`
    pub fn assign(
        &mut self,
        cluster: impl Into<String>,
        role: ClusterRole,
        node: impl Into<String>,
    ) -> &mut Self {
        self.clusters
            .entry(cluster.into())
            .or_default()
            .entry(role)
            .or_default()
            .push(node.into());
        self
    }

    /// Nodes with `role` in `cluster`, in assignment order
    pub fn nodes(&self, cluster: &str, role: ClusterRole) -> &[String] {
        self.clusters
            .get(cluster)
            .and_then(|roles| roles.get(&role))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether any node is assigned in `cluster`
    pub fn has_cluster(&self, cluster: &str) -> bool {
        self.clusters.contains_key(cluster)
    }
}
