//! dpu-sim `config.yaml`
//!
//! Only the sections CNI installation reads are modeled; networking, SSH and
//! OS settings are ignored when present.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use dpu_sim_cni::ovn::{DEFAULT_BUILD_IMAGE, DEFAULT_OVN_IMAGE};
use dpu_sim_cni::{ClusterRole, ClusterTarget, CniKind, NodeRoleAssignment};

use crate::{Error, Result};

/// Local registry every cluster pulls from
pub const REGISTRY_ENDPOINT: &str = "localhost:5000";
/// Default kubeconfig directory, relative to the working directory
pub const DEFAULT_KUBECONFIG_DIR: &str = "kubeconfig";

fn default_pod_cidr() -> String {
    "10.244.0.0/16".to_string()
}

fn default_service_cidr() -> String {
    "10.245.0.0/16".to_string()
}

fn default_kubeconfig_dir() -> PathBuf {
    PathBuf::from(DEFAULT_KUBECONFIG_DIR)
}

/// Top-level config file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// VM deployment nodes
    #[serde(default)]
    pub vms: Vec<VmConfig>,
    /// Kind deployment
    #[serde(default)]
    pub kind: Option<KindConfig>,
    /// Clusters and their CNIs
    pub kubernetes: KubernetesConfig,
    /// Local registry images
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
}

/// A VM and its place in a cluster
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmConfig {
    /// VM hostname, also its Kubernetes node name
    pub name: String,
    /// `host` or `dpu`
    #[serde(rename = "type")]
    pub vm_type: String,
    /// Cluster the VM joins
    pub k8s_cluster: String,
    /// Role in that cluster
    pub k8s_role: ClusterRole,
    /// Node IP on the Kubernetes network
    #[serde(default)]
    pub k8s_node_ip: Option<String>,
}

/// Kind deployment
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KindConfig {
    /// Kind nodes
    #[serde(default)]
    pub nodes: Vec<KindNode>,
}

/// A Kind node
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KindNode {
    /// `control-plane` or `worker`
    pub role: String,
}

/// `kubernetes:` section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KubernetesConfig {
    /// Kubernetes version
    #[serde(default)]
    pub version: Option<String>,
    /// Where per-cluster kubeconfigs are written
    #[serde(default = "default_kubeconfig_dir")]
    pub kubeconfig_dir: PathBuf,
    /// Clusters
    pub clusters: Vec<ClusterConfig>,
}

/// One cluster
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Pod network
    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: String,
    /// Service network
    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,
    /// CNI to install
    pub cni: CniKind,
}

/// `registry:` section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Images built locally and pushed to the registry
    #[serde(default)]
    pub containers: Vec<RegistryContainer>,
}

/// An image published to the local registry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryContainer {
    /// Display name
    pub name: String,
    /// CNI the image belongs to
    pub cni: CniKind,
    /// Local image name, also the registry repository
    pub tag: String,
}

impl Config {
    /// Read and validate `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the installers cannot act on
    pub fn validate(&self) -> Result<()> {
        if self.kubernetes.clusters.is_empty() {
            return Err(Error::validation("kubernetes.clusters must not be empty"));
        }

        let mut names = BTreeSet::new();
        for cluster in &self.kubernetes.clusters {
            if cluster.name.is_empty() {
                return Err(Error::validation("cluster name must not be empty"));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate cluster name '{}'",
                    cluster.name
                )));
            }
        }

        let has_kind = self.kind.as_ref().is_some_and(|k| !k.nodes.is_empty());
        if has_kind && !self.vms.is_empty() {
            return Err(Error::validation(
                "config defines both vms and kind; pick one deployment mode",
            ));
        }
        if has_kind && self.kubernetes.clusters.len() != 1 {
            return Err(Error::validation("kind mode supports exactly one cluster"));
        }

        for vm in &self.vms {
            if !names.contains(vm.k8s_cluster.as_str()) {
                return Err(Error::validation(format!(
                    "vm '{}' references unknown cluster '{}'",
                    vm.name, vm.k8s_cluster
                )));
            }
        }

        for container in self.registry_containers() {
            if container.tag.is_empty() {
                return Err(Error::validation(format!(
                    "registry container '{}' has an empty tag",
                    container.name
                )));
            }
        }

        Ok(())
    }

    /// Whether clusters run in Kind instead of VMs
    pub fn is_kind_mode(&self) -> bool {
        self.vms.is_empty() && self.kind.as_ref().is_some_and(|k| !k.nodes.is_empty())
    }

    /// Cluster by name
    pub fn cluster(&self, name: &str) -> Result<&ClusterConfig> {
        self.kubernetes
            .clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::ClusterNotFound {
                name: name.to_string(),
            })
    }

    /// `name`, or every cluster when `None`
    pub fn select_clusters(&self, name: Option<&str>) -> Result<Vec<&ClusterConfig>> {
        match name {
            Some(name) => Ok(vec![self.cluster(name)?]),
            None => Ok(self.kubernetes.clusters.iter().collect()),
        }
    }

    /// Node roles of every VM
    pub fn role_assignment(&self) -> NodeRoleAssignment {
        let mut roles = NodeRoleAssignment::new();
        for vm in &self.vms {
            roles.assign(&vm.k8s_cluster, vm.k8s_role, &vm.name);
        }
        roles
    }

    /// Kubeconfig written for `cluster`
    pub fn kubeconfig_path(&self, cluster: &str) -> PathBuf {
        self.kubernetes
            .kubeconfig_dir
            .join(format!("{}.yaml", cluster))
    }

    /// Host the API server of `cluster` is reachable at from its nodes.
    ///
    /// VM clusters use the first master's node IP; Kind clusters use the
    /// control-plane container name.
    pub fn api_server_host(&self, cluster: &str) -> Result<String> {
        if self.is_kind_mode() {
            return Ok(format!("{}-control-plane", cluster));
        }
        self.vms
            .iter()
            .filter(|vm| vm.k8s_cluster == cluster && vm.k8s_role == ClusterRole::Master)
            .find_map(|vm| vm.k8s_node_ip.clone())
            .ok_or_else(|| {
                Error::validation(format!(
                    "cluster '{}' has no master VM with a k8s_node_ip",
                    cluster
                ))
            })
    }

    /// Installer target for `cluster`, optionally overriding the API server host
    pub fn cluster_target(
        &self,
        cluster: &ClusterConfig,
        api_server_override: Option<&str>,
    ) -> Result<ClusterTarget> {
        let host = match api_server_override {
            Some(host) => host.to_string(),
            None => self.api_server_host(&cluster.name)?,
        };
        Ok(ClusterTarget::new(
            &cluster.name,
            &cluster.pod_cidr,
            &cluster.service_cidr,
            &host,
        ))
    }

    fn registry_containers(&self) -> impl Iterator<Item = &RegistryContainer> {
        self.registry.iter().flat_map(|r| r.containers.iter())
    }

    /// Registry image configured for `cni`
    pub fn registry_container(&self, cni: CniKind) -> Option<&RegistryContainer> {
        self.registry_containers().find(|c| c.cni == cni)
    }

    /// Local image name for OVN-Kubernetes source builds
    pub fn ovn_build_image(&self) -> String {
        self.registry_container(CniKind::OvnKubernetes)
            .map(|c| c.tag.clone())
            .unwrap_or_else(|| DEFAULT_BUILD_IMAGE.to_string())
    }

    /// Image the OVN-Kubernetes daemonsets run
    pub fn ovn_daemonset_image(&self) -> String {
        self.registry_container(CniKind::OvnKubernetes)
            .map(|c| registry_image_ref(&c.tag))
            .unwrap_or_else(|| DEFAULT_OVN_IMAGE.to_string())
    }
}

/// `tag` as pushed to the local registry
pub fn registry_image_ref(tag: &str) -> String {
    format!("{}/{}", REGISTRY_ENDPOINT, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VM_CONFIG: &str = r#"
networks:
  - name: mgmt
    bridge_name: virbr-mgmt
vms:
  - name: host-1
    type: host
    k8s_cluster: host
    k8s_role: master
    k8s_node_ip: 192.168.100.10
  - name: host-2
    type: host
    k8s_cluster: host
    k8s_role: worker
    k8s_node_ip: 192.168.100.11
  - name: dpu-1
    type: dpu
    k8s_cluster: dpu
    k8s_role: master
    k8s_node_ip: 192.168.100.20
kubernetes:
  version: "1.33"
  clusters:
    - name: host
      pod_cidr: 10.244.0.0/16
      service_cidr: 10.96.0.0/12
      cni: ovn-kubernetes
    - name: dpu
      cni: flannel
registry:
  containers:
    - name: ovn-kube
      cni: ovn-kubernetes
      tag: ovn-kube-fedora:dev
"#;

    const KIND_CONFIG: &str = r#"
kind:
  nodes:
    - role: control-plane
    - role: worker
kubernetes:
  clusters:
    - name: sim
      cni: kindnet
"#;

    #[test]
    fn parses_vm_config_and_ignores_unrelated_sections() {
        let config = Config::from_yaml(VM_CONFIG).unwrap();
        assert!(!config.is_kind_mode());
        assert_eq!(config.kubernetes.clusters.len(), 2);

        let dpu = config.cluster("dpu").unwrap();
        assert_eq!(dpu.cni, CniKind::Flannel);
        assert_eq!(dpu.pod_cidr, "10.244.0.0/16");
        assert_eq!(dpu.service_cidr, "10.245.0.0/16");
        assert_eq!(
            config.kubeconfig_path("host"),
            PathBuf::from("kubeconfig/host.yaml")
        );
    }

    #[test]
    fn roles_come_from_vms() {
        let roles = Config::from_yaml(VM_CONFIG).unwrap().role_assignment();
        assert_eq!(roles.nodes("host", ClusterRole::Master), ["host-1"]);
        assert_eq!(roles.nodes("host", ClusterRole::Worker), ["host-2"]);
        assert_eq!(roles.nodes("dpu", ClusterRole::Master), ["dpu-1"]);
    }

    #[test]
    fn api_server_is_the_first_master_ip() {
        let config = Config::from_yaml(VM_CONFIG).unwrap();
        let target = config
            .cluster_target(config.cluster("host").unwrap(), None)
            .unwrap();
        assert_eq!(target.api_server_url, "https://192.168.100.10:6443");
        assert_eq!(target.service_cidr, "10.96.0.0/12");

        let overridden = config
            .cluster_target(config.cluster("host").unwrap(), Some("10.0.0.1"))
            .unwrap();
        assert_eq!(overridden.api_server_url, "https://10.0.0.1:6443");
    }

    #[test]
    fn kind_api_server_is_the_control_plane_container() {
        let config = Config::from_yaml(KIND_CONFIG).unwrap();
        assert!(config.is_kind_mode());
        assert_eq!(config.api_server_host("sim").unwrap(), "sim-control-plane");
        assert!(config.role_assignment().nodes("sim", ClusterRole::Master).is_empty());
    }

    #[test]
    fn registry_container_selects_ovn_images() {
        let config = Config::from_yaml(VM_CONFIG).unwrap();
        assert_eq!(config.ovn_build_image(), "ovn-kube-fedora:dev");
        assert_eq!(
            config.ovn_daemonset_image(),
            "localhost:5000/ovn-kube-fedora:dev"
        );

        let kind = Config::from_yaml(KIND_CONFIG).unwrap();
        assert_eq!(kind.ovn_build_image(), DEFAULT_BUILD_IMAGE);
        assert_eq!(kind.ovn_daemonset_image(), DEFAULT_OVN_IMAGE);
    }

    #[test]
    fn select_clusters_by_name_or_all() {
        let config = Config::from_yaml(VM_CONFIG).unwrap();
        assert_eq!(config.select_clusters(None).unwrap().len(), 2);
        assert_eq!(config.select_clusters(Some("dpu")).unwrap()[0].name, "dpu");
        assert!(matches!(
            config.select_clusters(Some("nope")),
            Err(Error::ClusterNotFound { .. })
        ));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let both = format!("{}\nkind:\n  nodes:\n    - role: control-plane\n", VM_CONFIG);
        assert!(matches!(
            Config::from_yaml(&both),
            Err(Error::Validation { .. })
        ));

        let dangling = r#"
vms:
  - name: host-1
    type: host
    k8s_cluster: missing
    k8s_role: master
kubernetes:
  clusters:
    - name: host
      cni: flannel
"#;
        assert!(matches!(
            Config::from_yaml(dangling),
            Err(Error::Validation { .. })
        ));

        let duplicate = r#"
kubernetes:
  clusters:
    - name: host
      cni: flannel
    - name: host
      cni: flannel
"#;
        assert!(matches!(
            Config::from_yaml(duplicate),
            Err(Error::Validation { .. })
        ));

        let bad_cni = r#"
kubernetes:
  clusters:
    - name: host
      cni: calico
"#;
        assert!(matches!(Config::from_yaml(bad_cni), Err(Error::Yaml(_))));
    }

    #[test]
    fn vm_without_master_ip_has_no_api_server() {
        let config = Config::from_yaml(
            r#"
vms:
  - name: host-1
    type: host
    k8s_cluster: host
    k8s_role: worker
kubernetes:
  clusters:
    - name: host
      cni: flannel
"#,
        )
        .unwrap();
        assert!(config.api_server_host("host").is_err());
    }

    #[test]
    fn load_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("config.yaml");
        let err = Config::load(&missing).unwrap_err();
        assert!(err.to_string().contains("config.yaml"));

        std::fs::write(&missing, KIND_CONFIG).unwrap();
        assert!(Config::load(&missing).unwrap().is_kind_mode());
    }
}
