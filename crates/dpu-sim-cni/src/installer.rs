//! CNI selection and the install/redeploy entry points
//!
//! Each supported CNI is an [`Installer`]. Soft failures (CoreDNS patching,
//! readiness timeouts, best-effort config tweaks) do not abort an install;
//! they are collected as [`InstallWarning`]s in the returned report.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use dpu_sim_common::{CommandExecutor, Error, Result};

use crate::client::ClusterApi;
use crate::cluster::{ClusterTarget, NodeRoleAssignment};
use crate::engine::ContainerEngine;
use crate::flannel::FlannelInstaller;
use crate::ovn::{OvnKubernetesInstaller, OvnOptions};
use crate::source::SourceConfig;

/// CNI plugins dpu-sim can install
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CniKind {
    /// Flannel from the upstream release manifest
    Flannel,
    /// OVN-Kubernetes built from source
    OvnKubernetes,
    /// Kind's built-in CNI
    Kindnet,
}

impl CniKind {
    /// Name used in config files and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flannel => "flannel",
            Self::OvnKubernetes => "ovn-kubernetes",
            Self::Kindnet => "kindnet",
        }
    }
}

impl fmt::Display for CniKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CniKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flannel" => Ok(Self::Flannel),
            "ovn-kubernetes" => Ok(Self::OvnKubernetes),
            "kindnet" => Ok(Self::Kindnet),
            other => Err(Error::config(format!(
                "unknown CNI '{}', expected flannel, ovn-kubernetes or kindnet",
                other
            ))),
        }
    }
}

/// A step that failed without failing the install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallWarning {
    /// Step name (`coredns`, `readiness`, ...)
    pub step: String,
    /// What went wrong
    pub message: String,
}

/// Result of a successful install or redeploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Cluster name
    pub cluster: String,
    /// Installed CNI
    pub cni: CniKind,
    /// Soft failures, in the order they happened
    pub warnings: Vec<InstallWarning>,
}

impl InstallReport {
    /// Empty report
    pub fn new(cluster: impl Into<String>, cni: CniKind) -> Self {
        Self {
            cluster: cluster.into(),
            cni,
            warnings: Vec::new(),
        }
    }

    /// Record `error` as a warning for `step`
    pub fn warn(&mut self, step: &str, error: &Error) {
        warn!(cluster = %self.cluster, cni = %self.cni, step = %step, error = %error, "Step failed, continuing");
        self.warnings.push(InstallWarning {
            step: step.to_string(),
            message: error.to_string(),
        });
    }

    /// Downgrade a soft error to a warning; hard errors pass through
    pub fn soften(&mut self, step: &str, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if e.is_soft() => {
                self.warn(step, &e);
                Ok(())
            }
            other => other,
        }
    }

    /// Whether any step failed softly
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Result of a redeploy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeployOutcome {
    /// Components were refreshed
    Redeployed(InstallReport),
    /// The CNI has no redeploy support; nothing was done
    Unsupported {
        /// CNI of the cluster
        cni: CniKind,
    },
}

/// Installs one CNI on a cluster
#[async_trait]
pub trait Installer: Send + Sync {
    /// Which CNI this installs
    fn kind(&self) -> CniKind;

    /// Install the CNI
    async fn install(&self, cluster: &ClusterTarget) -> Result<InstallReport>;

    /// Refresh running CNI components without a full install
    async fn redeploy(&self, _cluster: &ClusterTarget) -> Result<RedeployOutcome> {
        Ok(RedeployOutcome::Unsupported { cni: self.kind() })
    }
}

/// Kind's default CNI, already present on Kind clusters
pub struct KindnetInstaller {
    kind_mode: bool,
}

impl KindnetInstaller {
    /// Installer for a Kind (`true`) or VM (`false`) deployment
    pub fn new(kind_mode: bool) -> Self {
        Self { kind_mode }
    }
}

#[async_trait]
impl Installer for KindnetInstaller {
    fn kind(&self) -> CniKind {
        CniKind::Kindnet
    }

    async fn install(&self, cluster: &ClusterTarget) -> Result<InstallReport> {
        if !self.kind_mode {
            return Err(Error::unsupported(
                "kindnet install",
                format!("VM cluster {}", cluster.name),
            ));
        }
        info!(cluster = %cluster.name, "Kindnet is the default CNI for Kind clusters, nothing to install");
        Ok(InstallReport::new(&cluster.name, CniKind::Kindnet))
    }
}

/// Everything installers need besides the cluster target
#[derive(Clone)]
pub struct InstallContext {
    /// Kubernetes API of the target cluster
    pub api: Arc<dyn ClusterApi>,
    /// Host running git, builds and `daemonset.sh`
    pub exec: Arc<dyn CommandExecutor>,
    /// Engine for image builds; required for OVN-Kubernetes
    pub engine: Option<Arc<dyn ContainerEngine>>,
    /// Where the OVN-Kubernetes source lives
    pub source: SourceConfig,
    /// Node roles from the config
    pub roles: NodeRoleAssignment,
    /// Kind deployment instead of VMs
    pub kind_mode: bool,
    /// OVN-Kubernetes settings
    pub ovn: OvnOptions,
}

/// Installer for `kind`
pub fn installer_for(kind: CniKind, ctx: &InstallContext) -> Result<Box<dyn Installer>> {
    Ok(match kind {
        CniKind::Flannel => Box::new(FlannelInstaller::new(ctx.api.clone())),
        CniKind::OvnKubernetes => {
            let engine = ctx.engine.clone().ok_or_else(|| {
                Error::config("installing OVN-Kubernetes needs a container engine")
            })?;
            let mut options = ctx.ovn.clone();
            // Kind nodes do not run OVS themselves
            options.ovs_node = ctx.kind_mode;
            Box::new(OvnKubernetesInstaller::new(
                ctx.api.clone(),
                ctx.exec.clone(),
                engine,
                ctx.source.clone(),
                ctx.roles.clone(),
                options,
            )?)
        }
        CniKind::Kindnet => Box::new(KindnetInstaller::new(ctx.kind_mode)),
    })
}

/// Install `installer`'s CNI on `cluster`
pub async fn install_cni(installer: &dyn Installer, cluster: &ClusterTarget) -> Result<InstallReport> {
    info!(cluster = %cluster.name, cni = %installer.kind(), "Installing CNI");
    let report = installer.install(cluster).await?;
    if report.has_warnings() {
        warn!(
            cluster = %cluster.name,
            cni = %report.cni,
            warnings = report.warnings.len(),
            "CNI installed with warnings"
        );
    } else {
        info!(cluster = %cluster.name, cni = %report.cni, "CNI installed");
    }
    Ok(report)
}

/// Redeploy `installer`'s CNI on `cluster`, if it supports that
pub async fn redeploy_cni(installer: &dyn Installer, cluster: &ClusterTarget) -> Result<RedeployOutcome> {
    let outcome = installer.redeploy(cluster).await?;
    match &outcome {
        RedeployOutcome::Redeployed(report) => {
            info!(cluster = %cluster.name, cni = %report.cni, warnings = report.warnings.len(), "CNI redeployed");
        }
        RedeployOutcome::Unsupported { cni } => {
            info!(cluster = %cluster.name, cni = %cni, "CNI does not support redeployment, skipping");
        }
    }
    Ok(outcome)
}
