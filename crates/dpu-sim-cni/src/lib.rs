//! CNI installation for dpu-sim clusters
//!
//! Installs Flannel, OVN-Kubernetes or Kindnet on a cluster. OVN-Kubernetes
//! is built from a local source tree with a content-addressed image cache,
//! deployed in dependency order and can be redeployed in place.

#![deny(missing_docs)]

pub mod client;
pub mod cluster;
pub mod coredns;
pub mod engine;
pub mod flannel;
pub mod image;
pub mod installer;
pub mod manifests;
pub mod ovn;
pub mod readiness;
pub mod source;

#[cfg(test)]
mod testing;

pub use client::{ClusterApi, KubeClusterApi};
pub use cluster::{ClusterRole, ClusterTarget, NodeRoleAssignment};
pub use engine::{detect_engine, ContainerEngine, EngineName, EnginePreference};
pub use image::{BuildOutcome, ImageBuilder};
pub use installer::{
    install_cni, installer_for, redeploy_cni, CniKind, InstallContext, InstallReport,
    InstallWarning, Installer, RedeployOutcome,
};
pub use ovn::OvnOptions;
pub use source::{SourceConfig, SourceProvisioner};
