//! install-cni: install each cluster's configured CNI

use std::path::Path;

use clap::Args;

use dpu_sim_cni::{install_cni, installer_for};

use super::{print_report, selected_clusters, CommandEnv, HostArgs};
use crate::config::Config;
use crate::Result;

/// Install the CNI configured for each cluster.
///
/// With a registry container configured for OVN-Kubernetes, the built image
/// is pushed to the local registry before the daemonsets reference it.
#[derive(Args, Debug)]
pub struct InstallCniArgs {
    /// Only install on this cluster
    #[arg(long)]
    pub cluster: Option<String>,

    /// Compile OVN from this git ref instead of using prebuilt packages
    #[arg(long, env = "DPU_SIM_OVN_GIT_REF")]
    pub ovn_git_ref: Option<String>,

    /// API server host written into OVN-Kubernetes manifests
    #[arg(long)]
    pub api_server: Option<String>,

    #[command(flatten)]
    pub host: HostArgs,
}

/// Run install-cni
pub async fn run(config_path: &Path, args: InstallCniArgs) -> Result<()> {
    let config = Config::load(config_path)?;
    let clusters = selected_clusters(&config, args.cluster.as_deref(), args.api_server.as_deref())?;
    let env = CommandEnv::new(config, &args.host, &clusters.iter().collect::<Vec<_>>()).await?;

    for cluster in &clusters {
        let target = env
            .config
            .cluster_target(cluster, args.api_server.as_deref())?;
        let ctx = env
            .install_context(cluster, args.ovn_git_ref.as_deref())
            .await?;
        let installer = installer_for(cluster.cni, &ctx)?;
        let report = install_cni(installer.as_ref(), &target).await?;
        print_report("installed", &report);
    }
    Ok(())
}
