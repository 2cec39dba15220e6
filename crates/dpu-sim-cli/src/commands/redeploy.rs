//! redeploy-cni: refresh running CNI components after a rebuild

use std::path::Path;

use clap::Args;

use dpu_sim_cni::{installer_for, redeploy_cni, RedeployOutcome};

use super::{print_report, selected_clusters, CommandEnv, HostArgs};
use crate::config::Config;
use crate::Result;

/// Redeploy the CNI of each cluster in place
#[derive(Args, Debug)]
pub struct RedeployCniArgs {
    /// Only redeploy on this cluster
    #[arg(long)]
    pub cluster: Option<String>,

    #[command(flatten)]
    pub host: HostArgs,
}

/// Run redeploy-cni
pub async fn run(config_path: &Path, args: RedeployCniArgs) -> Result<()> {
    let config = Config::load(config_path)?;
    let clusters = selected_clusters(&config, args.cluster.as_deref(), None)?;
    let env = CommandEnv::new(config, &args.host, &clusters.iter().collect::<Vec<_>>()).await?;

    for cluster in &clusters {
        let target = env.config.cluster_target(cluster, None)?;
        let ctx = env.install_context(cluster, None).await?;
        let installer = installer_for(cluster.cni, &ctx)?;
        match redeploy_cni(installer.as_ref(), &target).await? {
            RedeployOutcome::Redeployed(report) => print_report("redeployed", &report),
            RedeployOutcome::Unsupported { cni } => {
                println!("{} does not support redeploy, skipped {}", cni, cluster.name)
            }
        }
    }
    Ok(())
}
