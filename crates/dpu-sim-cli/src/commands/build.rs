//! build-image: build the OVN-Kubernetes image without installing it

use std::path::Path;

use clap::Args;
use tracing::info;

use dpu_sim_cni::engine::PushOptions;
use dpu_sim_cni::{detect_engine, CniKind, ImageBuilder, SourceConfig, SourceProvisioner};

use super::{local_executor, CommandErrorExt, HostArgs};
use crate::config::{registry_image_ref, Config};
use crate::Result;

/// Build (or reuse) the OVN-Kubernetes image
#[derive(Args, Debug)]
pub struct BuildImageArgs {
    /// Local image name; defaults to the registry tag from the config
    #[arg(long)]
    pub image: Option<String>,

    /// Compile OVN from this git ref instead of using prebuilt packages
    #[arg(long, env = "DPU_SIM_OVN_GIT_REF")]
    pub ovn_git_ref: Option<String>,

    /// Push to the local registry afterwards
    #[arg(long)]
    pub push: bool,

    #[command(flatten)]
    pub host: HostArgs,
}

/// Run build-image
pub async fn run(config_path: &Path, args: BuildImageArgs) -> Result<()> {
    let config = Config::load(config_path)?;
    let image = args.image.clone().unwrap_or_else(|| config.ovn_build_image());

    let exec = local_executor();
    let engine = detect_engine(exec.clone(), args.host.engine).await?;
    let source = SourceProvisioner::new(exec.clone(), SourceConfig::new(&args.host.project_root));
    let builder = ImageBuilder::new(exec, engine.clone(), source);

    let outcome = builder
        .build_or_reuse(&image, args.ovn_git_ref.as_deref())
        .await?;
    if outcome.reused {
        println!("{} is up to date ({})", outcome.image, outcome.cached_image);
    } else {
        println!("built {} ({})", outcome.image, outcome.cached_image);
    }

    if args.push {
        let tag = config
            .registry_container(CniKind::OvnKubernetes)
            .map(|c| c.tag.clone())
            .unwrap_or_else(|| image.clone());
        let remote = registry_image_ref(&tag);
        engine.tag(&outcome.image, &remote).await.cmd_err()?;
        engine
            .push(&remote, &PushOptions { insecure: true })
            .await
            .cmd_err()?;
        info!(image = %remote, "Image pushed");
        println!("pushed {}", remote);
    }
    Ok(())
}
