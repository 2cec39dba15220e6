//! dpu-sim CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// dpu-sim - CNI installation for simulated DPU clusters
#[derive(Parser, Debug)]
#[command(name = "dpu-sim")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the dpu-sim config file
    #[arg(short, long, global = true, env = "DPU_SIM_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install the configured CNI on each cluster, pushing OVN registry images first
    InstallCni(commands::install::InstallCniArgs),
    /// Redeploy the CNI on each cluster without a full install
    RedeployCni(commands::redeploy::RedeployCniArgs),
    /// Build the OVN-Kubernetes image
    BuildImage(commands::build::BuildImageArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::InstallCni(args) => commands::install::run(&self.config, args).await,
            Commands::RedeployCni(args) => commands::redeploy::run(&self.config, args).await,
            Commands::BuildImage(args) => commands::build::run(&self.config, args).await,
        }
    }
}
