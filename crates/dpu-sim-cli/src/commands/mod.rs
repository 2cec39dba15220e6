//! CLI commands

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::debug;

use dpu_sim_cni::engine::ENGINE_ENV;
use dpu_sim_cni::{
    detect_engine, ClusterApi, CniKind, ContainerEngine, EnginePreference, InstallContext,
    InstallReport, KubeClusterApi, OvnOptions, SourceConfig,
};
use dpu_sim_common::kube_utils::create_client;
use dpu_sim_common::{CommandExecutor, HostInfoCache, LocalExecutor};

use crate::config::{ClusterConfig, Config};
use crate::{Error, Result};

pub mod build;
pub mod install;
pub mod redeploy;

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

fn parse_engine(s: &str) -> std::result::Result<EnginePreference, String> {
    s.parse().map_err(|e: dpu_sim_common::Error| e.to_string())
}

/// Options for commands that touch the local source tree or container engine
#[derive(Args, Debug, Clone)]
pub struct HostArgs {
    /// dpu-sim checkout holding the ovn-kubernetes source
    #[arg(long, env = "DPU_SIM_PROJECT_ROOT", default_value = ".")]
    pub project_root: PathBuf,

    /// Container engine: auto, docker or podman
    #[arg(long, env = ENGINE_ENV, default_value = "auto", value_parser = parse_engine)]
    pub engine: EnginePreference,
}

/// Executor for the local machine
pub fn local_executor() -> Arc<dyn CommandExecutor> {
    Arc::new(LocalExecutor::new(Arc::new(HostInfoCache::new())))
}

/// Kubernetes API of `cluster`, from its kubeconfig
pub async fn cluster_api(config: &Config, cluster: &str) -> Result<Arc<dyn ClusterApi>> {
    let path = config.kubeconfig_path(cluster);
    debug!(cluster = %cluster, kubeconfig = %path.display(), "Connecting to cluster");
    let client = create_client(Some(&path)).await?;
    Ok(Arc::new(KubeClusterApi::new(client)))
}

/// Settings shared by every cluster a command touches
pub struct CommandEnv {
    /// Loaded config
    pub config: Config,
    /// Local executor
    pub exec: Arc<dyn CommandExecutor>,
    /// Engine, detected only when a cluster needs one
    pub engine: Option<Arc<dyn ContainerEngine>>,
    /// Source checkout location
    pub source: SourceConfig,
}

impl CommandEnv {
    /// Environment for installing on `clusters`
    pub async fn new(config: Config, host: &HostArgs, clusters: &[&ClusterConfig]) -> Result<Self> {
        let exec = local_executor();
        let needs_engine = clusters.iter().any(|c| c.cni == CniKind::OvnKubernetes);
        let engine = if needs_engine {
            Some(detect_engine(exec.clone(), host.engine).await?)
        } else {
            None
        };
        Ok(Self {
            config,
            exec,
            engine,
            source: SourceConfig::new(&host.project_root),
        })
    }

    /// Installer context for `cluster`
    pub async fn install_context(
        &self,
        cluster: &ClusterConfig,
        ovn_git_ref: Option<&str>,
    ) -> Result<InstallContext> {
        let ovn = ovn_options(&self.config, ovn_git_ref);
        Ok(InstallContext {
            api: cluster_api(&self.config, &cluster.name).await?,
            exec: self.exec.clone(),
            engine: self.engine.clone(),
            source: self.source.clone(),
            roles: self.config.role_assignment(),
            kind_mode: self.config.is_kind_mode(),
            ovn,
        })
    }
}

/// OVN-Kubernetes settings from the config; registry images are pushed by the install
pub fn ovn_options(config: &Config, ovn_git_ref: Option<&str>) -> OvnOptions {
    OvnOptions {
        daemonset_image: config.ovn_daemonset_image(),
        build_image: config.ovn_build_image(),
        ovn_git_ref: ovn_git_ref.map(str::to_string),
        push_daemonset_image: config.registry_container(CniKind::OvnKubernetes).is_some(),
        ..OvnOptions::default()
    }
}

/// Print the outcome of an install or redeploy
pub fn print_report(action: &str, report: &InstallReport) {
    if report.has_warnings() {
        println!(
            "{} {} on {} with {} warning(s):",
            report.cni,
            action,
            report.cluster,
            report.warnings.len()
        );
        for warning in &report.warnings {
            println!("  [{}] {}", warning.step, warning.message);
        }
    } else {
        println!("{} {} on {}", report.cni, action, report.cluster);
    }
}

/// Clusters selected by `--cluster`, rejecting an API server override that is ambiguous
pub fn selected_clusters(
    config: &Config,
    cluster: Option<&str>,
    api_server: Option<&str>,
) -> Result<Vec<ClusterConfig>> {
    let clusters: Vec<ClusterConfig> = config
        .select_clusters(cluster)?
        .into_iter()
        .cloned()
        .collect();
    if api_server.is_some() && clusters.len() > 1 {
        return Err(Error::validation(
            "--api-server needs --cluster when the config has several clusters",
        ));
    }
    Ok(clusters)
}
