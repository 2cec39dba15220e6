//! Container engine abstraction over the docker and podman CLIs

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use dpu_sim_common::{CommandExecutor, Error, Result};

/// Environment variable selecting the container engine
pub const ENGINE_ENV: &str = "DPU_SIM_CONTAINER_ENGINE";

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Supported container engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineName {
    /// Docker CLI
    Docker,
    /// Podman CLI
    Podman,
}

impl EngineName {
    /// Binary name
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl fmt::Display for EngineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// Which engine to use, as requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnginePreference {
    /// Podman if present, otherwise docker
    #[default]
    Auto,
    /// Docker only
    Docker,
    /// Podman only
    Podman,
}

impl FromStr for EnginePreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            other => Err(Error::config(format!(
                "unknown container engine '{}', expected docker, podman or auto",
                other
            ))),
        }
    }
}

/// Inputs for one image build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Build context directory
    pub context_dir: PathBuf,
    /// Dockerfile path
    pub dockerfile: PathBuf,
    /// Tag for the built image
    pub image: String,
    /// Target platform (`linux/amd64`)
    pub platform: String,
    /// `--build-arg` values, emitted in key order
    pub build_args: BTreeMap<String, String>,
    /// Extra engine flags placed before the context (volumes, etc.)
    pub extra_args: Vec<String>,
}

/// Options for pushing an image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Skip TLS verification for the registry
    pub insecure: bool,
}

/// Container image operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Which engine this is
    fn name(&self) -> EngineName;

    /// Build and tag an image
    async fn build(&self, options: &BuildOptions) -> Result<()>;

    /// Tag `source` as `target`
    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    /// Push an image to its registry
    async fn push(&self, image: &str, options: &PushOptions) -> Result<()>;

    /// Whether the image exists in local storage
    async fn image_exists(&self, image: &str) -> bool;
}

/// Command line arguments for `<engine> build`
pub fn build_command_args(options: &BuildOptions) -> Vec<String> {
    let mut args = vec!["build".to_string()];
    for (key, value) in &options.build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push("--platform".to_string());
    args.push(options.platform.clone());
    args.push("-t".to_string());
    args.push(options.image.clone());
    args.push("-f".to_string());
    args.push(options.dockerfile.display().to_string());
    args.extend(options.extra_args.iter().cloned());
    args.push(options.context_dir.display().to_string());
    args
}

/// Command line arguments for `<engine> push`
pub fn push_command_args(engine: EngineName, image: &str, options: &PushOptions) -> Vec<String> {
    let mut args = vec!["push".to_string()];
    if options.insecure && engine == EngineName::Podman {
        args.push("--tls-verify=false".to_string());
    }
    args.push(image.to_string());
    args
}

/// [`ContainerEngine`] driving the docker or podman binary
pub struct CliEngine {
    name: EngineName,
    exec: Arc<dyn CommandExecutor>,
}

impl CliEngine {
    /// Engine `name` running on `exec`
    pub fn new(name: EngineName, exec: Arc<dyn CommandExecutor>) -> Self {
        Self { name, exec }
    }
}

#[async_trait]
impl ContainerEngine for CliEngine {
    fn name(&self) -> EngineName {
        self.name
    }

    async fn build(&self, options: &BuildOptions) -> Result<()> {
        let args = build_command_args(options);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        info!(engine = %self.name, image = %options.image, "Building image");
        self.exec.run_cmd(self.name.binary(), &args).await
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        debug!(engine = %self.name, source = %source, target = %target, "Tagging image");
        self.exec
            .execute(self.name.binary(), &["tag", source, target])
            .await
            .map(|_| ())
    }

    async fn push(&self, image: &str, options: &PushOptions) -> Result<()> {
        let args = push_command_args(self.name, image, options);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        info!(engine = %self.name, image = %image, "Pushing image");
        self.exec.run_cmd(self.name.binary(), &args).await
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.exec
            .execute_with_timeout(
                self.name.binary(),
                &["image", "inspect", image],
                INSPECT_TIMEOUT,
            )
            .await
            .is_ok()
    }
}

async fn engine_available(exec: &dyn CommandExecutor, name: EngineName) -> bool {
    exec.execute_with_timeout(name.binary(), &["--version"], VERSION_PROBE_TIMEOUT)
        .await
        .is_ok()
}

/// Pick a container engine on the executor's host.
///
/// An explicit preference must be installed; `Auto` tries podman, then docker.
pub async fn detect_engine(
    exec: Arc<dyn CommandExecutor>,
    preference: EnginePreference,
) -> Result<Arc<dyn ContainerEngine>> {
    let candidates: &[EngineName] = match preference {
        EnginePreference::Docker => &[EngineName::Docker],
        EnginePreference::Podman => &[EngineName::Podman],
        EnginePreference::Auto => &[EngineName::Podman, EngineName::Docker],
    };

    for &name in candidates {
        if engine_available(exec.as_ref(), name).await {
            info!(engine = %name, host = %exec.describe(), "Using container engine");
            return Ok(Arc::new(CliEngine::new(name, exec)));
        }
        debug!(engine = %name, "Container engine not available");
    }

    let wanted = candidates
        .iter()
        .map(|n| n.binary())
        .collect::<Vec<_>>()
        .join(" or ");
    Err(Error::config(format!(
        "no container engine found on {} (looked for {})",
        exec.describe(),
        wanted
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExecutor;

    fn options() -> BuildOptions {
        let mut build_args = BTreeMap::new();
        build_args.insert("TARGETARCH".to_string(), "amd64".to_string());
        build_args.insert("BUILDER_IMAGE".to_string(), "golang:1.24".to_string());
        BuildOptions {
            context_dir: PathBuf::from("/src/ovn-kubernetes"),
            dockerfile: PathBuf::from("/src/ovn-kubernetes/dist/images/Dockerfile.fedora"),
            image: "ovn-kube:abc".to_string(),
            platform: "linux/amd64".to_string(),
            build_args,
            extra_args: vec!["--volume".to_string(), "/cache:/root/.cache/go-build:Z".to_string()],
        }
    }

    #[test]
    fn build_args_are_sorted_and_context_is_last() {
        let args = build_command_args(&options());
        assert_eq!(
            args,
            vec![
                "build",
                "--build-arg",
                "BUILDER_IMAGE=golang:1.24",
                "--build-arg",
                "TARGETARCH=amd64",
                "--platform",
                "linux/amd64",
                "-t",
                "ovn-kube:abc",
                "-f",
                "/src/ovn-kubernetes/dist/images/Dockerfile.fedora",
                "--volume",
                "/cache:/root/.cache/go-build:Z",
                "/src/ovn-kubernetes",
            ]
        );
    }

    #[test]
    fn insecure_push_only_affects_podman() {
        let insecure = PushOptions { insecure: true };
        assert_eq!(
            push_command_args(EngineName::Podman, "localhost:5000/ovn", &insecure),
            vec!["push", "--tls-verify=false", "localhost:5000/ovn"]
        );
        assert_eq!(
            push_command_args(EngineName::Docker, "localhost:5000/ovn", &insecure),
            vec!["push", "localhost:5000/ovn"]
        );
    }

    #[test]
    fn preference_parsing() {
        assert_eq!("".parse::<EnginePreference>().unwrap(), EnginePreference::Auto);
        assert_eq!("Docker".parse::<EnginePreference>().unwrap(), EnginePreference::Docker);
        assert_eq!("podman".parse::<EnginePreference>().unwrap(), EnginePreference::Podman);
        assert!("containerd".parse::<EnginePreference>().is_err());
    }

    #[tokio::test]
    async fn auto_detection_prefers_podman() {
        let exec = Arc::new(FakeExecutor::new());
        let engine = detect_engine(exec, EnginePreference::Auto).await.unwrap();
        assert_eq!(engine.name(), EngineName::Podman);
    }

    #[tokio::test]
    async fn auto_detection_falls_back_to_docker() {
        let exec = Arc::new(FakeExecutor::new());
        exec.fail("podman --version", "command not found");
        let engine = detect_engine(exec, EnginePreference::Auto).await.unwrap();
        assert_eq!(engine.name(), EngineName::Docker);
    }

    #[tokio::test]
    async fn explicit_preference_does_not_fall_back() {
        let exec = Arc::new(FakeExecutor::new());
        exec.fail("docker --version", "command not found");
        let err = detect_engine(exec, EnginePreference::Docker)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("docker"));
    }

    #[tokio::test]
    async fn cli_engine_issues_commands() {
        let exec = Arc::new(FakeExecutor::new());
        exec.fail("podman image inspect missing:latest", "no such image");
        let engine = CliEngine::new(EngineName::Podman, exec.clone());

        engine.build(&options()).await.unwrap();
        engine.tag("ovn-kube:abc", "ovn-kube:dev").await.unwrap();
        assert!(engine.image_exists("ovn-kube:abc").await);
        assert!(!engine.image_exists("missing:latest").await);

        let calls = exec.calls();
        assert!(calls[0].starts_with("podman build --build-arg BUILDER_IMAGE=golang:1.24"));
        assert_eq!(calls[1], "podman tag ovn-kube:abc ovn-kube:dev");
    }
}
