//! Provisioning of the OVN-Kubernetes source tree
//!
//! The tree is normally a git submodule of the project. An uninitialized
//! submodule leaves an empty directory behind, so presence of the directory
//! alone means nothing: a tree counts as populated only once
//! `dist/images/daemonset.sh` exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use dpu_sim_common::{CommandExecutor, Error, Result};

/// Upstream OVN-Kubernetes repository
pub const OVN_KUBERNETES_REPO_URL: &str = "https://github.com/ovn-org/ovn-kubernetes.git";
/// Branch cloned when the submodule is unavailable
pub const DEFAULT_BRANCH: &str = "master";
/// Directory (and submodule) name under the project root
pub const DEFAULT_SOURCE_DIR: &str = "ovn-kubernetes";
/// File whose presence marks a populated tree
pub const SOURCE_MARKER: &str = "dist/images/daemonset.sh";

/// Where the source tree lives and where to get it from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// Root of the dpu-sim checkout
    pub project_root: PathBuf,
    /// Directory name of the tree under `project_root`
    pub dir_name: String,
    /// Repository cloned when the submodule cannot be used
    pub repo_url: String,
    /// Branch to clone
    pub branch: String,
}

impl SourceConfig {
    /// Upstream defaults under `project_root`
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            dir_name: DEFAULT_SOURCE_DIR.to_string(),
            repo_url: OVN_KUBERNETES_REPO_URL.to_string(),
            branch: DEFAULT_BRANCH.to_string(),
        }
    }

    /// Path of the source tree
    pub fn source_path(&self) -> PathBuf {
        self.project_root.join(&self.dir_name)
    }
}

/// Makes sure a populated source tree exists.
///
/// Callers must not run two provisioners on the same path concurrently.
pub struct SourceProvisioner {
    exec: Arc<dyn CommandExecutor>,
    config: SourceConfig,
}

impl SourceProvisioner {
    /// Provisioner running git through `exec`
    pub fn new(exec: Arc<dyn CommandExecutor>, config: SourceConfig) -> Self {
        Self { exec, config }
    }

    /// Path of the source tree, populated or not
    pub fn source_path(&self) -> PathBuf {
        self.config.source_path()
    }

    async fn is_populated(&self, path: &Path) -> bool {
        self.exec.file_exists(&path.join(SOURCE_MARKER)).await
    }

    async fn init_submodule(&self) -> Result<()> {
        let root = &self.config.project_root;
        let name = self.config.dir_name.as_str();
        debug!(submodule = %name, "Initializing git submodule");
        self.exec
            .run_cmd_in_dir(root, "git", &["submodule", "init", name])
            .await?;
        self.exec
            .run_cmd_in_dir(root, "git", &["submodule", "update", "--init", name])
            .await
    }

    /// Return the path of a populated source tree, fetching it if needed.
    ///
    /// An existing populated tree is reused as is. Otherwise the submodule
    /// is initialized, and failing that the repository is cloned.
    pub async fn ensure(&self) -> Result<PathBuf> {
        let path = self.source_path();

        if self.exec.file_exists(&path).await {
            if self.is_populated(&path).await {
                debug!(path = %path.display(), "Source tree already populated");
                return Ok(path);
            }

            info!(path = %path.display(), "Source directory is empty, initializing submodule");
            match self.init_submodule().await {
                Ok(()) if self.is_populated(&path).await => return Ok(path),
                Ok(()) => warn!(
                    path = %path.display(),
                    marker = SOURCE_MARKER,
                    "Submodule initialized without source, removing directory"
                ),
                Err(e) => warn!(error = %e, "Submodule initialization failed, removing directory"),
            }
            self.exec.remove_all(&path).await?;
        } else if self
            .exec
            .file_exists(&self.config.project_root.join(".git"))
            .await
        {
            match self.init_submodule().await {
                Ok(()) if self.is_populated(&path).await => return Ok(path),
                Ok(()) => warn!(path = %path.display(), "Submodule left no source tree"),
                Err(e) => warn!(error = %e, "Submodule initialization failed"),
            }
            // git clone refuses a non-empty target directory
            self.exec.remove_all(&path).await?;
        }

        self.clone_repository(&path).await?;
        if !self.is_populated(&path).await {
            return Err(Error::source_unavailable(
                &path,
                format!("clone completed but {} is missing", SOURCE_MARKER),
            ));
        }
        Ok(path)
    }

    async fn clone_repository(&self, path: &Path) -> Result<()> {
        info!(
            repo = %self.config.repo_url,
            branch = %self.config.branch,
            "Cloning OVN-Kubernetes"
        );
        let target = path.display().to_string();
        self.exec
            .run_cmd_in_dir(
                &self.config.project_root,
                "git",
                &[
                    "clone",
                    "--branch",
                    &self.config.branch,
                    &self.config.repo_url,
                    &target,
                ],
            )
            .await
            .map_err(|e| Error::source_unavailable(path, format!("clone failed: {}", e)))?;
        info!(path = %path.display(), "OVN-Kubernetes cloned");
        Ok(())
    }
}
