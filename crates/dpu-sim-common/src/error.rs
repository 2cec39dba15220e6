//! Error types for dpu-sim CNI installation
//!
//! Errors carry the cluster, manifest phase, file or image they concern so a
//! failed install can be diagnosed from the log line alone.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for dpu-sim operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The plugin source tree could not be provisioned
    #[error("source unavailable at {}: {message}", path.display())]
    SourceUnavailable {
        /// Expected location of the source tree
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// The image build definition is missing from the source tree
    #[error("build spec missing: {} not found", path.display())]
    BuildSpecMissing {
        /// Path of the expected Dockerfile
        path: PathBuf,
    },

    /// The container image build failed
    #[error("image build failed for {image}: {message}")]
    BuildFailed {
        /// Image reference being built
        image: String,
        /// Description of what failed
        message: String,
        /// Captured engine output
        output: String,
    },

    /// A remote git reference could not be resolved to a commit
    #[error("failed to resolve git ref {git_ref} in {repo}: {message}")]
    GitRefResolutionFailed {
        /// Remote repository URL
        repo: String,
        /// Reference that was requested
        git_ref: String,
        /// Description of what failed
        message: String,
    },

    /// A manifest file could not be read
    #[error("failed to read manifest {file} during {phase}: {message}")]
    ManifestRead {
        /// Manifest file path or URL
        file: String,
        /// Manifest phase being applied
        phase: String,
        /// Description of what failed
        message: String,
    },

    /// A manifest could not be applied to the cluster
    #[error("failed to apply {manifest} during {phase} on cluster {cluster}: {message}")]
    ManifestApply {
        /// Manifest file path or URL
        manifest: String,
        /// Manifest phase being applied
        phase: String,
        /// Target cluster
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// A node could not be labeled
    #[error("failed to label node {node} on cluster {cluster}: {message}")]
    NodeLabel {
        /// Node name
        node: String,
        /// Target cluster
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// The CoreDNS Corefile could not be patched
    #[error("coredns patch failed: {message}")]
    CoreDnsPatch {
        /// Description of what failed
        message: String,
    },

    /// Pods did not become ready in time
    #[error("timed out after {}s waiting for pods in {namespace} ({selector}) to become ready", timeout.as_secs())]
    ReadinessTimeout {
        /// Namespace that was polled
        namespace: String,
        /// Label selector that was polled (empty means all pods)
        selector: String,
        /// How long the wait lasted
        timeout: Duration,
    },

    /// Redeploying the CNI failed
    #[error("redeploy failed on cluster {cluster}: {message}")]
    RedeployFailed {
        /// Target cluster
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// The requested operation is not supported in this context
    #[error("{operation} is not supported for {target}")]
    Unsupported {
        /// Operation that was requested
        operation: String,
        /// What the operation was requested for (CNI, deployment mode)
        target: String,
    },

    /// An external command failed
    #[error("command failed [{command}]: {message}")]
    Command {
        /// Command line that was run
        command: String,
        /// Description of what failed
        message: String,
        /// Captured stdout and stderr
        output: String,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what is wrong
        message: String,
    },

    /// Filesystem error
    #[error("io error [{context}]: {source}")]
    Io {
        /// Operation or path that failed
        context: String,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a source unavailable error
    pub fn source_unavailable(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a build failure carrying the engine output
    pub fn build_failed(
        image: impl Into<String>,
        msg: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::BuildFailed {
            image: image.into(),
            message: msg.into(),
            output: output.into(),
        }
    }

    /// Create a git ref resolution error
    pub fn git_ref_resolution(
        repo: impl Into<String>,
        git_ref: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::GitRefResolutionFailed {
            repo: repo.into(),
            git_ref: git_ref.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest read error
    pub fn manifest_read(
        file: impl Into<String>,
        phase: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ManifestRead {
            file: file.into(),
            phase: phase.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest apply error
    pub fn manifest_apply(
        manifest: impl Into<String>,
        phase: impl Into<String>,
        cluster: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ManifestApply {
            manifest: manifest.into(),
            phase: phase.into(),
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a node label error
    pub fn node_label(
        node: impl Into<String>,
        cluster: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::NodeLabel {
            node: node.into(),
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a CoreDNS patch error
    pub fn coredns_patch(msg: impl Into<String>) -> Self {
        Self::CoreDnsPatch {
            message: msg.into(),
        }
    }

    /// Create a readiness timeout error
    pub fn readiness_timeout(
        namespace: impl Into<String>,
        selector: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self::ReadinessTimeout {
            namespace: namespace.into(),
            selector: selector.into(),
            timeout,
        }
    }

    /// Create a redeploy error
    pub fn redeploy_failed(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RedeployFailed {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            target: target.into(),
        }
    }

    /// Create a command error without captured output
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
            output: String::new(),
        }
    }

    /// Create a command error with the captured output
    pub fn command_with_output(
        command: impl Into<String>,
        msg: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
            output: output.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Wrap an io error with the operation or path it came from
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether an installer should downgrade this error to a warning.
    ///
    /// DNS patching and readiness waits are best effort: the cluster is
    /// usable without them and they converge on their own.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::CoreDnsPatch { .. } | Self::ReadinessTimeout { .. })
    }

    /// Get the cluster name if this error has cluster context
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Self::ManifestApply { cluster, .. }
            | Self::NodeLabel { cluster, .. }
            | Self::RedeployFailed { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Captured command output attached to this error, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::BuildFailed { output, .. } | Self::Command { output, .. }
                if !output.is_empty() =>
            {
                Some(output.as_str())
            }
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(format!("yaml: {}", e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(format!("json: {}", e))
    }
}
