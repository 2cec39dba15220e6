//! Common types for dpu-sim: errors, host execution, hashing and Kubernetes helpers

#![deny(missing_docs)]

pub mod digest;
pub mod error;
pub mod exec;
pub mod kube_utils;
pub mod retry;

pub use error::Error;
pub use exec::{
    Architecture, CommandExecutor, CommandOutput, HostInfo, HostInfoCache, LocalExecutor,
};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for server-side apply
pub const FIELD_MANAGER: &str = "dpu-sim";

/// Namespace holding cluster system components (CoreDNS, kube-proxy)
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
