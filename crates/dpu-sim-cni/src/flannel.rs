//! Flannel install from the upstream release manifest

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use dpu_sim_common::{Error, Result};

use crate::client::ClusterApi;
use crate::cluster::ClusterTarget;
use crate::installer::{CniKind, InstallReport, Installer};
use crate::readiness::{ReadinessWaiter, DEFAULT_POLL_INTERVAL};

/// Latest Flannel release manifest
pub const FLANNEL_MANIFEST_URL: &str =
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml";
/// Namespace created by the Flannel manifest
pub const FLANNEL_NAMESPACE: &str = "kube-flannel";
/// ConfigMap holding the Flannel network config
pub const FLANNEL_CONFIG_MAP: &str = "kube-flannel-cfg";
/// Key of the network config in [`FLANNEL_CONFIG_MAP`]
pub const NET_CONF_KEY: &str = "net-conf.json";
/// Flannel daemonset
pub const FLANNEL_DAEMONSET: &str = "kube-flannel-ds";
/// How long to wait for Flannel pods
pub const FLANNEL_READINESS_TIMEOUT: Duration = Duration::from_secs(180);

/// `net-conf.json` for a VXLAN network over `pod_cidr`
pub fn net_conf(pod_cidr: &str) -> String {
    json!({
        "Network": pod_cidr,
        "Backend": { "Type": "vxlan" },
    })
    .to_string()
}

/// Installs Flannel
pub struct FlannelInstaller {
    api: Arc<dyn ClusterApi>,
    poll_interval: Duration,
}

impl FlannelInstaller {
    /// Installer applying through `api`
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    async fn patch_config(&self, pod_cidr: &str) -> Result<()> {
        let data = BTreeMap::from([(NET_CONF_KEY.to_string(), net_conf(pod_cidr))]);
        self.api
            .update_config_map(FLANNEL_NAMESPACE, FLANNEL_CONFIG_MAP, data)
            .await?;
        debug!(pod_cidr = %pod_cidr, "Flannel network config updated");
        Ok(())
    }
}

#[async_trait]
impl Installer for FlannelInstaller {
    fn kind(&self) -> CniKind {
        CniKind::Flannel
    }

    async fn install(&self, cluster: &ClusterTarget) -> Result<InstallReport> {
        let mut report = InstallReport::new(&cluster.name, CniKind::Flannel);

        self.api
            .apply_manifest_from_url(FLANNEL_MANIFEST_URL)
            .await
            .map_err(|e| {
                Error::manifest_apply(FLANNEL_MANIFEST_URL, "flannel", &cluster.name, e.to_string())
            })?;

        if let Err(e) = self.patch_config(&cluster.pod_cidr).await {
            report.warn("flannel-config", &e);
        }
        if let Err(e) = self
            .api
            .rollout_restart_daemonset(FLANNEL_NAMESPACE, FLANNEL_DAEMONSET)
            .await
        {
            report.warn("flannel-restart", &e);
        }
        info!(cluster = %cluster.name, "Flannel applied");

        let ready = ReadinessWaiter::new(self.api.clone())
            .with_poll_interval(self.poll_interval)
            .wait_ready(FLANNEL_NAMESPACE, "", FLANNEL_READINESS_TIMEOUT)
            .await;
        report.soften("readiness", ready)?;
        Ok(report)
    }
}
