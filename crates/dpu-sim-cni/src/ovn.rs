//! OVN-Kubernetes install and redeploy

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use dpu_sim_common::{CommandExecutor, Error, Result, KUBE_SYSTEM_NAMESPACE};

use crate::client::ClusterApi;
use crate::cluster::{ClusterTarget, NodeRoleAssignment};
use crate::coredns::{CoreDnsPatcher, CorefilePolicy, DEFAULT_DNS_SERVER, DEFAULT_EXTRA_TLD};
use crate::engine::{ContainerEngine, PushOptions};
use crate::image::ImageBuilder;
use crate::installer::{CniKind, InstallReport, Installer, RedeployOutcome};
use crate::manifests::{deployment_manifests, ManifestDeployer, PhasePlan, OVN_NAMESPACE};
use crate::readiness::{ReadinessWaiter, DEFAULT_POLL_INTERVAL};
use crate::source::{SourceConfig, SourceProvisioner};

/// Upstream image used by the daemonsets unless a registry image is configured
pub const DEFAULT_OVN_IMAGE: &str = "ghcr.io/ovn-kubernetes/ovn-kubernetes/ovn-kube-fedora:master";
/// Local name of the image built from source
pub const DEFAULT_BUILD_IMAGE: &str = "ovn-kube-fedora:dpu-sim";
/// How long to wait for OVN-Kubernetes pods
pub const OVN_READINESS_TIMEOUT: Duration = Duration::from_secs(300);
/// `name=` labels of the components recycled on redeploy
pub const OVN_COMPONENT_LABELS: [&str; 4] = [
    "ovnkube-db",
    "ovnkube-master",
    "ovnkube-node",
    "ovnkube-identity",
];

const KUBE_PROXY: &str = "kube-proxy";
const DAEMONSET_SCRIPT: &str = "daemonset.sh";

/// OVN-Kubernetes install settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvnOptions {
    /// Image referenced by the generated daemonsets
    pub daemonset_image: String,
    /// Local image name for the source build
    pub build_image: String,
    /// Build OVN from this ref instead of using prebuilt packages
    pub ovn_git_ref: Option<String>,
    /// Deploy the standalone OVS daemonset
    pub ovs_node: bool,
    /// Tag the built image as `daemonset_image` and push it before deploying
    pub push_daemonset_image: bool,
    /// Upstream DNS server written into the Corefile
    pub dns_server: String,
    /// Extra TLD the cluster DNS answers for
    pub extra_tld: String,
    /// Readiness wait after install and redeploy
    pub readiness_timeout: Duration,
    /// Readiness poll interval
    pub poll_interval: Duration,
}

impl Default for OvnOptions {
    fn default() -> Self {
        Self {
            daemonset_image: DEFAULT_OVN_IMAGE.to_string(),
            build_image: DEFAULT_BUILD_IMAGE.to_string(),
            ovn_git_ref: None,
            ovs_node: false,
            push_daemonset_image: false,
            dns_server: DEFAULT_DNS_SERVER.to_string(),
            extra_tld: DEFAULT_EXTRA_TLD.to_string(),
            readiness_timeout: OVN_READINESS_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Arguments for `daemonset.sh`: cluster settings plus the fixed feature set
pub fn daemonset_args(image: &str, cluster: &ClusterTarget) -> Vec<String> {
    let mut args = vec![
        format!("--image={}", image),
        format!("--net-cidr={}", cluster.pod_cidr),
        format!("--svc-cidr={}", cluster.service_cidr),
        format!("--k8s-apiserver={}", cluster.api_server_url),
    ];
    args.extend(
        [
            "--gateway-mode=shared",
            "--dummy-gateway-bridge=false",
            "--gateway-options=",
            "--enable-ipsec=false",
            "--hybrid-enabled=false",
            "--disable-snat-multiple-gws=false",
            "--disable-forwarding=false",
            "--ovn-encap-port=",
            "--disable-pkt-mtu-check=false",
            "--ovn-empty-lb-events=false",
            "--multicast-enabled=false",
            "--ovn-master-count=1",
            "--ovn-unprivileged-mode=no",
            "--master-loglevel=5",
            "--node-loglevel=5",
            "--dbchecker-loglevel=5",
            "--ovn-loglevel-northd=-vconsole:info -vfile:info",
            "--ovn-loglevel-nb=-vconsole:info -vfile:info",
            "--ovn-loglevel-sb=-vconsole:info -vfile:info",
            "--ovn-loglevel-controller=-vconsole:info",
            "--ovnkube-libovsdb-client-logfile=",
            "--ovnkube-config-duration-enable=true",
            "--admin-network-policy-enable=true",
            "--egress-ip-enable=true",
            "--egress-ip-healthcheck-port=9107",
            "--egress-firewall-enable=true",
            "--egress-qos-enable=true",
            "--egress-service-enable=true",
            "--v4-join-subnet=100.64.0.0/16",
            "--v6-join-subnet=fd98::/64",
            "--v4-masquerade-subnet=169.254.0.0/17",
            "--v6-masquerade-subnet=fd69::/112",
            "--v4-transit-subnet=100.88.0.0/16",
            "--v6-transit-subnet=fd97::/64",
            "--ex-gw-network-interface=",
            "--multi-network-enable=false",
            "--network-segmentation-enable=false",
            "--preconfigured-udn-addresses-enable=false",
            "--route-advertisements-enable=false",
            "--advertise-default-network=false",
            "--advertised-udn-isolation-mode=strict",
            "--ovnkube-metrics-scale-enable=false",
            "--compact-mode=false",
            "--enable-multi-external-gateway=true",
            "--enable-ovnkube-identity=true",
            "--enable-persistent-ips=true",
            "--network-qos-enable=false",
            "--mtu=1400",
            "--enable-dnsnameresolver=false",
            "--enable-observ=false",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args
}

/// Installs OVN-Kubernetes from a locally built image
pub struct OvnKubernetesInstaller {
    api: Arc<dyn ClusterApi>,
    exec: Arc<dyn CommandExecutor>,
    engine: Arc<dyn ContainerEngine>,
    source: SourceConfig,
    roles: NodeRoleAssignment,
    options: OvnOptions,
    corefile_policy: CorefilePolicy,
}

impl OvnKubernetesInstaller {
    /// Installer with the offline Corefile policy
    pub fn new(
        api: Arc<dyn ClusterApi>,
        exec: Arc<dyn CommandExecutor>,
        engine: Arc<dyn ContainerEngine>,
        source: SourceConfig,
        roles: NodeRoleAssignment,
        options: OvnOptions,
    ) -> Result<Self> {
        let corefile_policy = CorefilePolicy::offline(&options.extra_tld)?;
        Ok(Self {
            api,
            exec,
            engine,
            source,
            roles,
            options,
            corefile_policy,
        })
    }

    /// Replace the Corefile rule table
    pub fn with_corefile_policy(mut self, policy: CorefilePolicy) -> Self {
        self.corefile_policy = policy;
        self
    }

    fn provisioner(&self) -> SourceProvisioner {
        SourceProvisioner::new(self.exec.clone(), self.source.clone())
    }

    fn deployer(&self) -> ManifestDeployer {
        ManifestDeployer::new(self.api.clone(), self.exec.clone())
    }

    fn waiter(&self) -> ReadinessWaiter {
        ReadinessWaiter::new(self.api.clone()).with_poll_interval(self.options.poll_interval)
    }

    /// Make the built image pullable under the daemonset image name
    async fn publish(&self, image: &str) -> Result<()> {
        let target = self.options.daemonset_image.as_str();
        if image != target {
            self.engine.tag(image, target).await?;
        }
        self.engine
            .push(target, &PushOptions { insecure: true })
            .await?;
        info!(image = %target, "OVN-Kubernetes image pushed");
        Ok(())
    }

    /// Render the manifests under `dist/yaml` with `daemonset.sh`
    async fn generate_manifests(&self, tree: &Path, cluster: &ClusterTarget) -> Result<()> {
        let images_dir = tree.join("dist").join("images");
        let script = images_dir.join(DAEMONSET_SCRIPT);
        if !self.exec.file_exists(&script).await {
            return Err(Error::source_unavailable(
                tree,
                format!("{} not found", script.display()),
            ));
        }

        let args = daemonset_args(&self.options.daemonset_image, cluster);
        let script_arg = format!("./{}", DAEMONSET_SCRIPT);
        let mut argv = vec![script_arg.as_str()];
        argv.extend(args.iter().map(String::as_str));

        info!(cluster = %cluster.name, image = %self.options.daemonset_image, "Generating OVN-Kubernetes manifests");
        self.exec.run_cmd_in_dir(&images_dir, "bash", &argv).await?;
        debug!("daemonset.sh completed");
        Ok(())
    }

    async fn redeploy_components(&self, cluster: &ClusterTarget) -> Result<InstallReport> {
        let mut report = InstallReport::new(&cluster.name, CniKind::OvnKubernetes);
        let tree = self.provisioner().ensure().await?;

        self.deployer()
            .apply_deployments(&yaml_dir(&tree), &deployment_manifests(false), &cluster.name)
            .await?;

        for label in OVN_COMPONENT_LABELS {
            let selector = format!("name={}", label);
            if let Err(e) = self.api.delete_pods_by_label(OVN_NAMESPACE, &selector).await {
                report.warn("delete-pods", &e);
            }
        }

        let ready = self
            .waiter()
            .wait_ready(OVN_NAMESPACE, "", self.options.readiness_timeout)
            .await;
        report.soften("readiness", ready)?;
        Ok(report)
    }
}

fn yaml_dir(tree: &Path) -> PathBuf {
    tree.join("dist").join("yaml")
}

#[async_trait]
impl Installer for OvnKubernetesInstaller {
    fn kind(&self) -> CniKind {
        CniKind::OvnKubernetes
    }

    async fn install(&self, cluster: &ClusterTarget) -> Result<InstallReport> {
        info!(
            cluster = %cluster.name,
            pod_cidr = %cluster.pod_cidr,
            service_cidr = %cluster.service_cidr,
            api_server = %cluster.api_server_url,
            "Installing OVN-Kubernetes"
        );
        let mut report = InstallReport::new(&cluster.name, CniKind::OvnKubernetes);

        let patcher = CoreDnsPatcher::new(self.api.clone(), self.corefile_policy.clone());
        report.soften("coredns", patcher.patch(&self.options.dns_server).await)?;

        let tree = self.provisioner().ensure().await?;

        let builder = ImageBuilder::new(self.exec.clone(), self.engine.clone(), self.provisioner());
        let outcome = builder
            .build_or_reuse(&self.options.build_image, self.options.ovn_git_ref.as_deref())
            .await?;
        debug!(image = %outcome.cached_image, reused = outcome.reused, "OVN-Kubernetes image ready");
        if self.options.push_daemonset_image {
            self.publish(&outcome.image).await?;
        }

        self.generate_manifests(&tree, cluster).await?;

        let plan = PhasePlan::ovn_kubernetes(self.options.ovs_node);
        self.deployer()
            .apply_all(&yaml_dir(&tree), &plan, &cluster.name, &self.roles)
            .await?;

        let ready = self
            .waiter()
            .wait_ready(OVN_NAMESPACE, "", self.options.readiness_timeout)
            .await;
        report.soften("readiness", ready)?;

        // OVN-Kubernetes replaces kube-proxy
        self.api
            .delete_daemonset(KUBE_SYSTEM_NAMESPACE, KUBE_PROXY)
            .await?;
        info!(cluster = %cluster.name, "kube-proxy removed");

        Ok(report)
    }

    async fn redeploy(&self, cluster: &ClusterTarget) -> Result<RedeployOutcome> {
        info!(cluster = %cluster.name, "Redeploying OVN-Kubernetes");
        self.redeploy_components(cluster)
            .await
            .map(RedeployOutcome::Redeployed)
            .map_err(|e| Error::redeploy_failed(&cluster.name, e.to_string()))
    }
}
