//! In-memory fakes for installer tests

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use dpu_sim_common::exec::format_command;
use dpu_sim_common::kube_utils::{describe_document, document_kind, parse_yaml_documents};
use dpu_sim_common::{Architecture, CommandExecutor, CommandOutput, Error, HostInfo, Result};

use crate::client::{ClusterApi, NodeInfo, PodReadiness};
use crate::engine::{BuildOptions, ContainerEngine, EngineName, PushOptions};
use crate::manifests::{
    NETWORK_POLICY_API_CRD_URLS, OVN_CRD_MANIFESTS, OVN_SETUP_MANIFESTS, OVS_NODE_MANIFEST,
};

// =============================================================================
// FakeExecutor
// =============================================================================

/// A recorded command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub dir: Option<PathBuf>,
    pub line: String,
}

struct Rule {
    prefix: String,
    result: std::result::Result<CommandOutput, String>,
    creates: Vec<PathBuf>,
}

#[derive(Default)]
struct ExecState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    rules: Vec<Rule>,
    calls: Vec<Call>,
}

/// Executor with an in-memory filesystem and scripted command results.
///
/// Commands succeed with empty output unless a rule matches; the most
/// recently added rule whose prefix matches the command line wins.
pub(crate) struct FakeExecutor {
    state: Mutex<ExecState>,
    arch: Architecture,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::with_arch(Architecture::X86_64)
    }

    pub fn with_arch(arch: Architecture) -> Self {
        Self {
            state: Mutex::new(ExecState::default()),
            arch,
        }
    }

    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.add_rule(prefix, Ok(CommandOutput::stdout(stdout)), vec![]);
    }

    pub fn fail(&self, prefix: &str, message: &str) {
        self.add_rule(prefix, Err(message.to_string()), vec![]);
    }

    /// Make a matching command create `paths` when it succeeds
    pub fn creates_on_success(&self, prefix: &str, paths: &[PathBuf]) {
        self.add_rule(prefix, Ok(CommandOutput::default()), paths.to_vec());
    }

    fn add_rule(
        &self,
        prefix: &str,
        result: std::result::Result<CommandOutput, String>,
        creates: Vec<PathBuf>,
    ) {
        self.state.lock().unwrap().rules.push(Rule {
            prefix: prefix.to_string(),
            result,
            creates,
        });
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, content: impl AsRef<[u8]>) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.into(), content.as_ref().to_vec());
    }

    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().dirs.insert(path.into());
    }

    pub fn file(&self, path: &Path) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|c| c.line.clone())
            .collect()
    }

    pub fn calls_detailed(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn run(&self, dir: Option<&Path>, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = format_command(program, args);
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            dir: dir.map(Path::to_path_buf),
            line: line.clone(),
        });

        let matched = state
            .rules
            .iter()
            .rev()
            .find(|r| line.starts_with(&r.prefix))
            .map(|r| (r.result.clone(), r.creates.clone()));

        match matched {
            None => Ok(CommandOutput::default()),
            Some((Ok(output), creates)) => {
                for path in creates {
                    state.files.insert(path, Vec::new());
                }
                Ok(output)
            }
            Some((Err(message), _)) => Err(Error::command_with_output(
                line,
                "exited with status 1",
                message,
            )),
        }
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run(None, program, args)
    }

    async fn execute_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        self.run(None, program, args)
    }

    async fn run_cmd(&self, program: &str, args: &[&str]) -> Result<()> {
        self.run(None, program, args).map(|_| ())
    }

    async fn run_cmd_in_dir(&self, dir: &Path, program: &str, args: &[&str]) -> Result<()> {
        self.run(Some(dir), program, args).map(|_| ())
    }

    async fn file_exists(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        state.files.keys().any(|f| f.starts_with(path))
            || state.dirs.iter().any(|d| d.starts_with(path))
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.file(path).ok_or_else(|| {
            Error::io(
                path.display().to_string(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            )
        })
    }

    async fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.add_file(path, content);
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.files.retain(|f, _| !f.starts_with(path));
        state.dirs.retain(|d| !d.starts_with(path));
        Ok(())
    }

    async fn host_info(&self) -> Result<HostInfo> {
        Ok(HostInfo {
            distro_id: "fedora".to_string(),
            version_id: "41".to_string(),
            id_like: vec![],
            architecture: self.arch.clone(),
        })
    }

    fn describe(&self) -> String {
        "fake-host".to_string()
    }
}

// =============================================================================
// FakeClusterApi
// =============================================================================

/// Kinds the fake API server knows without any CRD
const BUILTIN_KINDS: &[&str] = &[
    "Namespace",
    "ServiceAccount",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "ConfigMap",
    "Secret",
    "Service",
    "Deployment",
    "DaemonSet",
    "CustomResourceDefinition",
    "ValidatingWebhookConfiguration",
];

/// Something the fake API was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ApiEvent {
    /// Documents of one applied manifest, as `Kind/name`
    Apply(Vec<String>),
    ApplyUrl(String),
    InvalidateDiscovery,
    UpdateConfigMap(String),
    LabelNode(String),
    RemoveTaint(String, String),
    DeleteDaemonSet(String),
    DeletePods(String),
    RolloutRestart(String),
}

#[derive(Default)]
struct ApiState {
    events: Vec<ApiEvent>,
    registered_kinds: BTreeSet<String>,
    discovered_kinds: Option<BTreeSet<String>>,
    url_manifests: BTreeMap<String, String>,
    config_maps: BTreeMap<(String, String), BTreeMap<String, String>>,
    nodes: Vec<NodeInfo>,
    pods: BTreeMap<String, Vec<PodReadiness>>,
    failing: BTreeSet<&'static str>,
}

/// API server fake that resolves CRD kinds the way discovery does.
///
/// A CRD instance is rejected unless its CRD was applied and discovery was
/// refreshed afterwards. Discovery is snapshotted on the first apply after
/// creation or invalidation, like [`KubeClusterApi`](crate::client::KubeClusterApi).
#[derive(Default)]
pub(crate) struct FakeClusterApi {
    state: Mutex<ApiState>,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve_url(&self, url: &str, manifest: &str) {
        self.state
            .lock()
            .unwrap()
            .url_manifests
            .insert(url.to_string(), manifest.to_string());
    }

    pub fn set_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        self.state.lock().unwrap().nodes = nodes;
    }

    pub fn node_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.labels.clone())
            .unwrap_or_default()
    }

    /// Report `count` pods in `namespace`, all with the given readiness
    pub fn set_pods(&self, namespace: &str, count: usize, ready: bool) {
        let pods = (0..count)
            .map(|i| PodReadiness {
                name: format!("pod-{}", i),
                ready,
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .pods
            .insert(namespace.to_string(), pods);
    }

    /// Make the named trait operation fail
    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().unwrap().failing.insert(operation);
    }

    pub fn events(&self) -> Vec<ApiEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Every applied `Kind/name`, in order
    pub fn applied_objects(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ApiEvent::Apply(objects) => Some(objects),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.state.lock().unwrap().failing.contains(operation) {
            return Err(Error::internal_with_context(operation, "injected failure"));
        }
        Ok(())
    }

    fn apply_content(&self, content: &str) -> Result<()> {
        let documents = parse_yaml_documents(content)?;
        let mut state = self.state.lock().unwrap();
        if state.discovered_kinds.is_none() {
            state.discovered_kinds = Some(state.registered_kinds.clone());
        }

        let mut applied = Vec::new();
        for document in &documents {
            let kind = document_kind(document).unwrap_or_default().to_string();
            let known = BUILTIN_KINDS.contains(&kind.as_str())
                || state
                    .discovered_kinds
                    .as_ref()
                    .is_some_and(|d| d.contains(&kind));
            if !known {
                return Err(Error::internal_with_context(
                    "apply_manifest",
                    format!("unknown resource type {}", kind),
                ));
            }
            if kind == "CustomResourceDefinition" {
                if let Some(crd_kind) = document
                    .pointer("/spec/names/kind")
                    .and_then(|v| v.as_str())
                {
                    state.registered_kinds.insert(crd_kind.to_string());
                }
            }
            applied.push(describe_document(document));
        }
        state.events.push(ApiEvent::Apply(applied));
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn apply_manifest(&self, manifest: &[u8]) -> Result<()> {
        self.check("apply_manifest")?;
        self.apply_content(&String::from_utf8_lossy(manifest))
    }

    async fn apply_manifest_from_url(&self, url: &str) -> Result<()> {
        self.check("apply_manifest_from_url")?;
        let content = {
            let mut state = self.state.lock().unwrap();
            state.events.push(ApiEvent::ApplyUrl(url.to_string()));
            state.url_manifests.get(url).cloned()
        };
        let content = content.ok_or_else(|| {
            Error::internal_with_context("fetch_manifest", format!("404 for {}", url))
        })?;
        self.apply_content(&content)
    }

    async fn invalidate_discovery_cache(&self) {
        let mut state = self.state.lock().unwrap();
        state.discovered_kinds = None;
        state.events.push(ApiEvent::InvalidateDiscovery);
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>> {
        self.check("get_config_map")?;
        self.config_map(namespace, name).ok_or_else(|| {
            Error::internal_with_context("get_config_map", format!("{}/{} not found", namespace, name))
        })
    }

    async fn update_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        self.check("update_config_map")?;
        let mut state = self.state.lock().unwrap();
        state
            .events
            .push(ApiEvent::UpdateConfigMap(format!("{}/{}", namespace, name)));
        state
            .config_maps
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .extend(data);
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, _label_selector: &str) -> Result<Vec<PodReadiness>> {
        self.check("list_pods")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.check("get_nodes")?;
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn label_node(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        self.check("label_node")?;
        let mut state = self.state.lock().unwrap();
        state.events.push(ApiEvent::LabelNode(name.to_string()));
        match state.nodes.iter_mut().find(|n| n.name == name) {
            Some(node) => {
                node.labels.extend(labels);
                Ok(())
            }
            None => Err(Error::internal_with_context(
                "label_node",
                format!("node {} not found", name),
            )),
        }
    }

    async fn remove_node_taint(&self, name: &str, key: &str, _effect: &str) -> Result<()> {
        self.check("remove_node_taint")?;
        self.state
            .lock()
            .unwrap()
            .events
            .push(ApiEvent::RemoveTaint(name.to_string(), key.to_string()));
        Ok(())
    }

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        self.check("delete_daemonset")?;
        self.state
            .lock()
            .unwrap()
            .events
            .push(ApiEvent::DeleteDaemonSet(format!("{}/{}", namespace, name)));
        Ok(())
    }

    async fn delete_pods_by_label(&self, namespace: &str, label_selector: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .events
            .push(ApiEvent::DeletePods(format!("{}/{}", namespace, label_selector)));
        self.check("delete_pods_by_label")
    }

    async fn rollout_restart_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        self.check("rollout_restart_daemonset")?;
        self.state
            .lock()
            .unwrap()
            .events
            .push(ApiEvent::RolloutRestart(format!("{}/{}", namespace, name)));
        Ok(())
    }
}

// =============================================================================
// FakeEngine
// =============================================================================

#[derive(Default)]
struct EngineState {
    images: BTreeSet<String>,
    builds: Vec<BuildOptions>,
    tags: Vec<(String, String)>,
    pushes: Vec<String>,
    build_failure: Option<String>,
}

/// Container engine keeping images in memory
pub(crate) struct FakeEngine {
    name: EngineName,
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new(name: EngineName) -> Self {
        Self {
            name,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn fail_builds(&self, output: &str) {
        self.state.lock().unwrap().build_failure = Some(output.to_string());
    }

    pub fn builds(&self) -> Vec<BuildOptions> {
        self.state.lock().unwrap().builds.clone()
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().tags.clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().unwrap().images.contains(image)
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> EngineName {
        self.name
    }

    async fn build(&self, options: &BuildOptions) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.builds.push(options.clone());
        if let Some(output) = &state.build_failure {
            return Err(Error::command_with_output(
                format!("{} build", self.name),
                "exited with status 1",
                output.clone(),
            ));
        }
        state.images.insert(options.image.clone());
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains(source) {
            return Err(Error::command("tag", format!("image {} not known", source)));
        }
        state.tags.push((source.to_string(), target.to_string()));
        state.images.insert(target.to_string());
        Ok(())
    }

    async fn push(&self, image: &str, _options: &PushOptions) -> Result<()> {
        self.state.lock().unwrap().pushes.push(image.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.state.lock().unwrap().images.contains(image)
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// CRD kind defined by each OVN CRD manifest, in manifest order
pub(crate) const OVN_CRD_KINDS: [&str; 10] = [
    "EgressFirewall",
    "EgressIP",
    "EgressQoS",
    "EgressService",
    "AdminPolicyBasedExternalRoute",
    "NetworkQoS",
    "UserDefinedNetwork",
    "ClusterUserDefinedNetwork",
    "RouteAdvertisements",
    "ClusterNetworkConnect",
];

pub(crate) fn crd_yaml(kind: &str, group: &str) -> String {
    let plural = format!("{}s", kind.to_lowercase());
    format!(
        r#"apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: {plural}.{group}
spec:
  group: {group}
  names:
    kind: {kind}
    plural: {plural}
  scope: Namespaced
"#
    )
}

fn object_yaml(api_version: &str, kind: &str, name: &str) -> String {
    format!(
        "apiVersion: {api_version}\nkind: {kind}\nmetadata:\n  name: {name}\n  namespace: ovn-kubernetes\n"
    )
}

/// Serve the two network-policy-api CRDs from their upstream URLs
pub(crate) fn serve_network_policy_crds(api: &FakeClusterApi) {
    api.serve_url(
        NETWORK_POLICY_API_CRD_URLS[0],
        &crd_yaml("AdminNetworkPolicy", "policy.networking.k8s.io"),
    );
    api.serve_url(
        NETWORK_POLICY_API_CRD_URLS[1],
        &crd_yaml("BaselineAdminNetworkPolicy", "policy.networking.k8s.io"),
    );
}

/// Populate `source` with the files an OVN-Kubernetes checkout provides.
///
/// `ovn-setup.yaml` instantiates CRD kinds so applying it before the CRDs
/// and a discovery refresh fails against [`FakeClusterApi`].
pub(crate) fn write_ovn_source(exec: &FakeExecutor, source: &Path) {
    exec.add_file(source.join("dist/images/daemonset.sh"), "#!/bin/bash\n");
    exec.add_file(
        source.join("dist/images/Dockerfile.fedora"),
        "FROM fedora:41\nARG OVN_FROM=koji\n",
    );

    let yaml = source.join("dist/yaml");
    for (file, kind) in OVN_CRD_MANIFESTS.iter().zip(OVN_CRD_KINDS) {
        exec.add_file(yaml.join(file), crd_yaml(kind, "k8s.ovn.org"));
    }

    let setup = [
        object_yaml("v1", "Namespace", "ovn-kubernetes"),
        object_yaml("k8s.ovn.org/v1", "UserDefinedNetwork", "default"),
        object_yaml(
            "policy.networking.k8s.io/v1alpha1",
            "BaselineAdminNetworkPolicy",
            "default",
        ),
    ]
    .join("---\n");
    exec.add_file(yaml.join(OVN_SETUP_MANIFESTS[0]), setup);
    for file in &OVN_SETUP_MANIFESTS[1..] {
        let name = file.trim_start_matches("rbac-").trim_end_matches(".yaml");
        let content = [
            object_yaml("v1", "ServiceAccount", name),
            object_yaml("rbac.authorization.k8s.io/v1", "ClusterRole", name),
        ]
        .join("---\n");
        exec.add_file(yaml.join(file), content);
    }

    for (file, kind) in [
        ("ovnkube-identity.yaml", "Deployment"),
        (OVS_NODE_MANIFEST, "DaemonSet"),
        ("ovnkube-db.yaml", "Deployment"),
        ("ovnkube-master.yaml", "Deployment"),
        ("ovnkube-node.yaml", "DaemonSet"),
    ] {
        let name = file.trim_end_matches(".yaml");
        exec.add_file(yaml.join(file), object_yaml("apps/v1", kind, name));
    }
}

pub(crate) fn node(name: &str, control_plane: bool) -> NodeInfo {
    let mut labels = BTreeMap::new();
    labels.insert("kubernetes.io/hostname".to_string(), name.to_string());
    if control_plane {
        labels.insert(
            "node-role.kubernetes.io/control-plane".to_string(),
            String::new(),
        );
    }
    NodeInfo {
        name: name.to_string(),
        labels,
    }
}
