//! Content-addressed build cache for the OVN-Kubernetes image
//!
//! Every input that changes the image content (source revision including
//! uncommitted changes, target architecture, OVN origin, resolved OVN commit,
//! Dockerfile) feeds a cache key. The image is tagged with the key, so an
//! unchanged build is a lookup instead of a multi-minute rebuild.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use dpu_sim_common::digest::{sha256_hex_prefix, short_hash};
use dpu_sim_common::{CommandExecutor, Error, Result};

use crate::engine::{BuildOptions, ContainerEngine, EngineName};
use crate::source::SourceProvisioner;

/// Dockerfile used for the image, relative to the source tree
pub const DOCKERFILE: &str = "dist/images/Dockerfile.fedora";
/// Go toolchain image the Dockerfile compiles with
pub const GO_BUILDER_IMAGE: &str = "quay.io/projectquay/golang:1.24";
/// OVN repository used when building OVN from source
pub const OVN_REPO_URL: &str = "https://github.com/ovn-org/ovn.git";
/// Source revision recorded when git cannot report one
pub const UNKNOWN_REVISION: &str = "unknown";

const DIFF_HASH_LEN: usize = 12;
const GIT_TIMEOUT: Duration = Duration::from_secs(60);
const DOCKERIGNORE: &str = ".dockerignore";
const DOCKERIGNORE_CONTENT: &str = "\
# Written by dpu-sim for the duration of an image build.
# Keeps files Dockerfile.fedora does not need out of the build context
# so the COPY layer only changes when real build inputs change.
.git
.github
contrib
docs
test
helm
*.yml
*.txt
*.md
**/*_test.go
";

/// Where OVN and OVS come from inside the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvnOrigin {
    /// Prebuilt RPMs from Koji
    Prebuilt,
    /// Compiled from an OVN git ref
    FromSource,
}

impl OvnOrigin {
    /// Value of the `OVN_FROM` build argument
    pub fn build_arg(&self) -> &'static str {
        match self {
            Self::Prebuilt => "koji",
            Self::FromSource => "source",
        }
    }
}

/// Everything that determines the content of a built image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInputs {
    /// HEAD commit, with a `-dirty` suffix for uncommitted changes
    pub source_revision: String,
    /// Go architecture name (`amd64`, `arm64`)
    pub target_arch: String,
    /// OVN origin
    pub ovn_origin: OvnOrigin,
    /// OVN commit when building from source
    pub resolved_git_ref: Option<String>,
    /// Short hash of the Dockerfile content
    pub dockerfile_hash: String,
}

impl BuildInputs {
    /// Short hash of a Dockerfile
    pub fn hash_dockerfile(content: &[u8]) -> String {
        short_hash(content)
    }

    /// Cache key derived from all inputs
    pub fn cache_key(&self) -> CacheKey {
        let material = [
            self.source_revision.clone(),
            format!("arch={}", self.target_arch),
            format!("ovn_from={}", self.ovn_origin.build_arg()),
            format!(
                "ovn_gitref={}",
                self.resolved_git_ref.as_deref().unwrap_or_default()
            ),
            format!("dockerfile_sha={}", self.dockerfile_hash),
        ]
        .join("\n");
        CacheKey(short_hash(material.as_bytes()))
    }
}

/// 16 lowercase hex characters identifying a set of [`BuildInputs`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// The key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Image reference carrying the cache key.
///
/// The key is appended to an existing tag (`repo:tag-key`), or becomes the
/// tag when there is none (`repo:key`). A colon before the last slash is a
/// registry port, not a tag.
pub fn cached_image_name(image: &str, key: &CacheKey) -> String {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(offset) => {
            let colon = name_start + offset;
            format!("{}:{}-{}", &image[..colon], &image[colon + 1..], key)
        }
        None => format!("{}:{}", image, key),
    }
}

async fn git(exec: &dyn CommandExecutor, tree: &Path, args: &[&str]) -> Result<String> {
    let tree = tree.display().to_string();
    let mut full = vec!["-C", tree.as_str()];
    full.extend_from_slice(args);
    exec.execute_with_timeout("git", &full, GIT_TIMEOUT)
        .await
        .map(|out| out.stdout)
}

/// Revision of the tree at `path` for cache keying.
///
/// A tree with modified tracked files gets `-dirty-<hash of the diff>` so
/// different local edits produce different keys; `-dirty` alone when the
/// diff cannot be produced.
pub async fn source_revision(exec: &dyn CommandExecutor, path: &Path) -> Result<String> {
    let head = git(exec, path, &["rev-parse", "HEAD"]).await?;
    let head = head.trim();
    if head.is_empty() {
        return Err(Error::command("git rev-parse HEAD", "empty HEAD"));
    }

    let status = match git(exec, path, &["status", "--porcelain", "--untracked-files=no"]).await {
        Ok(status) => status,
        Err(e) => {
            debug!(error = %e, "git status failed, treating tree as clean");
            return Ok(head.to_string());
        }
    };
    if status.trim().is_empty() {
        return Ok(head.to_string());
    }

    match git(exec, path, &["diff", "--no-ext-diff", "--binary", "--", "."]).await {
        Ok(diff) => Ok(format!(
            "{}-dirty-{}",
            head,
            sha256_hex_prefix(diff.as_bytes(), DIFF_HASH_LEN)
        )),
        Err(e) => {
            debug!(error = %e, "git diff failed, using plain dirty marker");
            Ok(format!("{}-dirty", head))
        }
    }
}

/// Commit of `git ls-remote` output, or `git_ref` itself when nothing matched
pub fn parse_ls_remote(output: &str, git_ref: &str) -> String {
    output
        .lines()
        .find_map(|line| line.split_whitespace().next())
        .unwrap_or(git_ref)
        .to_string()
}

/// Resolve a branch, tag or commit of `repo` to a commit hash
pub async fn resolve_git_ref(exec: &dyn CommandExecutor, repo: &str, git_ref: &str) -> Result<String> {
    let output = exec
        .execute_with_timeout("git", &["ls-remote", repo, git_ref], GIT_TIMEOUT)
        .await
        .map_err(|e| Error::git_ref_resolution(repo, git_ref, e.to_string()))?;
    let commit = parse_ls_remote(&output.stdout, git_ref);
    debug!(repo = %repo, git_ref = %git_ref, commit = %commit, "Resolved git ref");
    Ok(commit)
}

/// Persistent Go build cache directory for podman builds
pub fn default_go_build_cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir()
        .ok_or_else(|| Error::config("cannot determine user cache directory"))?;
    Ok(base.join("dpu-sim").join("ovn-go-build-cache"))
}

/// Result of [`ImageBuilder::build_or_reuse`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Image name that was requested
    pub image: String,
    /// Cache-keyed image name
    pub cached_image: String,
    /// Key derived from the build inputs
    pub cache_key: CacheKey,
    /// True when an existing image was reused
    pub reused: bool,
}

/// Builds the OVN-Kubernetes image unless an identical one already exists
pub struct ImageBuilder {
    exec: Arc<dyn CommandExecutor>,
    engine: Arc<dyn ContainerEngine>,
    source: SourceProvisioner,
    go_build_cache: Option<PathBuf>,
}

impl ImageBuilder {
    /// Builder using `engine` on the host behind `exec`
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        engine: Arc<dyn ContainerEngine>,
        source: SourceProvisioner,
    ) -> Self {
        Self {
            exec,
            engine,
            source,
            go_build_cache: None,
        }
    }

    /// Use `dir` instead of the user cache directory for podman Go caches
    pub fn with_go_build_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.go_build_cache = Some(dir.into());
        self
    }

    /// Make `requested_image` available locally, building only on a cache miss.
    ///
    /// With `ovn_git_ref` set, OVN is compiled from that ref of the OVN
    /// repository; otherwise prebuilt packages are used.
    pub async fn build_or_reuse(
        &self,
        requested_image: &str,
        ovn_git_ref: Option<&str>,
    ) -> Result<BuildOutcome> {
        let tree = self.source.ensure().await?;

        let dockerfile = tree.join(DOCKERFILE);
        if !self.exec.file_exists(&dockerfile).await {
            return Err(Error::BuildSpecMissing { path: dockerfile });
        }
        let dockerfile_content = self.exec.read_file(&dockerfile).await?;

        let arch = self.exec.architecture().await?;
        let arch = arch.go_arch().to_string();

        let (ovn_origin, resolved_git_ref) = match ovn_git_ref.filter(|r| !r.is_empty()) {
            Some(git_ref) => (
                OvnOrigin::FromSource,
                Some(resolve_git_ref(self.exec.as_ref(), OVN_REPO_URL, git_ref).await?),
            ),
            None => (OvnOrigin::Prebuilt, None),
        };

        let source_revision = match source_revision(self.exec.as_ref(), &tree).await {
            Ok(rev) => rev,
            Err(e) => {
                warn!(error = %e, "Could not determine source revision, cache key will not track source changes");
                UNKNOWN_REVISION.to_string()
            }
        };

        let inputs = BuildInputs {
            source_revision,
            target_arch: arch,
            ovn_origin,
            resolved_git_ref,
            dockerfile_hash: BuildInputs::hash_dockerfile(&dockerfile_content),
        };
        let cache_key = inputs.cache_key();
        let cached_image = cached_image_name(requested_image, &cache_key);

        if self.engine.image_exists(&cached_image).await {
            info!(image = %cached_image, "Using cached OVN-Kubernetes image");
            self.retag(&cached_image, requested_image).await?;
            return Ok(BuildOutcome {
                image: requested_image.to_string(),
                cached_image,
                cache_key,
                reused: true,
            });
        }

        let options = self.build_options(&tree, dockerfile, &cached_image, &inputs).await;
        info!(
            image = %requested_image,
            cache_key = %cache_key,
            ovn_from = inputs.ovn_origin.build_arg(),
            arch = %inputs.target_arch,
            "Building OVN-Kubernetes image"
        );

        let dockerignore = tree.join(DOCKERIGNORE);
        if let Err(e) = self
            .exec
            .write_file(&dockerignore, DOCKERIGNORE_CONTENT.as_bytes())
            .await
        {
            warn!(error = %e, "Could not write .dockerignore, build context will be larger");
        }
        let built = self.engine.build(&options).await;
        if let Err(e) = self.exec.remove_all(&dockerignore).await {
            debug!(error = %e, "Could not remove .dockerignore");
        }
        built.map_err(|e| {
            let output = e.output().unwrap_or_default().to_string();
            Error::build_failed(&cached_image, e.to_string(), output)
        })?;

        self.retag(&cached_image, requested_image).await?;
        info!(image = %requested_image, cached = %cached_image, "OVN-Kubernetes image built");
        Ok(BuildOutcome {
            image: requested_image.to_string(),
            cached_image,
            cache_key,
            reused: false,
        })
    }

    async fn retag(&self, cached_image: &str, requested_image: &str) -> Result<()> {
        if cached_image == requested_image {
            return Ok(());
        }
        self.engine.tag(cached_image, requested_image).await
    }

    async fn build_options(
        &self,
        tree: &Path,
        dockerfile: PathBuf,
        image: &str,
        inputs: &BuildInputs,
    ) -> BuildOptions {
        let arch = &inputs.target_arch;
        let platform = format!("linux/{}", arch);

        let mut build_args = BTreeMap::from([
            ("BUILDER_IMAGE".to_string(), GO_BUILDER_IMAGE.to_string()),
            ("OVN_FROM".to_string(), inputs.ovn_origin.build_arg().to_string()),
            ("OVN_KUBERNETES_DIR".to_string(), ".".to_string()),
            // podman does not derive these from --platform like BuildKit does
            ("BUILDPLATFORM".to_string(), platform.clone()),
            ("TARGETOS".to_string(), "linux".to_string()),
            ("TARGETARCH".to_string(), arch.clone()),
        ]);
        if let Some(commit) = &inputs.resolved_git_ref {
            build_args.insert("OVN_REPO".to_string(), OVN_REPO_URL.to_string());
            build_args.insert("OVN_GITREF".to_string(), commit.clone());
        }

        let mut extra_args = Vec::new();
        if self.engine.name() == EngineName::Podman {
            match self.prepare_go_build_cache().await {
                Ok(dir) => {
                    let dir = dir.display();
                    extra_args.extend([
                        "--volume".to_string(),
                        format!("{}:/root/.cache/go-build:Z", dir),
                        "--volume".to_string(),
                        format!("{}:/go/pkg/mod:Z", dir),
                    ]);
                }
                Err(e) => warn!(error = %e, "No Go build cache, build will be slower"),
            }
        }

        BuildOptions {
            context_dir: tree.to_path_buf(),
            dockerfile,
            image: image.to_string(),
            platform,
            build_args,
            extra_args,
        }
    }

    async fn prepare_go_build_cache(&self) -> Result<PathBuf> {
        let dir = match &self.go_build_cache {
            Some(dir) => dir.clone(),
            None => default_go_build_cache_dir()?,
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(dir.display().to_string(), e))?;
        Ok(dir)
    }
}
