//! Host command execution
//!
//! Everything the installer does on the host (git, the container engine,
//! `daemonset.sh`, file access) goes through [`CommandExecutor`] so the
//! installer logic can run against a fake in tests.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Number of trailing output lines kept for error reports from streamed commands
const OUTPUT_TAIL_LINES: usize = 200;

const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Build an output with only stdout set
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Stdout followed by stderr, for error reports
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// CPU architecture of a host, as reported by `uname -m`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Architecture {
    /// x86_64
    X86_64,
    /// aarch64
    Aarch64,
    /// Anything else, kept verbatim
    Other(String),
}

impl Architecture {
    /// Parse the machine name printed by `uname -m`
    pub fn from_machine(machine: &str) -> Self {
        match machine.trim() {
            "x86_64" | "amd64" => Self::X86_64,
            "aarch64" | "arm64" => Self::Aarch64,
            other => Self::Other(other.to_string()),
        }
    }

    /// Architecture name in Go/OCI platform terms (`amd64`, `arm64`)
    pub fn go_arch(&self) -> &str {
        match self {
            Self::X86_64 => "amd64",
            Self::Aarch64 => "arm64",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => f.write_str("x86_64"),
            Self::Aarch64 => f.write_str("aarch64"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// Distribution and architecture of a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    /// `ID` from os-release (e.g. `fedora`), empty when unknown
    pub distro_id: String,
    /// `VERSION_ID` from os-release
    pub version_id: String,
    /// `ID_LIKE` from os-release, split on whitespace
    pub id_like: Vec<String>,
    /// CPU architecture
    pub architecture: Architecture,
}

/// Fields of an os-release file relevant to host detection
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OsRelease {
    /// `ID`
    pub id: String,
    /// `VERSION_ID`
    pub version_id: String,
    /// `ID_LIKE`
    pub id_like: Vec<String>,
}

/// Parse the `KEY=value` lines of an os-release file
pub fn parse_os_release(content: &str) -> OsRelease {
    let mut release = OsRelease::default();
    for line in content.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        match key {
            "ID" => release.id = value.to_string(),
            "VERSION_ID" => release.version_id = value.to_string(),
            "ID_LIKE" => {
                release.id_like = value.split_whitespace().map(str::to_string).collect();
            }
            _ => {}
        }
    }
    release
}

/// Caller-owned cache for host detection results.
///
/// Detection runs at most once per cache. The cache is passed to executors
/// explicitly instead of living in a global.
#[derive(Debug, Default)]
pub struct HostInfoCache {
    cell: OnceCell<HostInfo>,
}

impl HostInfoCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached host info, running `detect` on first use
    pub async fn get_or_detect<F, Fut>(&self, detect: F) -> Result<&HostInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HostInfo>>,
    {
        self.cell.get_or_try_init(detect).await
    }

    /// Cached host info, if detection already ran
    pub fn get(&self) -> Option<&HostInfo> {
        self.cell.get()
    }
}

/// Runs commands and touches files on a host
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit status is an [`Error::Command`] carrying the output.
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Like [`execute`](Self::execute) but killed after `timeout`
    async fn execute_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Run a long command, streaming its output to the log
    async fn run_cmd(&self, program: &str, args: &[&str]) -> Result<()>;

    /// Run a long command in `dir`, streaming its output to the log
    async fn run_cmd_in_dir(&self, dir: &Path, program: &str, args: &[&str]) -> Result<()>;

    /// Whether a file or directory exists
    async fn file_exists(&self, path: &Path) -> bool;

    /// Read a whole file
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write a whole file, creating parent directories
    async fn write_file(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Remove a file or directory tree; missing paths are not an error
    async fn remove_all(&self, path: &Path) -> Result<()>;

    /// Distribution and architecture of the host
    async fn host_info(&self) -> Result<HostInfo>;

    /// CPU architecture of the host
    async fn architecture(&self) -> Result<Architecture> {
        Ok(self.host_info().await?.architecture)
    }

    /// Human-readable name of the host for logs
    fn describe(&self) -> String;
}

/// Format a command line for logs and errors
pub fn format_command(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Executes commands on the local machine with `tokio::process`
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    host_cache: Arc<HostInfoCache>,
}

impl LocalExecutor {
    /// Create an executor sharing the given host detection cache
    pub fn new(host_cache: Arc<HostInfoCache>) -> Self {
        Self { host_cache }
    }

    async fn output(&self, mut cmd: Command, command_line: String) -> Result<CommandOutput> {
        trace!(command = %command_line, "Executing");
        let output = cmd
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::command(&command_line, format!("failed to spawn: {}", e)))?;

        let captured = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.status.success() {
            return Err(Error::command_with_output(
                command_line,
                format!("exited with {}", output.status),
                captured.combined(),
            ));
        }
        Ok(captured)
    }

    async fn stream(&self, mut cmd: Command, command_line: String) -> Result<()> {
        debug!(command = %command_line, "Running");
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::command(&command_line, format!("failed to spawn: {}", e)))?;

        let (stdout_tail, stderr_tail) = tokio::join!(
            pump_lines(child.stdout.take(), "stdout"),
            pump_lines(child.stderr.take(), "stderr"),
        );

        let status = child
            .wait()
            .await
            .map_err(|e| Error::io(command_line.clone(), e))?;

        if status.success() {
            return Ok(());
        }

        let mut output = stdout_tail;
        output.extend(stderr_tail);
        Err(Error::command_with_output(
            command_line,
            format!("exited with {}", status),
            output.join("\n"),
        ))
    }
}

/// Log each line of a child stream, keeping the last lines for error reports
async fn pump_lines<R>(reader: Option<R>, stream: &'static str) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    // Drain to EOF; closing the pipe early would kill the child with SIGPIPE
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(stream, error = %e, "Stopped reading command output");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        debug!(stream, "{}", line);
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail)
}

async fn detect_local_host() -> Result<HostInfo> {
    let release = match tokio::fs::read_to_string(OS_RELEASE_PATH).await {
        Ok(content) => parse_os_release(&content),
        Err(e) => {
            debug!(error = %e, "No os-release file, distribution unknown");
            OsRelease::default()
        }
    };

    let machine = match Command::new("uname").arg("-m").output().await {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
        _ => std::env::consts::ARCH.to_string(),
    };

    Ok(HostInfo {
        distro_id: release.id,
        version_id: release.version_id,
        id_like: release.id_like,
        architecture: Architecture::from_machine(&machine),
    })
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        self.output(cmd, format_command(program, args)).await
    }

    async fn execute_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let command_line = format_command(program, args);
        match tokio::time::timeout(timeout, self.execute(program, args)).await {
            Ok(result) => result,
            Err(_) => Err(Error::command(
                command_line,
                format!("timed out after {}s", timeout.as_secs()),
            )),
        }
    }

    async fn run_cmd(&self, program: &str, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        self.stream(cmd, format_command(program, args)).await
    }

    async fn run_cmd_in_dir(&self, dir: &Path, program: &str, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(dir);
        let command_line = format!("(cd {}) {}", dir.display(), format_command(program, args));
        self.stream(cmd, command_line).await
    }

    async fn file_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| Error::io(path.display().to_string(), e))
    }

    async fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent.display().to_string(), e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| Error::io(path.display().to_string(), e))
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(path.display().to_string(), e)),
        };
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        result.map_err(|e| Error::io(path.display().to_string(), e))
    }

    async fn host_info(&self) -> Result<HostInfo> {
        self.host_cache
            .get_or_detect(detect_local_host)
            .await
            .cloned()
    }

    fn describe(&self) -> String {
        "localhost".to_string()
    }
}
