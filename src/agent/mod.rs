//! The sandbox agent: runs inside an environment and executes operations the
//! controller has already validated. Its only policy is workspace confinement.

pub mod process;
pub mod server;

use crate::error::{Result, SandboxError};
use crate::policy::{self, split_command};
use crate::protocol::ExecResponse;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

pub use process::{ProcessSpec, MAX_OUTPUT_BYTES};

/// Agent lifecycle: `Starting -> Ready -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub workspace: PathBuf,
    pub timeout: Duration,
    pub package_manager: String,
    /// Address-space ceiling for spawned processes.
    pub memory_limit: Option<u64>,
    /// `PYTHONUSERBASE` for user-local package installs.
    pub user_base: Option<PathBuf>,
}

impl AgentSettings {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            timeout: Duration::from_secs(3600),
            package_manager: "pip".into(),
            memory_limit: None,
            user_base: None,
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: AgentState,
    in_flight: usize,
}

#[derive(Debug)]
pub struct Agent {
    settings: AgentSettings,
    lifecycle: Mutex<Lifecycle>,
}

/// Admission ticket for one operation; releases its slot on drop.
struct InFlight<'a> {
    agent: &'a Agent,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut lifecycle = self.agent.lifecycle();
        lifecycle.in_flight -= 1;
        if lifecycle.state == AgentState::Draining && lifecycle.in_flight == 0 {
            lifecycle.state = AgentState::Stopped;
            info!("Agent drained");
        }
    }
}

impl Agent {
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings,
            lifecycle: Mutex::new(Lifecycle {
                state: AgentState::Starting,
                in_flight: 0,
            }),
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn workspace(&self) -> &Path {
        &self.settings.workspace
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> AgentState {
        self.lifecycle().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == AgentState::Ready
    }

    /// Create the workspace root and start accepting operations.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.settings.workspace)
            .await
            .map_err(|e| SandboxError::EnvironmentFault(format!("cannot create workspace: {e}")))?;
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == AgentState::Starting {
            lifecycle.state = AgentState::Ready;
            info!(workspace = %self.settings.workspace.display(), "Agent ready");
        }
        Ok(())
    }

    /// Stop accepting new operations. In-flight ones finish; the process keeps running.
    pub fn shutdown(&self) -> AgentState {
        let mut lifecycle = self.lifecycle();
        lifecycle.state = match lifecycle.state {
            AgentState::Stopped => AgentState::Stopped,
            _ if lifecycle.in_flight == 0 => AgentState::Stopped,
            _ => AgentState::Draining,
        };
        info!(state = ?lifecycle.state, in_flight = lifecycle.in_flight, "Shutdown requested");
        lifecycle.state
    }

    fn admit(&self) -> Result<InFlight<'_>> {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            AgentState::Ready => {
                lifecycle.in_flight += 1;
                Ok(InFlight { agent: self })
            }
            AgentState::Starting => Err(SandboxError::ChannelUnreachable(
                "agent is still starting".into(),
            )),
            AgentState::Draining | AgentState::Stopped => Err(SandboxError::ShuttingDown),
        }
    }

    pub async fn execute(&self, command: &str) -> Result<ExecResponse> {
        let _ticket = self.admit()?;
        let argv = split_command(command)?;
        info!(command = %command, "Executing");
        process::run(ProcessSpec {
            argv: &argv,
            cwd: &self.settings.workspace,
            timeout: self.settings.timeout,
            env: Vec::new(),
            memory_limit: self.settings.memory_limit,
        })
        .await
    }

    /// Write `content`, creating parent directories. Returns the workspace-relative path.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<PathBuf> {
        let _ticket = self.admit()?;
        let relative = policy::confine(&self.settings.workspace, path)?;
        let full = self.contained(&relative).await?;

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| file_error("write", &relative, e))?;
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.custom_flags(libc::O_NOFOLLOW);

        let mut file = options
            .open(&full)
            .await
            .map_err(|e| file_error("write", &relative, e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| file_error("write", &relative, e))?;
        file.flush()
            .await
            .map_err(|e| file_error("write", &relative, e))?;

        info!(path = %relative.display(), bytes = content.len(), "File written");
        Ok(relative)
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let _ticket = self.admit()?;
        let relative = policy::confine(&self.settings.workspace, path)?;
        let full = self.contained(&relative).await?;

        let mut options = tokio::fs::OpenOptions::new();
        options.read(true);
        #[cfg(unix)]
        options.custom_flags(libc::O_NOFOLLOW);

        let mut bytes = Vec::new();
        let mut file = options
            .open(&full)
            .await
            .map_err(|e| file_error("read", &relative, e))?;
        file.read_to_end(&mut bytes)
            .await
            .map_err(|e| file_error("read", &relative, e))?;
        String::from_utf8(bytes).map_err(|_| {
            SandboxError::FileAccess(format!(
                "Failed to read file {}: content is not valid UTF-8",
                relative.display()
            ))
        })
    }

    /// Real location of `relative`. Symlinks are followed only while their
    /// target stays inside the canonical workspace.
    async fn contained(&self, relative: &Path) -> Result<PathBuf> {
        let root = tokio::fs::canonicalize(&self.settings.workspace)
            .await
            .map_err(|e| SandboxError::EnvironmentFault(format!("workspace unavailable: {e}")))?;
        let escape = || {
            SandboxError::PathConfinement(format!(
                "{} resolves outside the workspace",
                relative.display()
            ))
        };

        let mut resolved = root.clone();
        let mut components = relative.components();
        while let Some(component) = components.next() {
            let candidate = resolved.join(component);
            match tokio::fs::symlink_metadata(&candidate).await {
                Ok(meta) if meta.file_type().is_symlink() => {
                    let target = tokio::fs::canonicalize(&candidate)
                        .await
                        .map_err(|_| escape())?;
                    if !target.starts_with(&root) {
                        warn!(path = %relative.display(), "Symlink escapes workspace");
                        return Err(escape());
                    }
                    resolved = target;
                }
                Ok(_) => resolved = candidate,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    resolved = candidate;
                    resolved.extend(components);
                    break;
                }
                Err(e) => return Err(file_error("access", relative, e)),
            }
        }
        Ok(resolved)
    }

    /// Install a package into the user-local target, non-interactively.
    pub async fn install_package(&self, name: &str) -> Result<ExecResponse> {
        let _ticket = self.admit()?;
        let argv = vec![
            self.settings.package_manager.clone(),
            "install".into(),
            "--user".into(),
            "--no-cache-dir".into(),
            name.to_string(),
        ];
        let mut env = vec![
            ("PIP_NO_INPUT".to_string(), "1".to_string()),
            ("PIP_DISABLE_PIP_VERSION_CHECK".to_string(), "1".to_string()),
        ];
        if let Some(base) = &self.settings.user_base {
            env.push(("PYTHONUSERBASE".into(), base.display().to_string()));
        }

        info!(package = %name, manager = %self.settings.package_manager, "Installing package");
        let result = process::run(ProcessSpec {
            argv: &argv,
            cwd: &self.settings.workspace,
            timeout: self.settings.timeout,
            env,
            memory_limit: self.settings.memory_limit,
        })
        .await;
        if let Ok(out) = &result {
            if out.exit_code != 0 {
                warn!(package = %name, exit_code = out.exit_code, "Package install failed");
            }
        }
        result
    }
}

fn file_error(op: &str, relative: &Path, e: std::io::Error) -> SandboxError {
    #[cfg(unix)]
    {
        if e.raw_os_error() == Some(libc::ELOOP) {
            return SandboxError::PathConfinement(format!(
                "{} is a symbolic link",
                relative.display()
            ));
        }
    }
    let reason = match e.kind() {
        std::io::ErrorKind::NotFound => "no such file".to_string(),
        _ => e.to_string(),
    };
    SandboxError::FileAccess(format!(
        "Failed to {op} file {}: {reason}",
        relative.display()
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn ready_agent(dir: &Path) -> Agent {
        let agent = Agent::new(AgentSettings::new(dir.join("workspace")));
        agent.prepare().await.unwrap();
        agent
    }

    #[tokio::test]
    async fn starts_in_starting_state_and_rejects_work() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(AgentSettings::new(dir.path()));
        assert_eq!(agent.state(), AgentState::Starting);
        let err = agent.execute("echo hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelUnreachable);
    }

    #[tokio::test]
    async fn prepare_creates_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ready_agent(dir.path()).await;
        assert!(agent.workspace().is_dir());
        assert!(agent.is_ready());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ready_agent(dir.path()).await;
        for content in ["", "line one\nline two\n", "héllo wörld ✓ 日本語"] {
            agent.write_file("/nested/dir/file.txt", content).await.unwrap();
            assert_eq!(agent.read_file("nested/dir/file.txt").await.unwrap(), content);
        }
    }

    #[tokio::test]
    async fn traversal_stays_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ready_agent(dir.path()).await;
        let rel = agent.write_file("../../escape.txt", "x").await.unwrap();
        assert_eq!(rel, Path::new("escape.txt"));
        assert!(agent.workspace().join("escape.txt").is_file());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn symlinked_directory_cannot_leave_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "host data").unwrap();
        let agent = ready_agent(dir.path()).await;
        std::os::unix::fs::symlink(outside.path(), agent.workspace().join("escape")).unwrap();

        let err = agent.read_file("escape/secret.txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathConfinementViolation);

        let err = agent.write_file("escape/planted.txt", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathConfinementViolation);
        let err = agent.write_file("escape/new/deep.txt", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathConfinementViolation);
        assert!(!outside.path().join("planted.txt").exists());
        assert!(!outside.path().join("new").exists());
    }

    #[tokio::test]
    async fn symlinked_file_cannot_leave_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("passwd");
        std::fs::write(&target, "root:x:0:0").unwrap();
        let agent = ready_agent(dir.path()).await;
        std::os::unix::fs::symlink(&target, agent.workspace().join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("gone"), agent.workspace().join("dangling"))
            .unwrap();

        let err = agent.read_file("link").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathConfinementViolation);
        let err = agent.write_file("link", "overwritten").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathConfinementViolation);
        let err = agent.write_file("dangling", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathConfinementViolation);

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "root:x:0:0");
        assert!(!outside.path().join("gone").exists());
    }

    #[tokio::test]
    async fn symlink_inside_workspace_is_followed() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ready_agent(dir.path()).await;
        agent.write_file("real/a.txt", "inside").await.unwrap();
        std::os::unix::fs::symlink(agent.workspace().join("real"), agent.workspace().join("alias"))
            .unwrap();

        assert_eq!(agent.read_file("alias/a.txt").await.unwrap(), "inside");
        agent.write_file("alias/b.txt", "via alias").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(agent.workspace().join("real/b.txt")).unwrap(),
            "via alias"
        );
    }

    #[tokio::test]
    async fn missing_file_is_file_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ready_agent(dir.path()).await;
        let err = agent.read_file("nope.txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileAccess);
        assert!(!err.to_string().contains(&dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn execute_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ready_agent(dir.path()).await;
        agent.write_file("seen.txt", "1").await.unwrap();
        let out = agent.execute("ls").await.unwrap();
        assert!(out.stdout.contains("seen.txt"));
    }

    #[tokio::test]
    async fn shutdown_rejects_late_requests() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ready_agent(dir.path()).await;
        assert_eq!(agent.shutdown(), AgentState::Stopped);
        let err = agent.read_file("x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShuttingDown);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_operations() {
        let dir = tempfile::tempdir().unwrap();
        let agent = std::sync::Arc::new(ready_agent(dir.path()).await);

        let running = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.execute("sleep 0.5").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(agent.shutdown(), AgentState::Draining);
        assert_eq!(
            agent.execute("echo late").await.unwrap_err().kind(),
            ErrorKind::ShuttingDown
        );

        let out = running.await.unwrap().unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(agent.state(), AgentState::Stopped);
    }
}
