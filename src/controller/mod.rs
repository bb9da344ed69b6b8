//! The sandbox controller: validates every request, owns the session to
//! environment mapping, and relays operations to the agent of each session.
//!
//! Every public operation returns an [`OperationResult`]. Validation (session
//! id, allowlist, package name, path confinement, envelope parameters) always
//! runs before any environment is contacted or provisioned.

pub mod backend;
pub mod client;
pub mod docker;
pub mod local;
pub mod server;

pub use backend::{AgentChannel, EnvironmentHandle, EnvironmentSpec, Provisioner};
pub use client::HttpAgentClient;
pub use docker::DockerProvisioner;
pub use local::LocalBackend;

use crate::config::{BackendKind, Config};
use crate::error::{ErrorKind, Result, SandboxError};
use crate::policy::{self, validate_package_name, validate_session_id};
use crate::protocol::{
    Action, ActionRequest, CommandOutput, ExecResponse, Failure, OperationRequest,
    OperationResult, Payload,
};
use crate::state::{SessionInfo, SessionSlot, Sessions};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Controller {
    config: Config,
    provisioner: Arc<dyn Provisioner>,
    channel: Arc<dyn AgentChannel>,
    sessions: Sessions,
}

impl Controller {
    pub fn new(
        config: Config,
        provisioner: Arc<dyn Provisioner>,
        channel: Arc<dyn AgentChannel>,
    ) -> Self {
        Self {
            config,
            provisioner,
            channel,
            sessions: Sessions::new(),
        }
    }

    /// Controller wired to the backend named in `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        match config.backend {
            BackendKind::Local => {
                let backend = Arc::new(LocalBackend::new(config.local_root.clone()).with_adopted_settings(
                    config.limits.command_timeout,
                    config.package_manager.clone(),
                    Some(config.limits.memory.bytes()),
                ));
                info!(root = %config.local_root.display(), "Using local backend");
                Ok(Self::new(config, backend.clone(), backend))
            }
            BackendKind::Remote => {
                let provisioner = Arc::new(DockerProvisioner::new(config.agent_port, config.host_port));
                let channel = Arc::new(HttpAgentClient::new(config.limits.command_timeout)?);
                info!(image = %config.image, "Using remote backend");
                Ok(Self::new(config, provisioner, channel))
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Provision the session's environment, or report the live one.
    pub async fn start(&self, session: &str) -> OperationResult {
        let result = self.start_session(session).await.map(OperationResult::Success);
        self.finish("start", session, result)
    }

    /// Tear the session's environment down. A session without one is a no-op.
    pub async fn stop(&self, session: &str) -> OperationResult {
        let result = self.stop_session(session).await.map(OperationResult::Success);
        self.finish("stop", session, result)
    }

    async fn start_session(&self, session: &str) -> Result<Payload> {
        validate_session_id(session)?;
        let cell = self.sessions.entry(session).await;
        let mut slot = cell.lock().await;

        if let Some(handle) = slot.environment.clone() {
            slot.touch();
            let ready = self.channel.health(&handle).await.unwrap_or(false);
            return Ok(Payload::Started {
                environment_id: handle.id,
                ready,
                message: "Environment already running".into(),
            });
        }

        let outcome = self.attach(session, &mut slot, true).await;
        drop(slot);
        let (handle, ready) = match outcome {
            Ok(Some(attached)) => attached,
            Ok(None) => {
                self.sessions.remove_if_idle(session).await;
                return Err(SandboxError::EnvironmentFault(format!(
                    "no environment was provisioned for session '{session}'"
                )));
            }
            Err(e) => {
                self.sessions.remove_if_idle(session).await;
                return Err(e);
            }
        };

        let message = if ready {
            "Environment started".to_string()
        } else {
            "Environment started but the agent is not answering yet".to_string()
        };
        Ok(Payload::Started {
            environment_id: handle.id,
            ready,
            message,
        })
    }

    async fn stop_session(&self, session: &str) -> Result<Payload> {
        validate_session_id(session)?;
        let cell = self.sessions.entry(session).await;
        let mut slot = cell.lock().await;

        let handle = match slot.environment.clone() {
            Some(handle) => Some(handle),
            None => match self.provisioner.get_by_name(&environment_name(session)).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(session, error = %e, "Environment lookup failed; nothing to stop");
                    None
                }
            },
        };
        let Some(handle) = handle else {
            drop(slot);
            self.sessions.remove_if_idle(session).await;
            return Ok(Payload::Stopped {
                message: "No environment is running".into(),
            });
        };

        if let Err(e) = self.channel.shutdown(&handle).await {
            debug!(session, error = %e, "Agent did not acknowledge shutdown");
        }
        self.provisioner.stop(&handle).await.map_err(into_fault)?;
        slot.environment = None;
        drop(slot);
        self.sessions.remove_if_idle(session).await;

        info!(session, environment = %handle.id, "Environment stopped");
        Ok(Payload::Stopped {
            message: "Environment stopped".into(),
        })
    }

    /// Fill an empty slot: adopt a live environment of the same name, or
    /// provision one when `create` is set. Returns the handle and readiness.
    async fn attach(
        &self,
        session: &str,
        slot: &mut SessionSlot,
        create: bool,
    ) -> Result<Option<(EnvironmentHandle, bool)>> {
        let name = environment_name(session);
        let (handle, ready) = match self.provisioner.get_by_name(&name).await? {
            Some(handle) => {
                info!(session, environment = %handle.id, "Adopting running environment");
                let ready = self.wait_ready(&handle).await;
                (handle, ready)
            }
            None if create => {
                let spec = self.environment_spec(session);
                let handle = self.provisioner.create(&spec).await.map_err(into_fault)?;
                info!(session, environment = %handle.id, "Environment provisioned");
                let ready = self.wait_ready(&handle).await;
                (handle, ready)
            }
            None => return Ok(None),
        };
        slot.environment = Some(handle.clone());
        slot.touch();
        Ok(Some((handle, ready)))
    }

    /// Poll agent health on the startup schedule. `false` once the budget runs out.
    async fn wait_ready(&self, handle: &EnvironmentHandle) -> bool {
        let startup = &self.config.startup;
        for attempt in 0..startup.attempts {
            match self.channel.health(handle).await {
                Ok(true) => return true,
                Ok(false) => debug!(environment = %handle.id, attempt, "Agent not ready"),
                Err(e) => debug!(environment = %handle.id, attempt, error = %e, "Agent unreachable"),
            }
            if attempt + 1 < startup.attempts {
                tokio::time::sleep(startup.delay(attempt)).await;
            }
        }
        warn!(environment = %handle.id, attempts = startup.attempts, "Agent never became ready");
        false
    }

    fn environment_spec(&self, session: &str) -> EnvironmentSpec {
        let mut labels = BTreeMap::new();
        labels.insert("managed-by".to_string(), "coolify".to_string());
        labels.insert("llm-vm".to_string(), "true".to_string());
        labels.insert("warden.session".to_string(), session.to_string());
        if let Some(project) = &self.config.coolify_project_id {
            labels.insert("coolify.project".to_string(), project.clone());
        }
        EnvironmentSpec {
            name: environment_name(session),
            image: self.config.image.clone(),
            memory: self.config.limits.memory.clone(),
            cpus: self.config.limits.cpus,
            network_isolated: self.config.network_isolated,
            labels,
            workspace_root: self.config.workspace_root.clone(),
            command_timeout: self.config.limits.command_timeout,
            package_manager: self.config.package_manager.clone(),
        }
    }

    /// Handle of the session's environment, provisioning it on first use
    /// when `auto_start` is on.
    async fn environment(&self, session: &str) -> Result<EnvironmentHandle> {
        let cell = self.sessions.entry(session).await;
        let mut slot = cell.lock().await;
        if let Some(handle) = &slot.environment {
            let handle = handle.clone();
            slot.touch();
            return Ok(handle);
        }

        let outcome = self.attach(session, &mut slot, self.config.auto_start).await;
        drop(slot);
        match outcome {
            Ok(Some((handle, _))) => Ok(handle),
            Ok(None) => {
                self.sessions.remove_if_idle(session).await;
                Err(SandboxError::NotRunning(session.to_string()))
            }
            Err(e) => {
                self.sessions.remove_if_idle(session).await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    pub async fn execute(&self, session: &str, command: &str) -> OperationResult {
        self.perform(
            session,
            OperationRequest::Execute {
                command: command.to_string(),
            },
        )
        .await
    }

    pub async fn write_file(&self, session: &str, path: &str, content: &str) -> OperationResult {
        self.perform(
            session,
            OperationRequest::WriteFile {
                path: path.to_string(),
                content: content.to_string(),
            },
        )
        .await
    }

    pub async fn read_file(&self, session: &str, path: &str) -> OperationResult {
        self.perform(
            session,
            OperationRequest::ReadFile {
                path: path.to_string(),
            },
        )
        .await
    }

    pub async fn install_package(&self, session: &str, name: &str) -> OperationResult {
        self.perform(
            session,
            OperationRequest::InstallPackage {
                name: name.to_string(),
            },
        )
        .await
    }

    /// Relay one operation to the session's environment.
    pub async fn perform(&self, session: &str, op: OperationRequest) -> OperationResult {
        let label = match &op {
            OperationRequest::Execute { .. } => "execute",
            OperationRequest::WriteFile { .. } => "write_file",
            OperationRequest::ReadFile { .. } => "read_file",
            OperationRequest::InstallPackage { .. } => "install",
        };
        let result = self.relay(session, op).await;
        self.finish(label, session, result)
    }

    async fn relay(&self, session: &str, op: OperationRequest) -> Result<OperationResult> {
        validate_session_id(session)?;
        match op {
            OperationRequest::Execute { command } => {
                self.config.policy.check(&command)?;
                let handle = self.environment(session).await?;
                info!(session, command = %command, "Relaying command");
                let out = self.channel.execute(&handle, &command).await?;
                Ok(command_result(out, Payload::Executed))
            }
            OperationRequest::WriteFile { path, content } => {
                let (relative, logical) = self.confine(&path)?;
                let handle = self.environment(session).await?;
                self.channel.write_file(&handle, &relative, &content).await?;
                Ok(OperationResult::Success(Payload::FileWritten {
                    path: logical.clone(),
                    message: format!("File written successfully to {logical}"),
                }))
            }
            OperationRequest::ReadFile { path } => {
                let (relative, logical) = self.confine(&path)?;
                let handle = self.environment(session).await?;
                let content = self.channel.read_file(&handle, &relative).await?;
                Ok(OperationResult::Success(Payload::FileRead {
                    path: logical,
                    content,
                }))
            }
            OperationRequest::InstallPackage { name } => {
                validate_package_name(&name)?;
                let handle = self.environment(session).await?;
                info!(session, package = %name, "Installing package");
                let out = self.channel.install_package(&handle, &name).await?;
                Ok(command_result(out, |output| Payload::Installed {
                    package: name.clone(),
                    output,
                }))
            }
        }
    }

    /// Workspace-relative path to forward, and the logical path to report.
    fn confine(&self, raw: &str) -> Result<(String, String)> {
        let root = &self.config.workspace_root;
        let relative = policy::confine(root, raw)?;
        if relative.as_os_str().is_empty() {
            return Err(SandboxError::PathConfinement(
                "path must name a file inside the workspace".into(),
            ));
        }
        let logical: PathBuf = root.join(&relative);
        Ok((
            relative.to_string_lossy().into_owned(),
            logical.to_string_lossy().into_owned(),
        ))
    }

    // ------------------------------------------------------------------------
    // Envelopes
    // ------------------------------------------------------------------------

    /// Dispatch a caller envelope. The session defaults to the configured one.
    pub async fn handle(&self, request: ActionRequest) -> OperationResult {
        let session = request
            .session()
            .unwrap_or(&self.config.default_session)
            .to_string();
        let action = match request.parse() {
            Ok(action) => action,
            Err(e) => {
                return self.finish(
                    request.action.as_deref().unwrap_or("unknown"),
                    &session,
                    Err(e),
                )
            }
        };
        match action {
            Action::Start => self.start(&session).await,
            Action::Stop => self.stop(&session).await,
            Action::Operation(op) => self.perform(&session, op).await,
        }
    }

    /// Decode a JSON envelope and dispatch it.
    pub async fn handle_json(&self, body: &[u8]) -> OperationResult {
        match serde_json::from_slice::<ActionRequest>(body) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(error = %e, "Malformed action envelope");
                SandboxError::InvalidRequest(format!("Invalid request body: {e}")).into()
            }
        }
    }

    // ------------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------------

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list().await
    }

    /// Stop every environment idle for longer than `ttl`. Returns the stopped session ids.
    pub async fn reap_idle(&self, ttl: Duration) -> Vec<String> {
        let mut reaped = Vec::new();
        for id in self.sessions.ids().await {
            let Some(cell) = self.sessions.get(&id).await else {
                continue;
            };
            let expired = {
                let slot = cell.lock().await;
                slot.environment.is_some() && slot.idle_for() > ttl
            };
            if !expired {
                continue;
            }
            info!(session = %id, "Stopping idle session");
            if self.stop(&id).await.is_success() {
                reaped.push(id);
            }
        }
        reaped
    }

    /// Stop every known session concurrently.
    pub async fn shutdown_all(&self) -> Vec<(String, OperationResult)> {
        let ids = self.sessions.ids().await;
        info!(sessions = ids.len(), "Stopping all sessions");
        let results =
            futures_util::future::join_all(ids.iter().map(|id| self.stop(id))).await;
        ids.into_iter().zip(results).collect()
    }

    fn finish(
        &self,
        operation: &str,
        session: &str,
        result: Result<OperationResult>,
    ) -> OperationResult {
        let result = result.unwrap_or_else(OperationResult::from);
        if let OperationResult::Error(failure) = &result {
            warn!(
                session,
                operation,
                kind = %failure.error_kind,
                message = %failure.message,
                "Operation failed"
            );
        }
        result
    }
}

pub fn environment_name(session: &str) -> String {
    format!("warden-{session}")
}

/// Exit code 0 is success; anything else is `CommandFailed` with the output attached.
fn command_result(out: ExecResponse, success: impl FnOnce(CommandOutput) -> Payload) -> OperationResult {
    let output = out.into_output();
    if output.exit_code == 0 {
        OperationResult::Success(success(output))
    } else {
        OperationResult::Error(Failure {
            error_kind: ErrorKind::CommandFailed,
            message: format!("Command exited with status {}", output.exit_code),
            output: Some(output),
        })
    }
}

fn into_fault(err: SandboxError) -> SandboxError {
    match err {
        SandboxError::EnvironmentFault(_) => err,
        other => SandboxError::EnvironmentFault(other.to_string()),
    }
}
