//! Wire types: the agent HTTP protocol, the caller-facing action envelope,
//! and the tagged operation result.

use crate::error::{ErrorKind, SandboxError};
use serde::{Deserialize, Serialize};

// ============================================================================
// Agent protocol
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequest {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileQuery {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRequest {
    pub package: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentResponse {
    pub content: String,
}

/// Result of running a process inside the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    /// stdout followed by stderr.
    pub output: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResponse {
    pub fn new(stdout: String, stderr: String, exit_code: i32) -> Self {
        Self {
            output: format!("{stdout}{stderr}"),
            stdout,
            stderr,
            exit_code,
        }
    }

    pub fn into_output(self) -> CommandOutput {
        CommandOutput {
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Body of every non-2xx agent response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl From<&SandboxError> for ErrorBody {
    fn from(err: &SandboxError) -> Self {
        Self {
            detail: err.to_string(),
            error_kind: Some(err.kind()),
        }
    }
}

// ============================================================================
// Caller-facing action envelope
// ============================================================================

/// `{action, params, session?}` as sent by the tool-calling front end.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub params: ActionParams,
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionParams {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default, alias = "file_path")]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "package_name")]
    pub package: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
}

/// An operation relayed to the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    Execute { command: String },
    ReadFile { path: String },
    WriteFile { path: String, content: String },
    InstallPackage { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Operation(OperationRequest),
}

impl ActionRequest {
    /// Session named by the envelope, falling back to `params.session`.
    pub fn session(&self) -> Option<&str> {
        self.session
            .as_deref()
            .or(self.params.session.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Validate the envelope into an [`Action`] without touching any environment.
    pub fn parse(&self) -> Result<Action, SandboxError> {
        let action = self
            .action
            .as_deref()
            .ok_or_else(|| SandboxError::InvalidRequest("No action provided".into()))?;
        let params = &self.params;

        let op = match action {
            "start" | "start_vm" => return Ok(Action::Start),
            "stop" | "stop_vm" => return Ok(Action::Stop),
            "execute" | "execute_command" => OperationRequest::Execute {
                command: required(&params.command, "No command provided")?,
            },
            "write_file" => {
                let path = required(&params.path, "File path or content missing")?;
                let content = params.content.clone().ok_or_else(|| {
                    SandboxError::InvalidRequest("File path or content missing".into())
                })?;
                OperationRequest::WriteFile { path, content }
            }
            "read_file" => OperationRequest::ReadFile {
                path: required(&params.path, "File path missing")?,
            },
            "install" | "install_package" => OperationRequest::InstallPackage {
                name: required(&params.package, "Package name missing")?,
            },
            other => {
                return Err(SandboxError::InvalidRequest(format!(
                    "Unknown action: {other}"
                )))
            }
        };
        Ok(Action::Operation(op))
    }
}

fn required(value: &Option<String>, message: &str) -> Result<String, SandboxError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(SandboxError::InvalidRequest(message.to_string())),
    }
}

/// Canonical action names advertised to tool-calling front ends.
pub const ACTIONS: &[&str] = &["start", "stop", "execute", "write_file", "read_file", "install"];

/// JSON-schema tool description for function-calling front ends.
pub fn tool_specification() -> serde_json::Value {
    serde_json::json!({
        "name": "warden",
        "description": "Provides access to a sandboxed environment for executing commands and running code",
        "parameters": {
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ACTIONS,
                    "description": "Action to perform in the environment"
                },
                "command": {
                    "type": "string",
                    "description": "Command to execute (for 'execute' action)"
                },
                "file_path": {
                    "type": "string",
                    "description": "Path to file (for file operations)"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write (for 'write_file' action)"
                },
                "package": {
                    "type": "string",
                    "description": "Package name to install (for 'install' action)"
                },
                "session": {
                    "type": "string",
                    "description": "Session whose environment the action targets"
                }
            },
            "required": ["action"]
        }
    })
}

// ============================================================================
// Operation results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Started {
        environment_id: String,
        ready: bool,
        message: String,
    },
    Stopped {
        message: String,
    },
    Executed(CommandOutput),
    FileWritten {
        path: String,
        message: String,
    },
    FileRead {
        path: String,
        content: String,
    },
    Installed {
        package: String,
        #[serde(flatten)]
        output: CommandOutput,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub error_kind: ErrorKind,
    pub message: String,
    #[serde(flatten)]
    pub output: Option<CommandOutput>,
}

/// What every controller operation returns. Serializes with a `status` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationResult {
    Success(Payload),
    Error(Failure),
}

impl OperationResult {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        OperationResult::Error(Failure {
            error_kind: kind,
            message: message.into(),
            output: None,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            OperationResult::Error(failure) => Some(failure.error_kind),
            OperationResult::Success(_) => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            OperationResult::Error(failure) => Some(&failure.message),
            OperationResult::Success(Payload::Started { message, .. })
            | OperationResult::Success(Payload::Stopped { message })
            | OperationResult::Success(Payload::FileWritten { message, .. }) => Some(message),
            OperationResult::Success(_) => None,
        }
    }

    /// Captured command output, on either side of the result.
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            OperationResult::Success(Payload::Executed(output))
            | OperationResult::Success(Payload::Installed { output, .. }) => Some(output),
            OperationResult::Error(failure) => failure.output.as_ref(),
            OperationResult::Success(_) => None,
        }
    }
}

impl From<SandboxError> for OperationResult {
    fn from(err: SandboxError) -> Self {
        OperationResult::error(err.kind(), err.to_string())
    }
}
