//! Seams between the controller and whatever hosts its environments.

use crate::config::MemoryLimit;
use crate::error::Result;
use crate::protocol::ExecResponse;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Opaque reference to a provisioned environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentHandle {
    pub id: String,
    pub name: String,
    /// Agent base URL (remote) or workspace directory (local).
    pub endpoint: String,
}

/// Everything needed to create an environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub name: String,
    pub image: String,
    pub memory: MemoryLimit,
    pub cpus: f64,
    pub network_isolated: bool,
    pub labels: BTreeMap<String, String>,
    pub workspace_root: PathBuf,
    pub command_timeout: Duration,
    pub package_manager: String,
}

/// Environment lifecycle on the orchestration platform.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle>;

    /// Live environment with this name, if any.
    async fn get_by_name(&self, name: &str) -> Result<Option<EnvironmentHandle>>;

    /// Terminate and reclaim. Stopping something already gone succeeds.
    async fn stop(&self, handle: &EnvironmentHandle) -> Result<()>;
}

/// Request/response channel to the agent inside an environment.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn health(&self, handle: &EnvironmentHandle) -> Result<bool>;

    async fn execute(&self, handle: &EnvironmentHandle, command: &str) -> Result<ExecResponse>;

    async fn write_file(&self, handle: &EnvironmentHandle, path: &str, content: &str)
        -> Result<()>;

    async fn read_file(&self, handle: &EnvironmentHandle, path: &str) -> Result<String>;

    async fn install_package(&self, handle: &EnvironmentHandle, name: &str)
        -> Result<ExecResponse>;

    async fn shutdown(&self, handle: &EnvironmentHandle) -> Result<()>;
}
