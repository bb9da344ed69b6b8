//! Local backend: each environment is a directory on this host and the agent
//! core runs in-process. Memory caps become `RLIMIT_AS` on spawned commands;
//! CPU shares and network isolation cannot be enforced here.

use super::backend::{AgentChannel, EnvironmentHandle, EnvironmentSpec, Provisioner};
use crate::agent::{Agent, AgentSettings};
use crate::error::{Result, SandboxError};
use crate::protocol::ExecResponse;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct LocalEnvironment {
    handle: EnvironmentHandle,
    agent: Arc<Agent>,
    dir: PathBuf,
}

/// Provisioner and channel in one: there is no network hop to bridge.
pub struct LocalBackend {
    root: PathBuf,
    environments: RwLock<HashMap<String, LocalEnvironment>>,
    /// Settings for environments found on disk rather than created here.
    adopted: AdoptedSettings,
}

struct AdoptedSettings {
    timeout: Duration,
    package_manager: String,
    memory_limit: Option<u64>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            environments: RwLock::new(HashMap::new()),
            adopted: AdoptedSettings {
                timeout: Duration::from_secs(3600),
                package_manager: "pip".into(),
                memory_limit: None,
            },
        }
    }

    /// Limits applied when an environment left by another process is adopted.
    pub fn with_adopted_settings(
        mut self,
        timeout: Duration,
        package_manager: impl Into<String>,
        memory_limit: Option<u64>,
    ) -> Self {
        self.adopted = AdoptedSettings {
            timeout,
            package_manager: package_manager.into(),
            memory_limit,
        };
        self
    }

    /// Prepare an agent over `root/name` and register it.
    async fn launch(
        &self,
        environments: &mut HashMap<String, LocalEnvironment>,
        name: &str,
        timeout: Duration,
        package_manager: String,
        memory_limit: Option<u64>,
    ) -> Result<EnvironmentHandle> {
        let dir = self.root.join(name);
        let workspace = dir.join("workspace");
        let agent = Arc::new(Agent::new(AgentSettings {
            workspace: workspace.clone(),
            timeout,
            package_manager,
            memory_limit,
            user_base: Some(dir.join(".local")),
        }));
        agent.prepare().await?;

        let handle = EnvironmentHandle {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            endpoint: workspace.display().to_string(),
        };
        environments.insert(
            name.to_string(),
            LocalEnvironment {
                handle: handle.clone(),
                agent,
                dir,
            },
        );
        Ok(handle)
    }

    async fn agent(&self, handle: &EnvironmentHandle) -> Result<Arc<Agent>> {
        self.environments
            .read()
            .await
            .get(&handle.name)
            .filter(|env| env.handle.id == handle.id)
            .map(|env| env.agent.clone())
            .ok_or_else(|| {
                SandboxError::ChannelUnreachable(format!("environment {} is not running", handle.id))
            })
    }
}

#[async_trait]
impl Provisioner for LocalBackend {
    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        let mut environments = self.environments.write().await;
        if environments.contains_key(&spec.name) {
            return Err(SandboxError::EnvironmentFault(format!(
                "environment {} already exists",
                spec.name
            )));
        }

        if spec.network_isolated {
            warn!(name = %spec.name, "Local backend cannot isolate the network");
        }

        let handle = self
            .launch(
                &mut environments,
                &spec.name,
                spec.command_timeout,
                spec.package_manager.clone(),
                Some(spec.memory.bytes()),
            )
            .await?;
        info!(name = %spec.name, id = %handle.id, root = %self.root.display(), "Local environment created");
        Ok(handle)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<EnvironmentHandle>> {
        if let Some(env) = self.environments.read().await.get(name) {
            return Ok(Some(env.handle.clone()));
        }

        // A workspace left behind by another process is still a live environment.
        let workspace = self.root.join(name).join("workspace");
        match tokio::fs::metadata(&workspace).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Ok(None),
        }

        let mut environments = self.environments.write().await;
        if let Some(env) = environments.get(name) {
            return Ok(Some(env.handle.clone()));
        }
        let handle = self
            .launch(
                &mut environments,
                name,
                self.adopted.timeout,
                self.adopted.package_manager.clone(),
                self.adopted.memory_limit,
            )
            .await?;
        info!(name = %name, id = %handle.id, "Local environment found on disk");
        Ok(Some(handle))
    }

    async fn stop(&self, handle: &EnvironmentHandle) -> Result<()> {
        let Some(env) = self.environments.write().await.remove(&handle.name) else {
            return Ok(());
        };
        env.agent.shutdown();
        match tokio::fs::remove_dir_all(&env.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SandboxError::EnvironmentFault(format!(
                    "failed to reclaim {}: {e}",
                    handle.name
                )))
            }
        }
        info!(name = %handle.name, "Local environment removed");
        Ok(())
    }
}

#[async_trait]
impl AgentChannel for LocalBackend {
    async fn health(&self, handle: &EnvironmentHandle) -> Result<bool> {
        Ok(self.agent(handle).await?.is_ready())
    }

    async fn execute(&self, handle: &EnvironmentHandle, command: &str) -> Result<ExecResponse> {
        self.agent(handle).await?.execute(command).await
    }

    async fn write_file(
        &self,
        handle: &EnvironmentHandle,
        path: &str,
        content: &str,
    ) -> Result<()> {
        self.agent(handle).await?.write_file(path, content).await?;
        Ok(())
    }

    async fn read_file(&self, handle: &EnvironmentHandle, path: &str) -> Result<String> {
        self.agent(handle).await?.read_file(path).await
    }

    async fn install_package(
        &self,
        handle: &EnvironmentHandle,
        name: &str,
    ) -> Result<ExecResponse> {
        self.agent(handle).await?.install_package(name).await
    }

    async fn shutdown(&self, handle: &EnvironmentHandle) -> Result<()> {
        self.agent(handle).await?.shutdown();
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> EnvironmentSpec {
        EnvironmentSpec {
            name: name.into(),
            image: "unused".into(),
            memory: "2048m".parse().unwrap(),
            cpus: 1.0,
            network_isolated: false,
            labels: BTreeMap::new(),
            workspace_root: PathBuf::from("/workspace"),
            command_timeout: Duration::from_secs(10),
            package_manager: "pip".into(),
        }
    }

    #[tokio::test]
    async fn create_find_stop() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path());

        let handle = backend.create(&spec("warden-a")).await.unwrap();
        assert!(root.path().join("warden-a/workspace").is_dir());
        assert!(backend.health(&handle).await.unwrap());
        assert_eq!(backend.get_by_name("warden-a").await.unwrap(), Some(handle.clone()));

        backend.stop(&handle).await.unwrap();
        assert!(!root.path().join("warden-a").exists());
        assert_eq!(backend.get_by_name("warden-a").await.unwrap(), None);
        backend.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_names_are_refused() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path());
        backend.create(&spec("warden-a")).await.unwrap();
        assert!(backend.create(&spec("warden-a")).await.is_err());
    }

    #[tokio::test]
    async fn stale_handle_is_unreachable() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path());
        let handle = backend.create(&spec("warden-a")).await.unwrap();
        backend.stop(&handle).await.unwrap();
        let err = backend.execute(&handle, "ls").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ChannelUnreachable);
    }

    #[tokio::test]
    async fn workspace_on_disk_is_adopted() {
        let root = tempfile::tempdir().unwrap();
        let first = LocalBackend::new(root.path());
        let handle = first.create(&spec("warden-a")).await.unwrap();
        first.write_file(&handle, "kept.txt", "from first").await.unwrap();

        let second = LocalBackend::new(root.path())
            .with_adopted_settings(Duration::from_secs(5), "pip", Some(1 << 30));
        let adopted = second.get_by_name("warden-a").await.unwrap().unwrap();
        assert_eq!(second.get_by_name("warden-a").await.unwrap(), Some(adopted.clone()));
        assert_eq!(second.read_file(&adopted, "kept.txt").await.unwrap(), "from first");

        second.stop(&adopted).await.unwrap();
        assert!(!root.path().join("warden-a").exists());
        assert_eq!(second.get_by_name("warden-b").await.unwrap(), None);
    }
}
