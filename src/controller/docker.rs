//! Docker container environments, driven through the `docker` CLI.
//!
//! Each environment is a detached container started from the agent image:
//! - Auto-removed when stopped (`--rm`)
//! - Memory and CPU caps (`--memory`, `--cpus`)
//! - Network isolation via an `--internal` bridge network; the agent is reached
//!   on the container's address on that network
//! - Without isolation, the agent port is published on the host loopback

use super::backend::{EnvironmentHandle, EnvironmentSpec, Provisioner};
use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const ISOLATED_NETWORK: &str = "warden-isolated";

#[derive(Debug, Clone)]
pub struct DockerProvisioner {
    binary: String,
    agent_port: u16,
    host_port: u16,
    network: String,
}

impl DockerProvisioner {
    pub fn new(agent_port: u16, host_port: u16) -> Self {
        Self {
            binary: "docker".into(),
            agent_port,
            host_port,
            network: ISOLATED_NETWORK.into(),
        }
    }

    /// Arguments for `docker run`, image last.
    pub fn run_args(&self, spec: &EnvironmentSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--rm".into(),
            "--name".into(),
            spec.name.clone(),
            format!("--memory={}", spec.memory),
            format!("--cpus={}", spec.cpus),
            "--workdir".into(),
            spec.workspace_root.display().to_string(),
        ];

        if spec.network_isolated {
            args.push(format!("--network={}", self.network));
        } else if self.host_port == 0 {
            args.push("--publish".into());
            args.push(format!("127.0.0.1::{}", self.agent_port));
        } else {
            args.push("--publish".into());
            args.push(format!("127.0.0.1:{}:{}", self.host_port, self.agent_port));
        }

        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }

        let env = [
            ("VM_PORT", self.agent_port.to_string()),
            ("COMMAND_TIMEOUT", spec.command_timeout.as_secs().max(1).to_string()),
            ("SANDBOX_WORKSPACE", spec.workspace_root.display().to_string()),
            ("SANDBOX_PACKAGE_MANAGER", spec.package_manager.clone()),
        ];
        for (key, value) in env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }

        args.push(spec.image.clone());
        args
    }

    async fn docker<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                SandboxError::EnvironmentFault(format!(
                    "failed to run docker (is Docker installed?): {e}"
                ))
            })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(SandboxError::EnvironmentFault(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn ensure_network(&self) -> Result<()> {
        if self.docker(["network", "inspect", self.network.as_str()]).await.is_ok() {
            return Ok(());
        }
        info!(network = %self.network, "Creating isolated network");
        match self
            .docker(["network", "create", "--internal", self.network.as_str()])
            .await
        {
            Ok(_) => Ok(()),
            // Lost a creation race with another controller.
            Err(SandboxError::EnvironmentFault(msg)) if msg.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Agent base URL for a running container.
    async fn endpoint(&self, name: &str) -> Result<String> {
        let networks = self
            .docker([
                "inspect",
                "--format",
                "{{range $net, $cfg := .NetworkSettings.Networks}}{{$net}}={{$cfg.IPAddress}} {{end}}",
                name,
            ])
            .await?;
        let isolated_ip = networks.split_whitespace().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(net, ip)| *net == self.network && !ip.is_empty())
                .map(|(_, ip)| ip.to_string())
        });
        if let Some(ip) = isolated_ip {
            return Ok(format!("http://{}:{}/api/v1", ip, self.agent_port));
        }

        let port_spec = format!("{}/tcp", self.agent_port);
        let published = self.docker(["port", name, port_spec.as_str()]).await?;
        let addr = published
            .lines()
            .find(|line| line.starts_with("127.0.0.1:") || line.starts_with("0.0.0.0:"))
            .ok_or_else(|| {
                SandboxError::EnvironmentFault(format!("agent port of {name} is not reachable"))
            })?;
        let port = addr.rsplit(':').next().unwrap_or_default();
        Ok(format!("http://127.0.0.1:{}/api/v1", port))
    }
}

fn is_missing(err: &SandboxError) -> bool {
    matches!(err, SandboxError::EnvironmentFault(msg)
        if msg.contains("No such container") || msg.contains("No such object"))
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        if spec.network_isolated {
            self.ensure_network().await?;
        }

        let args = self.run_args(spec);
        debug!(args = ?args, "Starting container");
        let id = self.docker(&args).await?;
        info!(name = %spec.name, id = %id, "Container started");

        match self.endpoint(&spec.name).await {
            Ok(endpoint) => Ok(EnvironmentHandle {
                id,
                name: spec.name.clone(),
                endpoint,
            }),
            Err(e) => {
                warn!(name = %spec.name, error = %e, "Cannot locate agent, removing container");
                let _ = self.docker(["rm", "--force", spec.name.as_str()]).await;
                Err(e)
            }
        }
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<EnvironmentHandle>> {
        let state = match self
            .docker(["inspect", "--format", "{{.Id}} {{.State.Running}}", name])
            .await
        {
            Ok(state) => state,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        match state.split_once(' ') {
            Some((id, "true")) => Ok(Some(EnvironmentHandle {
                id: id.to_string(),
                name: name.to_string(),
                endpoint: self.endpoint(name).await?,
            })),
            _ => Ok(None),
        }
    }

    async fn stop(&self, handle: &EnvironmentHandle) -> Result<()> {
        match self.docker(["rm", "--force", handle.name.as_str()]).await {
            Ok(_) => {
                info!(name = %handle.name, "Container removed");
                Ok(())
            }
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn spec(network_isolated: bool) -> EnvironmentSpec {
        let mut labels = BTreeMap::new();
        labels.insert("managed-by".to_string(), "coolify".to_string());
        labels.insert("warden.session".to_string(), "s1".to_string());
        EnvironmentSpec {
            name: "warden-s1".into(),
            image: "warden-agent:latest".into(),
            memory: "2048m".parse().unwrap(),
            cpus: 1.5,
            network_isolated,
            labels,
            workspace_root: PathBuf::from("/workspace"),
            command_timeout: Duration::from_secs(60),
            package_manager: "pip".into(),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn run_args_apply_limits_and_labels() {
        let args = DockerProvisioner::new(8080, 8081).run_args(&spec(true));
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"--memory=2048m".to_string()));
        assert!(args.contains(&"--cpus=1.5".to_string()));
        assert!(has_pair(&args, "--name", "warden-s1"));
        assert!(has_pair(&args, "--label", "managed-by=coolify"));
        assert!(has_pair(&args, "--label", "warden.session=s1"));
        assert!(has_pair(&args, "--env", "COMMAND_TIMEOUT=60"));
        assert_eq!(args.last().unwrap(), "warden-agent:latest");
    }

    #[test]
    fn isolated_environments_join_internal_network_without_publishing() {
        let args = DockerProvisioner::new(8080, 8081).run_args(&spec(true));
        assert!(args.contains(&format!("--network={ISOLATED_NETWORK}")));
        assert!(!args.contains(&"--publish".to_string()));
    }

    #[test]
    fn open_environments_publish_on_loopback() {
        let args = DockerProvisioner::new(8080, 8081).run_args(&spec(false));
        assert!(has_pair(&args, "--publish", "127.0.0.1:8081:8080"));

        let args = DockerProvisioner::new(8080, 0).run_args(&spec(false));
        assert!(has_pair(&args, "--publish", "127.0.0.1::8080"));
    }

    #[test]
    fn missing_container_errors_are_recognized() {
        assert!(is_missing(&SandboxError::EnvironmentFault(
            "Error: No such object: warden-x".into()
        )));
        assert!(!is_missing(&SandboxError::EnvironmentFault(
            "permission denied".into()
        )));
    }
}
