//! Process configuration, read once from flags and environment variables.

use crate::policy::{CommandPolicy, DEFAULT_ALLOWED_COMMANDS};
use clap::{Args, ValueEnum};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which execution backend the controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Per-session workspace directory on this host, commands run as local processes.
    Local,
    /// Docker container running `warden agent`, reached over HTTP.
    Remote,
}

/// Memory ceiling in Docker notation (`512m`, `2g`, `1048576`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLimit {
    raw: String,
    bytes: u64,
}

impl MemoryLimit {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl FromStr for MemoryLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        let (digits, multiplier) = match raw.chars().last() {
            Some('b') => (&raw[..raw.len() - 1], 1),
            Some('k') => (&raw[..raw.len() - 1], 1 << 10),
            Some('m') => (&raw[..raw.len() - 1], 1 << 20),
            Some('g') => (&raw[..raw.len() - 1], 1 << 30),
            _ => (raw.as_str(), 1),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid memory limit '{s}'"))?;
        let bytes = value
            .checked_mul(multiplier)
            .filter(|b| *b > 0)
            .ok_or_else(|| format!("invalid memory limit '{s}'"))?;
        Ok(Self { raw, bytes })
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Caps applied to every environment at creation.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory: MemoryLimit,
    /// Fraction of CPUs, 1.0 = one core.
    pub cpus: f64,
    /// Wall-clock limit per command.
    pub command_timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: MemoryLimit {
                raw: "2048m".into(),
                bytes: 2048 << 20,
            },
            cpus: 1.0,
            command_timeout: Duration::from_secs(3600),
        }
    }
}

/// Health poll schedule after provisioning.
#[derive(Debug, Clone)]
pub struct StartupPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl StartupPolicy {
    /// Delay before retry number `attempt` (0-based), doubling up to `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Everything the controller needs, passed into `Controller::new`.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    /// Agent image for the remote backend.
    pub image: String,
    pub limits: ResourceLimits,
    pub policy: CommandPolicy,
    /// Logical workspace root inside every environment.
    pub workspace_root: PathBuf,
    pub agent_port: u16,
    /// Host port the agent is published on; 0 picks an ephemeral port.
    pub host_port: u16,
    pub network_isolated: bool,
    pub default_session: String,
    /// Provision on first use instead of answering `NotRunning`.
    pub auto_start: bool,
    pub coolify_project_id: Option<String>,
    pub startup: StartupPolicy,
    /// Where the local backend creates session directories.
    pub local_root: PathBuf,
    pub package_manager: String,
    pub idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Remote,
            image: "warden-agent:latest".into(),
            limits: ResourceLimits::default(),
            policy: CommandPolicy::default(),
            workspace_root: PathBuf::from("/workspace"),
            agent_port: 8080,
            host_port: 8081,
            network_isolated: true,
            default_session: "default".into(),
            auto_start: true,
            coolify_project_id: None,
            startup: StartupPolicy::default(),
            local_root: std::env::temp_dir().join("warden"),
            package_manager: "pip".into(),
            idle_timeout: None,
        }
    }
}

/// Controller settings as flags, each with an environment variable fallback.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Execution backend
    #[arg(long, env = "SANDBOX_BACKEND", value_enum, default_value = "remote")]
    pub backend: BackendKind,

    /// Agent image started for each session (remote backend)
    #[arg(long, env = "SANDBOX_IMAGE", default_value = "warden-agent:latest")]
    pub image: String,

    /// Memory ceiling per environment
    #[arg(long, env = "DOCKER_MEMORY_LIMIT", default_value = "2048m")]
    pub memory_limit: MemoryLimit,

    /// CPU share per environment (1.0 = one core)
    #[arg(long, env = "DOCKER_CPU_LIMIT", default_value = "1.0")]
    pub cpu_limit: f64,

    /// Wall-clock timeout per command in seconds
    #[arg(long, env = "COMMAND_TIMEOUT", default_value = "3600")]
    pub command_timeout: u64,

    /// Port the agent listens on inside the environment
    #[arg(long, env = "VM_PORT", default_value = "8080")]
    pub agent_port: u16,

    /// Host port the agent is published on (0 = ephemeral)
    #[arg(long, env = "HOST_PORT", default_value = "8081")]
    pub host_port: u16,

    /// Session used when a request names none
    #[arg(long, env = "OPENWEBUI_SESSION_ID", default_value = "default")]
    pub session: String,

    /// Coolify project id, attached as a container label
    #[arg(long, env = "COOLIFY_PROJECT_ID")]
    pub coolify_project_id: Option<String>,

    /// Comma-separated command allowlist
    #[arg(long, env = "SANDBOX_ALLOWED_COMMANDS", value_delimiter = ',')]
    pub allowed_commands: Vec<String>,

    /// Workspace root inside the environment
    #[arg(long, env = "SANDBOX_WORKSPACE", default_value = "/workspace")]
    pub workspace: PathBuf,

    /// Cut environments off from the network
    #[arg(long, env = "SANDBOX_NETWORK_ISOLATED", default_value_t = true, action = clap::ArgAction::Set)]
    pub network_isolated: bool,

    /// Provision environments on first use
    #[arg(long, env = "SANDBOX_AUTO_START", default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_start: bool,

    /// Directory for local backend sessions
    #[arg(long, env = "SANDBOX_LOCAL_ROOT")]
    pub local_root: Option<PathBuf>,

    /// Package manager used by `install`
    #[arg(long, env = "SANDBOX_PACKAGE_MANAGER", default_value = "pip")]
    pub package_manager: String,

    /// Stop sessions idle for this many seconds (0 = never)
    #[arg(long, env = "SANDBOX_IDLE_TIMEOUT", default_value = "0")]
    pub idle_timeout: u64,
}

impl From<ConfigArgs> for Config {
    fn from(args: ConfigArgs) -> Self {
        let defaults = Config::default();
        let policy = if args.allowed_commands.is_empty() {
            CommandPolicy::new(DEFAULT_ALLOWED_COMMANDS.iter().copied())
        } else {
            CommandPolicy::new(args.allowed_commands)
        };
        Self {
            backend: args.backend,
            image: args.image,
            limits: ResourceLimits {
                memory: args.memory_limit,
                cpus: args.cpu_limit,
                command_timeout: Duration::from_secs(args.command_timeout.max(1)),
            },
            policy,
            workspace_root: args.workspace,
            agent_port: args.agent_port,
            host_port: args.host_port,
            network_isolated: args.network_isolated,
            default_session: args.session,
            auto_start: args.auto_start,
            coolify_project_id: args.coolify_project_id.filter(|p| !p.is_empty()),
            startup: defaults.startup,
            local_root: args.local_root.unwrap_or(defaults.local_root),
            package_manager: args.package_manager,
            idle_timeout: (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ConfigArgs,
    }

    #[test]
    fn parses_docker_memory_notation() {
        assert_eq!("2048m".parse::<MemoryLimit>().unwrap().bytes(), 2048 << 20);
        assert_eq!("2G".parse::<MemoryLimit>().unwrap().bytes(), 2 << 30);
        assert_eq!("512k".parse::<MemoryLimit>().unwrap().bytes(), 512 << 10);
        assert_eq!("4096".parse::<MemoryLimit>().unwrap().bytes(), 4096);
        assert_eq!("2G".parse::<MemoryLimit>().unwrap().to_string(), "2g");
        assert!("lots".parse::<MemoryLimit>().is_err());
        assert!("0m".parse::<MemoryLimit>().is_err());
    }

    #[test]
    fn startup_delay_backs_off_and_caps() {
        let policy = StartupPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(40), Duration::from_secs(2));
    }

    #[test]
    fn flags_build_config() {
        let cli = TestCli::parse_from([
            "warden",
            "--backend",
            "local",
            "--allowed-commands",
            "ls,echo",
            "--command-timeout",
            "5",
            "--idle-timeout",
            "60",
            "--network-isolated",
            "false",
        ]);
        let config = Config::from(cli.config);
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.policy.allowed(), ["ls", "echo"]);
        assert_eq!(config.limits.command_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
        assert!(!config.network_isolated);
    }

    #[test]
    fn empty_allowlist_falls_back_to_defaults() {
        let cli = TestCli::parse_from(["warden"]);
        let config = Config::from(cli.config);
        assert_eq!(config.policy, CommandPolicy::default());
        assert_eq!(config.idle_timeout, None);
    }
}
