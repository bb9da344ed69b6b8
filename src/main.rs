//! warden - session-scoped command sandbox.
//!
//! Usage:
//!   warden agent [--port 8080] [--workspace /workspace]   # Agent inside an environment
//!   warden serve [--port 9090]                            # Controller HTTP front
//!   warden call '{"action":"execute","params":{...}}'     # One-shot controller call
//!   warden schema                                         # Tool description as JSON

use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use warden::agent::{server::run_agent, Agent, AgentSettings};
use warden::config::{Config, ConfigArgs};
use warden::controller::{server::run_controller, Controller};
use warden::protocol::{tool_specification, ActionRequest};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Session-scoped command sandbox")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent HTTP server inside an environment
    Agent {
        /// Port to listen on
        #[arg(long, env = "VM_PORT", default_value = "8080")]
        port: u16,

        /// Workspace root; every operation runs relative to it
        #[arg(long, env = "SANDBOX_WORKSPACE", default_value = "/workspace")]
        workspace: PathBuf,

        /// Wall-clock timeout per command in seconds
        #[arg(long, env = "COMMAND_TIMEOUT", default_value = "3600")]
        timeout: u64,

        /// Package manager used by `install`
        #[arg(long, env = "SANDBOX_PACKAGE_MANAGER", default_value = "pip")]
        package_manager: String,
    },
    /// Run the controller behind an HTTP front
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "9090")]
        port: u16,

        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Handle one action envelope and print the result as JSON
    Call {
        /// Envelope JSON, or `-` to read it from stdin
        envelope: String,

        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Print the tool description for function-calling front ends
    Schema,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Agent {
            port,
            workspace,
            timeout,
            package_manager,
        } => {
            let mut settings = AgentSettings::new(workspace);
            settings.timeout = Duration::from_secs(timeout.max(1));
            settings.package_manager = package_manager;
            if let Err(e) = run_agent(port, Arc::new(Agent::new(settings))).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Serve { port, config } => {
            let controller = match Controller::from_config(Config::from(config)) {
                Ok(controller) => Arc::new(controller),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            };
            if let Err(e) = run_controller(port, controller).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Call { envelope, config } => {
            let body = if envelope == "-" {
                let mut buf = String::new();
                if let Err(e) = std::io::stdin().read_to_string(&mut buf) {
                    eprintln!("Error: cannot read stdin: {}", e);
                    exit(1);
                }
                buf
            } else {
                envelope
            };
            let request: ActionRequest = match serde_json::from_str(&body) {
                Ok(request) => request,
                Err(e) => {
                    eprintln!("Error: invalid envelope: {}", e);
                    exit(1);
                }
            };

            let controller = match Controller::from_config(Config::from(config)) {
                Ok(controller) => controller,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            };
            let result = controller.handle(request).await;
            match serde_json::to_string_pretty(&result) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
            if !result.is_success() {
                exit(1);
            }
        }
        Commands::Schema => match serde_json::to_string_pretty(&tool_specification()) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                exit(1);
            }
        },
    }
}
