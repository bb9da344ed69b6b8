//! warden: a restricted command-execution sandbox.
//!
//! A [`Controller`] provisions one isolated environment per session, checks
//! every request against the command allowlist, package name rules and
//! workspace confinement, and relays it to the [`Agent`] running inside that
//! environment.

pub mod agent;
pub mod config;
pub mod controller;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod state;

pub use agent::{Agent, AgentSettings, AgentState};
pub use config::Config;
pub use controller::Controller;
pub use error::{ErrorKind, SandboxError};
pub use protocol::{ActionRequest, OperationResult};

use tracing::info;

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
