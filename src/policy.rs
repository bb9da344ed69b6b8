//! Command allowlist, package name check and workspace path confinement.
//!
//! Commands are never handed to a shell: they are split into an argument
//! vector with shell quoting rules and executed directly, so chaining,
//! substitution and redirection have no effect. The allowlist therefore only
//! has to gate the program name. Bare control operators are still rejected so
//! callers learn that chaining is not supported.

use crate::error::{Result, SandboxError};
use std::path::{Component, Path, PathBuf};

/// Commands permitted when no allowlist is configured.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "echo", "python", "python3", "pip", "apt-get", "apt", "mkdir", "rm", "cp", "mv",
    "chmod", "chown", "chgrp", "ln", "touch", "date", "sleep", "kill",
];

const CONTROL_OPERATORS: &[&str] = &[";", "&&", "||", "|", "&", ">", ">>", "<", "<<", "2>", "2>&1"];

/// Ordered set of permitted leading tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPolicy {
    allowed: Vec<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_COMMANDS.iter().copied())
    }
}

impl CommandPolicy {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut allowed: Vec<String> = Vec::new();
        for cmd in commands {
            let cmd = cmd.into().trim().to_string();
            if !cmd.is_empty() && !allowed.contains(&cmd) {
                allowed.push(cmd);
            }
        }
        Self { allowed }
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    /// Validate a command line and return its argument vector.
    pub fn check(&self, command: &str) -> Result<Vec<String>> {
        let argv = split_command(command)?;
        let program = &argv[0];

        if !self.allowed.iter().any(|a| a == program) {
            return Err(SandboxError::CommandNotAllowed {
                command: program.clone(),
                allowed: self.allowed.clone(),
            });
        }

        if let Some(op) = argv.iter().find(|t| CONTROL_OPERATORS.contains(&t.as_str())) {
            return Err(SandboxError::CommandRejected(format!(
                "shell operator '{op}' is not supported; run one command per request"
            )));
        }

        Ok(argv)
    }
}

/// Split a command line into argv using POSIX shell quoting rules.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let argv = shell_words::split(command)
        .map_err(|e| SandboxError::CommandRejected(format!("cannot parse command: {e}")))?;
    if argv.is_empty() {
        return Err(SandboxError::InvalidRequest("No command provided".into()));
    }
    Ok(argv)
}

/// Alphanumerics plus `.`, `-`, `_`, starting with an alphanumeric so the
/// name can never be read as a package manager flag.
pub fn validate_package_name(name: &str) -> Result<()> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidPackageName(name.to_string()))
    }
}

/// Session ids end up in environment names.
pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidRequest(format!(
            "Invalid session id '{id}': use 1-64 characters from [A-Za-z0-9._-]"
        )))
    }
}

/// Rewrite `raw` as a normalized path relative to `root`.
///
/// A leading `root` prefix is stripped, leading separators are ignored and
/// `..` never climbs above the root. The result may be empty (the root itself).
pub fn confine(root: &Path, raw: &str) -> Result<PathBuf> {
    if raw.contains('\0') {
        return Err(SandboxError::PathConfinement(
            "path contains a NUL byte".into(),
        ));
    }

    let raw = Path::new(raw);
    let raw = raw.strip_prefix(root).unwrap_or(raw);

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(parts.iter().collect())
}
