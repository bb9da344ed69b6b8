//! Process execution for the agent: argv spawn, output capture, timeouts.

use crate::error::{Result, SandboxError};
use crate::protocol::ExecResponse;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Per-stream capture cap.
pub const MAX_OUTPUT_BYTES: usize = 1 << 20;

/// Exit code reported when the program does not exist, as a shell would.
const EXIT_NOT_FOUND: i32 = 127;

/// What to run and under which constraints.
#[derive(Debug, Clone)]
pub struct ProcessSpec<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    /// Address-space ceiling applied in the child before exec.
    pub memory_limit: Option<u64>,
}

/// Run a process to completion or until the timeout fires.
///
/// The child gets its own process group so a timeout can take down anything
/// it forked as well.
pub async fn run(spec: ProcessSpec<'_>) -> Result<ExecResponse> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| SandboxError::InvalidRequest("No command provided".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        cmd.process_group(0);
        if let Some(bytes) = spec.memory_limit {
            // SAFETY: setrlimit is async-signal-safe and touches no parent state.
            unsafe {
                cmd.pre_exec(move || {
                    let limit = bytes as libc::rlim_t;
                    nix::sys::resource::setrlimit(
                        nix::sys::resource::Resource::RLIMIT_AS,
                        limit,
                        limit,
                    )
                    .map_err(std::io::Error::from)
                });
            }
        }
    }

    debug!(argv = ?spec.argv, cwd = ?spec.cwd, timeout = ?spec.timeout, "Spawning process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(program = %program, "Program not found");
            return Ok(ExecResponse::new(
                String::new(),
                format!("{program}: command not found\n"),
                EXIT_NOT_FOUND,
            ));
        }
        Err(e) => {
            return Err(SandboxError::EnvironmentFault(format!(
                "failed to spawn '{program}': {e}"
            )))
        }
    };
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Pipes are drained alongside the wait so the child never blocks on a full pipe.
    let finished = tokio::time::timeout(spec.timeout, async {
        tokio::join!(child.wait(), read_capped(stdout), read_capped(stderr))
    })
    .await;

    match finished {
        Ok((Ok(status), Ok(stdout), Ok(stderr))) => {
            let exit_code = exit_code(&status);
            info!(program = %program, exit_code, "Process exited");
            Ok(ExecResponse::new(stdout, stderr, exit_code))
        }
        Ok((Err(e), _, _)) | Ok((_, Err(e), _)) | Ok((_, _, Err(e))) => {
            Err(SandboxError::EnvironmentFault(format!(
                "failed to wait for '{program}': {e}"
            )))
        }
        Err(_) => {
            warn!(program = %program, pid = ?pid, timeout = ?spec.timeout, "Process timed out, killing group");
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            Err(SandboxError::Timeout(spec.timeout))
        }
    }
}

/// Keep at most `MAX_OUTPUT_BYTES` of a stream and discard the rest as it arrives.
async fn read_capped<R>(reader: Option<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut kept = Vec::new();
    (&mut reader)
        .take(MAX_OUTPUT_BYTES as u64)
        .read_to_end(&mut kept)
        .await?;
    let discarded = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(capture(&kept, discarded > 0))
}

fn capture(bytes: &[u8], truncated: bool) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated {
        text.push_str(&format!(
            "\n[truncated: output limit {}KB exceeded]\n",
            MAX_OUTPUT_BYTES / 1024
        ));
    }
    text
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}
