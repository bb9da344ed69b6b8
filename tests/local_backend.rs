//! End-to-end tests through the local backend: real processes, real files.
//!
//! These tests verify:
//! - Allowed commands run in the session workspace
//! - Timeouts, unknown programs and non-zero exits are reported
//! - File contents round-trip unchanged
//! - Path traversal stays inside the workspace
//! - Symlinks planted by commands cannot reach outside the workspace
//! - Sessions are isolated and stop reclaims the workspace, even from another process

#![cfg(unix)]

use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use warden::config::{BackendKind, Config, ResourceLimits};
use warden::error::ErrorKind;
use warden::policy::{CommandPolicy, DEFAULT_ALLOWED_COMMANDS};
use warden::protocol::{OperationResult, Payload};
use warden::Controller;

fn local_controller(root: &Path, timeout: Duration) -> Controller {
    let config = Config {
        backend: BackendKind::Local,
        local_root: root.to_path_buf(),
        network_isolated: false,
        policy: CommandPolicy::new(["ls", "echo", "cat", "sleep", "no-such-program-xyz"]),
        limits: ResourceLimits {
            command_timeout: timeout,
            ..ResourceLimits::default()
        },
        ..Config::default()
    };
    Controller::from_config(config).expect("local controller")
}

fn setup() -> (TempDir, Controller) {
    let root = tempfile::tempdir().expect("tempdir");
    let controller = local_controller(root.path(), Duration::from_secs(30));
    (root, controller)
}

fn workspace(root: &Path, session: &str) -> std::path::PathBuf {
    root.join(format!("warden-{session}")).join("workspace")
}

// =============================================================================
// Execution
// =============================================================================

#[tokio::test]
async fn test_echo_hello() {
    let (_root, controller) = setup();

    let result = controller.execute("s1", "echo hello").await;

    assert!(result.is_success(), "{result:?}");
    let output = result.output().unwrap();
    assert_eq!(output.stdout, "hello\n");
    assert_eq!(output.stderr, "");
    assert_eq!(output.exit_code, 0);
}

#[tokio::test]
async fn test_rm_is_not_allowed() {
    let (root, controller) = setup();

    let result = controller.execute("s1", "rm -rf /").await;

    assert_eq!(result.error_kind(), Some(ErrorKind::CommandNotAllowed));
    assert!(!root.path().join("warden-s1").exists());
}

#[tokio::test]
async fn test_quoted_arguments_are_not_interpreted() {
    let (_root, controller) = setup();

    let result = controller.execute("s1", "echo 'a; rm -rf /' \"$HOME\"").await;

    assert_eq!(result.output().unwrap().stdout, "a; rm -rf / $HOME\n");
}

#[tokio::test]
async fn test_timeout_is_reported_as_timeout() {
    let root = tempfile::tempdir().expect("tempdir");
    let controller = local_controller(root.path(), Duration::from_secs(1));

    let started = Instant::now();
    let result = controller.execute("s1", "sleep 10").await;

    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_unknown_program_exits_127() {
    let (_root, controller) = setup();

    let result = controller.execute("s1", "no-such-program-xyz").await;

    assert_eq!(result.error_kind(), Some(ErrorKind::CommandFailed));
    assert_eq!(result.output().unwrap().exit_code, 127);
}

#[tokio::test]
async fn test_nonzero_exit_keeps_stderr() {
    let (_root, controller) = setup();

    let result = controller.execute("s1", "ls does-not-exist").await;

    assert_eq!(result.error_kind(), Some(ErrorKind::CommandFailed));
    let output = result.output().unwrap();
    assert_ne!(output.exit_code, 0);
    assert!(!output.stderr.is_empty());
}

// =============================================================================
// Files
// =============================================================================

#[tokio::test]
async fn test_file_contents_round_trip() {
    let (_root, controller) = setup();

    for content in ["", "first line\nsecond line\n\nfourth\n", "naïve café ✓ 日本語 🚀"] {
        assert!(controller.write_file("s1", "notes.txt", content).await.is_success());
        assert_eq!(
            controller.read_file("s1", "notes.txt").await,
            OperationResult::Success(Payload::FileRead {
                path: "/workspace/notes.txt".into(),
                content: content.to_string(),
            })
        );
    }

    let cat = controller.execute("s1", "cat notes.txt").await;
    assert_eq!(cat.output().unwrap().stdout, "naïve café ✓ 日本語 🚀");
}

#[tokio::test]
async fn test_traversal_stays_in_workspace() {
    let (root, controller) = setup();

    let result = controller.write_file("s1", "../../escape.txt", "x").await;

    match result {
        OperationResult::Success(Payload::FileWritten { path, .. }) => {
            assert_eq!(path, "/workspace/escape.txt")
        }
        other => panic!("expected FileWritten, got {other:?}"),
    }
    assert!(workspace(root.path(), "s1").join("escape.txt").is_file());
    assert!(!root.path().join("escape.txt").exists());
    assert!(!root.path().join("warden-s1").join("escape.txt").exists());
}

#[tokio::test]
async fn test_workspace_prefix_and_nested_dirs() {
    let (root, controller) = setup();

    let result = controller
        .write_file("s1", "/workspace/src/pkg/main.py", "print('hi')\n")
        .await;

    assert!(result.is_success());
    assert!(workspace(root.path(), "s1").join("src/pkg/main.py").is_file());
}

#[tokio::test]
async fn test_missing_file_is_file_access_error() {
    let (root, controller) = setup();

    let result = controller.read_file("s1", "nope.txt").await;

    assert_eq!(result.error_kind(), Some(ErrorKind::FileAccess));
    let message = result.message().unwrap();
    assert!(!message.contains(&root.path().display().to_string()));
}

#[tokio::test]
async fn test_symlink_from_command_cannot_escape() {
    let root = tempfile::tempdir().expect("tempdir");
    let outside = tempfile::tempdir().expect("tempdir");
    std::fs::write(outside.path().join("secret.txt"), "host data").unwrap();
    let config = Config {
        backend: BackendKind::Local,
        local_root: root.path().to_path_buf(),
        network_isolated: false,
        policy: CommandPolicy::new(DEFAULT_ALLOWED_COMMANDS.iter().copied()),
        ..Config::default()
    };
    let controller = Controller::from_config(config).expect("local controller");

    let link = format!("ln -s {} escape", outside.path().display());
    assert!(controller.execute("s1", &link).await.is_success());

    let read = controller.read_file("s1", "escape/secret.txt").await;
    assert_eq!(read.error_kind(), Some(ErrorKind::PathConfinementViolation));
    let write = controller.write_file("s1", "escape/planted.txt", "x").await;
    assert_eq!(write.error_kind(), Some(ErrorKind::PathConfinementViolation));
    assert!(!outside.path().join("planted.txt").exists());
}

// =============================================================================
// Sessions
// =============================================================================

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (_root, controller) = setup();

    controller.write_file("alice", "secret.txt", "a").await;
    let result = controller.read_file("bob", "secret.txt").await;

    assert_eq!(result.error_kind(), Some(ErrorKind::FileAccess));
}

#[tokio::test]
async fn test_stop_reclaims_workspace() {
    let (root, controller) = setup();
    controller.write_file("s1", "a.txt", "a").await;
    assert!(workspace(root.path(), "s1").is_dir());

    assert!(controller.stop("s1").await.is_success());

    assert!(!root.path().join("warden-s1").exists());
    assert!(controller.sessions().await.is_empty());
}

#[tokio::test]
async fn test_start_reports_ready() {
    let (_root, controller) = setup();

    match controller.start("s1").await {
        OperationResult::Success(Payload::Started { ready, .. }) => assert!(ready),
        other => panic!("expected Started, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stop_from_another_controller_reclaims_workspace() {
    let root = tempfile::tempdir().expect("tempdir");
    let first = local_controller(root.path(), Duration::from_secs(30));
    assert!(first.write_file("s1", "a.txt", "from first").await.is_success());
    drop(first);

    let second = local_controller(root.path(), Duration::from_secs(30));
    assert_eq!(
        second.read_file("s1", "a.txt").await,
        OperationResult::Success(Payload::FileRead {
            path: "/workspace/a.txt".into(),
            content: "from first".into(),
        })
    );

    let third = local_controller(root.path(), Duration::from_secs(30));
    assert_eq!(
        third.stop("s1").await,
        OperationResult::Success(Payload::Stopped {
            message: "Environment stopped".into()
        })
    );
    assert!(!root.path().join("warden-s1").exists());
}
