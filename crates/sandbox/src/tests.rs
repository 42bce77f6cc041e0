use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;

use super::*;

#[test]
fn prepare_mount_points_creates_fixed_guest_layout() {
    let runtime_root = tempfile::tempdir().unwrap();
    let spec = SandboxSpec {
        runtime_root: runtime_root.path().to_path_buf(),
        build_tree: runtime_root.path().to_path_buf(),
        inputs: vec![InputMount {
            name: "files".to_string(),
            host_path: runtime_root.path().to_path_buf(),
        }],
        host_api_socket: runtime_root.path().join("api.sock"),
        libdir: PathBuf::from("usr/lib/osbuild"),
        stage_name: "org.osbuild.noop".to_string(),
        extra_args: vec![],
        grace_period: Duration::from_secs(1),
    };

    prepare_mount_points(&spec).unwrap();

    assert!(runtime_root.path().join("run/osbuild/tree").is_dir());
    assert!(runtime_root.path().join("run/osbuild/inputs/files").is_dir());
    assert!(runtime_root.path().join("run/osbuild/api.sock").is_file());
    assert!(runtime_root.path().join("dev").is_dir());
    assert!(runtime_root.path().join("proc").is_dir());
    assert!(runtime_root.path().join("sys").is_dir());
}

#[test]
fn stage_binary_path_is_resolved_under_the_runtime_root_libdir() {
    let spec = SandboxSpec {
        runtime_root: PathBuf::from("/runtime"),
        build_tree: PathBuf::from("/tree"),
        inputs: vec![],
        host_api_socket: PathBuf::from("/tmp/api.sock"),
        libdir: PathBuf::from("usr/lib/osbuild"),
        stage_name: "org.osbuild.noop".to_string(),
        extra_args: vec![],
        grace_period: Duration::from_secs(1),
    };
    assert_eq!(
        spec.stage_binary(),
        PathBuf::from("/runtime/usr/lib/osbuild/stages/org.osbuild.noop")
    );
}

#[test]
fn spawn_rejects_a_missing_stage_binary() {
    let runtime_root = tempfile::tempdir().unwrap();
    let spec = SandboxSpec {
        runtime_root: runtime_root.path().to_path_buf(),
        build_tree: runtime_root.path().to_path_buf(),
        inputs: vec![],
        host_api_socket: runtime_root.path().join("api.sock"),
        libdir: PathBuf::from("usr/lib/osbuild"),
        stage_name: "org.osbuild.does-not-exist".to_string(),
        extra_args: vec![],
        grace_period: Duration::from_secs(1),
    };
    let err = spawn(&spec).unwrap_err();
    assert!(matches!(err, SandboxError::Exec(_)));
}

/// `ManagedChild`'s group-kill escalation doesn't need an actual sandbox, just a child in its
/// own session, so it's exercised directly against a plain `sleep` rather than a full stage
/// sandbox (which needs `CAP_SYS_ADMIN` to run at all).
#[test]
fn terminate_escalates_to_sigkill_when_child_ignores_sigterm() {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg("trap '' TERM; sleep 30");
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
        });
    }
    let child = command.spawn().unwrap();
    let mut managed = ManagedChild::new(child, Duration::from_millis(200));

    managed.terminate().unwrap();

    // SIGKILL cannot be trapped, so the process must be gone by now; a subsequent wait should
    // return immediately rather than hang.
    let status = managed.wait().unwrap();
    assert!(!status.success());
}
