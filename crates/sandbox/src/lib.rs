// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::new_without_default)]

//! Launches a stage program inside an isolated mount namespace (spec §4.4).
//!
//! A sandbox is built from a fixed guest layout rooted at [`GUEST_RUN_DIR`]:
//!
//! ```text
//! <runtime root>/run/osbuild/tree            the stage's writable build tree
//! <runtime root>/run/osbuild/inputs/<name>    one read-only directory per declared input
//! <runtime root>/run/osbuild/api.sock         the Host API control socket
//! ```
//!
//! All of it lives inside a private mount namespace entered via `unshare(CLONE_NEWNS)` just
//! before `exec`, so a single process exit tears every mount down with it; there is no explicit
//! teardown step to get wrong.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

mod children;
mod mount;

pub use children::{ManagedChild, DEFAULT_GRACE_PERIOD};

/// Errors surfaced while constructing or running a stage sandbox (spec §7: `SandboxError`).
#[derive(Debug)]
pub enum SandboxError {
    /// A mount, unshare, or chroot syscall failed.
    Mount(String),
    /// The stage binary could not be resolved or exec'd.
    Exec(String),
    /// Sending a signal to the stage's process group failed.
    Signal(String),
    Io(String),
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::Mount(msg) => write!(f, "sandbox mount error: {msg}"),
            SandboxError::Exec(msg) => write!(f, "sandbox exec error: {msg}"),
            SandboxError::Signal(msg) => write!(f, "sandbox signal error: {msg}"),
            SandboxError::Io(msg) => write!(f, "sandbox io error: {msg}"),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<io::Error> for SandboxError {
    fn from(e: io::Error) -> Self {
        SandboxError::Io(e.to_string())
    }
}

pub const GUEST_RUN_DIR: &str = "/run/osbuild";

fn guest_tree_dir() -> PathBuf {
    PathBuf::from(GUEST_RUN_DIR).join("tree")
}

fn guest_inputs_dir() -> PathBuf {
    PathBuf::from(GUEST_RUN_DIR).join("inputs")
}

fn guest_api_socket() -> PathBuf {
    PathBuf::from(GUEST_RUN_DIR).join("api.sock")
}

/// One declared input, materialized on the host and bind-mounted read-only into the sandbox.
#[derive(Debug, Clone)]
pub struct InputMount {
    pub name: String,
    pub host_path: PathBuf,
}

/// Everything needed to construct and run one stage invocation's sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Either the host root (bootstrap pipeline) or a writable snapshot of a build pipeline's
    /// final object (spec §4.4, construction step 1).
    pub runtime_root: PathBuf,
    /// A writable snapshot of the pipeline's in-progress object (step 2).
    pub build_tree: PathBuf,
    /// Materialized input directories (step 3).
    pub inputs: Vec<InputMount>,
    /// Host-side path of the Host API server's listening socket (step 4).
    pub host_api_socket: PathBuf,
    /// Directory under the runtime root where stage binaries live, e.g. `usr/lib/osbuild`
    /// (spec §6: `<libdir>/stages/<name>`).
    pub libdir: PathBuf,
    pub stage_name: String,
    /// Extra argv entries after the resolved stage binary path and the socket path.
    pub extra_args: Vec<String>,
    pub grace_period: Duration,
}

impl SandboxSpec {
    fn stage_binary(&self) -> PathBuf {
        self.runtime_root.join(&self.libdir).join("stages").join(&self.stage_name)
    }
}

/// Captured result of running a stage to completion.
#[derive(Debug)]
pub struct StageOutcome {
    pub status: std::process::ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl StageOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Prepare the fixed guest mount points under `runtime_root` (create the directories the
/// bind mounts will target; mount(2) requires the destination to already exist).
fn prepare_mount_points(spec: &SandboxSpec) -> Result<(), SandboxError> {
    std::fs::create_dir_all(spec.runtime_root.join(guest_tree_dir().strip_prefix("/").unwrap()))?;
    for input in &spec.inputs {
        let guest = guest_inputs_dir().join(&input.name);
        std::fs::create_dir_all(spec.runtime_root.join(guest.strip_prefix("/").unwrap()))?;
    }
    let socket_guest = guest_api_socket();
    if let Some(parent) = socket_guest.parent() {
        std::fs::create_dir_all(spec.runtime_root.join(parent.strip_prefix("/").unwrap()))?;
    }
    std::fs::write(
        spec.runtime_root.join(socket_guest.strip_prefix("/").unwrap()),
        b"",
    )?;
    for dir in ["dev", "proc", "sys"] {
        std::fs::create_dir_all(spec.runtime_root.join(dir))?;
    }
    Ok(())
}

/// Everything that must happen between `fork` and `exec`, inside the child (spec §4.4
/// construction + execution). Mount syscalls here affect only this not-yet-exec'd process's
/// namespace, so failures are reported back to the parent via the `io::Error` this closure
/// returns, per `Command::pre_exec`'s contract.
fn enter_sandbox(spec: &SandboxSpec) -> io::Result<()> {
    nix::unistd::setsid()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("setsid: {e}")))?;

    mount::unshare_mount_namespace().map_err(to_io_error)?;
    mount::make_mount_tree_private().map_err(to_io_error)?;

    mount::bind_mount(&spec.build_tree, &spec.runtime_root.join(guest_tree_dir().strip_prefix("/").unwrap()), false)
        .map_err(to_io_error)?;
    for input in &spec.inputs {
        let guest = spec.runtime_root.join(guest_inputs_dir().join(&input.name).strip_prefix("/").unwrap());
        mount::bind_mount(&input.host_path, &guest, true).map_err(to_io_error)?;
    }
    mount::bind_mount(
        &spec.host_api_socket,
        &spec.runtime_root.join(guest_api_socket().strip_prefix("/").unwrap()),
        false,
    )
    .map_err(to_io_error)?;
    mount::mount_device_surface(&spec.runtime_root).map_err(to_io_error)?;

    mount::enter_root(&spec.runtime_root).map_err(to_io_error)?;
    Ok(())
}

fn to_io_error(e: SandboxError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Spawn the stage, returning a handle whose `Drop` enforces the SIGTERM → SIGKILL escalation
/// of spec §5 if it is dropped without having been waited on.
pub fn spawn(spec: &SandboxSpec) -> Result<ManagedChild, SandboxError> {
    prepare_mount_points(spec)?;

    let guest_socket = guest_api_socket();
    let stage_binary = spec.stage_binary();
    if !stage_binary.is_file() {
        return Err(SandboxError::Exec(format!(
            "stage binary not found at {}",
            stage_binary.display()
        )));
    }

    let mut command = Command::new(&stage_binary);
    command
        .env_clear()
        .arg(guest_socket.display().to_string())
        .args(&spec.extra_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let spec_for_child = spec.clone();
    // Safety: the closure only calls functions documented as async-signal-safe-adjacent for
    // this single-threaded post-fork context (setsid, mount, chroot, chdir), matching the
    // restrictions `Command::pre_exec` imposes, and it runs before any other thread could
    // exist in the child.
    unsafe {
        command.pre_exec(move || enter_sandbox(&spec_for_child));
    }

    let child = command
        .spawn()
        .map_err(|e| SandboxError::Exec(format!("spawning {}: {e}", stage_binary.display())))?;
    Ok(ManagedChild::new(child, spec.grace_period))
}

/// Run a stage to completion, capturing its exit status and output (spec §6: "Standard I/O is
/// captured").
pub fn run(spec: &SandboxSpec) -> Result<StageOutcome, SandboxError> {
    let mut managed = spawn(spec)?;
    let output = managed
        .wait_and_capture()
        .map_err(|e| SandboxError::Io(e.to_string()))?;
    Ok(StageOutcome {
        status: output.status,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

#[cfg(test)]
mod tests;
