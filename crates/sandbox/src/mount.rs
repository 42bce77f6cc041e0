// Mount-namespace construction for a stage sandbox (spec §4.4).
//
// Everything in this module runs inside the forked child, between `fork` and `exec`
// (`std::process::Command::pre_exec`), so teardown of the bind mounts is automatic: when the
// mount namespace's last member exits, the kernel tears down every mount in it along with the
// namespace itself. Nothing here needs an explicit unmount on the happy path; `unmount_best_effort`
// exists only for the case where we've mounted something in the *parent's* namespace (the socket
// bind mount staging performed before `unshare`, on some kernels) and need to clean up on error.

use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::chroot;

use crate::SandboxError;

fn mount_err(what: &str, e: nix::Error) -> SandboxError {
    SandboxError::Mount(format!("{what}: {e}"))
}

/// Enter a new mount namespace, private to this process tree.
pub fn unshare_mount_namespace() -> Result<(), SandboxError> {
    unshare(CloneFlags::CLONE_NEWNS).map_err(|e| mount_err("unshare(CLONE_NEWNS)", e))
}

/// Mark the whole mount tree as private so that mounts performed after this point are never
/// propagated back to the host's namespace, and vice versa.
pub fn make_mount_tree_private() -> Result<(), SandboxError> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err("mount(/, MS_PRIVATE|MS_REC)", e))
}

/// Bind-mount `src` onto `dst`, optionally read-only. `dst` must already exist.
pub fn bind_mount(src: &Path, dst: &Path, read_only: bool) -> Result<(), SandboxError> {
    mount(
        Some(src),
        dst,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err(&format!("bind {} -> {}", src.display(), dst.display()), e))?;

    if read_only {
        // A bind mount's flags can't be changed in the same call; remount is required to apply
        // MS_RDONLY to an existing bind.
        mount(
            None::<&str>,
            dst,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| mount_err(&format!("remount ro {}", dst.display()), e))?;
    }
    Ok(())
}

/// Mount a minimal, host-backed `/dev`, `/proc`, `/sys` surface (spec §4.4 device surface).
pub fn mount_device_surface(guest_root: &Path) -> Result<(), SandboxError> {
    bind_mount(Path::new("/dev"), &guest_root.join("dev"), false)?;
    bind_mount(Path::new("/sys"), &guest_root.join("sys"), true)?;

    mount(
        Some("proc"),
        &guest_root.join("proc"),
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| mount_err("mount proc", e))?;
    Ok(())
}

/// Make `guest_root` the process's root filesystem (spec §4.4: "the sandbox as its
/// chroot-equivalent").
pub fn enter_root(guest_root: &Path) -> Result<(), SandboxError> {
    chroot(guest_root).map_err(|e| mount_err(&format!("chroot({})", guest_root.display()), e))?;
    std::env::set_current_dir("/").map_err(|e| SandboxError::Io(e.to_string()))
}

/// Best-effort lazy unmount, used only for cleanup paths that run outside the sandboxed
/// process's own (self-destructing) mount namespace.
pub fn unmount_best_effort(path: &Path) {
    if let Err(e) = umount2(path, MntFlags::MNT_DETACH) {
        log::debug!("unmount {} failed (likely already gone): {e}", path.display());
    }
}
