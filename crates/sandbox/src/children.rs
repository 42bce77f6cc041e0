// A child process running in its own process group, with a drop implementation that escalates
// from SIGTERM to SIGKILL against the whole group (spec §4.4 teardown, §5 suspension points).
//
// Grouping matters because a stage is free to fork helpers of its own; killing only the direct
// child would leave them behind. `setsid` is installed via `pre_exec`, the same place the
// mount-namespace and chroot setup for the sandbox itself runs (see `crate::enter_sandbox`).

use std::io::{self, Read};
use std::ops::{Deref, DerefMut};
use std::process::{Child, Output};
use std::sync::atomic::{AtomicBool, Ordering};
use std::{thread, time};

use nix::sys::signal::{self, Signal};
use nix::unistd::{getpgid, Pid};

use crate::SandboxError;

const GRACE_POLL_INTERVAL: time::Duration = time::Duration::from_millis(50);

/// Default grace period between `SIGTERM` and `SIGKILL` (spec §5: "bounded grace period
/// (default 10 s)").
pub const DEFAULT_GRACE_PERIOD: time::Duration = time::Duration::from_secs(10);

pub struct ManagedChild {
    child: Child,
    grace_period: time::Duration,
    reaped: AtomicBool,
}

impl ManagedChild {
    pub fn new(child: Child, grace_period: time::Duration) -> ManagedChild {
        ManagedChild {
            child,
            grace_period,
            reaped: AtomicBool::new(false),
        }
    }

    fn pgid(&self) -> Result<Pid, SandboxError> {
        let pid = self.child.id();
        getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| SandboxError::Signal(format!("getpgid({pid}): {e}")))
    }

    fn signal_group(&self, signal: Signal) -> Result<(), SandboxError> {
        let pgid = self.pgid()?;
        // negating the pgid targets the whole group rather than just the leader.
        signal::kill(Pid::from_raw(-pgid.as_raw()), signal)
            .map_err(|e| SandboxError::Signal(format!("kill(-{pgid}, {signal}): {e}")))
    }

    fn has_exited(&mut self) -> Result<bool, SandboxError> {
        self.child
            .try_wait()
            .map(|status| status.is_some())
            .map_err(|e| SandboxError::Io(e.to_string()))
    }

    fn wait_up_to(&mut self, timeout: time::Duration) -> Result<bool, SandboxError> {
        let deadline = time::Instant::now() + timeout;
        while time::Instant::now() <= deadline {
            if self.has_exited()? {
                return Ok(true);
            }
            thread::sleep(GRACE_POLL_INTERVAL);
        }
        Ok(false)
    }

    /// Send `SIGTERM` to the process group and wait up to `grace_period` before escalating to
    /// `SIGKILL` (spec §5). Blocks for a bounded amount of time.
    pub fn terminate(&mut self) -> Result<(), SandboxError> {
        self.signal_group(Signal::SIGTERM)?;
        match self.wait_up_to(self.grace_period) {
            Ok(true) => {
                self.reaped.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(false) => {
                log::warn!("stage did not exit within grace period; sending SIGKILL");
                self.kill_group()
            }
            Err(e) => {
                log::warn!("error waiting for graceful shutdown ({e}); sending SIGKILL");
                self.kill_group()
            }
        }
    }

    fn kill_group(&mut self) -> Result<(), SandboxError> {
        self.signal_group(Signal::SIGKILL)?;
        self.reaped.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Mark the child as already reaped (via a normal `wait`) so `Drop` does not try to signal a
    /// process group that no longer exists.
    pub fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::SeqCst);
    }

    /// Wait for the child to exit, capturing everything written to its piped stdout/stderr
    /// (spec §6: "Standard I/O is captured"). Unlike `Child::wait_with_output` this takes `&mut
    /// self` rather than `self`, since `ManagedChild` has a `Drop` impl and so can't be
    /// destructured by value.
    pub fn wait_and_capture(&mut self) -> io::Result<Output> {
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        let stdout_reader = stdout.map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });
        let stderr_reader = stderr.map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });

        let status = self.child.wait()?;
        self.reaped.store(true, Ordering::SeqCst);

        let join = |handle: Option<thread::JoinHandle<io::Result<Vec<u8>>>>| -> io::Result<Vec<u8>> {
            match handle {
                Some(h) => h
                    .join()
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(io::ErrorKind::Other, "reader thread panicked"))
                    }),
                None => Ok(Vec::new()),
            }
        };
        let stdout = join(stdout_reader)?;
        let stderr = join(stderr_reader)?;
        Ok(Output { status, stdout, stderr })
    }
}

impl Deref for ManagedChild {
    type Target = Child;

    fn deref(&self) -> &Child {
        &self.child
    }
}

impl DerefMut for ManagedChild {
    fn deref_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if !self.reaped.load(Ordering::SeqCst) {
            let _ = self.terminate();
        }
    }
}
