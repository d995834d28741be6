//! Child exit detection.
//!
//! The `SIGCHLD` handler only bumps a counter. Reaping happens on the
//! collector thread (and at shutdown) through a non-blocking wait on the one
//! pid this monitor tracks, so exits of unrelated children are ignored.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use portable_pty::{Child, ChildKiller};

static SIGCHLD_COUNT: AtomicUsize = AtomicUsize::new(0);
static HANDLER_INSTALLED: OnceLock<bool> = OnceLock::new();

extern "C" fn on_sigchld(_: libc::c_int) {
    SIGCHLD_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Install the process-wide `SIGCHLD` handler once.
///
/// Returns whether it is in place. Without it, monitors fall back to
/// polling on every check.
pub fn install_sigchld_handler() -> bool {
    *HANDLER_INSTALLED.get_or_init(|| {
        let action = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        // SAFETY: the handler only touches an atomic counter.
        match unsafe { sigaction(Signal::SIGCHLD, &action) } {
            Ok(_) => true,
            Err(e) => {
                warn!("failed to install SIGCHLD handler, polling instead: {e}");
                false
            }
        }
    })
}

/// How the tracked child ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildExit {
    pub code: u32,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Watches one spawned child.
pub struct ExitMonitor {
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    seen: Option<usize>,
    exit: Option<ChildExit>,
}

impl ExitMonitor {
    pub fn new(child: Box<dyn Child + Send + Sync>) -> Self {
        let pid = child.process_id();
        Self {
            child,
            pid,
            seen: None,
            exit: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Reap the child if it has exited. Never blocks.
    ///
    /// Only waits when a `SIGCHLD` arrived since the last check (or when no
    /// handler is installed); the first call always waits once.
    pub fn check(&mut self) -> Option<ChildExit> {
        if self.exit.is_some() {
            return self.exit;
        }

        let count = SIGCHLD_COUNT.load(Ordering::SeqCst);
        let handler = HANDLER_INSTALLED.get().copied().unwrap_or(false);
        if handler && self.seen == Some(count) {
            return None;
        }
        self.seen = Some(count);

        match self.child.try_wait() {
            Ok(Some(status)) => self.record(status.exit_code()),
            Ok(None) => debug!("child {:?} still running, SIGCHLD was for another process", self.pid),
            Err(e) => warn!("waiting for child {:?} failed: {e}", self.pid),
        }
        self.exit
    }

    /// Kill the child if it is still running, then reap it.
    pub fn terminate(&mut self) -> Option<ChildExit> {
        if self.check().is_some() {
            return self.exit;
        }

        if let Err(e) = self.child.kill() {
            debug!("kill child {:?}: {e}", self.pid);
        }
        match self.child.wait() {
            Ok(status) => self.record(status.exit_code()),
            Err(e) => warn!("reaping child {:?} failed: {e}", self.pid),
        }
        self.exit
    }

    fn record(&mut self, code: u32) {
        let exit = ChildExit { code };
        if exit.success() {
            info!("child {:?} exited cleanly", self.pid);
        } else {
            warn!("child {:?} exited with status {code}", self.pid);
        }
        self.exit = Some(exit);
    }
}

/// Kill and reap a child by pid after its [`ExitMonitor`] was lost.
///
/// A signalled child reports status 1, matching what the monitor records.
pub(crate) fn kill_orphan(pid: u32) -> Option<ChildExit> {
    let pid = Pid::from_raw(pid as i32);
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("kill orphaned child {pid}: {e}"),
    }
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Some(ChildExit { code: code as u32 }),
            Ok(WaitStatus::Signaled(..)) => return Some(ChildExit { code: 1 }),
            Ok(status) => debug!("orphaned child {pid} changed state: {status:?}"),
            Err(Errno::EINTR) => {}
            Err(e) => {
                // ECHILD: someone else already reaped it.
                debug!("reaping orphaned child {pid}: {e}");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
    use std::thread;
    use std::time::{Duration, Instant};

    // The master is returned so the child is not hung up before the test ends.
    fn spawn(args: &[&str]) -> (Box<dyn Child + Send + Sync>, Box<dyn MasterPty + Send>) {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .unwrap();
        let mut cmd = CommandBuilder::new(args[0]);
        cmd.args(&args[1..]);
        let child = pair.slave.spawn_command(cmd).unwrap();
        (child, pair.master)
    }

    fn wait_for_exit(monitor: &mut ExitMonitor) -> Option<ChildExit> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(exit) = monitor.check() {
                return Some(exit);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }

    #[test]
    fn test_install_is_idempotent() {
        let first = install_sigchld_handler();
        assert_eq!(install_sigchld_handler(), first);
    }

    #[test]
    fn test_detects_clean_exit() {
        install_sigchld_handler();
        let (child, _master) = spawn(&["/bin/sh", "-c", "exit 0"]);
        let mut monitor = ExitMonitor::new(child);
        assert!(monitor.pid().is_some());
        let exit = wait_for_exit(&mut monitor).expect("child should exit");
        assert!(exit.success());
    }

    #[test]
    fn test_detects_failing_exit() {
        install_sigchld_handler();
        let (child, _master) = spawn(&["/bin/sh", "-c", "exit 7"]);
        let mut monitor = ExitMonitor::new(child);
        let exit = wait_for_exit(&mut monitor).expect("child should exit");
        assert_eq!(exit, ChildExit { code: 7 });
    }

    #[test]
    fn test_running_child_reports_nothing() {
        let (child, _master) = spawn(&["/bin/sh", "-c", "sleep 30"]);
        let mut monitor = ExitMonitor::new(child);
        assert_eq!(monitor.check(), None);
        assert!(monitor.terminate().is_some());
    }

    #[test]
    fn test_terminate_after_exit_keeps_status() {
        let (child, _master) = spawn(&["/bin/sh", "-c", "exit 3"]);
        let mut monitor = ExitMonitor::new(child);
        let exit = wait_for_exit(&mut monitor);
        assert_eq!(monitor.terminate(), exit);
    }

    #[test]
    fn test_kill_orphan_reaps_running_child() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert_eq!(kill_orphan(pid), Some(ChildExit { code: 1 }));
        assert_eq!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH));
    }

    #[test]
    fn test_kill_orphan_of_reaped_child() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert_eq!(kill_orphan(pid), None);
    }
}
