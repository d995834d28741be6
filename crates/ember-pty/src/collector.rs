//! Dedicated thread that moves child output from the PTY into scrollback.
//!
//! PTY reads block, so the collector gets its own OS thread and owns its own
//! duplicate of the master descriptor. The session lock is only held while a
//! chunk is stored, never across a read. Each round waits on the descriptor
//! with a timeout so stop requests and child exits are noticed promptly.

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::exit_monitor::ExitMonitor;
use crate::pty::PtyError;
use crate::session::SessionShared;
use crate::wake::WakeNotifier;

/// Consecutive unexpected read errors tolerated before giving up.
const MAX_READ_FAILURES: u32 = 16;

/// Poll rounds to wait for the child to be reaped after the PTY hangs up.
const HANGUP_LINGER_ROUNDS: u32 = 10;

/// Collector tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Longest wait for output before re-checking for exit.
    pub poll_timeout: Duration,
    /// Bytes requested per read.
    pub read_chunk: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            read_chunk: 4096,
        }
    }
}

/// What a failed read means for the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadFailure {
    /// Try again on the next round.
    Transient,
    /// The slave side is closed; no more output will arrive.
    HungUp,
    /// Unexpected; retried a bounded number of times.
    Unexpected,
}

/// Sort a read error into retry / hang-up / unexpected.
///
/// Linux reports a closed slave as `EIO` on the master.
pub fn classify_read_error(err: &io::Error) -> ReadFailure {
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock => ReadFailure::Transient,
        _ if err.raw_os_error() == Some(Errno::EIO as i32) => ReadFailure::HungUp,
        _ => ReadFailure::Unexpected,
    }
}

enum Readiness {
    Readable,
    Timeout,
    HungUp,
}

/// Start the collector thread. The thread hands the exit monitor back when
/// it finishes so the owner can reap or kill the child.
pub fn start_collector(
    shared: Arc<SessionShared>,
    reader: File,
    monitor: ExitMonitor,
    notifier: WakeNotifier,
    config: CollectorConfig,
) -> Result<JoinHandle<ExitMonitor>, PtyError> {
    let handle = std::thread::Builder::new()
        .name("ember-collector".into())
        .spawn(move || {
            let mut collector = Collector {
                shared,
                reader,
                monitor,
                notifier,
                config,
            };
            collector.run();
            collector.monitor
        })?;
    Ok(handle)
}

struct Collector {
    shared: Arc<SessionShared>,
    reader: File,
    monitor: ExitMonitor,
    notifier: WakeNotifier,
    config: CollectorConfig,
}

impl Collector {
    fn run(&mut self) {
        let mut buf = vec![0u8; self.config.read_chunk.max(1)];
        let mut failures = 0;

        loop {
            if self.shared.should_exit() {
                debug!("collector for child {:?} asked to stop", self.monitor.pid());
                return;
            }
            self.check_child();

            match self.wait_readable() {
                Readiness::Timeout => {
                    // Nothing left to drain after the child is gone.
                    if self.shared.child_exited() {
                        return;
                    }
                    continue;
                }
                Readiness::HungUp => break,
                Readiness::Readable => {}
            }

            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    failures = 0;
                    self.store(&buf[..n]);
                }
                Err(e) => match classify_read_error(&e) {
                    ReadFailure::Transient => {}
                    ReadFailure::HungUp => break,
                    ReadFailure::Unexpected => {
                        failures += 1;
                        warn!("PTY read failed ({failures}/{MAX_READ_FAILURES}): {e}");
                        if failures >= MAX_READ_FAILURES {
                            break;
                        }
                    }
                },
            }
        }

        info!("PTY for child {:?} hung up", self.monitor.pid());
        self.linger();
    }

    fn wait_readable(&self) -> Readiness {
        let timeout_ms = self.config.poll_timeout.as_millis().min(u16::MAX as u128) as u16;
        let mut fds = [PollFd::new(self.reader.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Readiness::Timeout,
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                    Readiness::Readable
                } else if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    Readiness::HungUp
                } else {
                    Readiness::Timeout
                }
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => Readiness::Timeout,
            Err(e) => {
                warn!("polling PTY failed: {e}");
                Readiness::HungUp
            }
        }
    }

    fn store(&self, data: &[u8]) {
        let mut buffer = self.shared.lock_buffer();
        let outcome = buffer.store(data);
        if outcome.dropped > 0 {
            debug!("scrollback full, dropped {} new bytes", outcome.dropped);
        }
        if outcome.evicted > 0 {
            debug!("scrollback full, evicted {} old bytes", outcome.evicted);
        }
        if buffer.mark_changed() {
            self.notifier.notify();
        }
    }

    fn check_child(&mut self) {
        if let Some(exit) = self.monitor.check() {
            if self.shared.record_exit(exit) && self.shared.lock_buffer().mark_changed() {
                self.notifier.notify();
            }
        }
    }

    /// Give the exit monitor a few rounds to see the child go.
    fn linger(&mut self) {
        for _ in 0..HANGUP_LINGER_ROUNDS {
            if self.shared.should_exit() || self.shared.child_exited() {
                return;
            }
            self.check_child();
            if self.shared.child_exited() {
                return;
            }
            std::thread::sleep(self.config.poll_timeout);
        }
        debug!(
            "PTY hung up but child {:?} has not been reaped",
            self.monitor.pid()
        );
    }
}
