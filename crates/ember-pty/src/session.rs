use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use ember_scrollback::{OverflowPolicy, RingBuffer, ScrollDirection, Viewport, WriteOutcome};
use log::{debug, info, warn};

use crate::collector::{start_collector, CollectorConfig};
use crate::exit_monitor::{install_sigchld_handler, kill_orphan, ChildExit, ExitMonitor};
use crate::pty::{LaunchConfig, PtyError, PtyHandle, PtyMaster};
use crate::wake::WakeNotifier;
use crate::writer::{ControlKey, InputWriter};

/// Default scrollback size in bytes.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 64 * 1024;

/// Scrollback plus the "needs redraw" flag, guarded together.
#[derive(Debug)]
pub struct SessionBuffer {
    ring: RingBuffer,
    buff_changed: bool,
}

impl SessionBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            ring: RingBuffer::new(capacity, policy),
            buff_changed: false,
        }
    }

    /// Store child output.
    pub fn store(&mut self, data: &[u8]) -> WriteOutcome {
        self.ring.write(data)
    }

    /// Flag the contents as changed. Returns `false` if a redraw was
    /// already pending.
    pub fn mark_changed(&mut self) -> bool {
        !std::mem::replace(&mut self.buff_changed, true)
    }

    /// Clear and return the pending-redraw flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.buff_changed)
    }

    pub fn scroll(&mut self, direction: ScrollDirection, lines: usize) -> usize {
        self.ring.scroll(direction, lines)
    }

    /// Anchor the window on the newest output.
    ///
    /// A [`OverflowPolicy::DropNewest`] ring never evicts, so once it is full
    /// new output would be dropped for good. Bytes above the window are
    /// released here to make room. Returns how many were released.
    pub fn follow_newest(&mut self, viewport: Viewport) -> usize {
        viewport.scroll_to_bottom(&mut self.ring);
        if self.ring.policy().overwrites_oldest() {
            return 0;
        }
        let released = self.ring.consume(self.ring.hidden_len());
        if released > 0 {
            debug!("released {released} scrolled-off bytes");
        }
        released
    }

    /// Whether the window reaches the newest output.
    pub fn at_bottom(&self, viewport: Viewport) -> bool {
        viewport.shows_bottom(&self.ring)
    }

    pub fn extract_window(&self, viewport: Viewport, placeholder: u8) -> Vec<String> {
        viewport.extract(&self.ring, placeholder)
    }
}

/// State shared between the session owner and its collector thread.
#[derive(Debug)]
pub struct SessionShared {
    buffer: Mutex<SessionBuffer>,
    should_exit: AtomicBool,
    child_exited: AtomicBool,
    exit: OnceLock<ChildExit>,
}

impl SessionShared {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            buffer: Mutex::new(SessionBuffer::new(capacity, policy)),
            should_exit: AtomicBool::new(false),
            child_exited: AtomicBool::new(false),
            exit: OnceLock::new(),
        }
    }

    /// Lock the scrollback. A panic on another thread does not make the
    /// bytes invalid, so a poisoned lock is recovered.
    pub fn lock_buffer(&self) -> MutexGuard<'_, SessionBuffer> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask the collector to stop at its next check.
    pub fn request_exit(&self) {
        self.should_exit.store(true, Ordering::SeqCst);
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::SeqCst)
    }

    pub fn child_exited(&self) -> bool {
        self.child_exited.load(Ordering::SeqCst)
    }

    pub fn exit(&self) -> Option<ChildExit> {
        self.exit.get().copied()
    }

    /// Publish the child's exit. Returns `true` the first time only.
    pub(crate) fn record_exit(&self, exit: ChildExit) -> bool {
        let first = self.exit.set(exit).is_ok();
        self.child_exited.store(true, Ordering::SeqCst);
        first
    }
}

/// Everything needed to start a session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub launch: LaunchConfig,
    /// Backing array size of the scrollback ring.
    pub scrollback_bytes: usize,
    pub policy: OverflowPolicy,
    pub poll_timeout: Duration,
    pub read_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let collector = CollectorConfig::default();
        Self {
            launch: LaunchConfig::default(),
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            policy: OverflowPolicy::default(),
            poll_timeout: collector.poll_timeout,
            read_chunk: collector.read_chunk,
        }
    }
}

/// A child process on its own PTY, with its output collected into scrollback.
///
/// Output is gathered on a dedicated thread; the session owner writes input,
/// scrolls and extracts windows through [`Session::buffer`]. Dropping the
/// session stops the collector and kills the child if it is still running.
pub struct Session {
    shared: Arc<SessionShared>,
    master: PtyMaster,
    input: InputWriter<Box<dyn Write + Send>>,
    collector: Option<JoinHandle<ExitMonitor>>,
    pid: Option<u32>,
}

impl Session {
    /// Launch `config.launch` and start collecting its output.
    ///
    /// `notifier` fires whenever new output lands or the child exits.
    pub fn spawn(config: &SessionConfig, notifier: WakeNotifier) -> Result<Self, PtyError> {
        install_sigchld_handler();

        let handle = PtyHandle::spawn(&config.launch)?;
        let PtyHandle {
            master,
            writer,
            child,
        } = handle;

        let mut monitor = ExitMonitor::new(child);
        let pid = monitor.pid();
        let shared = Arc::new(SessionShared::new(config.scrollback_bytes, config.policy));

        let reader = match master.clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                monitor.terminate();
                return Err(e);
            }
        };
        let collector_config = CollectorConfig {
            poll_timeout: config.poll_timeout,
            read_chunk: config.read_chunk,
        };
        let collector = match start_collector(
            Arc::clone(&shared),
            reader,
            monitor,
            notifier,
            collector_config,
        ) {
            Ok(collector) => collector,
            Err(e) => {
                // The monitor went down with the thread that never started.
                if let Some(pid) = pid {
                    kill_orphan(pid);
                }
                return Err(e);
            }
        };

        Ok(Self {
            shared,
            master,
            input: InputWriter::new(writer),
            collector: Some(collector),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    /// Lock the scrollback for scrolling or extraction.
    pub fn buffer(&self) -> MutexGuard<'_, SessionBuffer> {
        self.shared.lock_buffer()
    }

    /// Send user text, isolating carriage returns.
    pub fn write_input(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.input.write(data)
    }

    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.input.write_raw(data)
    }

    pub fn send_control(&mut self, key: ControlKey) -> Result<(), PtyError> {
        self.input.send_control(key)
    }

    pub fn erase_last(&mut self) -> Result<(), PtyError> {
        self.input.erase_last()
    }

    /// Change the window size seen by the child.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master.resize(cols, rows)
    }

    pub fn child_exited(&self) -> bool {
        self.shared.child_exited()
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.shared.exit().map(|exit| exit.code)
    }

    /// Stop collecting and make sure the child is gone.
    pub fn shutdown(mut self) -> Option<ChildExit> {
        self.stop()
    }

    fn stop(&mut self) -> Option<ChildExit> {
        let collector = self.collector.take()?;
        self.shared.request_exit();

        match collector.join() {
            Ok(mut monitor) => {
                if let Some(exit) = monitor.terminate() {
                    self.shared.record_exit(exit);
                }
                info!("session for child {:?} shut down", self.pid);
            }
            Err(_) => {
                warn!("collector thread for child {:?} panicked", self.pid);
                if let Some(exit) = self.pid.and_then(kill_orphan) {
                    self.shared.record_exit(exit);
                }
            }
        }
        self.shared.exit()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wake::wake_channel;
    use std::thread;
    use std::time::Instant;

    fn sh(script: &str) -> SessionConfig {
        SessionConfig {
            launch: LaunchConfig {
                argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
                ..LaunchConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    fn screen(session: &Session) -> String {
        let buffer = session.buffer();
        buffer
            .extract_window(Viewport::new(200, 100), b'?')
            .join("\n")
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_buffer_change_flag() {
        let mut buffer = SessionBuffer::new(16, OverflowPolicy::EvictOldest);
        assert!(!buffer.take_changed());
        assert!(buffer.mark_changed());
        assert!(!buffer.mark_changed());
        assert!(buffer.take_changed());
        assert!(!buffer.take_changed());
    }

    #[test]
    fn test_drop_newest_keeps_taking_output_while_following() {
        let mut buffer = SessionBuffer::new(32, OverflowPolicy::DropNewest);
        for n in 1..=6 {
            buffer.store(format!("line{n}\n").as_bytes());
        }
        let viewport = Viewport::new(20, 3);
        assert!(buffer.follow_newest(viewport) > 0);
        assert_eq!(buffer.extract_window(viewport, b'?'), vec!["line4", "line5", "l"]);

        assert_eq!(buffer.store(b"fresh\n").dropped, 0);
        buffer.follow_newest(viewport);
        assert_eq!(
            buffer.extract_window(viewport, b'?'),
            vec!["line4", "line5", "lfresh"]
        );
    }

    #[test]
    fn test_evict_oldest_keeps_history_while_following() {
        let mut buffer = SessionBuffer::new(256, OverflowPolicy::EvictOldest);
        buffer.store(b"1\n2\n3\n4\n");
        let viewport = Viewport::new(10, 2);
        assert_eq!(buffer.follow_newest(viewport), 0);
        assert!(buffer.at_bottom(viewport));
        assert_eq!(buffer.scroll(ScrollDirection::Up, 2), 2);
        assert!(!buffer.at_bottom(viewport));
        assert_eq!(buffer.extract_window(viewport, b'?'), vec!["1", "2"]);
    }

    #[test]
    fn test_record_exit_once() {
        let shared = SessionShared::new(16, OverflowPolicy::EvictOldest);
        assert!(!shared.child_exited());
        assert!(shared.record_exit(ChildExit { code: 2 }));
        assert!(!shared.record_exit(ChildExit { code: 9 }));
        assert!(shared.child_exited());
        assert_eq!(shared.exit(), Some(ChildExit { code: 2 }));
    }

    #[test]
    fn test_collects_output() {
        let (notifier, mut wake) = wake_channel();
        let session = Session::spawn(&sh("echo hello-ember; sleep 5"), notifier).unwrap();
        assert!(wait_until(|| screen(&session).contains("hello-ember")));
        assert!(wake.try_take());
        assert!(session.buffer().take_changed());
    }

    #[test]
    fn test_term_is_exported() {
        let (notifier, _wake) = wake_channel();
        let session = Session::spawn(&sh("echo \"term=$TERM\"; sleep 5"), notifier).unwrap();
        assert!(wait_until(|| screen(&session).contains("term=ember")));
    }

    #[test]
    fn test_records_exit_code() {
        let (notifier, _wake) = wake_channel();
        let session = Session::spawn(&sh("exit 4"), notifier).unwrap();
        assert!(wait_until(|| session.child_exited()));
        assert_eq!(session.exit_code(), Some(4));
        assert_eq!(session.shutdown(), Some(ChildExit { code: 4 }));
    }

    #[test]
    fn test_input_reaches_child() {
        let (notifier, _wake) = wake_channel();
        let mut session = Session::spawn(&sh("read line; echo \"got:$line\"; sleep 5"), notifier).unwrap();
        session.write_input(b"ping\r").unwrap();
        assert!(wait_until(|| screen(&session).contains("got:ping")));
    }

    #[test]
    fn test_shutdown_kills_running_child() {
        let (notifier, _wake) = wake_channel();
        let session = Session::spawn(&sh("sleep 30"), notifier).unwrap();
        assert!(!session.child_exited());
        let started = Instant::now();
        assert!(session.shutdown().is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_stop_kills_child_when_collector_panicked() {
        let (notifier, _wake) = wake_channel();
        let mut session = Session::spawn(&sh("sleep 30"), notifier).unwrap();
        let pid = session.pid().unwrap();
        // Stand in a collector that died without handing the monitor back.
        session.collector = Some(thread::spawn(|| -> ExitMonitor { panic!("collector died") }));

        session.shutdown();
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
        assert_eq!(alive, Err(nix::errno::Errno::ESRCH));
    }

    #[test]
    fn test_resize_running_session() {
        let (notifier, _wake) = wake_channel();
        let session = Session::spawn(&sh("sleep 5"), notifier).unwrap();
        assert!(session.resize(100, 30).is_ok());
    }

    #[test]
    fn test_spawn_failure_is_fatal() {
        let (notifier, _wake) = wake_channel();
        let config = SessionConfig {
            launch: LaunchConfig {
                argv: vec!["/nonexistent/ember-test-binary".into()],
                ..LaunchConfig::default()
            },
            ..SessionConfig::default()
        };
        let err = Session::spawn(&config, notifier).err().expect("spawn should fail");
        assert!(err.is_fatal());
    }
}
