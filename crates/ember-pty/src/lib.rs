//! ember-pty: PTY sessions for Ember.
//!
//! This crate sits between a child process running on a pseudo-terminal and
//! the scrollback that holds its output. It launches the child, collects what
//! it prints, notices when it exits, and writes user input back to it.
//!
//! # Architecture
//!
//! - [`PtyHandle`] — Opens the PTY pair and starts the child with a clean environment.
//! - [`ExitMonitor`] — Reaps the child after `SIGCHLD` without blocking.
//! - [`start_collector`] — Dedicated thread that reads output into scrollback.
//! - [`InputWriter`] — Forwards text and control keys to the child.
//! - [`wake_channel`] — Coalescing "redraw needed" signal for the event loop.
//! - [`Session`] — Ties all of the above together for one child.

pub mod collector;
pub mod exit_monitor;
pub mod pty;
pub mod session;
pub mod wake;
pub mod writer;

pub use collector::{start_collector, CollectorConfig};
pub use exit_monitor::{install_sigchld_handler, ChildExit, ExitMonitor};
pub use pty::{LaunchConfig, PtyError, PtyHandle, DEFAULT_TERM};
pub use session::{Session, SessionBuffer, SessionConfig, SessionShared, DEFAULT_SCROLLBACK_BYTES};
pub use wake::{wake_channel, WakeNotifier, WakeReceiver};
pub use writer::{ControlKey, InputWriter};
