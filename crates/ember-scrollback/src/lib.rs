//! ember-scrollback: scrollback storage for Ember terminal sessions.
//!
//! Holds the bytes a child process wrote to its terminal in a fixed-capacity
//! ring, tracks which part of that history is currently on screen, and cuts
//! printable text windows out of it for whatever draws the screen.
//!
//! # Architecture
//!
//! - [`RingBuffer`] — Circular byte store with an explicit [`OverflowPolicy`].
//! - [`ScrollDirection`] — Line-wise movement of the visible window.
//! - [`Viewport`] / [`extract_window`] — Turns the visible window into lines
//!   no wider and no taller than the screen.

pub mod ring;
pub mod scroll;
pub mod viewport;

pub use ring::{OverflowPolicy, RingBuffer, WriteOutcome};
pub use scroll::ScrollDirection;
pub use viewport::{extract_window, Layout, Viewport, DEFAULT_PLACEHOLDER};
