//! Cross-thread "something changed, redraw" signal.
//!
//! A single-slot channel: any number of notifications sent before the
//! consumer drains the slot collapse into one. Sending never blocks, so the
//! collector can notify while it holds the buffer lock.

use log::debug;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// Create a connected notifier/receiver pair.
pub fn wake_channel() -> (WakeNotifier, WakeReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (WakeNotifier { tx }, WakeReceiver { rx })
}

/// Producer half, held by the output collector.
#[derive(Clone, Debug)]
pub struct WakeNotifier {
    tx: mpsc::Sender<()>,
}

impl WakeNotifier {
    /// Fire-and-forget. A pending, undrained wake absorbs this one.
    pub fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => debug!("wake receiver is gone"),
        }
    }
}

/// Consumer half, polled by the event loop.
#[derive(Debug)]
pub struct WakeReceiver {
    rx: mpsc::Receiver<()>,
}

impl WakeReceiver {
    /// Wait for the next wake. Returns `false` once every notifier is dropped.
    pub async fn wait(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Drain a pending wake without waiting.
    pub fn try_take(&mut self) -> bool {
        match self.rx.try_recv() {
            Ok(()) => true,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
        }
    }
}
