//! The single stop signal shared by Ctrl-C, the console and the session.

use flume::{Receiver, Sender};
use tokio_util::sync::CancellationToken;

/// Fired once to end the session. Clones observe the same signal.
#[derive(Clone)]
pub struct StopSignal {
    token: CancellationToken,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            token: CancellationToken::new(),
            tx,
            rx,
        }
    }

    pub fn trigger(&self) {
        self.token.cancel();
        let _ = self.tx.try_send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token cancelled when the signal fires, for cooperative loops.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Blocks the calling thread until the signal fires.
    pub fn wait(&self) {
        if self.token.is_cancelled() {
            return;
        }
        // The wake-up is consumed by one waiter; pass it on to the next.
        if self.rx.recv().is_ok() {
            let _ = self.tx.try_send(());
        }
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
