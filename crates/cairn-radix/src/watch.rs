use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// A one-shot change signal.
///
/// Every tree node owns one. When a mutation supersedes the node the watch
/// is closed, waking every task blocked in [`Watch::closed`]. Closing is
/// idempotent and a closed watch never reopens.
#[derive(Clone)]
pub struct Watch {
    sender: Arc<watch::Sender<bool>>,
}

impl Watch {
    /// Create a new open watch.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Close the watch, waking all waiters.
    pub fn close(&self) {
        self.sender.send_replace(true);
    }

    /// Returns `true` once [`Watch::close`] has been called.
    pub fn is_closed(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait until the watch is closed. Returns immediately if it already is.
    pub async fn closed(&self) {
        let mut receiver = self.sender.subscribe();
        // `self` keeps the sender alive, so the channel cannot drop under us.
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    /// Returns `true` if both handles refer to the same signal.
    pub fn ptr_eq(&self, other: &Watch) -> bool {
        Arc::ptr_eq(&self.sender, &other.sender)
    }
}

impl Default for Watch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("closed", &self.is_closed())
            .finish()
    }
}
