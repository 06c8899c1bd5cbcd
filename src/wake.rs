use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::sched::FiberId;

/// One-shot token that resumes a parked fiber.
///
/// The same handle is registered in the registry of every cell the parked
/// transaction observed; the first committed write to any of them fires it.
/// Firing is idempotent: at most one resumption per park, no matter how many
/// registries still hold the handle.
///
/// The resume signal travels over an unbounded channel so the writer never
/// blocks on a slow waker.
#[derive(Clone)]
pub struct WakeHandle {
    fiber: FiberId,
    sender: tokio::sync::mpsc::UnboundedSender<()>,
    fired: Arc<AtomicBool>,
}

/// The parked side of a [WakeHandle] pair.
pub struct WakeReceiver {
    receiver: tokio::sync::mpsc::UnboundedReceiver<()>,
}

impl WakeHandle {
    /// Create a connected handle/receiver pair for one park.
    pub fn pair(fiber: FiberId) -> (WakeHandle, WakeReceiver) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (
            WakeHandle {
                fiber,
                sender,
                fired: Arc::new(AtomicBool::new(false)),
            },
            WakeReceiver { receiver },
        )
    }

    /// Identity of the fiber this handle belongs to.
    pub fn fiber(&self) -> FiberId {
        self.fiber
    }

    /// Resume the parked fiber. Only the first call sends the signal.
    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(());
        }
    }

    /// True once [WakeHandle::fire] has been called on this handle or a clone of it.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// True when the parked fiber has gone away, either because it was
    /// already resumed through another cell or because it was cancelled.
    fn is_dead(&self) -> bool {
        self.is_fired() || self.sender.is_closed()
    }
}

impl WakeReceiver {
    /// Park until the paired handle fires.
    ///
    /// A dropped handle set also wakes us up; in that case the caller will
    /// simply re-run its transaction and park again if nothing changed.
    pub async fn wait(mut self) {
        let _ = self.receiver.recv().await;
    }
}

/// Per-cell set of pending wakeups.
///
/// Mutated only while the commit lock is held, which is what makes
/// register-then-park safe against concurrent writers: a writer either takes
/// the lock after us and finds our handle, or took it before us, in which
/// case our final validation sees the version change and we restart instead
/// of parking.
pub(crate) struct WakeRegistry {
    waiting: Vec<WakeHandle>,
    /// Highest number of waiters seen so far, used as the pruning threshold.
    max_waiting: usize,
}

impl WakeRegistry {
    pub fn new() -> Self {
        WakeRegistry {
            waiting: Vec::new(),
            max_waiting: 1,
        }
    }

    /// Register a handle to be fired on the next committed write to the cell.
    pub fn register(&mut self, handle: WakeHandle) {
        self.prune();
        self.waiting.push(handle);
    }

    /// Empty the registry and hand its contents to the committer, which
    /// fires them after releasing the commit lock.
    pub fn take_and_clear(&mut self) -> Vec<WakeHandle> {
        std::mem::take(&mut self.waiting)
    }

    pub fn pending(&self) -> usize {
        self.waiting.len()
    }

    /// Whenever the waiting set hits a new record size, drop handles whose
    /// fiber has already been resumed through some other cell. This keeps a
    /// frequently-read but never-written cell from accumulating dead
    /// registrations.
    fn prune(&mut self) {
        if self.waiting.len() > self.max_waiting {
            self.waiting.retain(|h| !h.is_dead());
            self.max_waiting = self.max_waiting.max(self.waiting.len());
        }
    }
}

impl Default for WakeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
