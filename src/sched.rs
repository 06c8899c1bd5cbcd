use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Identity of a fiber as assigned by the enclosing scheduler.
pub type FiberId = u64;

/// Interface to the fiber scheduler that drives transactions.
///
/// The runtime never parks or resumes fibers through this trait; parking is
/// realised by awaiting a [crate::wake::WakeReceiver] and resuming by firing
/// the matching [crate::wake::WakeHandle]. What the runtime needs from the
/// scheduler is fiber identity and a cancellation signal, which the executor
/// consults at deterministic checkpoints between primitives.
pub trait Scheduler: Send + Sync {
    /// Identity of the fiber running the current transaction attempt.
    fn current_fiber_id(&self) -> FiberId;

    /// True when the current fiber has been cancelled. The executor aborts
    /// the attempt at the next checkpoint without publishing anything.
    fn is_cancelled(&self) -> bool;
}

/// Scheduler for callers without a fiber fabric: a single anonymous fiber
/// that is never cancelled. Backs [crate::atomically] and
/// [crate::atomically_or_err].
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn current_fiber_id(&self) -> FiberId {
        0
    }

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Scheduler backed by a shared cancellation flag.
#[derive(Clone)]
pub struct FlagScheduler {
    fiber: FiberId,
    cancelled: Arc<AtomicBool>,
}

impl FlagScheduler {
    pub fn new(fiber: FiberId) -> Self {
        FlagScheduler {
            fiber,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation; observed by the executor at its next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl Scheduler for FlagScheduler {
    fn current_fiber_id(&self) -> FiberId {
        self.fiber
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
