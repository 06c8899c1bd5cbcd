use std::{
    future::Future,
    mem,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Deferred release action registered with a [Scope].
pub type Finalizer = Box<dyn FnOnce() -> BoxFuture + Send + 'static>;

/// Structured scope collaborator: owns the release actions of resources
/// acquired within it and runs them exactly once, newest first, when the
/// scope exits.
///
/// Scoped hub subscriptions register their unsubscribe here; see
/// [crate::collections::subscribe_scoped].
pub struct Scope {
    finalizers: Mutex<Vec<Finalizer>>,
    closed: AtomicBool,
}

impl Scope {
    pub fn new() -> Scope {
        Scope {
            finalizers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a release action to run on scope exit.
    ///
    /// Panics if the scope has already closed: a finalizer added after exit
    /// could never run, which would break the exactly-once guarantee.
    pub fn add_finalizer<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            panic!("finalizer added to a closed scope");
        }
        self.finalizers
            .lock()
            .push(Box::new(move || Box::pin(f()) as BoxFuture));
    }

    /// Exit the scope, running every finalizer once in LIFO order.
    /// Subsequent calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let finalizers = mem::take(&mut *self.finalizers.lock());
        for finalizer in finalizers.into_iter().rev() {
            finalizer().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}
