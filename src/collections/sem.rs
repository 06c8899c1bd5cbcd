use crate::cell::TRef;
use crate::term::{retry, Stm, TxValue};

/// Transactional counting semaphore.
///
/// Acquisition blocks by retrying while no permit is available, so waiters
/// wake exactly when a release commits. Composes with any other transaction:
/// acquiring a permit and taking from a queue can be one atomic step.
#[derive(Clone)]
pub struct TSem {
    permits: TRef<usize>,
}

impl TSem {
    pub fn new(permits: usize) -> TSem {
        TSem {
            permits: TRef::new(permits),
        }
    }

    /// Take one permit, blocking while none are available.
    pub fn acquire<E: TxValue>(&self) -> Stm<(), E> {
        self.acquire_n(1)
    }

    /// Take `n` permits atomically, blocking until all are available.
    pub fn acquire_n<E: TxValue>(&self, n: usize) -> Stm<(), E> {
        let permits = self.permits.clone();
        self.permits.get().and_then(move |available| {
            if available < n {
                retry()
            } else {
                permits.set(available - n)
            }
        })
    }

    /// Return one permit.
    pub fn release<E: TxValue>(&self) -> Stm<(), E> {
        self.release_n(1)
    }

    /// Return `n` permits.
    pub fn release_n<E: TxValue>(&self, n: usize) -> Stm<(), E> {
        self.permits.update(move |available| available + n)
    }

    /// Number of permits currently available.
    pub fn available<E: TxValue>(&self) -> Stm<usize, E> {
        self.permits.get()
    }

    /// Run an async closure while holding one permit, releasing it on the
    /// way out.
    pub async fn with_permit<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        crate::atomically(self.acquire()).await;
        let result = f().await;
        crate::atomically(self.release()).await;
        result
    }
}
