use std::{convert::Infallible, time::Duration};

use crate::cell::downcast_owned;
use crate::commit;
use crate::exec::{Interp, Outcome};
use crate::sched::{NoopScheduler, Scheduler};
use crate::term::{Defect, Stm, TxValue};
use crate::wake::WakeHandle;

/// How long to wait before re-running a transaction that retried without
/// reading any cell. There is no write that could wake it, so instead of
/// parking a fiber forever we poll at a leisurely pace.
const EMPTY_RETRY_WAIT: Duration = Duration::from_secs(60);

/// How a driven transaction ended, as seen by the scheduler.
///
/// Retry and conflict restarts are invisible; they re-run inside the loop.
#[derive(Debug)]
pub enum TxStatus<T, E> {
    /// Committed; the value was delivered.
    Done(T),
    /// Aborted with an error from the transaction's error channel.
    Aborted(E),
    /// Torn down by a defect; nothing was published.
    Died(Defect),
    /// The scheduler cancelled the fiber at a checkpoint; nothing was
    /// published and no wakeup registration is left behind.
    Interrupted,
}

/// Run a transaction that cannot abort, retrying until it commits.
///
/// Make sure the transaction is free of side effects outside its cells,
/// because it can be executed repeatedly.
pub async fn atomically<T: TxValue>(stm: Stm<T, Infallible>) -> T {
    match atomically_with(&NoopScheduler, stm).await {
        TxStatus::Done(value) => value,
        TxStatus::Aborted(e) => match e {},
        TxStatus::Died(defect) => panic!("{}", defect),
        TxStatus::Interrupted => unreachable!("NoopScheduler never cancels"),
    }
}

/// Run a transaction until it commits a value or aborts with an error.
pub async fn atomically_or_err<T, E>(stm: Stm<T, E>) -> Result<T, E>
where
    T: TxValue,
    E: TxValue,
{
    match atomically_with(&NoopScheduler, stm).await {
        TxStatus::Done(value) => Ok(value),
        TxStatus::Aborted(error) => Err(error),
        TxStatus::Died(defect) => panic!("{}", defect),
        TxStatus::Interrupted => unreachable!("NoopScheduler never cancels"),
    }
}

/// Run a transaction on behalf of a scheduler-managed fiber, exposing
/// defects and cancellation instead of panicking.
pub async fn atomically_with<T, E>(sched: &dyn Scheduler, stm: Stm<T, E>) -> TxStatus<T, E>
where
    T: TxValue,
    E: TxValue,
{
    let term = stm.term;

    loop {
        let mut interp = Interp::new(sched);

        match interp.run(term.clone()) {
            Outcome::Conflict => continue,
            Outcome::Interrupted => return TxStatus::Interrupted,
            Outcome::Success(value) => match commit::commit(&interp.journal) {
                Ok(woken) => {
                    for handle in woken {
                        handle.fire();
                    }
                    return TxStatus::Done(downcast_owned::<T>(value));
                }
                Err(_) => continue,
            },
            Outcome::Failure(error) => match commit::validate(&interp.journal) {
                Ok(()) => return TxStatus::Aborted(downcast_owned::<E>(error)),
                Err(_) => continue,
            },
            Outcome::Die(defect) => match commit::validate(&interp.journal) {
                Ok(()) => return TxStatus::Died(defect),
                Err(_) => continue,
            },
            Outcome::Retry => {
                if !interp.journal.has_reads() {
                    tokio::time::sleep(EMPTY_RETRY_WAIT).await;
                    continue;
                }
                let (handle, receiver) = WakeHandle::pair(sched.current_fiber_id());
                if commit::park_candidate(&interp.journal, &handle).is_ok() {
                    receiver.wait().await;
                }
                if sched.is_cancelled() {
                    return TxStatus::Interrupted;
                }
            }
        }
    }
}
