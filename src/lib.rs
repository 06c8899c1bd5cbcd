//! Software transactional memory for cooperatively scheduled fibers.
//!
//! A transaction is a pure description of reads and writes over [TRef]
//! cells, built from combinators and interpreted by the runtime. The
//! attempt runs optimistically against a private journal; validation and
//! publication happen under a single commit lock, and a transaction that
//! called [retry] parks until one of the cells it observed is written.
//!
//! Make sure transactions are free of side effects beyond their cells,
//! because conflicts re-execute them from scratch.

mod cell;
mod commit;
mod exec;
mod journal;
mod ops;
mod sched;
mod scope;
mod term;
mod version;
mod wake;

/// `TRef` is the public interface to lift data into the transactional
/// context for subsequent read and write operations.
pub use cell::{CellId, TRef};

/// The primary verbs to build and run STM transactions.
pub use ops::{atomically, atomically_or_err, atomically_with, TxStatus};
pub use term::{
    check, die, fail, guard, interrupt, retry, succeed, sync, with_env, Defect, Stm, TxEnv,
    TxValue,
};

/// Collaborator interfaces: fiber identity and cancellation, scoped
/// resource release.
pub use sched::{FiberId, FlagScheduler, NoopScheduler, Scheduler};
pub use scope::{Finalizer, Scope};
pub use version::Version;
pub use wake::{WakeHandle, WakeReceiver};

/// Transactional collections built on the core runtime.
#[cfg(feature = "collections")]
pub mod collections;

#[cfg(feature = "collections")]
pub use collections::{
    subscribe_scoped, ShutdownError, Strategy, Subscription, THub, TQueue, TSem,
};

#[cfg(test)]
mod test;
