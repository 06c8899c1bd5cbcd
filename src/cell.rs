use parking_lot::{Mutex, RwLock};

use std::{
    any::Any,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::journal::{Entry, Journal};
use crate::term::{Stm, Term, TxValue};
use crate::version::{Version, INITIAL_VERSION};
use crate::wake::{WakeHandle, WakeRegistry};

/// Unique ID for a cell.
pub type CellId = u64;

/// The value can be observed by many fibers, so it is tracked by an `Arc`.
/// Kept dynamic so journals and terms don't have to be generic over every
/// cell type they touch.
pub(crate) type DynValue = Arc<dyn Any + Send + Sync>;

/// Perform a downcast on a dynamic value. Returns an `Arc` so reads don't
/// clone; a value that needs mutating can be cloned out of the `Arc` after
/// being read.
pub(crate) fn downcast<T: Any + Send + Sync>(value: DynValue) -> Arc<T> {
    match value.downcast::<T>() {
        Ok(v) => v,
        Err(_) => unreachable!("TRef has wrong type"),
    }
}

/// Downcast and take ownership, cloning only if the value is still shared.
pub(crate) fn downcast_owned<T: TxValue>(value: DynValue) -> T {
    let arc = downcast::<T>(value);
    Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone())
}

/// A versioned slot. Only accessed through a journal and a [TRef].
#[derive(Clone)]
pub(crate) struct VSlot {
    pub version: Version,
    pub value: DynValue,
}

/// Shared cell state: the live versioned slot plus the wakeup registry of
/// fibers parked on it.
pub(crate) struct SCell {
    pub slot: RwLock<VSlot>,
    pub todos: Mutex<WakeRegistry>,
}

impl SCell {
    /// Register a parked fiber's handle. Caller must hold the commit lock.
    pub fn register_todo(&self, handle: WakeHandle) {
        self.todos.lock().register(handle);
    }

    /// Number of fibers currently parked on this cell.
    pub fn pending_todos(&self) -> usize {
        self.todos.lock().pending()
    }

    /// Empty the registry, returning the handles for the committer to fire
    /// once the commit lock is released.
    pub fn take_todos(&self) -> Vec<WakeHandle> {
        self.todos.lock().take_and_clear()
    }
}

/// Untyped handle to a cell: identity plus shared state. [TRef] wraps this
/// with the value type; terms and journals work on the erased form.
#[derive(Clone)]
pub(crate) struct CellRef {
    pub id: CellId,
    pub cell: Arc<SCell>,
}

impl PartialEq for CellRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CellRef {}

impl CellRef {
    /// Read through the journal. The first touch installs an entry seeded
    /// from the live slot; later touches return the tentative value.
    ///
    /// Not safe in isolation. Callable only from executor code; the live
    /// snapshot it takes is validated again under the commit lock.
    pub fn unsafe_get(&self, journal: &mut Journal) -> DynValue {
        if let Some(entry) = journal.lookup(self.id) {
            return entry.tentative.clone();
        }
        let observed = self.cell.slot.read().clone();
        let value = observed.value.clone();
        journal.add(
            self.id,
            Entry {
                cell: self.cell.clone(),
                observed,
                tentative: value.clone(),
                was_read: true,
                was_written: false,
            },
        );
        value
    }

    /// Write through the journal, installing an entry on first touch.
    ///
    /// Not safe in isolation; see [CellRef::unsafe_get].
    pub fn unsafe_set(&self, journal: &mut Journal, value: DynValue) {
        match journal.lookup_mut(self.id) {
            Some(entry) => {
                entry.was_written = true;
                entry.tentative = value;
            }
            None => {
                let observed = self.cell.slot.read().clone();
                journal.add(
                    self.id,
                    Entry {
                        cell: self.cell.clone(),
                        observed,
                        tentative: value,
                        was_read: false,
                        was_written: true,
                    },
                );
            }
        }
        journal.mark_written();
    }

    /// Current committed version of the cell.
    pub fn live_version(&self) -> Version {
        self.cell.slot.read().version
    }

    /// Number of fibers currently parked on this cell.
    pub fn pending_todos(&self) -> usize {
        self.cell.pending_todos()
    }
}

/// `TRef` is the handle lifting a value into the transactional context;
/// reading and writing go through the journal of the running transaction.
pub struct TRef<T> {
    pub(crate) raw: CellRef,
    phantom: PhantomData<T>,
}

impl<T> Clone for TRef<T> {
    fn clone(&self) -> Self {
        TRef {
            raw: self.raw.clone(),
            phantom: PhantomData,
        }
    }
}

/// Two handles are equal when they point at the same cell.
impl<T> PartialEq for TRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for TRef<T> {}

impl<T> Default for TRef<T>
where
    T: TxValue + Default,
{
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T: TxValue> TRef<T> {
    /// Create a new cell. The initial version is 0, so a cell created in
    /// the middle of a transaction will not conflict during the commit.
    pub fn new(value: T) -> TRef<T> {
        // Shared between all cells.
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        TRef {
            raw: CellRef {
                id: COUNTER.fetch_add(1, Ordering::Relaxed),
                cell: Arc::new(SCell {
                    slot: RwLock::new(VSlot {
                        version: INITIAL_VERSION,
                        value: Arc::new(value),
                    }),
                    todos: Mutex::new(WakeRegistry::default()),
                }),
            },
            phantom: PhantomData,
        }
    }

    /// Read the value of the cell.
    pub fn get<E>(&self) -> Stm<T, E> {
        Stm::from_term(Term::Read(self.raw.clone()))
    }

    /// Replace the value of the cell.
    pub fn set<E>(&self, value: T) -> Stm<(), E> {
        Stm::from_term(Term::Write(self.raw.clone(), Arc::new(value)))
    }

    /// Apply an update to the value of the cell.
    pub fn update<E, F>(&self, f: F) -> Stm<(), E>
    where
        E: TxValue,
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let cell = self.clone();
        self.get().and_then(move |v| cell.set(f(v)))
    }

    /// Apply an update to the value of the cell and return a derived value.
    pub fn modify<R, E, F>(&self, f: F) -> Stm<R, E>
    where
        R: TxValue,
        E: TxValue,
        F: Fn(T) -> (T, R) + Send + Sync + 'static,
    {
        let cell = self.clone();
        self.get().and_then(move |v| {
            let (w, r) = f(v);
            cell.set(w).map(move |_| r.clone())
        })
    }

    /// Replace the value of the cell and return the previous value.
    pub fn replace<E>(&self, value: T) -> Stm<T, E>
    where
        E: TxValue,
    {
        let cell = self.clone();
        self.get().and_then(move |old| {
            let old = old.clone();
            cell.set(value.clone()).map(move |_| old.clone())
        })
    }

    pub(crate) fn id(&self) -> CellId {
        self.raw.id
    }
}
