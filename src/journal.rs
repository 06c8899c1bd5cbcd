use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cell::{CellId, DynValue, SCell, VSlot};

/// State of one cell as seen by one transaction attempt.
///
/// At most one entry per cell exists in a journal. The first touch seeds
/// `observed` from the live slot; all later reads and writes go through
/// `tentative`.
#[derive(Clone)]
pub(crate) struct Entry {
    /// The shared cell the entry belongs to, needed at commit time.
    pub cell: Arc<SCell>,
    /// Version and value of the live slot at first touch, for validation
    /// and for recovering the read footprint of an abandoned branch.
    pub observed: VSlot,
    /// The in-transaction value, replaced on every write.
    pub tentative: DynValue,
    /// The live value was observed; these are the cells to watch on retry.
    pub was_read: bool,
    /// The cell must be published at commit time.
    pub was_written: bool,
}

impl Entry {
    /// A copy of this entry carrying only its read footprint, with the
    /// tentative state rolled back to what was originally observed.
    fn as_read(&self) -> Entry {
        Entry {
            cell: self.cell.clone(),
            observed: self.observed.clone(),
            tentative: self.observed.value.clone(),
            was_read: true,
            was_written: false,
        }
    }
}

/// Per-attempt log of observed and tentatively written cell states.
///
/// A journal is exclusively owned by one transaction attempt and discarded
/// on commit or abort. The map is keyed by cell identity, ordered so the
/// commit walk is deterministic.
#[derive(Clone)]
pub(crate) struct Journal {
    entries: BTreeMap<CellId, Entry>,
    read_only: bool,
}

impl Journal {
    pub fn new() -> Journal {
        Journal {
            entries: BTreeMap::new(),
            read_only: true,
        }
    }

    pub fn add(&mut self, id: CellId, entry: Entry) {
        self.entries.insert(id, entry);
    }

    pub fn lookup(&self, id: CellId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn lookup_mut(&mut self, id: CellId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Flip the read-only flag; called on the first write.
    pub fn mark_written(&mut self) {
        self.read_only = false;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True when the transaction has observed at least one live cell, so a
    /// retry has something to wake up on.
    pub fn has_reads(&self) -> bool {
        self.entries.values().any(|e| e.was_read)
    }

    /// The sole validation predicate: the journal is invalid as soon as any
    /// entry's observed version differs from the cell's current version.
    pub fn is_invalid(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.cell.slot.read().version != e.observed.version)
    }

    /// Merge the read footprint of an abandoned `or_try` branch.
    ///
    /// The overall transaction must stay observant of every cell the branch
    /// read, so its retry wakes when any of them changes; the branch's
    /// writes must not leak.
    pub fn merge_reads(&mut self, attempted: Journal) {
        for (id, entry) in attempted.entries {
            if entry.was_read && !self.entries.contains_key(&id) {
                self.entries.insert(id, entry.as_read());
            }
        }
    }
}
