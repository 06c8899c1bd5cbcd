use parking_lot::Mutex;

use crate::journal::Journal;
use crate::wake::WakeHandle;

/// The commit lock: one global mutex serialising validation, publication and
/// retry-parks. Transaction bodies run outside it; only the journal walk in
/// here runs under it.
static COMMIT_LOCK: Mutex<()> = Mutex::new(());

/// The journal no longer matches the live cells; the attempt must re-run
/// from scratch.
pub(crate) struct Conflict;

/// Validate and publish a completed journal.
///
/// On success every written entry's tentative value becomes the cell's live
/// value, its version is bumped, and the handles parked on the written cells
/// are returned for the caller to fire once the lock has been released.
pub(crate) fn commit(journal: &Journal) -> Result<Vec<WakeHandle>, Conflict> {
    let guard = COMMIT_LOCK.lock();

    if journal.is_invalid() {
        tracing::trace!(target: "fiber_stm::commit", "journal invalidated, restarting");
        return Err(Conflict);
    }

    let mut woken = Vec::new();
    let mut published = 0usize;
    for entry in journal.entries() {
        if !entry.was_written {
            continue;
        }
        {
            let mut slot = entry.cell.slot.write();
            slot.version += 1;
            slot.value = entry.tentative.clone();
        }
        woken.append(&mut entry.cell.take_todos());
        published += 1;
    }

    drop(guard);

    if published > 0 {
        tracing::trace!(
            target: "fiber_stm::commit",
            cells = published,
            woken = woken.len(),
            "transaction committed"
        );
    }

    Ok(woken)
}

/// Validate a journal whose outcome publishes nothing (Failure, a defect, or
/// a read-only success). The lock acquisition is the linearisation point; an
/// invalid journal means the outcome was derived from a stale snapshot and
/// may not be surfaced.
pub(crate) fn validate(journal: &Journal) -> Result<(), Conflict> {
    let _guard = COMMIT_LOCK.lock();
    if journal.is_invalid() {
        return Err(Conflict);
    }
    Ok(())
}

/// Register a retrying transaction in the registries of every cell it
/// observed, unless the journal has already been invalidated, in which case
/// the fiber must re-run immediately instead of parking.
///
/// Registration happens under the same lock as publication, so a writer
/// either commits before us (we see the version change here) or after us
/// (it finds our handle and fires it). No wakeup can be missed.
pub(crate) fn park_candidate(journal: &Journal, handle: &WakeHandle) -> Result<(), Conflict> {
    let _guard = COMMIT_LOCK.lock();

    if journal.is_invalid() {
        return Err(Conflict);
    }

    let mut registered = 0usize;
    for entry in journal.entries() {
        if entry.was_read {
            entry.cell.register_todo(handle.clone());
            registered += 1;
        }
    }
    tracing::trace!(
        target: "fiber_stm::commit",
        fiber = handle.fiber(),
        cells = registered,
        "parked on retry"
    );
    Ok(())
}
