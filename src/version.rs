/// Version of a cell's committed value.
///
/// Every committed write to a cell bumps its version by one, so the version
/// equals the number of commits that wrote the cell. A transaction that
/// observed version `v` and finds the live version different at validation
/// time has read an inconsistent snapshot and must restart.
pub type Version = u64;

/// Version of a freshly created cell.
///
/// Starting at 0 means a cell allocated in the middle of a transaction
/// cannot cause a conflict when that transaction commits.
pub const INITIAL_VERSION: Version = 0;
