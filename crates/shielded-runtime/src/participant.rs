use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::Context;

/// Capability contract every transactional object implements.
///
/// The runner never downcasts a `Participant` to do its job; it only calls
/// through this trait during the commit protocol. Cells and dictionaries
/// additionally expose a typed API to their own owners that the runner
/// never sees.
pub trait Participant: Send + Sync {
    /// Stable identifier assigned at construction. Used to deduplicate
    /// enlistment, to order commit-protocol calls, and to key this
    /// participant's slot in a transaction's local state.
    fn id(&self) -> u64;

    /// True iff this participant has a non-empty write set in `ctx`.
    fn has_changes(&self, ctx: &Context) -> bool;

    /// Validates this participant's read and write sets against the
    /// current committed state and, if valid, acquires the locks needed to
    /// publish at `write_stamp`. Must not have any other observable side
    /// effect, and must be safe to call more than once for the same `ctx`.
    fn can_commit(&self, ctx: &Context, write_stamp: u64) -> bool;

    /// Publishes this participant's write set as new version-chain nodes
    /// carrying `write_stamp`, releases the matching locks, and clears
    /// local state. Returns true iff anything was actually published.
    /// Only called after `can_commit` returned true.
    fn commit(&self, ctx: &Context, write_stamp: u64) -> bool;

    /// Clears local state and releases any lock this participant is
    /// holding for `ctx`, whether acquired by `can_commit` or eagerly
    /// during commute resolution.
    fn rollback(&self, ctx: &Context, write_stamp: Option<u64>);

    /// Drops version-chain nodes no open transaction with a start stamp
    /// `<= min_open` could still need.
    fn trim_copies(&self, min_open: u64);
}

static NEXT_PARTICIPANT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh, process-wide unique participant id.
pub(crate) fn next_participant_id() -> u64 {
    NEXT_PARTICIPANT_ID.fetch_add(1, Ordering::Relaxed)
}
