use std::collections::HashMap;

use bytes::Bytes;
use relay_wire::Hash256;

/// Implemented by any content-addressed set the background deduper should
/// sweep for identical payloads held by more than one set.
///
/// Every method is non-blocking: the deduper must never contend with a
/// connection thread doing real work, so a set that cannot currently be
/// locked is simply skipped for this sweep pass.
pub trait Dedupable: Send + Sync {
    /// Sets that intentionally allow duplicate payload instances (e.g. a
    /// scratch buffer) are never swept.
    fn allow_dups(&self) -> bool;

    /// Collects `(content hash, payload handle)` for every live entry,
    /// stopping early if another caller starts waiting on the lock mid-walk.
    /// Returns `None` if the lock is currently held elsewhere.
    fn snapshot_for_dedup(&self) -> Option<Vec<(Hash256, Bytes)>>;

    /// Replaces any live entry whose hash is a key of `canonical` with a
    /// clone of the canonical handle, when the entry isn't already pointing
    /// at that same allocation. Returns the number of entries deduped, or
    /// `None` if the lock is currently held elsewhere.
    fn apply_dedup(&self, canonical: &HashMap<Hash256, Bytes>) -> Option<usize>;
}
