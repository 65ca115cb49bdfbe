use std::collections::HashMap;

use bytes::Bytes;
use relay_wire::{double_sha256, Hash256};

use crate::dedupable::Dedupable;
use crate::error::FasError;
use crate::wait_mutex::WaitCountMutex;

struct BackingEntry {
    /// Monotonic sequence number assigned at insertion time; the external
    /// index of a live entry is always `seq - offset`.
    seq: u64,
    flag: bool,
    payload: Bytes,
}

#[derive(Clone, Copy)]
struct IndexSlot {
    hash: Hash256,
    alive: bool,
}

struct Inner {
    max_size: usize,
    allow_dups: bool,
    offset: u64,
    flag_count: usize,
    flags_to_remove: usize,
    max_remove: i64,
    backing: HashMap<Hash256, BackingEntry>,
    index_map: Vec<IndexSlot>,
    to_be_removed: Vec<usize>,
    partially_removed: Vec<usize>,
}

impl Inner {
    fn live_len(&self) -> usize {
        self.index_map.len() - self.to_be_removed.len() - self.partially_removed.len()
    }

    /// Removes the entry at `index`, patching whichever side of the vector
    /// is shorter rather than always shifting the tail. Removing from the
    /// front half bumps `offset` instead of touching every later entry;
    /// removing from the back half patches only the entries after it.
    fn remove_at(&mut self, index: usize, partial: bool) {
        debug_assert!(partial || self.partially_removed.is_empty());
        let slot = self.index_map[index];
        debug_assert!(slot.alive);

        if let Some(entry) = self.backing.get(&slot.hash) {
            if entry.flag {
                self.flag_count -= 1;
            }
        }

        let size = self.index_map.len();
        if index < size / 2 {
            for i in 0..index {
                if self.index_map[i].alive {
                    let h = self.index_map[i].hash;
                    if let Some(e) = self.backing.get_mut(&h) {
                        e.seq += 1;
                    }
                }
            }
            self.offset += 1;
        } else {
            for i in (index + 1)..size {
                if self.index_map[i].alive {
                    let h = self.index_map[i].hash;
                    if let Some(e) = self.backing.get_mut(&h) {
                        e.seq -= 1;
                    }
                }
            }
        }

        self.backing.remove(&slot.hash);
        if !partial {
            self.index_map.remove(index);
        } else {
            self.partially_removed.push(index);
            self.index_map[index].alive = false;
        }
    }

    /// Flushes deferred index-based removals.
    ///
    /// Processed in descending position order rather than the order the
    /// removals were requested in: removing a lower position first would
    /// shift every higher deferred position out from under it.
    fn cleanup_late_remove(&mut self) {
        if !self.to_be_removed.is_empty() {
            let mut indices = std::mem::take(&mut self.to_be_removed);
            indices.sort_unstable_by(|a, b| b.cmp(a));
            for i in indices {
                self.remove_at(i, false);
            }
            self.max_remove = 0;
            self.flags_to_remove = 0;
        }
    }

    fn cleanup_partially_removed(&mut self) {
        if !self.partially_removed.is_empty() {
            let mut indices = std::mem::take(&mut self.partially_removed);
            indices.sort_unstable();
            for &i in indices.iter().rev() {
                debug_assert!(!self.index_map[i].alive);
                self.index_map.remove(i);
            }
        }
    }

    fn cleanup_all(&mut self) {
        self.cleanup_partially_removed();
        self.cleanup_late_remove();
    }

    fn sanity_check(&self) -> bool {
        let size = self.index_map.len();
        if self.backing.len() + self.partially_removed.len() != size {
            return false
        }
        // `backing` still holds an entry for every slot in `to_be_removed`
        // (deferred index-removal leaves the backing entry in place until
        // `cleanup_late_remove` compacts it), so it overcounts `live_len()`
        // by exactly that many pending entries.
        if self.backing.len() != self.live_len() + self.to_be_removed.len() {
            return false
        }

        let mut expected_flags = 0;
        for slot in &self.index_map {
            if !slot.alive {
                continue
            }
            let Some(entry) = self.backing.get(&slot.hash) else { return false };
            if entry.flag {
                expected_flags += 1;
            }
        }
        self.flag_count == expected_flags
    }
}

/// Bounded, ordered, content-addressed set of byte payloads.
///
/// Entries are assigned a sequence number on insertion and evicted oldest
/// first once the set exceeds `max_size`. Removal can be requested either by
/// content (when a peer announces it already has a payload) or by external
/// index (when a block references pool entries by position); both forms of
/// removal are deferred and coalesced rather than applied eagerly, since a
/// single physical removal can require renumbering up to half the set.
pub struct FlaggedArraySet {
    inner: WaitCountMutex<Inner>,
}

impl std::fmt::Debug for FlaggedArraySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlaggedArraySet").field("len", &self.len()).finish()
    }
}

impl FlaggedArraySet {
    /// Builds a set, asserting that `max_size` is nonzero.
    ///
    /// Every call site in this repo passes a compile-time constant, so a
    /// zero capacity here is a programming error rather than a condition
    /// callers need to recover from; use [`FlaggedArraySet::try_new`] at any
    /// boundary where the capacity comes from outside the process (CLI
    /// arguments, a config file).
    pub fn new(max_size: usize, allow_dups: bool) -> Self {
        Self::try_new(max_size, allow_dups).expect("FlaggedArraySet capacity must be nonzero")
    }

    /// Builds a set, returning [`FasError::ZeroCapacity`] instead of
    /// panicking when `max_size == 0`.
    pub fn try_new(max_size: usize, allow_dups: bool) -> Result<Self, FasError> {
        if max_size == 0 {
            return Err(FasError::ZeroCapacity);
        }
        Ok(Self {
            inner: WaitCountMutex::new(Inner {
                max_size,
                allow_dups,
                offset: 0,
                flag_count: 0,
                flags_to_remove: 0,
                max_remove: 0,
                backing: HashMap::with_capacity(max_size),
                index_map: Vec::with_capacity(max_size),
                to_be_removed: Vec::new(),
                partially_removed: Vec::new(),
            }),
        })
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().max_size
    }

    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.cleanup_all();
        inner.live_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, payload: &[u8]) -> bool {
        let hash = double_sha256(payload);
        self.contains_hash(&hash)
    }

    /// Tests identity membership directly by hash, for callers (like a
    /// compressor checking whether a peer already knows a transaction) that
    /// only have the hash and shouldn't need the payload bytes on hand.
    pub fn contains_hash(&self, hash: &Hash256) -> bool {
        let mut inner = self.inner.lock();
        inner.cleanup_all();
        inner.backing.contains_key(hash)
    }

    /// Inserts `payload`, evicting the oldest entry if the set is now over
    /// capacity. Returns `false` if an equal payload is already present.
    pub fn add(&self, payload: Bytes, flag: bool) -> bool {
        let hash = double_sha256(&payload);
        let mut inner = self.inner.lock();
        inner.cleanup_all();

        if inner.backing.contains_key(&hash) {
            return false
        }

        let seq = inner.live_len() as u64 + inner.offset;
        inner.backing.insert(hash, BackingEntry { seq, flag, payload });
        inner.index_map.push(IndexSlot { hash, alive: true });

        debug_assert!(inner.live_len() <= inner.max_size + 1);
        while inner.live_len() > inner.max_size {
            inner.remove_at(0, false);
        }

        if flag {
            inner.flag_count += 1;
        }

        debug_assert!(inner.sanity_check());
        true
    }

    /// Removes by content, returning the external index the payload held at
    /// the moment of removal, or `None` if it wasn't present.
    pub fn remove_by_content(&self, payload: &[u8]) -> Option<u64> {
        let hash = double_sha256(payload);
        let mut inner = self.inner.lock();
        inner.cleanup_late_remove();

        let entry = inner.backing.get(&hash)?;
        let res = entry.seq - inner.offset;

        let mut idx = res as usize;
        while idx < inner.index_map.len() {
            if inner.index_map[idx].alive && inner.index_map[idx].hash == hash {
                break
            }
            idx += 1;
        }
        debug_assert!(idx < inner.index_map.len());
        inner.remove_at(idx, true);

        debug_assert!(inner.sanity_check());
        Some(res)
    }

    /// Removes by external index, returning the removed payload and its
    /// hash, or `None` if the index is out of range.
    ///
    /// Removal is deferred when `index` is at or beyond the highest index
    /// removed so far in the current batch, so a caller working backward
    /// from the end of a block through consecutive positions pays for a
    /// single renumbering pass instead of one per call.
    pub fn remove_by_index(&self, index: usize) -> Option<(Bytes, Hash256)> {
        let mut inner = self.inner.lock();
        inner.cleanup_partially_removed();
        if (index as i64) < inner.max_remove {
            inner.cleanup_late_remove();
        }

        let lookup_index = index + inner.to_be_removed.len();
        if lookup_index >= inner.index_map.len() {
            return None
        }

        let slot = inner.index_map[lookup_index];
        debug_assert!(slot.alive);
        let entry = inner.backing.get(&slot.hash).expect("live slot has a backing entry");
        let payload = entry.payload.clone();
        let flag = entry.flag;
        let hash = slot.hash;

        if (index as i64) >= inner.max_remove {
            inner.to_be_removed.push(index);
            inner.max_remove = index as i64;
            if flag {
                inner.flags_to_remove += 1;
            }
        } else {
            inner.cleanup_late_remove();
            inner.remove_at(index, false);
        }

        debug_assert!(inner.sanity_check());
        Some((payload, hash))
    }

    /// Reads the payload at external index `index` without removing it.
    pub fn get_by_index(&self, index: usize) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        inner.cleanup_all();
        let slot = inner.index_map.get(index)?;
        inner.backing.get(&slot.hash).map(|e| e.payload.clone())
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.offset = 0;
        inner.flag_count = 0;
        inner.flags_to_remove = 0;
        inner.max_remove = 0;
        inner.to_be_removed.clear();
        inner.partially_removed.clear();
        inner.backing.clear();
        inner.index_map.clear();
    }

    /// Visits every live payload in index order.
    pub fn for_each(&self, mut callback: impl FnMut(&Bytes)) {
        let mut inner = self.inner.lock();
        inner.cleanup_all();
        for slot in &inner.index_map {
            let entry = inner.backing.get(&slot.hash).expect("live slot has a backing entry");
            callback(&entry.payload);
        }
    }
}

impl Dedupable for FlaggedArraySet {
    fn allow_dups(&self) -> bool {
        self.inner.lock().allow_dups
    }

    fn snapshot_for_dedup(&self) -> Option<Vec<(Hash256, Bytes)>> {
        let inner = self.inner.try_lock()?;
        let mut out = Vec::with_capacity(inner.backing.len());
        for (hash, entry) in &inner.backing {
            if self.inner.wait_count() > 0 {
                break
            }
            out.push((*hash, entry.payload.clone()));
        }
        Some(out)
    }

    fn apply_dedup(&self, canonical: &HashMap<Hash256, Bytes>) -> Option<usize> {
        let mut inner = self.inner.try_lock()?;
        let mut deduped = 0;
        for (hash, entry) in inner.backing.iter_mut() {
            if self.inner.wait_count() > 0 {
                break
            }
            if let Some(shared) = canonical.get(hash) {
                if entry.payload.as_ptr() != shared.as_ptr() {
                    entry.payload = shared.clone();
                    deduped += 1;
                }
            }
        }
        Some(deduped)
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        RemoveByContent(u8),
        RemoveByIndex(usize),
        Contains(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u8>().prop_map(Op::Add),
            any::<u8>().prop_map(Op::RemoveByContent),
            (0..8usize).prop_map(Op::RemoveByIndex),
            any::<u8>().prop_map(Op::Contains),
        ]
    }

    fn tag_payload(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 48])
    }

    proptest! {
        // Property 1: every FAS invariant holds after every operation in an
        // arbitrary sequence, for a fixed small capacity.
        #[test]
        fn invariants_hold_after_any_sequence(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let fas = FlaggedArraySet::new(4, false);
            for op in ops {
                match op {
                    Op::Add(tag) => { fas.add(tag_payload(tag), false); }
                    Op::RemoveByContent(tag) => { fas.remove_by_content(&tag_payload(tag)); }
                    Op::RemoveByIndex(i) => { fas.remove_by_index(i); }
                    Op::Contains(tag) => { fas.contains(&tag_payload(tag)); }
                }
                prop_assert!(fas.len() <= 4);
                let mut inner = fas.inner.lock();
                inner.cleanup_all();
                prop_assert!(inner.sanity_check());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: u8, len: usize) -> Bytes {
        Bytes::from(vec![tag; len])
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(FlaggedArraySet::try_new(0, false), Err(FasError::ZeroCapacity)));
    }

    #[test]
    fn add_and_contains() {
        let fas = FlaggedArraySet::new(10, false);
        let p = payload(1, 40);
        assert!(fas.add(p.clone(), false));
        assert!(fas.contains(&p));
        assert_eq!(fas.len(), 1);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let fas = FlaggedArraySet::new(10, false);
        let p = payload(2, 40);
        assert!(fas.add(p.clone(), false));
        assert!(!fas.add(p, false));
        assert_eq!(fas.len(), 1);
    }

    #[test]
    fn eviction_drops_oldest_on_overflow() {
        let fas = FlaggedArraySet::new(2, false);
        let a = payload(1, 10);
        let b = payload(2, 10);
        let c = payload(3, 10);
        fas.add(a.clone(), false);
        fas.add(b.clone(), false);
        fas.add(c.clone(), false);

        assert_eq!(fas.len(), 2);
        assert!(!fas.contains(&a));
        assert!(fas.contains(&b));
        assert!(fas.contains(&c));
    }

    #[test]
    fn remove_by_content_returns_index_and_drops_entry() {
        let fas = FlaggedArraySet::new(10, false);
        let a = payload(1, 10);
        let b = payload(2, 10);
        fas.add(a.clone(), false);
        fas.add(b.clone(), false);

        assert_eq!(fas.remove_by_content(&a), Some(0));
        assert!(!fas.contains(&a));
        assert!(fas.contains(&b));
        assert_eq!(fas.len(), 1);
    }

    #[test]
    fn remove_by_content_missing_is_none() {
        let fas = FlaggedArraySet::new(10, false);
        assert_eq!(fas.remove_by_content(&payload(9, 10)), None);
    }

    #[test]
    fn remove_by_index_descending_batches_correctly() {
        let fas = FlaggedArraySet::new(10, false);
        let payloads: Vec<Bytes> = (0..5u8).map(|i| payload(i, 10)).collect();
        for p in &payloads {
            fas.add(p.clone(), false);
        }

        // Working backward from the end is the pattern the relay uses when a
        // block references pool indices: batches into one renumbering pass.
        for i in (0..5usize).rev() {
            let (removed, _hash) = fas.remove_by_index(i).expect("index in range");
            assert_eq!(removed, payloads[i]);
        }
        assert_eq!(fas.len(), 0);
    }

    #[test]
    fn remove_by_index_out_of_range_is_none() {
        let fas = FlaggedArraySet::new(10, false);
        fas.add(payload(1, 10), false);
        assert_eq!(fas.remove_by_index(5), None);
    }

    #[test]
    fn clear_resets_everything() {
        let fas = FlaggedArraySet::new(10, false);
        fas.add(payload(1, 10), true);
        fas.add(payload(2, 10), false);
        fas.clear();
        assert_eq!(fas.len(), 0);
        assert!(fas.add(payload(1, 10), false));
    }

    #[test]
    fn for_each_visits_live_entries_in_order() {
        let fas = FlaggedArraySet::new(10, false);
        let payloads: Vec<Bytes> = (0..4u8).map(|i| payload(i, 10)).collect();
        for p in &payloads {
            fas.add(p.clone(), false);
        }
        fas.remove_by_content(&payloads[1]);

        let mut seen = Vec::new();
        fas.for_each(|p| seen.push(p.clone()));
        assert_eq!(seen, vec![payloads[0].clone(), payloads[2].clone(), payloads[3].clone()]);
    }

    #[test]
    fn dedup_snapshot_and_apply_replace_pointer() {
        let fas_a = FlaggedArraySet::new(10, false);
        let fas_b = FlaggedArraySet::new(10, false);
        let content = vec![7u8; 64];
        let a_copy = Bytes::from(content.clone());
        let b_copy = Bytes::from(content);
        assert_ne!(a_copy.as_ptr(), b_copy.as_ptr());

        fas_a.add(a_copy.clone(), false);
        fas_b.add(b_copy, false);

        let snapshot = fas_a.snapshot_for_dedup().expect("uncontended");
        let canonical: HashMap<Hash256, Bytes> = snapshot.into_iter().collect();

        let deduped = fas_b.apply_dedup(&canonical).expect("uncontended");
        assert_eq!(deduped, 1);

        let mut seen_ptr = None;
        fas_b.for_each(|p| seen_ptr = Some(p.as_ptr()));
        assert_eq!(seen_ptr, Some(a_copy.as_ptr()));
    }
}
