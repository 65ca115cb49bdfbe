//! Process-wide background sweeper that reclaims memory when the same
//! payload is held by more than one [`relay_fas::FlaggedArraySet`] — for
//! example the same transaction kept separately by three per-version
//! compressors.
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use relay_fas::Dedupable;
use relay_wire::Hash256;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Production sweep interval: dedup is a memory-reclamation nicety, not a
/// latency-sensitive path, so it runs rarely.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Handle to the background sweeper. Dropping it stops the sweep task.
#[derive(Debug)]
pub struct Deduper {
    sets: Arc<Mutex<Vec<Weak<dyn Dedupable>>>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Deduper {
    /// Spawns the sweeper on the current tokio runtime, sweeping every
    /// `interval`.
    pub fn spawn(interval: Duration) -> Self {
        let sets: Arc<Mutex<Vec<Weak<dyn Dedupable>>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task_sets = sets.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return
                        }
                    }
                }
                sweep(&task_sets);
            }
        });

        Self { sets, shutdown, task }
    }

    /// Registers a set to be swept. The deduper only holds a weak reference,
    /// so registering never keeps a discarded set's memory alive.
    pub fn register(&self, set: &Arc<dyn Dedupable>) {
        self.sets.lock().push(Arc::downgrade(set));
    }

    /// Runs a single sweep pass synchronously, returning the number of
    /// entries deduped. Exposed for tests that don't want to wait on a timer.
    pub fn sweep_once(&self) -> usize {
        sweep(&self.sets)
    }

    /// Signals the background task to stop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// One sweep pass: snapshot every uncontended set's live payloads, find
/// content hashes held by more than one distinct allocation, then replace
/// the non-canonical allocations with a shared clone of the first one seen.
///
/// Every step uses `try_lock` semantics end to end (see
/// [`relay_fas::Dedupable`]); a set busy doing real work is simply skipped
/// for this pass rather than waited on.
fn sweep(sets: &Mutex<Vec<Weak<dyn Dedupable>>>) -> usize {
    let live: Vec<Arc<dyn Dedupable>> = {
        let mut guard = sets.lock();
        guard.retain(|w| w.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).filter(|s| !s.allow_dups()).collect()
    };

    if live.len() < 2 {
        return 0
    }

    let mut canonical: HashMap<Hash256, Bytes> = HashMap::new();
    for set in &live {
        let Some(entries) = set.snapshot_for_dedup() else { continue };
        for (hash, payload) in entries {
            canonical.entry(hash).or_insert(payload);
        }
    }

    let mut deduped = 0;
    for set in &live {
        if let Some(n) = set.apply_dedup(&canonical) {
            deduped += n;
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_fas::FlaggedArraySet;

    #[tokio::test]
    async fn sweep_coalesces_identical_payload_across_sets() {
        let deduper = Deduper::spawn(Duration::from_secs(3600));

        let content = vec![9u8; 128];
        let a_handle = Bytes::from(content.clone());
        let b_handle = Bytes::from(content);
        assert_ne!(a_handle.as_ptr(), b_handle.as_ptr());

        let fas_a = Arc::new(FlaggedArraySet::new(10, false));
        let fas_b = Arc::new(FlaggedArraySet::new(10, false));
        fas_a.add(a_handle.clone(), false);
        fas_b.add(b_handle, false);

        let dyn_a: Arc<dyn Dedupable> = fas_a.clone();
        let dyn_b: Arc<dyn Dedupable> = fas_b.clone();
        deduper.register(&dyn_a);
        deduper.register(&dyn_b);

        assert_eq!(deduper.sweep_once(), 1);

        let mut seen_ptr = None;
        fas_b.for_each(|p| seen_ptr = Some(p.as_ptr()));
        assert_eq!(seen_ptr, Some(a_handle.as_ptr()));

        deduper.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_skips_allow_dups_sets() {
        let deduper = Deduper::spawn(Duration::from_secs(3600));
        let scratch: Arc<dyn Dedupable> = Arc::new(FlaggedArraySet::new(10, true));
        deduper.register(&scratch);
        assert_eq!(deduper.sweep_once(), 0);
        deduper.shutdown().await;
    }
}
