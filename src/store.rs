use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::record::ExecutionRecord;

/// Bounded, concurrently mutable buffer of the most recent executions.
///
/// Records are keyed by a monotonically increasing insertion sequence, so
/// "oldest" is the smallest live key. Capacity eviction walks an atomic
/// cursor forward over that sequence; records removed elsewhere leave holes
/// the cursor skips. The size counter is incremented before a record becomes
/// visible and decremented only after a successful removal, so it is always
/// an upper bound of the live count and never underflows.
///
/// Locking is internal to `DashMap` (per-shard, held for a single map
/// operation). No lock is exposed to or held across calls by users.
pub struct TraceStore {
    entries: DashMap<u64, Arc<ExecutionRecord>>,
    next_seq: AtomicU64,
    evict_cursor: AtomicU64,
    size: AtomicUsize,
    capacity: usize,
}

impl TraceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            evict_cursor: AtomicU64::new(0),
            size: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate number of stored records
    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert at the newest end.
    ///
    /// Returns the record pushed out from the oldest end when the store
    /// went over capacity.
    pub fn insert_newest(&self, record: Arc<ExecutionRecord>) -> Option<Arc<ExecutionRecord>> {
        let size = self.size.fetch_add(1, Ordering::SeqCst) + 1;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(seq, record);

        if size > self.capacity {
            return self.evict_oldest();
        }
        None
    }

    fn evict_oldest(&self) -> Option<Arc<ExecutionRecord>> {
        loop {
            let cursor = self.evict_cursor.load(Ordering::SeqCst);
            if cursor >= self.next_seq.load(Ordering::SeqCst) {
                return None;
            }
            if self
                .evict_cursor
                .compare_exchange(cursor, cursor + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            if let Some((_, record)) = self.entries.remove(&cursor) {
                self.size.fetch_sub(1, Ordering::SeqCst);
                return Some(record);
            }
        }
    }

    /// Weakly consistent view, oldest first.
    ///
    /// Every call starts a fresh traversal. Concurrent inserts and removals
    /// may or may not be reflected; yielded entries may already be gone from
    /// the store by the time they are consumed.
    pub fn iter_oldest_to_newest(&self) -> impl Iterator<Item = (u64, Arc<ExecutionRecord>)> {
        self.ordered().into_iter()
    }

    /// Weakly consistent view, newest first
    pub fn iter_newest_to_oldest(&self) -> impl Iterator<Item = (u64, Arc<ExecutionRecord>)> {
        self.ordered().into_iter().rev()
    }

    fn ordered(&self) -> Vec<(u64, Arc<ExecutionRecord>)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries
    }

    /// Remove the record at `seq` if it is still there and `predicate` holds.
    ///
    /// The predicate runs while the entry is locked, so it sees the record
    /// as it is at removal time.
    pub fn remove_if<F>(&self, seq: u64, predicate: F) -> Option<Arc<ExecutionRecord>>
    where
        F: FnOnce(&ExecutionRecord) -> bool,
    {
        let removed = self.entries.remove_if(&seq, |_, record| predicate(record));
        removed.map(|(_, record)| {
            self.size.fetch_sub(1, Ordering::SeqCst);
            record
        })
    }

    /// Linear search by record id
    pub fn find_by_id(&self, id: Uuid) -> Option<Arc<ExecutionRecord>> {
        self.entries
            .iter()
            .find(|e| e.value().id() == id)
            .map(|e| e.value().clone())
    }

    /// Drop oldest records until the size counter is back within capacity.
    ///
    /// Covers inserts whose capacity eviction raced with another and missed.
    pub fn enforce_capacity(&self) -> Vec<Arc<ExecutionRecord>> {
        let mut trimmed = Vec::new();
        if self.len() <= self.capacity {
            return trimmed;
        }
        for (seq, _) in self.ordered() {
            if self.len() <= self.capacity {
                break;
            }
            if let Some((_, record)) = self.entries.remove(&seq) {
                self.size.fetch_sub(1, Ordering::SeqCst);
                trimmed.push(record);
            }
        }
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordIdentity;
    use std::thread;

    fn record(sql: &str) -> Arc<ExecutionRecord> {
        Arc::new(ExecutionRecord::detached(
            RecordIdentity::plain("main", Uuid::nil(), sql),
            1_000,
        ))
    }

    fn sqls_newest_first(store: &TraceStore) -> Vec<String> {
        store
            .iter_newest_to_oldest()
            .map(|(_, r)| r.sql().to_string())
            .collect()
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = TraceStore::new(3);
        for sql in ["A", "B", "C"] {
            assert!(store.insert_newest(record(sql)).is_none());
        }
        let evicted = store.insert_newest(record("D")).expect("A should be evicted");

        assert_eq!(evicted.sql(), "A");
        assert_eq!(sqls_newest_first(&store), vec!["D", "C", "B"]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_eviction_skips_holes() {
        let store = TraceStore::new(2);
        store.insert_newest(record("A"));
        store.insert_newest(record("B"));

        // A removed out of band (e.g. by retention)
        assert!(store.remove_if(0, |_| true).is_some());
        store.insert_newest(record("C"));
        assert_eq!(store.len(), 2);

        let evicted = store.insert_newest(record("D")).expect("B should be evicted");
        assert_eq!(evicted.sql(), "B");
        assert_eq!(sqls_newest_first(&store), vec!["D", "C"]);
    }

    #[test]
    fn test_remove_if_respects_predicate() {
        let store = TraceStore::new(10);
        store.insert_newest(record("A"));

        assert!(store.remove_if(0, |r| r.is_terminal()).is_none());
        assert_eq!(store.len(), 1);
        assert!(store.remove_if(0, |r| r.sql() == "A").is_some());
        assert!(store.remove_if(0, |_| true).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_find_by_id() {
        let store = TraceStore::new(10);
        let target = record("B");
        store.insert_newest(record("A"));
        store.insert_newest(target.clone());

        let found = store.find_by_id(target.id()).expect("record present");
        assert!(Arc::ptr_eq(&found, &target));
        assert!(store.find_by_id(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_iteration_is_restartable() {
        let store = TraceStore::new(10);
        store.insert_newest(record("A"));
        store.insert_newest(record("B"));

        let first: Vec<_> = store.iter_oldest_to_newest().map(|(s, _)| s).collect();
        let second: Vec<_> = store.iter_oldest_to_newest().map(|(s, _)| s).collect();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_concurrent_inserts_converge_to_capacity() {
        let store = Arc::new(TraceStore::new(50));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        store.insert_newest(record(&format!("t{}-{}", t, i)));
                        if i % 50 == 0 {
                            let _ = store.iter_oldest_to_newest().count();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        store.enforce_capacity();
        let live = store.iter_oldest_to_newest().count();
        assert!(store.len() <= store.capacity());
        assert_eq!(store.len(), live);
    }

    #[test]
    fn test_enforce_capacity_is_noop_within_bounds() {
        let store = TraceStore::new(5);
        store.insert_newest(record("A"));
        assert!(store.enforce_capacity().is_empty());
        assert_eq!(store.len(), 1);
    }
}
