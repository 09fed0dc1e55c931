//! Chunked read coalescing (§4.E.2).
//!
//! Reads are cached in 1 MiB buckets, each subdivided into eight 128 KiB
//! slots. Concurrent reads that land on the same not-yet-filled slot are
//! coalesced onto a single backend request via the pending-requester list,
//! the same "first caller fetches, the rest wait" shape the teacher's
//! `ContentCache` uses for its on-disk blocks, adapted to an in-memory,
//! per-handle cache rather than a disk-backed global one.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;

pub const BUCKET_SIZE: u64 = 1 << 20;
pub const SLOT_SIZE: u64 = 1 << 17;
pub const SLOTS_PER_BUCKET: usize = 8;

/// Default cap on resident buckets per file before the LRU evicts.
const DEFAULT_MAX_BUCKETS: usize = 32;

/// Which 1 MiB bucket a `[pos, pos+len)` read falls into.
#[must_use]
pub fn bucket_of(pos: u64, len: u64) -> u64 {
    let end = pos + len;
    let aligned = end.div_ceil(BUCKET_SIZE).max(1);
    aligned - 1
}

/// Which of the 8 slots within a bucket a given offset falls into.
#[must_use]
pub fn slot_of(pos: u64) -> usize {
    ((pos / SLOT_SIZE) % SLOTS_PER_BUCKET as u64) as usize
}

#[derive(Default)]
struct Bucket {
    slots: [Option<Arc<[u8]>>; SLOTS_PER_BUCKET],
}

struct ActiveRecordInner {
    buckets: HashMap<u64, Bucket>,
    lru: VecDeque<u64>,
    max_buckets: usize,
    /// One pending-fetch entry per bucket, not per slot: §4.E.2 requires a
    /// bucket miss to submit a single 1 MiB backend read that fills every
    /// slot it covers, so everyone waiting on that bucket waits on the same
    /// list regardless of which slot they actually wanted.
    pending: HashMap<u64, Vec<oneshot::Sender<()>>>,
    preread: Option<PreReadDescriptor>,
}

impl ActiveRecordInner {
    fn touch_bucket(&mut self, bucket: u64) {
        if let Some(pos) = self.lru.iter().position(|b| *b == bucket) {
            self.lru.remove(pos);
        }
        self.lru.push_back(bucket);
        while self.lru.len() > self.max_buckets {
            if let Some(evict) = self.lru.pop_front() {
                self.buckets.remove(&evict);
            }
        }
    }

    fn notify_bucket(&mut self, bucket: u64) {
        if let Some(waiters) = self.pending.remove(&bucket) {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }
}

/// Per-file cache state plus pre-read bookkeeping, created lazily on first
/// `open` and torn down when the last handle closes (§4.E).
#[derive(Clone)]
pub struct ActiveRecord(Arc<Mutex<ActiveRecordInner>>);

impl ActiveRecord {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(ActiveRecordInner {
            buckets: HashMap::new(),
            lru: VecDeque::new(),
            max_buckets: DEFAULT_MAX_BUCKETS,
            pending: HashMap::new(),
            preread: None,
        })))
    }

    /// Look up a cached slot, if present.
    pub fn get(&self, pos: u64) -> Option<Arc<[u8]>> {
        let bucket = bucket_of(pos, 0);
        let slot = slot_of(pos);
        let mut inner = self.0.lock();
        let hit = inner.buckets.get(&bucket).and_then(|b| b.slots[slot].clone());
        if hit.is_some() {
            inner.touch_bucket(bucket);
        }
        hit
    }

    /// Store a freshly fetched slot and wake anyone waiting on its bucket.
    pub fn insert(&self, pos: u64, data: Arc<[u8]>) {
        let bucket = bucket_of(pos, 0);
        let slot = slot_of(pos);
        let mut inner = self.0.lock();
        inner
            .buckets
            .entry(bucket)
            .or_default()
            .slots[slot] = Some(data);
        inner.touch_bucket(bucket);
        inner.notify_bucket(bucket);
    }

    /// Fan one coalesced backend read across every slot it covers (§4.E.2:
    /// "submit a 1 MiB backend read to fill it"). `data` may be shorter than
    /// a full bucket for the last bucket of a file; only the slots it
    /// actually covers are filled.
    pub fn insert_bucket(&self, bucket_start: u64, data: &[u8]) {
        let bucket = bucket_of(bucket_start, 0);
        let mut inner = self.0.lock();
        {
            let entry = inner.buckets.entry(bucket).or_default();
            for (slot, chunk) in data.chunks(SLOT_SIZE as usize).enumerate().take(SLOTS_PER_BUCKET) {
                entry.slots[slot] = Some(Arc::from(chunk));
            }
        }
        inner.touch_bucket(bucket);
        inner.notify_bucket(bucket);
    }

    /// Register interest in a slot whose bucket is already being fetched by
    /// another reader; the returned receiver resolves once the fetch lands.
    ///
    /// Returns `None` if the slot is already resident (caller should just
    /// call `get`) or nobody else is fetching its bucket (caller should
    /// claim it).
    pub fn wait_for_fetch_in_progress(&self, pos: u64) -> Option<oneshot::Receiver<()>> {
        let bucket = bucket_of(pos, 0);
        let slot = slot_of(pos);
        let mut inner = self.0.lock();
        if inner.buckets.get(&bucket).and_then(|b| b.slots[slot].as_ref()).is_some() {
            return None;
        }
        let entry = inner.pending.get_mut(&bucket)?;
        let (tx, rx) = oneshot::channel();
        entry.push(tx);
        Some(rx)
    }

    /// Claim responsibility for fetching the bucket covering `pos`, if
    /// nobody else is fetching it yet. Returns `true` if the caller is now
    /// the fetcher of record for the whole bucket, not just this slot.
    pub fn claim_fetch(&self, pos: u64) -> bool {
        let bucket = bucket_of(pos, 0);
        let slot = slot_of(pos);
        let mut inner = self.0.lock();
        if inner.buckets.get(&bucket).and_then(|b| b.slots[slot].as_ref()).is_some() {
            return false;
        }
        if inner.pending.contains_key(&bucket) {
            return false;
        }
        inner.pending.insert(bucket, Vec::new());
        true
    }

    pub fn preread(&self) -> Option<PreReadDescriptor> {
        self.0.lock().preread.clone()
    }

    pub fn set_preread(&self, descriptor: Option<PreReadDescriptor>) {
        self.0.lock().preread = descriptor;
    }

    /// Drop every cached bucket. Called when the last handle on the file
    /// closes, or when a write invalidates the cache (§4.E "shrink
    /// invalidation").
    pub fn teardown(&self) {
        let mut inner = self.0.lock();
        inner.buckets.clear();
        inner.lru.clear();
        inner.pending.clear();
        inner.preread = None;
    }

    /// Drop every cached bucket whose start lies at or beyond `new_size`
    /// (truncate/shrink invalidation, §4.E.1).
    pub fn invalidate_from(&self, new_size: u64) {
        let first_dead_bucket = bucket_of(new_size, 0);
        let mut inner = self.0.lock();
        inner.buckets.retain(|b, _| *b < first_dead_bucket);
        inner.lru.retain(|b| *b < first_dead_bucket);
    }
}

impl Default for ActiveRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-read progress for a file opened under the small-file linear-read
/// heuristic (§4.E.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreReadDescriptor {
    InFlight,
    Complete { len: u64 },
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_of_matches_spec_formula() {
        assert_eq!(bucket_of(0, 10), 0);
        assert_eq!(bucket_of(BUCKET_SIZE, 1), 1);
        assert_eq!(bucket_of(BUCKET_SIZE - 1, 1), 0);
        assert_eq!(bucket_of(2 * BUCKET_SIZE, 1), 2);
    }

    #[test]
    fn slot_of_wraps_every_bucket() {
        assert_eq!(slot_of(0), 0);
        assert_eq!(slot_of(SLOT_SIZE), 1);
        assert_eq!(slot_of(BUCKET_SIZE), 0);
        assert_eq!(slot_of(BUCKET_SIZE + SLOT_SIZE), 1);
    }

    #[test]
    fn insert_then_get_hits_cache() {
        let record = ActiveRecord::new();
        assert!(record.get(0).is_none());
        record.insert(0, Arc::from(vec![1, 2, 3].into_boxed_slice()));
        assert_eq!(record.get(0).unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn lru_evicts_oldest_bucket_past_capacity() {
        let record = ActiveRecord::new();
        {
            let mut inner = record.0.lock();
            inner.max_buckets = 2;
        }
        record.insert(0, Arc::from(vec![0u8].into_boxed_slice()));
        record.insert(BUCKET_SIZE, Arc::from(vec![0u8].into_boxed_slice()));
        record.insert(2 * BUCKET_SIZE, Arc::from(vec![0u8].into_boxed_slice()));
        assert!(record.get(0).is_none());
        assert!(record.get(BUCKET_SIZE).is_some());
        assert!(record.get(2 * BUCKET_SIZE).is_some());
    }

    #[test]
    fn invalidate_from_drops_buckets_past_new_size() {
        let record = ActiveRecord::new();
        record.insert(0, Arc::from(vec![0u8].into_boxed_slice()));
        record.insert(BUCKET_SIZE, Arc::from(vec![0u8].into_boxed_slice()));
        record.invalidate_from(BUCKET_SIZE);
        assert!(record.get(0).is_some());
        assert!(record.get(BUCKET_SIZE).is_none());
    }

    #[test]
    fn insert_bucket_fans_one_fetch_across_every_slot_it_covers() {
        let record = ActiveRecord::new();
        let data = vec![7u8; BUCKET_SIZE as usize];
        record.insert_bucket(0, &data);
        for slot in 0..SLOTS_PER_BUCKET {
            assert!(record.get(slot as u64 * SLOT_SIZE).is_some());
        }
    }

    #[test]
    fn claim_fetch_claims_the_whole_bucket_not_just_one_slot() {
        let record = ActiveRecord::new();
        assert!(record.claim_fetch(0));
        // A second reader wanting a different slot in the same bucket must
        // join the same pending fetch rather than issuing its own read.
        assert!(!record.claim_fetch(SLOT_SIZE));
        let rx = record.wait_for_fetch_in_progress(SLOT_SIZE).unwrap();
        record.insert_bucket(0, &vec![1u8; BUCKET_SIZE as usize]);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn claim_fetch_is_exclusive_until_insert() {
        let record = ActiveRecord::new();
        assert!(record.claim_fetch(0));
        assert!(!record.claim_fetch(0));
        let rx = record.wait_for_fetch_in_progress(0).unwrap();
        record.insert(0, Arc::from(vec![9u8].into_boxed_slice()));
        assert!(rx.try_recv().is_ok());
    }
}
