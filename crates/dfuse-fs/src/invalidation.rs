//! Time-bucketed invalidation engine (§4.G).
//!
//! Inodes are grouped into buckets keyed by their container's configured
//! dentry timeout. Each bucket is an LRU queue; a background task wakes up
//! at most every 60 seconds (or sooner if a shorter-lived bucket needs
//! attention) and evicts entries that have sat past their timeout plus a
//! fixed grace period - 30 minutes for directories, 2 seconds for files -
//! pushing an `entry_inval` upcall for each one it evicts.
//!
//! The teacher has nothing quite like this (OneDrive invalidation is driven
//! by webhook notifications, not local timers), so this is grounded
//! directly in the original `dfuse_inval.c`/`dfuse_da.c` design rather than
//! adapted from `lnxdrive-fuse`.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Extra grace period added on top of a bucket's own timeout before an
/// entry is actually evicted, per kind of inode.
pub const DIRECTORY_GRACE: Duration = Duration::from_secs(30 * 60);
pub const FILE_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on how long the background task ever sleeps between sweeps,
/// even if no bucket is due.
const MAX_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Entry {
    ino: u64,
    is_dir: bool,
    inserted_at: Instant,
}

struct Bucket {
    timeout: Duration,
    queue: VecDeque<Entry>,
}

impl Bucket {
    fn grace_for(is_dir: bool) -> Duration {
        if is_dir {
            DIRECTORY_GRACE
        } else {
            FILE_GRACE
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queue
            .front()
            .map(|e| e.inserted_at + self.timeout + Self::grace_for(e.is_dir))
    }
}

/// Upcall the invalidation engine drives when an entry expires. Implemented
/// by whatever owns the FUSE session (`dfuse-fs::filesystem`), since only
/// that layer can talk to `fuser::Notifier`.
#[async_trait::async_trait]
pub trait InvalidationSink: Send + Sync {
    /// Notify the kernel that a dentry (or, for the root, everything under
    /// it) should be dropped from its cache. An `Err` here means the FUSE
    /// session has gone away (EBADF) and the engine should stop trying for
    /// this inode without treating it as a bug.
    async fn notify_inval_entry(&self, ino: u64) -> Result<(), ()>;
}

struct Inner {
    buckets: HashMap<Duration, Bucket>,
}

/// Background invalidation engine; one instance per mounted filesystem.
pub struct InvalidationEngine {
    inner: Mutex<Inner>,
    wake: Notify,
    /// Open-handle probe consulted by `sweep` (§4.G: "an inode with
    /// open_count > 0 is skipped"). Defaults to "nothing is open" until
    /// `set_open_check` wires it to the live inode table, so existing
    /// callers that never install one keep today's time-only behaviour.
    is_open: Mutex<Arc<dyn Fn(u64) -> bool + Send + Sync>>,
}

impl InvalidationEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner { buckets: HashMap::new() }),
            wake: Notify::new(),
            is_open: Mutex::new(Arc::new(|_ino: u64| false)),
        })
    }

    /// Install the probe `sweep` uses to decide whether an inode is still
    /// open. Called once by the filesystem layer with a closure backed by
    /// its `InodeTable`.
    pub fn set_open_check(&self, probe: impl Fn(u64) -> bool + Send + Sync + 'static) {
        *self.is_open.lock() = Arc::new(probe);
    }

    /// Place (or re-place, moving to the back of its bucket) an inode under
    /// a timeout bucket. Calling this again for the same inode refreshes
    /// its position, the same way touching a dentry resets its TTL.
    pub fn touch(&self, ino: u64, is_dir: bool, timeout: Duration) {
        let mut inner = self.inner.lock();
        for bucket in inner.buckets.values_mut() {
            if let Some(pos) = bucket.queue.iter().position(|e| e.ino == ino) {
                bucket.queue.remove(pos);
            }
        }
        let bucket = inner.buckets.entry(timeout).or_insert_with(|| Bucket {
            timeout,
            queue: VecDeque::new(),
        });
        bucket.queue.push_back(Entry {
            ino,
            is_dir,
            inserted_at: Instant::now(),
        });
        drop(inner);
        self.wake.notify_one();
    }

    pub fn remove(&self, ino: u64) {
        let mut inner = self.inner.lock();
        for bucket in inner.buckets.values_mut() {
            bucket.queue.retain(|e| e.ino != ino);
        }
    }

    fn next_wakeup(&self) -> Duration {
        let inner = self.inner.lock();
        let now = Instant::now();
        inner
            .buckets
            .values()
            .filter_map(Bucket::next_deadline)
            .map(|deadline| deadline.saturating_duration_since(now))
            .min()
            .unwrap_or(MAX_SLEEP)
            .min(MAX_SLEEP)
    }

    /// Pop every entry across all buckets that is past its timeout + grace.
    /// An inode the probe reports as still open is never evicted; it is
    /// re-queued at the back of its bucket with a fresh `inserted_at` so it
    /// is reconsidered on a later sweep instead of spinning in this one.
    fn sweep(&self) -> Vec<u64> {
        let is_open = self.is_open.lock().clone();
        let mut expired = Vec::new();
        let now = Instant::now();
        let mut inner = self.inner.lock();
        for bucket in inner.buckets.values_mut() {
            let mut requeue = Vec::new();
            while let Some(front) = bucket.queue.front() {
                let deadline = front.inserted_at + bucket.timeout + Bucket::grace_for(front.is_dir);
                if deadline > now {
                    break;
                }
                let entry = bucket.queue.pop_front().unwrap();
                if is_open(entry.ino) {
                    requeue.push(Entry { inserted_at: now, ..entry });
                } else {
                    expired.push(entry.ino);
                }
            }
            bucket.queue.extend(requeue);
        }
        expired
    }

    /// Run the background sweep loop until `shutdown` resolves. Meant to be
    /// spawned once as a `tokio::task` for the lifetime of the mount.
    pub async fn run(self: Arc<Self>, sink: Arc<dyn InvalidationSink>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        loop {
            let sleep_for = self.next_wakeup();
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => continue,
                _ = &mut shutdown => return,
            }
            for ino in self.sweep() {
                match sink.notify_inval_entry(ino).await {
                    Ok(()) => debug!(ino, "invalidated expired dentry"),
                    Err(()) => {
                        warn!(ino, "invalidation upcall failed, session likely gone");
                        return;
                    }
                }
            }
        }
    }
}

impl Default for InvalidationEngine {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner { buckets: HashMap::new() }),
            wake: Notify::new(),
            is_open: Mutex::new(Arc::new(|_ino: u64| false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink(Arc<Mutex<Vec<u64>>>);

    #[async_trait::async_trait]
    impl InvalidationSink for RecordingSink {
        async fn notify_inval_entry(&self, ino: u64) -> Result<(), ()> {
            self.0.lock().push(ino);
            Ok(())
        }
    }

    #[test]
    fn touch_orders_entries_fifo_within_a_bucket() {
        let engine = InvalidationEngine::new();
        engine.touch(1, false, Duration::from_secs(1));
        engine.touch(2, false, Duration::from_secs(1));
        let expired = {
            let inner = engine.inner.lock();
            inner.buckets[&Duration::from_secs(1)].queue.iter().map(|e| e.ino).collect::<Vec<_>>()
        };
        assert_eq!(expired, vec![1, 2]);
    }

    #[test]
    fn re_touching_moves_entry_to_back() {
        let engine = InvalidationEngine::new();
        engine.touch(1, false, Duration::from_secs(1));
        engine.touch(2, false, Duration::from_secs(1));
        engine.touch(1, false, Duration::from_secs(1));
        let order = {
            let inner = engine.inner.lock();
            inner.buckets[&Duration::from_secs(1)].queue.iter().map(|e| e.ino).collect::<Vec<_>>()
        };
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn sweep_only_pops_entries_past_timeout_and_grace() {
        let engine = InvalidationEngine::new();
        engine.touch(1, false, Duration::from_millis(0));
        std::thread::sleep(FILE_GRACE + Duration::from_millis(5));
        let expired = engine.sweep();
        assert_eq!(expired, vec![1]);
    }

    #[test]
    fn sweep_skips_inodes_reported_open_and_requeues_them() {
        let engine = InvalidationEngine::new();
        engine.set_open_check(|ino| ino == 1);
        engine.touch(1, false, Duration::from_millis(0));
        engine.touch(2, false, Duration::from_millis(0));
        std::thread::sleep(FILE_GRACE + Duration::from_millis(5));
        let expired = engine.sweep();
        assert_eq!(expired, vec![2]);
        let still_queued = {
            let inner = engine.inner.lock();
            inner.buckets[&Duration::from_millis(0)].queue.iter().map(|e| e.ino).collect::<Vec<_>>()
        };
        assert_eq!(still_queued, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_invokes_sink_for_expired_entries() {
        let engine = InvalidationEngine::new();
        engine.touch(7, false, Duration::from_millis(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink(seen.clone()));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(engine.clone().run(sink, rx));
        tokio::time::advance(FILE_GRACE + Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        let _ = tx.send(());
        let _ = handle.await;
        assert!(seen.lock().contains(&7));
    }
}
