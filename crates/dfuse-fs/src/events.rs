//! Event queue worker and buffer arena (components A and B).
//!
//! `EventQueueWorker` is the same actor shape as the teacher's
//! `WriteSerializer`: an mpsc channel feeding a single background task that
//! drains it in order, with callers getting their result back over a
//! one-shot reply channel. The teacher uses this to keep concurrent writes
//! to one item from interleaving; here it gives every backend call a single
//! well-defined point where per-inode ordering can be enforced without a
//! lock held across an `.await`.
//!
//! `BufferSlab` plays the role the spec's design notes give to a slab-
//! indexed event arena: read/write buffers are checked out by index rather
//! than allocated fresh per call, and are returned to the slab on drop.

use std::{future::Future, pin::Pin, sync::Arc};

use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::{mpsc, oneshot};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A single-task actor that runs submitted futures strictly in submission
/// order.
pub struct EventQueueWorker {
    tx: mpsc::Sender<BoxFuture>,
}

impl EventQueueWorker {
    #[must_use]
    pub fn spawn(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<BoxFuture>(capacity);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { tx }
    }

    async fn submit(&self, fut: BoxFuture) {
        // A dropped receiver means the worker task ended (mount is
        // shutting down); submitters treat that as a no-op rather than a
        // panic, same as the teacher's handle.send() error path.
        let _ = self.tx.send(fut).await;
    }

    /// Run `fut` on the worker and wait for its result.
    pub async fn submit_and_wait<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(Box::pin(async move {
            let result = fut.await;
            let _ = reply_tx.send(result);
        }))
        .await;
        reply_rx.await.ok()
    }
}

/// A pool of reusable byte buffers for read/write/pre-read operations,
/// indexed with [`slab::Slab`] so a buffer's identity survives being handed
/// across an await point without needing an `Arc<Mutex<_>>` per buffer.
pub struct BufferSlab {
    inner: Mutex<Slab<Vec<u8>>>,
}

impl BufferSlab {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(Slab::new()) })
    }

    /// Check out a buffer of at least `min_capacity` bytes, reusing a freed
    /// slot if one is large enough.
    pub fn acquire(self: &Arc<Self>, min_capacity: usize) -> BufferHandle {
        let mut inner = self.inner.lock();
        let reusable = inner
            .iter()
            .find(|(_, buf)| buf.capacity() >= min_capacity)
            .map(|(idx, _)| idx);
        let key = if let Some(idx) = reusable {
            let mut buf = inner.remove(idx);
            buf.clear();
            buf.resize(min_capacity, 0);
            inner.insert(buf)
        } else {
            inner.insert(vec![0u8; min_capacity])
        };
        BufferHandle {
            slab: self.clone(),
            key: Some(key),
        }
    }

    fn release(&self, key: usize) -> Vec<u8> {
        self.inner.lock().try_remove(key).unwrap_or_default()
    }
}

/// An owned checkout from a [`BufferSlab`]. Returns the underlying buffer's
/// capacity to the slab when dropped instead of freeing it.
pub struct BufferHandle {
    slab: Arc<BufferSlab>,
    key: Option<usize>,
}

impl BufferHandle {
    pub fn with_buf<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let key = self.key.expect("buffer handle used after release");
        let mut inner = self.slab.inner.lock();
        f(inner.get_mut(key).expect("buffer handle outlived its slot"))
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let buf = self.slab.release(key);
            // Put it straight back so the capacity isn't lost; `release`
            // already removed it, so reinsert rather than leaving the slot
            // empty for the next `acquire` to rebuild from scratch.
            self.slab.inner.lock().insert(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn worker_preserves_submission_order() {
        let worker = EventQueueWorker::spawn(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let log = log.clone();
            handles.push(worker.submit_and_wait(async move {
                log.lock().push(i);
            }));
        }
        for h in handles {
            h.await;
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn submit_and_wait_returns_the_future_result() {
        let worker = EventQueueWorker::spawn(4);
        let result = worker.submit_and_wait(async { 21 + 21 }).await;
        assert_eq!(result, Some(42));
    }

    #[test]
    fn buffer_slab_reuses_released_capacity() {
        let slab = BufferSlab::new();
        {
            let mut handle = slab.acquire(128);
            handle.with_buf(|buf| buf[0] = 7);
        }
        let handle2 = slab.acquire(64);
        let cap = handle2.with_buf(std::vec::Vec::capacity);
        assert!(cap >= 64);
    }
}
