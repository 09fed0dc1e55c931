//! Per-inode state (§3 "Inode record").
//!
//! One [`InodeEntry`] exists per (container, object) pair currently known to
//! the kernel. Mirrors the teacher's `InodeEntry` (atomics for the counters
//! the kernel drives via lookup/forget and open/release, a `RwLock` around
//! the rest) but keyed on a DAOS object id instead of a cloud item id.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dfuse_core::{ContainerId, ObjectId, ObjectStat};
use parking_lot::RwLock;

use crate::chunk_cache::ActiveRecord;
use crate::readdir::ReaddirHandle;

/// Reserved inode number for the single mounted root (FUSE convention).
pub const ROOT_INO: u64 = 1;

struct Inner {
    stat: ObjectStat,
    attr_cached_at: std::time::Instant,
    dentry_cached_at: std::time::Instant,
    /// Set once `unlink`/`rmdir` removes the directory entry but the kernel
    /// still holds references (open file descriptors, in-flight lookups).
    unlinked: bool,
    /// Populated the first time a `readdir` on this directory decides to
    /// share state across handles (§4.F "shared" readdir mode).
    shared_readdir: Option<Arc<ReaddirHandle>>,
    /// Chunk cache and pre-read bookkeeping; only present for regular files
    /// that have been opened at least once.
    active: Option<ActiveRecord>,
    /// When the chunk cache was last (re)populated for this file, for the
    /// pre-read "data cache expired" gate (§4.E.1). `None` until the first
    /// pre-read is spawned.
    data_cached_at: Option<std::time::Instant>,
    /// The dentry-timeout bucket this inode currently belongs to, if any
    /// (component G). `None` means caching is disabled for this inode.
    bucket_timeout: Option<std::time::Duration>,
    /// Directory-only: whether the last handle to close after reading under
    /// this directory read its file linearly to EOF (§4.E.1/§4.E.3). Starts
    /// `true` so the first file opened under a freshly-seen directory is
    /// still a pre-read candidate.
    linear_read: bool,
    /// Overridden (container, object) this inode resolves against once it
    /// becomes a UNS mount point (§4.F.1); `None` means use `container`/
    /// `oid` unchanged. Kept separate from those fields rather than
    /// mutating them in place, since `InodeTable::forget` keys its
    /// `by_object` map off their original values.
    uns_override: Option<(ContainerId, ObjectId)>,
    uns_root: bool,
}

/// Per-inode state shared by every open handle and every cached dentry
/// pointing at the same backend object.
pub struct InodeEntry {
    pub ino: u64,
    pub container: ContainerId,
    pub oid: ObjectId,
    pub parent: Option<u64>,
    pub is_root: bool,
    /// Matches the kernel's own lookup refcount: one `lookup()` reply that
    /// isn't immediately followed by `forget()` increments this.
    lookup_count: AtomicU64,
    open_count: AtomicU64,
    open_write_count: AtomicU64,
    /// Number of interception-library file descriptors currently attached
    /// to this inode (§6 ioctl surface); tracked here so `DFUSE_EVICT` can
    /// refuse to evict an inode the IL still has open.
    il_attach_count: AtomicU64,
    inner: RwLock<Inner>,
}

impl InodeEntry {
    #[must_use]
    pub fn new(ino: u64, container: ContainerId, oid: ObjectId, parent: Option<u64>, stat: ObjectStat) -> Self {
        let now = std::time::Instant::now();
        Self {
            ino,
            container,
            oid,
            parent,
            is_root: ino == ROOT_INO,
            lookup_count: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
            open_write_count: AtomicU64::new(0),
            il_attach_count: AtomicU64::new(0),
            inner: RwLock::new(Inner {
                stat,
                attr_cached_at: now,
                dentry_cached_at: now,
                unlinked: false,
                shared_readdir: None,
                active: None,
                data_cached_at: None,
                bucket_timeout: None,
                linear_read: true,
                uns_override: None,
                uns_root: false,
            }),
        }
    }

    pub fn stat(&self) -> ObjectStat {
        self.inner.read().stat
    }

    pub fn set_stat(&self, stat: ObjectStat) {
        let mut inner = self.inner.write();
        inner.stat = stat;
        inner.attr_cached_at = std::time::Instant::now();
    }

    pub fn is_dir(&self) -> bool {
        self.inner.read().stat.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn attr_age(&self) -> std::time::Duration {
        self.inner.read().attr_cached_at.elapsed()
    }

    pub fn refresh_dentry_stamp(&self) {
        self.inner.write().dentry_cached_at = std::time::Instant::now();
    }

    pub fn dentry_age(&self) -> std::time::Duration {
        self.inner.read().dentry_cached_at.elapsed()
    }

    pub fn mark_unlinked(&self) {
        self.inner.write().unlinked = true;
    }

    pub fn is_unlinked(&self) -> bool {
        self.inner.read().unlinked
    }

    pub fn bucket_timeout(&self) -> Option<std::time::Duration> {
        self.inner.read().bucket_timeout
    }

    pub fn set_bucket_timeout(&self, timeout: Option<std::time::Duration>) {
        self.inner.write().bucket_timeout = timeout;
    }

    pub fn shared_readdir(&self) -> Option<Arc<ReaddirHandle>> {
        self.inner.read().shared_readdir.clone()
    }

    pub fn set_shared_readdir(&self, handle: Option<Arc<ReaddirHandle>>) {
        self.inner.write().shared_readdir = handle;
    }

    pub fn active_record(&self) -> Option<ActiveRecord> {
        self.inner.read().active.clone()
    }

    /// Get-or-create the [`ActiveRecord`] for this file, per §4.E: the
    /// record is created on first `open` and torn down when the last
    /// handle closes with no other opener.
    pub fn active_record_or_init(&self) -> ActiveRecord {
        let mut inner = self.inner.write();
        inner.active.get_or_insert_with(ActiveRecord::new).clone()
    }

    pub fn clear_active_record(&self) {
        self.inner.write().active = None;
    }

    /// How long ago the chunk cache was last (re)populated, or `None` if it
    /// never has been - both count as "expired" for the pre-read gate.
    pub fn data_cache_age(&self) -> Option<std::time::Duration> {
        self.inner.read().data_cached_at.map(|at| at.elapsed())
    }

    pub fn refresh_data_cache_stamp(&self) {
        self.inner.write().data_cached_at = Some(std::time::Instant::now());
    }

    pub fn is_linear_read(&self) -> bool {
        self.inner.read().linear_read
    }

    pub fn set_linear_read(&self, value: bool) {
        self.inner.write().linear_read = value;
    }

    /// The container this inode should actually be resolved against:
    /// the UNS target once it has become a mount point, otherwise the
    /// inode's own `container`.
    pub fn effective_container(&self) -> ContainerId {
        self.inner.read().uns_override.map(|(c, _)| c).unwrap_or(self.container)
    }

    /// The object id this inode should actually be resolved against, the
    /// UNS counterpart of [`InodeEntry::effective_container`].
    pub fn effective_oid(&self) -> ObjectId {
        self.inner.read().uns_override.map(|(_, o)| o).unwrap_or(self.oid)
    }

    /// Swap this inode's effective container/object onto a UNS mount
    /// target (§4.F.1). Idempotent: once set, later calls from a racing
    /// traversal are no-ops, so the first arriver's resolution wins.
    pub fn mark_uns_root(&self, container: ContainerId, oid: ObjectId) {
        let mut inner = self.inner.write();
        if inner.uns_override.is_none() {
            inner.uns_override = Some((container, oid));
        }
        inner.uns_root = true;
    }

    pub fn is_uns_root(&self) -> bool {
        self.inner.read().uns_root
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookup_count.load(Ordering::Acquire)
    }

    pub fn incref(&self) -> u64 {
        self.lookup_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement by `n` (the kernel's `forget` can batch via `forget_multi`,
    /// §14); returns the value after decrementing.
    pub fn decref(&self, n: u64) -> u64 {
        self.lookup_count.fetch_sub(n, Ordering::AcqRel).saturating_sub(n)
    }

    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::Acquire)
    }

    pub fn open_write_count(&self) -> u64 {
        self.open_write_count.load(Ordering::Acquire)
    }

    pub fn on_open(&self, writable: bool) -> u64 {
        if writable {
            self.open_write_count.fetch_add(1, Ordering::AcqRel);
        }
        self.open_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn on_release(&self, writable: bool) -> u64 {
        if writable {
            self.open_write_count.fetch_sub(1, Ordering::AcqRel);
        }
        self.open_count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    pub fn il_attach_count(&self) -> u64 {
        self.il_attach_count.load(Ordering::Acquire)
    }

    pub fn il_attach(&self) -> u64 {
        self.il_attach_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn il_detach(&self) -> u64 {
        self.il_attach_count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    /// True once nothing references this inode: no pending kernel lookups,
    /// no open handles, and the interception library has detached.
    pub fn is_evictable(&self) -> bool {
        self.lookup_count() == 0 && self.open_count() == 0 && self.il_attach_count() == 0 && !self.is_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn stat(oid: ObjectId) -> ObjectStat {
        ObjectStat {
            oid,
            size: 0,
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            atime: SystemTime::now(),
            mtime: SystemTime::now(),
            ctime: SystemTime::now(),
        }
    }

    #[test]
    fn lookup_refcount_tracks_incref_decref() {
        let entry = InodeEntry::new(2, ContainerId::new(), ObjectId::new(0, 2), Some(ROOT_INO), stat(ObjectId::new(0, 2)));
        assert_eq!(entry.incref(), 1);
        assert_eq!(entry.incref(), 2);
        assert_eq!(entry.decref(2), 0);
        assert!(entry.is_evictable());
    }

    #[test]
    fn open_handles_pin_the_inode() {
        let entry = InodeEntry::new(2, ContainerId::new(), ObjectId::new(0, 2), Some(ROOT_INO), stat(ObjectId::new(0, 2)));
        entry.on_open(false);
        assert!(!entry.is_evictable());
        entry.on_release(false);
        assert!(entry.is_evictable());
    }

    #[test]
    fn linear_read_defaults_true_and_is_settable() {
        let entry = InodeEntry::new(2, ContainerId::new(), ObjectId::new(0, 2), Some(ROOT_INO), stat(ObjectId::new(0, 2)));
        assert!(entry.is_linear_read());
        entry.set_linear_read(false);
        assert!(!entry.is_linear_read());
    }

    #[test]
    fn mark_uns_root_is_idempotent_across_racing_callers() {
        let original_container = ContainerId::new();
        let entry = InodeEntry::new(2, original_container, ObjectId::new(0, 2), Some(ROOT_INO), stat(ObjectId::new(0, 2)));
        let target_container = ContainerId::new();
        let target_oid = ObjectId::new(9, 9);
        entry.mark_uns_root(target_container, target_oid);
        // A second, racing traversal resolves a (hypothetically different)
        // target; the first arriver's resolution must stick.
        entry.mark_uns_root(ContainerId::new(), ObjectId::new(1, 1));
        assert_eq!(entry.effective_container(), target_container);
        assert_eq!(entry.effective_oid(), target_oid);
        assert!(entry.is_uns_root());
        assert_eq!(entry.container, original_container);
    }

    #[test]
    fn root_inode_is_never_evictable() {
        let entry = InodeEntry::new(ROOT_INO, ContainerId::new(), ObjectId::new(0, 1), None, stat(ObjectId::new(0, 1)));
        assert!(!entry.is_evictable());
    }
}
