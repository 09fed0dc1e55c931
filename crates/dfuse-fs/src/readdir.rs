//! Dual-mode (shared/private) readdir state machine (§4.F).
//!
//! A directory opened for sequential, from-the-start iteration by several
//! handles at once shares one cache and one backend cursor ("shared" mode)
//! so the backend only sees one `iterate()` stream per directory. A handle
//! that seeks, or that opens the directory after it has already advanced,
//! forks its own private copy of the cache ("private" mode) rather than
//! disturbing the shared readers.

use std::collections::VecDeque;

use dfuse_core::{Backend, BackendError, ContainerId, DirEntryInfo, IterAnchor, ObjectId};
use parking_lot::Mutex;

/// Hard cap on how many resolved entries a single `ReaddirHandle` will hold
/// ahead of the reader (§4.F "forward buffer").
pub const FORWARD_BUFFER_MAX: usize = 1024;

/// Reserved FUSE readdir offsets. `.` and `..` are always synthesized at
/// offsets 1 and 2; everything else starts at 3.
pub const DOT_OFFSET: i64 = 1;
pub const DOTDOT_OFFSET: i64 = 2;
pub const FIRST_ENTRY_OFFSET: i64 = 3;
/// Sentinel the kernel uses to mean "no more entries, don't call again".
pub const END_OF_DIRECTORY: i64 = 1 << 63;

#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub offset: i64,
    pub name: String,
    pub oid: ObjectId,
    pub is_dir: bool,
    /// Set when the entry carries a `user.daos.duns` UNS descriptor: a
    /// lookup into it should mount a different container (§4.F.1) rather
    /// than resolve inside the current one.
    pub is_uns_mountpoint: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared { readers: usize },
    Private,
}

struct Inner {
    mode: Mode,
    cache: VecDeque<CachedEntry>,
    backend_anchor: Option<IterAnchor>,
    eof: bool,
    next_offset: i64,
    /// High-water mark of the last offset actually replied to the kernel.
    /// The forward buffer is the suffix of `cache` past this point; `cache`
    /// itself is never trimmed, so a shared handle's cache list keeps
    /// growing for the lifetime of the directory (§4.F) while `fill` still
    /// only fetches as far ahead as `FORWARD_BUFFER_MAX` unconsumed entries.
    last_replied_offset: i64,
}

/// Shared or private readdir state for one directory inode.
pub struct ReaddirHandle {
    pub container: ContainerId,
    pub dir: ObjectId,
    inner: Mutex<Inner>,
}

impl ReaddirHandle {
    #[must_use]
    pub fn new_shared(container: ContainerId, dir: ObjectId) -> Self {
        Self {
            container,
            dir,
            inner: Mutex::new(Inner {
                mode: Mode::Shared { readers: 1 },
                cache: VecDeque::new(),
                backend_anchor: None,
                eof: false,
                next_offset: FIRST_ENTRY_OFFSET,
                last_replied_offset: FIRST_ENTRY_OFFSET - 1,
            }),
        }
    }

    /// Join an existing shared handle (another `opendir` starting from the
    /// top of the same directory).
    pub fn attach(&self) -> bool {
        let mut inner = self.inner.lock();
        match &mut inner.mode {
            Mode::Shared { readers } => {
                *readers += 1;
                true
            }
            Mode::Private => false,
        }
    }

    pub fn detach(&self) {
        let mut inner = self.inner.lock();
        if let Mode::Shared { readers } = &mut inner.mode {
            *readers = readers.saturating_sub(1);
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.inner.lock().mode, Mode::Shared { .. })
    }

    /// Fork a private copy seeded with whatever this handle has cached so
    /// far, for a reader that seeks away from the shared cursor.
    #[must_use]
    pub fn fork_private(&self) -> Self {
        let inner = self.inner.lock();
        Self {
            container: self.container,
            dir: self.dir,
            inner: Mutex::new(Inner {
                mode: Mode::Private,
                cache: inner.cache.clone(),
                backend_anchor: inner.backend_anchor.clone(),
                eof: inner.eof,
                next_offset: inner.next_offset,
                last_replied_offset: inner.last_replied_offset,
            }),
        }
    }

    /// Look up a cached entry at `offset`, without touching the backend.
    pub fn cached_at(&self, offset: i64) -> Option<CachedEntry> {
        self.inner.lock().cache.iter().find(|e| e.offset == offset).cloned()
    }

    pub fn is_eof(&self) -> bool {
        self.inner.lock().eof
    }

    /// Fetch more entries from the backend if the forward buffer - the
    /// unreplied tail of `cache` - has room and we haven't hit EOF, tagging
    /// each with a sequential offset. The cache list itself is append-only
    /// and can grow past `FORWARD_BUFFER_MAX`; only the not-yet-replied
    /// suffix is bounded.
    pub async fn fill(&self, backend: &dyn Backend) -> Result<(), BackendError> {
        let (anchor, need) = {
            let inner = self.inner.lock();
            if inner.eof {
                return Ok(());
            }
            let unconsumed = inner.cache.iter().filter(|e| e.offset > inner.last_replied_offset).count();
            if unconsumed >= FORWARD_BUFFER_MAX {
                return Ok(());
            }
            (inner.backend_anchor.clone(), FORWARD_BUFFER_MAX - unconsumed)
        };
        let (entries, next_anchor): (Vec<DirEntryInfo>, Option<IterAnchor>) =
            backend.iterate(self.container, self.dir, anchor, need).await?;
        let mut inner = self.inner.lock();
        for entry in entries {
            let offset = inner.next_offset;
            inner.next_offset += 1;
            inner.cache.push_back(CachedEntry {
                offset,
                name: entry.name,
                oid: entry.oid,
                is_dir: entry.is_dir,
                is_uns_mountpoint: false,
            });
        }
        inner.eof = next_anchor.is_none();
        inner.backend_anchor = next_anchor;
        Ok(())
    }

    /// Record that entries up to and including `offset` have been replied
    /// to the kernel, shrinking the unconsumed forward buffer so `fill` can
    /// fetch further ahead (§4.F).
    pub fn mark_replied(&self, offset: i64) {
        let mut inner = self.inner.lock();
        if offset > inner.last_replied_offset {
            inner.last_replied_offset = offset;
        }
    }

    /// Mark the entry named `name` as a UNS mount point (§4.F.1), once the
    /// caller has inspected its xattrs.
    pub fn mark_uns_mountpoint(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.cache.iter_mut().find(|e| e.name == name) {
            entry.is_uns_mountpoint = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfuse_backend::MemoryBackend;
    use dfuse_core::{ContainerId, PoolId};

    async fn mounted_dir() -> (MemoryBackend, ContainerId, ObjectId) {
        let backend = MemoryBackend::new();
        let pool = PoolId::new();
        let container = ContainerId::new();
        backend.pool_connect(pool).await.unwrap();
        backend.cont_open(pool, container).await.unwrap();
        let (root, _) = backend.dfs_mount(pool, container).await.unwrap();
        for name in ["a", "b", "c"] {
            backend.create(container, root, name, 0o644).await.unwrap();
        }
        (backend, container, root)
    }

    #[tokio::test]
    async fn fill_assigns_sequential_offsets_starting_at_three() {
        let (backend, container, root) = mounted_dir().await;
        let handle = ReaddirHandle::new_shared(container, root);
        handle.fill(&backend).await.unwrap();
        assert!(handle.is_eof());
        let first = handle.cached_at(FIRST_ENTRY_OFFSET).unwrap();
        assert_eq!(first.name, "a");
    }

    #[tokio::test]
    async fn fill_keeps_fetching_past_forward_buffer_once_replied_entries_are_marked() {
        let backend = MemoryBackend::new();
        let pool = PoolId::new();
        let container = ContainerId::new();
        backend.pool_connect(pool).await.unwrap();
        backend.cont_open(pool, container).await.unwrap();
        let (root, _) = backend.dfs_mount(pool, container).await.unwrap();
        let total = FORWARD_BUFFER_MAX + 50;
        for i in 0..total {
            backend.create(container, root, &format!("f{i}"), 0o644).await.unwrap();
        }

        let handle = ReaddirHandle::new_shared(container, root);
        handle.fill(&backend).await.unwrap();
        assert!(handle.cached_at(FIRST_ENTRY_OFFSET + FORWARD_BUFFER_MAX as i64 - 1).is_some());
        assert!(handle.cached_at(FIRST_ENTRY_OFFSET + FORWARD_BUFFER_MAX as i64).is_none());

        for offset in FIRST_ENTRY_OFFSET..FIRST_ENTRY_OFFSET + FORWARD_BUFFER_MAX as i64 {
            handle.mark_replied(offset);
        }
        handle.fill(&backend).await.unwrap();
        assert!(handle.is_eof());
        assert!(handle.cached_at(FIRST_ENTRY_OFFSET + total as i64 - 1).is_some());
    }

    #[tokio::test]
    async fn second_attach_shares_until_fork() {
        let (backend, container, root) = mounted_dir().await;
        let handle = ReaddirHandle::new_shared(container, root);
        assert!(handle.attach());
        handle.fill(&backend).await.unwrap();
        let private = handle.fork_private();
        assert!(!private.is_shared());
        assert_eq!(private.cached_at(FIRST_ENTRY_OFFSET).unwrap().name, "a");
    }
}
