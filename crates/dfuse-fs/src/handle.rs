//! Open file and directory handles (§3 "Handle record").

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::readdir::ReaddirHandle;

/// State attached to one `open`/`opendir` call, keyed by the file handle
/// (`fh`) the kernel echoes back on every subsequent `read`/`write`/
/// `readdir`/`release`.
pub struct OpenHandle {
    pub fh: u64,
    pub ino: u64,
    /// The directory this handle's inode was looked up under, if any. Used
    /// at `release` to write back this handle's linear-read verdict onto
    /// the parent's `linear_read` flag (§4.E.1/§4.E.3).
    pub parent_ino: Option<u64>,
    pub writable: bool,
    /// Caching attributes resolved at open time (direct-io-disable forces
    /// this handle to bypass the chunk cache entirely).
    pub direct_io: bool,
    /// §4.C "data-open-to-close": cache is valid only for this handle's
    /// lifetime and is torn down unconditionally at release.
    pub evict_cache_on_close: bool,
    /// Directory-only: the shared or private readdir state for this
    /// handle (§4.F).
    readdir: Mutex<Option<Arc<ReaddirHandle>>>,
    /// Cursor tracking whether reads through this handle have stayed
    /// linear, for the pre-read heuristic (§4.E.1). Reset to `false` the
    /// first time a read doesn't land where the previous one left off.
    linear_cursor: AtomicU64,
    linear: std::sync::atomic::AtomicBool,
    /// Whether any `read` has happened yet on this handle. §4.E.3 leaves
    /// the parent directory's `linear_read` flag untouched when no read
    /// ever occurred, so this distinguishes "never read" from "read and
    /// wasn't linear".
    saw_read: std::sync::atomic::AtomicBool,
    il_call_count: AtomicU64,
    write_count: AtomicU64,
}

impl OpenHandle {
    #[must_use]
    pub fn new(
        fh: u64,
        ino: u64,
        parent_ino: Option<u64>,
        writable: bool,
        direct_io: bool,
        evict_cache_on_close: bool,
    ) -> Self {
        Self {
            fh,
            ino,
            parent_ino,
            writable,
            direct_io,
            evict_cache_on_close,
            readdir: Mutex::new(None),
            linear_cursor: AtomicU64::new(0),
            linear: std::sync::atomic::AtomicBool::new(true),
            saw_read: std::sync::atomic::AtomicBool::new(false),
            il_call_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
        }
    }

    pub fn readdir_handle(&self) -> Option<Arc<ReaddirHandle>> {
        self.readdir.lock().clone()
    }

    pub fn set_readdir_handle(&self, handle: Arc<ReaddirHandle>) {
        *self.readdir.lock() = Some(handle);
    }

    /// Observe a read at `offset` of `len` bytes; returns whether the read
    /// stream has stayed linear (offset following the previous read) up to
    /// and including this call.
    pub fn observe_read(&self, offset: u64, len: u64) -> bool {
        self.saw_read.store(true, Ordering::Release);
        let expected = self.linear_cursor.load(Ordering::Acquire);
        let is_linear = offset == expected;
        if !is_linear {
            self.linear.store(false, Ordering::Release);
        }
        self.linear_cursor.store(offset + len, Ordering::Release);
        self.linear.load(Ordering::Acquire)
    }

    pub fn is_linear(&self) -> bool {
        self.linear.load(Ordering::Acquire)
    }

    pub fn saw_read(&self) -> bool {
        self.saw_read.load(Ordering::Acquire)
    }

    pub fn linear_cursor(&self) -> u64 {
        self.linear_cursor.load(Ordering::Acquire)
    }

    pub fn il_call_count(&self) -> u64 {
        self.il_call_count.load(Ordering::Acquire)
    }

    pub fn note_il_call(&self) -> u64 {
        self.il_call_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Acquire)
    }

    pub fn note_write(&self) -> u64 {
        self.write_count.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_reads_stay_linear() {
        let handle = OpenHandle::new(1, 2, Some(1), false, false, false);
        assert!(handle.observe_read(0, 100));
        assert!(handle.observe_read(100, 100));
        assert!(handle.is_linear());
        assert!(handle.saw_read());
    }

    #[test]
    fn a_seek_flips_linear_to_false_permanently() {
        let handle = OpenHandle::new(1, 2, Some(1), false, false, false);
        assert!(handle.observe_read(0, 100));
        assert!(!handle.observe_read(1000, 100));
        assert!(!handle.observe_read(1100, 100));
        assert!(!handle.is_linear());
    }

    #[test]
    fn a_handle_that_never_reads_does_not_report_saw_read() {
        let handle = OpenHandle::new(1, 2, Some(1), false, false, false);
        assert!(!handle.saw_read());
    }
}
