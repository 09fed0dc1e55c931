//! Speculative whole-file pre-read (§4.E.1).
//!
//! When a small file is opened and the first read looks linear, dfuse
//! speculatively reads the whole thing into the chunk cache in the
//! background, the way the teacher's `HydrationManager` speculatively pulls
//! a whole item ahead of demand, minus the disk persistence and priority
//! queue that don't apply to a pure read cache.

use std::sync::Arc;

use dfuse_core::{Backend, ContainerId, ObjectId};
use tracing::{debug, warn};

use crate::chunk_cache::{ActiveRecord, PreReadDescriptor};

/// Pre-read only applies to files at or below this size.
pub const PRE_READ_MAX_SIZE: u64 = 4 * 1024 * 1024;

/// A read is "linear" for pre-read purposes if it starts at offset 0.
#[must_use]
pub fn should_trigger(file_size: u64, first_read_offset: u64) -> bool {
    first_read_offset == 0 && file_size > 0 && file_size <= PRE_READ_MAX_SIZE
}

/// Kick off the speculative read as a detached task. Errors are swallowed
/// into `PreReadDescriptor::Failed`; normal reads fall back to on-demand
/// fetches regardless, so a failed pre-read is never fatal to the caller.
pub fn spawn(
    backend: Arc<dyn Backend>,
    container: ContainerId,
    oid: ObjectId,
    file_size: u64,
    active: ActiveRecord,
) {
    if active.preread().is_some() {
        return;
    }
    active.set_preread(Some(PreReadDescriptor::InFlight));
    tokio::spawn(async move {
        let mut offset = 0u64;
        let mut buf = vec![0u8; crate::chunk_cache::SLOT_SIZE as usize];
        while offset < file_size {
            let want = (file_size - offset).min(buf.len() as u64) as usize;
            match backend.read(container, oid, offset, &mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => {
                    active.insert(offset, Arc::from(&buf[..n]));
                    offset += n as u64;
                }
                Err(err) => {
                    warn!(?err, oid = %oid, "pre-read failed, falling back to on-demand reads");
                    active.set_preread(Some(PreReadDescriptor::Failed));
                    return;
                }
            }
        }
        debug!(oid = %oid, bytes = offset, "pre-read complete");
        active.set_preread(Some(PreReadDescriptor::Complete { len: offset }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_only_for_offset_zero_and_small_files() {
        assert!(should_trigger(1024, 0));
        assert!(!should_trigger(1024, 1));
        assert!(!should_trigger(0, 0));
        assert!(!should_trigger(PRE_READ_MAX_SIZE + 1, 0));
        assert!(should_trigger(PRE_READ_MAX_SIZE, 0));
    }
}
