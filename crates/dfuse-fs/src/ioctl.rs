//! The interception-library and administrative ioctl surface (§6, §14).
//!
//! These are the `ioctl()` calls a process linked against the interception
//! library (`il/int_posix.c`) issues against a dfuse-mounted file, plus the
//! `DFUSE_EVICT` administrative call. The interception library itself is
//! out of scope (§1); this module only implements dfuse's side of the
//! protocol.

use dfuse_core::{ContainerId, ObjectId, PoolId};

use crate::error::DfuseError;
use crate::inode::InodeTable;
use crate::registry::ContainerRecord;

/// Current protocol version dfuse expects from the interception library.
/// A version mismatch is always rejected with `EINVAL` (§14), never
/// silently accepted, so an old IL build against a new dfuse fails loudly.
pub const DFUSE_IOCTL_VERSION: u32 = 3;

/// Reported struct sizes for `DFUSE_IOCTL_IL_SIZE`/`DFUSE_IOCTL_IL_DSIZE`,
/// letting the interception library size its own buffers without dfuse
/// and the IL needing to share a header.
pub const IL_REPLY_STRUCT_SIZE: u32 = 32;
pub const IL_DFS_REPLY_STRUCT_SIZE: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlOp {
    /// Attach the interception library to this inode; carries the caller's
    /// protocol version.
    Attach { version: u32 },
    Detach,
    QuerySize,
    QueryDfsSize,
    /// Reply payloads carrying the pool/container/dfs/object open handles
    /// the interception library needs to make its own direct `dfs` calls.
    ReplyPoolHandle,
    ReplyContainerHandle,
    ReplyDfsHandle,
    ReplyObjectHandle,
    ReplyFileInfo,
    /// Single-inode lookup/open refcount query (§14 supplemental
    /// behaviour), not a whole-table dump.
    CountQuery,
    /// Administrative forced eviction.
    Evict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountQueryReply {
    pub lookup_count: u64,
    pub open_count: u64,
}

/// Set in [`AttachReply::flags`] when the inode is currently open for
/// writing, so the interception library knows its writes need the
/// invalidation upcall rather than being purely local.
pub const ATTACH_FLAG_WRITABLE: u32 = 1 << 0;

/// The payload an `Attach` replies with: everything the interception
/// library needs to make its own direct backend calls against this inode
/// without going back through dfuse for every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachReply {
    pub pool: PoolId,
    pub container: ContainerId,
    pub oid: ObjectId,
    pub flags: u32,
}

impl AttachReply {
    /// Pool UUID, container UUID, object id (hi, lo), flags - all
    /// native-endian, matching [`IL_REPLY_STRUCT_SIZE`].
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IL_REPLY_STRUCT_SIZE as usize);
        out.extend_from_slice(self.pool.as_uuid().as_bytes());
        out.extend_from_slice(self.container.as_uuid().as_bytes());
        out.extend_from_slice(&self.oid.hi.to_ne_bytes());
        out.extend_from_slice(&self.oid.lo.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out
    }
}

/// Validate the protocol version an `Attach` carries. The interception
/// library and dfuse must agree exactly; there is no negotiation.
pub fn validate_attach_version(version: u32) -> Result<(), DfuseError> {
    if version != DFUSE_IOCTL_VERSION {
        return Err(DfuseError::InvalidArgument("interception library protocol version mismatch"));
    }
    Ok(())
}

/// `record` must be the [`ContainerRecord`] for `entry`'s *effective*
/// container (after any UNS mount-point swap, §4.F.1), not necessarily the
/// top-level mount's own record.
pub fn attach(table: &InodeTable, record: &ContainerRecord, ino: u64, version: u32) -> Result<AttachReply, DfuseError> {
    validate_attach_version(version)?;
    let entry = table.get(ino).ok_or(DfuseError::UnknownInode(ino))?;
    entry.il_attach();
    let flags = if entry.open_write_count() > 0 { ATTACH_FLAG_WRITABLE } else { 0 };
    Ok(AttachReply {
        pool: record.pool,
        container: entry.effective_container(),
        oid: entry.effective_oid(),
        flags,
    })
}

#[must_use]
pub fn query_il_reply_size() -> u32 {
    IL_REPLY_STRUCT_SIZE
}

#[must_use]
pub fn query_dfs_reply_size() -> u32 {
    IL_DFS_REPLY_STRUCT_SIZE
}

/// `REPLY_POH`: the pool UUID alone, for an IL that queries each handle
/// separately instead of taking them all from the `Attach` reply.
#[must_use]
pub fn reply_pool_handle(record: &ContainerRecord) -> Vec<u8> {
    record.pool.as_uuid().as_bytes().to_vec()
}

/// `REPLY_COH`: the container UUID alone.
#[must_use]
pub fn reply_container_handle(record: &ContainerRecord) -> Vec<u8> {
    record.container.as_uuid().as_bytes().to_vec()
}

/// `REPLY_DOH`: the mounted dfs's root object id.
#[must_use]
pub fn reply_dfs_handle(record: &ContainerRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&record.root_oid.hi.to_ne_bytes());
    out.extend_from_slice(&record.root_oid.lo.to_ne_bytes());
    out
}

/// `REPLY_DOOH`: this specific inode's object id.
pub fn reply_object_handle(table: &InodeTable, ino: u64) -> Result<Vec<u8>, DfuseError> {
    let entry = table.get(ino).ok_or(DfuseError::UnknownInode(ino))?;
    let oid = entry.effective_oid();
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&oid.hi.to_ne_bytes());
    out.extend_from_slice(&oid.lo.to_ne_bytes());
    Ok(out)
}

/// `REPLY_PFILE`: pool and container handles too large to return inline are
/// written to a private temp file, with its path handed back instead -
/// mirroring the original `dfuse` IL protocol's large-handle fallback.
pub fn reply_file_info(record: &ContainerRecord) -> Result<Vec<u8>, DfuseError> {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new()
        .map_err(|_| DfuseError::InvalidArgument("failed to create interception library handle file"))?;
    file.write_all(record.pool.as_uuid().as_bytes())
        .and_then(|()| file.write_all(record.container.as_uuid().as_bytes()))
        .map_err(|_| DfuseError::InvalidArgument("failed to write interception library handle file"))?;
    let (_, path) = file
        .keep()
        .map_err(|_| DfuseError::InvalidArgument("failed to persist interception library handle file"))?;
    Ok(path.to_string_lossy().into_owned().into_bytes())
}

/// Decode a raw ioctl `cmd` number into the operation it names. dfuse's own
/// numbering, since the interception library's wire format itself is out
/// of scope (§1) - only dfuse's side of the protocol is implemented here.
#[must_use]
pub fn decode_cmd(cmd: u32, in_data: &[u8]) -> Option<IoctlOp> {
    match cmd {
        0 => Some(IoctlOp::Attach {
            version: u32::from_ne_bytes(in_data.get(..4)?.try_into().ok()?),
        }),
        1 => Some(IoctlOp::CountQuery),
        2 => Some(IoctlOp::Evict),
        3 => Some(IoctlOp::Detach),
        4 => Some(IoctlOp::QuerySize),
        5 => Some(IoctlOp::QueryDfsSize),
        6 => Some(IoctlOp::ReplyPoolHandle),
        7 => Some(IoctlOp::ReplyContainerHandle),
        8 => Some(IoctlOp::ReplyDfsHandle),
        9 => Some(IoctlOp::ReplyObjectHandle),
        10 => Some(IoctlOp::ReplyFileInfo),
        _ => None,
    }
}

pub fn detach(table: &InodeTable, ino: u64) -> Result<(), DfuseError> {
    let entry = table.get(ino).ok_or(DfuseError::UnknownInode(ino))?;
    entry.il_detach();
    Ok(())
}

/// Answer a `COUNT_QUERY`: the lookup and open counts for exactly the one
/// inode asked about, not the whole table (§14).
pub fn count_query(table: &InodeTable, ino: u64) -> Result<CountQueryReply, DfuseError> {
    let entry = table.get(ino).ok_or(DfuseError::UnknownInode(ino))?;
    Ok(CountQueryReply {
        lookup_count: entry.lookup_count(),
        open_count: entry.open_count(),
    })
}

/// `DFUSE_EVICT`: force-drop an inode's cached state. Refuses inodes that
/// are still open or still attached to the interception library rather
/// than silently doing nothing.
pub fn evict(table: &InodeTable, ino: u64) -> Result<(), DfuseError> {
    let entry = table.get(ino).ok_or(DfuseError::UnknownInode(ino))?;
    if !entry.is_evictable() {
        return Err(DfuseError::InvalidArgument("inode is still open or IL-attached"));
    }
    entry.clear_active_record();
    table.forget(ino, entry.lookup_count());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfuse_core::{BackendCapabilities, CachingAttrs, ObjectStat};
    use std::time::SystemTime;

    fn seed(table: &InodeTable) -> (u64, ContainerId) {
        let container = ContainerId::new();
        let oid = ObjectId::new(1, 2);
        let stat = ObjectStat {
            oid,
            size: 0,
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            atime: SystemTime::now(),
            mtime: SystemTime::now(),
            ctime: SystemTime::now(),
        };
        let entry = table.find_insert(container, oid, crate::inode_entry::ROOT_INO, 1, stat);
        (entry.ino, container)
    }

    fn record(container: ContainerId) -> ContainerRecord {
        ContainerRecord {
            pool: PoolId::new(),
            container,
            container_ino: 0,
            root_oid: ObjectId::new(0, 1),
            root_ino: crate::inode_entry::ROOT_INO,
            caching: CachingAttrs::default(),
            capabilities: BackendCapabilities {
                supports_readdirplus: true,
                supports_symlinks: true,
                supports_xattr: true,
            },
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        assert!(validate_attach_version(DFUSE_IOCTL_VERSION).is_ok());
        assert!(validate_attach_version(DFUSE_IOCTL_VERSION + 1).is_err());
    }

    #[test]
    fn attach_increments_il_count_and_count_query_reports_it() {
        let table = InodeTable::new();
        let (ino, container) = seed(&table);
        let reply = attach(&table, &record(container), ino, DFUSE_IOCTL_VERSION).unwrap();
        assert_eq!(reply.container, container);
        let counted = count_query(&table, ino).unwrap();
        assert_eq!(counted.lookup_count, 1);
        detach(&table, ino).unwrap();
    }

    #[test]
    fn attach_reports_writable_flag_only_when_a_write_handle_is_open() {
        let table = InodeTable::new();
        let (ino, container) = seed(&table);
        let entry = table.get(ino).unwrap();
        entry.on_open(true);
        let reply = attach(&table, &record(container), ino, DFUSE_IOCTL_VERSION).unwrap();
        assert_eq!(reply.flags & ATTACH_FLAG_WRITABLE, ATTACH_FLAG_WRITABLE);
    }

    #[test]
    fn attach_reply_encodes_to_the_advertised_struct_size() {
        let table = InodeTable::new();
        let (ino, container) = seed(&table);
        let reply = attach(&table, &record(container), ino, DFUSE_IOCTL_VERSION).unwrap();
        assert_eq!(reply.encode().len(), IL_REPLY_STRUCT_SIZE as usize);
    }

    #[test]
    fn decode_cmd_recognizes_every_known_op() {
        assert_eq!(decode_cmd(0, &0u32.to_ne_bytes()), Some(IoctlOp::Attach { version: 0 }));
        assert_eq!(decode_cmd(1, &[]), Some(IoctlOp::CountQuery));
        assert_eq!(decode_cmd(2, &[]), Some(IoctlOp::Evict));
        assert_eq!(decode_cmd(3, &[]), Some(IoctlOp::Detach));
        assert_eq!(decode_cmd(10, &[]), Some(IoctlOp::ReplyFileInfo));
        assert_eq!(decode_cmd(99, &[]), None);
    }

    #[test]
    fn evict_refuses_open_inode() {
        let table = InodeTable::new();
        let (ino, _) = seed(&table);
        let entry = table.get(ino).unwrap();
        entry.on_open(false);
        assert!(evict(&table, ino).is_err());
    }
}
