//! The `Backend` port: everything §1 places out of scope (the `dfs` flat
//! namespace library, the transactional object store and its RPC).
//!
//! Each method here corresponds to one or more of the
//! `src/client/dfuse/ops/*.c` files in the original implementation: `lookup`
//! to `ops/lookup.c`, `read`/`write` to `ops/read.c`/`ops/write.c`, and so
//! on. `dfuse-fs` drives the filesystem state machine entirely through this
//! trait; `dfuse-backend` supplies the one concrete implementation.

use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::{ContainerId, ObjectId, PoolId};

/// Errors a backend call can fail with, independent of any errno mapping.
///
/// `dfuse-fs::error::DfuseError` is the single place these get turned into
/// `libc::c_int` values (§7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name too long")]
    NameTooLong,
    #[error("no space left")]
    NoSpace,
    #[error("cross-device link")]
    CrossDevice,
    #[error("stale handle")]
    Stale,
    #[error("operation not supported")]
    Unsupported,
    #[error("backend I/O error: {0}")]
    Io(String),
}

/// A single entry produced while iterating a directory (§4.F).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub oid: ObjectId,
    pub is_dir: bool,
}

/// Opaque resume position for a directory iteration, handed back by
/// `Backend::iterate` and passed back in on the next call. `dfuse-fs` never
/// inspects the contents; it only stores and replays it (§4.F "anchor").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterAnchor(pub Vec<u8>);

/// POSIX-ish stat information for an object (§3 "Inode record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub oid: ObjectId,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Fields a setattr call may update; `None` means "leave unchanged", per the
/// usual FUSE `to_set` bitmask convention (`ops/setattr.c`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// Capabilities negotiated at `dfs_mount` time (§14 "init() capability
/// negotiation"). `dfuse-fs` uses this to decide which kernel FUSE
/// capabilities it may advertise back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub supports_readdirplus: bool,
    pub supports_symlinks: bool,
    pub supports_xattr: bool,
}

/// The out-of-scope collaborator: a flat-file namespace mounted on a
/// container inside a pool, reached over an RPC transport this crate never
/// sees directly.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn pool_connect(&self, pool: PoolId) -> Result<(), BackendError>;
    async fn pool_disconnect(&self, pool: PoolId) -> Result<(), BackendError>;

    async fn cont_open(&self, pool: PoolId, container: ContainerId) -> Result<(), BackendError>;
    async fn cont_close(&self, pool: PoolId, container: ContainerId) -> Result<(), BackendError>;

    /// Mount the `dfs` namespace of a container, returning the root object
    /// id and the negotiated capabilities.
    async fn dfs_mount(
        &self,
        pool: PoolId,
        container: ContainerId,
    ) -> Result<(ObjectId, BackendCapabilities), BackendError>;
    async fn dfs_umount(&self, pool: PoolId, container: ContainerId) -> Result<(), BackendError>;

    /// Resolve `name` under `parent`, returning its stat if it exists.
    async fn lookup(
        &self,
        container: ContainerId,
        parent: ObjectId,
        name: &str,
    ) -> Result<ObjectStat, BackendError>;

    async fn getattr(&self, container: ContainerId, oid: ObjectId) -> Result<ObjectStat, BackendError>;

    async fn setattr(
        &self,
        container: ContainerId,
        oid: ObjectId,
        req: SetAttrRequest,
    ) -> Result<ObjectStat, BackendError>;

    /// Read up to `buf.len()` bytes at `offset`, returning the slice
    /// actually filled.
    async fn read(
        &self,
        container: ContainerId,
        oid: ObjectId,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, BackendError>;

    async fn write(
        &self,
        container: ContainerId,
        oid: ObjectId,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, BackendError>;

    async fn create(
        &self,
        container: ContainerId,
        parent: ObjectId,
        name: &str,
        mode: u32,
    ) -> Result<ObjectStat, BackendError>;

    async fn mkdir(
        &self,
        container: ContainerId,
        parent: ObjectId,
        name: &str,
        mode: u32,
    ) -> Result<ObjectStat, BackendError>;

    async fn unlink(&self, container: ContainerId, parent: ObjectId, name: &str) -> Result<(), BackendError>;
    async fn rmdir(&self, container: ContainerId, parent: ObjectId, name: &str) -> Result<(), BackendError>;

    async fn rename(
        &self,
        container: ContainerId,
        old_parent: ObjectId,
        old_name: &str,
        new_parent: ObjectId,
        new_name: &str,
    ) -> Result<(), BackendError>;

    async fn symlink(
        &self,
        container: ContainerId,
        parent: ObjectId,
        name: &str,
        target: &str,
    ) -> Result<ObjectStat, BackendError>;
    async fn readlink(&self, container: ContainerId, oid: ObjectId) -> Result<String, BackendError>;

    /// Fetch up to `limit` directory entries starting from `anchor`
    /// (`None` means "from the beginning"). Returns the entries plus the
    /// anchor to resume from, or `None` if iteration is exhausted.
    async fn iterate(
        &self,
        container: ContainerId,
        dir: ObjectId,
        anchor: Option<IterAnchor>,
        limit: usize,
    ) -> Result<(Vec<DirEntryInfo>, Option<IterAnchor>), BackendError>;

    async fn statfs(&self, container: ContainerId) -> Result<StatfsInfo, BackendError>;

    async fn getxattr(&self, container: ContainerId, oid: ObjectId, name: &str) -> Result<Vec<u8>, BackendError>;
    async fn setxattr(
        &self,
        container: ContainerId,
        oid: ObjectId,
        name: &str,
        value: &[u8],
    ) -> Result<(), BackendError>;
    async fn removexattr(&self, container: ContainerId, oid: ObjectId, name: &str) -> Result<(), BackendError>;
    async fn listxattr(&self, container: ContainerId, oid: ObjectId) -> Result<Vec<String>, BackendError>;
}

/// statfs reply shape (`ops/statfs.c`). Quota/accounting semantics are a
/// Non-goal; these are whatever the backend reports at the time of call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatfsInfo {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}
