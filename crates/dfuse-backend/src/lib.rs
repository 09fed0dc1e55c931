//! In-memory implementation of [`dfuse_core::Backend`].
//!
//! Stands in for the `dfs` flat-file library and the object store's RPC
//! transport, which §1 places out of scope for this crate. Every pool and
//! container lives entirely in memory behind a [`parking_lot::Mutex`], the
//! way the teacher wraps its one concrete adapter client in a
//! `tokio::sync::Mutex` rather than behind a trait object.

use std::{
    collections::BTreeMap,
    time::SystemTime,
};

use async_trait::async_trait;
use dashmap::DashMap;
use dfuse_core::{
    Backend, BackendCapabilities, BackendError, ContainerId, DirEntryInfo, IterAnchor, ObjectId, ObjectStat,
    PoolId, SetAttrRequest, StatfsInfo,
};
use parking_lot::Mutex;

const ROOT_OID: ObjectId = ObjectId::new(0, 1);
const DIR_MODE: u32 = 0o040_755;
const FILE_MODE: u32 = 0o100_644;
const NAME_MAX: usize = 255;

#[derive(Debug, Clone)]
struct Node {
    oid: ObjectId,
    parent: Option<ObjectId>,
    is_dir: bool,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    data: Vec<u8>,
    symlink_target: Option<String>,
    children: BTreeMap<String, ObjectId>,
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl Node {
    fn new_dir(oid: ObjectId, parent: Option<ObjectId>, mode: u32) -> Self {
        let now = SystemTime::now();
        Self {
            oid,
            parent,
            is_dir: true,
            mode: mode | libc_s_ifdir(),
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            data: Vec::new(),
            symlink_target: None,
            children: BTreeMap::new(),
            xattrs: BTreeMap::new(),
        }
    }

    fn new_file(oid: ObjectId, parent: ObjectId, mode: u32) -> Self {
        let now = SystemTime::now();
        Self {
            oid,
            parent: Some(parent),
            is_dir: false,
            mode,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            data: Vec::new(),
            symlink_target: None,
            children: BTreeMap::new(),
            xattrs: BTreeMap::new(),
        }
    }

    fn stat(&self) -> ObjectStat {
        ObjectStat {
            oid: self.oid,
            size: self.data.len() as u64,
            mode: self.mode,
            nlink: if self.is_dir { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

/// Bare-bones constant so directory modes look plausible without a libc
/// dependency in this crate; `dfuse-fs` is the only crate that talks to the
/// kernel's mode bits directly.
const fn libc_s_ifdir() -> u32 {
    0o040_000
}

struct ContainerTree {
    nodes: BTreeMap<u64, Node>,
    next_lo: u64,
}

impl ContainerTree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_OID.lo, Node::new_dir(ROOT_OID, None, DIR_MODE));
        Self { nodes, next_lo: 2 }
    }

    fn alloc(&mut self) -> ObjectId {
        let lo = self.next_lo;
        self.next_lo += 1;
        ObjectId::new(0, lo)
    }

    fn get(&self, oid: ObjectId) -> Result<&Node, BackendError> {
        self.nodes.get(&oid.lo).ok_or(BackendError::NotFound)
    }

    fn get_mut(&mut self, oid: ObjectId) -> Result<&mut Node, BackendError> {
        self.nodes.get_mut(&oid.lo).ok_or(BackendError::NotFound)
    }

    fn child_of(&self, parent: ObjectId, name: &str) -> Result<ObjectId, BackendError> {
        let parent = self.get(parent)?;
        if !parent.is_dir {
            return Err(BackendError::NotADirectory);
        }
        parent.children.get(name).copied().ok_or(BackendError::NotFound)
    }

    fn insert_child(
        &mut self,
        parent: ObjectId,
        name: &str,
        node: Node,
    ) -> Result<ObjectStat, BackendError> {
        validate_name(name)?;
        {
            let parent_node = self.get(parent)?;
            if !parent_node.is_dir {
                return Err(BackendError::NotADirectory);
            }
            if parent_node.children.contains_key(name) {
                return Err(BackendError::AlreadyExists);
            }
        }
        let oid = node.oid;
        let stat = node.stat();
        self.nodes.insert(oid.lo, node);
        let parent_node = self.get_mut(parent)?;
        parent_node.children.insert(name.to_string(), oid);
        parent_node.mtime = SystemTime::now();
        Ok(stat)
    }

    fn remove_child(&mut self, parent: ObjectId, name: &str, want_dir: bool) -> Result<(), BackendError> {
        let oid = self.child_of(parent, name)?;
        {
            let node = self.get(oid)?;
            if node.is_dir != want_dir {
                return if want_dir {
                    Err(BackendError::NotADirectory)
                } else {
                    Err(BackendError::IsADirectory)
                };
            }
            if node.is_dir && !node.children.is_empty() {
                return Err(BackendError::NotEmpty);
            }
        }
        self.nodes.remove(&oid.lo);
        let parent_node = self.get_mut(parent)?;
        parent_node.children.remove(name);
        parent_node.mtime = SystemTime::now();
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), BackendError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(BackendError::InvalidArgument);
    }
    if name.len() > NAME_MAX {
        return Err(BackendError::NameTooLong);
    }
    Ok(())
}

/// A fully in-memory pool/container/object tree, keyed by [`PoolId`] and
/// [`ContainerId`]. Each mounted container gets one fresh root directory;
/// nothing is persisted across process restarts (this is a reference
/// implementation, not `dfs` itself).
pub struct MemoryBackend {
    pools: DashMap<PoolId, ()>,
    containers: DashMap<(PoolId, ContainerId), ()>,
    trees: DashMap<ContainerId, Mutex<ContainerTree>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
            containers: DashMap::new(),
            trees: DashMap::new(),
        }
    }

    fn tree(&self, container: ContainerId) -> Result<dashmap::mapref::one::Ref<'_, ContainerId, Mutex<ContainerTree>>, BackendError> {
        self.trees.get(&container).ok_or(BackendError::Stale)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn pool_connect(&self, pool: PoolId) -> Result<(), BackendError> {
        self.pools.insert(pool, ());
        Ok(())
    }

    async fn pool_disconnect(&self, pool: PoolId) -> Result<(), BackendError> {
        self.pools.remove(&pool);
        Ok(())
    }

    async fn cont_open(&self, pool: PoolId, container: ContainerId) -> Result<(), BackendError> {
        if !self.pools.contains_key(&pool) {
            return Err(BackendError::InvalidArgument);
        }
        self.containers.insert((pool, container), ());
        self.trees.entry(container).or_insert_with(|| Mutex::new(ContainerTree::new()));
        Ok(())
    }

    async fn cont_close(&self, pool: PoolId, container: ContainerId) -> Result<(), BackendError> {
        self.containers.remove(&(pool, container));
        Ok(())
    }

    async fn dfs_mount(
        &self,
        pool: PoolId,
        container: ContainerId,
    ) -> Result<(ObjectId, BackendCapabilities), BackendError> {
        if !self.containers.contains_key(&(pool, container)) {
            return Err(BackendError::InvalidArgument);
        }
        Ok((
            ROOT_OID,
            BackendCapabilities {
                supports_readdirplus: true,
                supports_symlinks: true,
                supports_xattr: true,
            },
        ))
    }

    async fn dfs_umount(&self, _pool: PoolId, container: ContainerId) -> Result<(), BackendError> {
        self.trees.remove(&container);
        Ok(())
    }

    async fn lookup(
        &self,
        container: ContainerId,
        parent: ObjectId,
        name: &str,
    ) -> Result<ObjectStat, BackendError> {
        let tree = self.tree(container)?;
        let tree = tree.lock();
        let oid = tree.child_of(parent, name)?;
        Ok(tree.get(oid)?.stat())
    }

    async fn getattr(&self, container: ContainerId, oid: ObjectId) -> Result<ObjectStat, BackendError> {
        let tree = self.tree(container)?;
        let tree = tree.lock();
        Ok(tree.get(oid)?.stat())
    }

    async fn setattr(
        &self,
        container: ContainerId,
        oid: ObjectId,
        req: SetAttrRequest,
    ) -> Result<ObjectStat, BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        let node = tree.get_mut(oid)?;
        if let Some(size) = req.size {
            node.data.resize(size as usize, 0);
        }
        if let Some(mode) = req.mode {
            node.mode = mode;
        }
        if let Some(uid) = req.uid {
            node.uid = uid;
        }
        if let Some(gid) = req.gid {
            node.gid = gid;
        }
        if let Some(atime) = req.atime {
            node.atime = atime;
        }
        if let Some(mtime) = req.mtime {
            node.mtime = mtime;
        }
        node.ctime = SystemTime::now();
        Ok(node.stat())
    }

    async fn read(
        &self,
        container: ContainerId,
        oid: ObjectId,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        let node = tree.get_mut(oid)?;
        if node.is_dir {
            return Err(BackendError::IsADirectory);
        }
        let offset = offset as usize;
        if offset >= node.data.len() {
            return Ok(0);
        }
        let n = (node.data.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&node.data[offset..offset + n]);
        node.atime = SystemTime::now();
        Ok(n)
    }

    async fn write(
        &self,
        container: ContainerId,
        oid: ObjectId,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        let node = tree.get_mut(oid)?;
        if node.is_dir {
            return Err(BackendError::IsADirectory);
        }
        let offset = offset as usize;
        let end = offset + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(data);
        node.mtime = SystemTime::now();
        Ok(data.len())
    }

    async fn create(
        &self,
        container: ContainerId,
        parent: ObjectId,
        name: &str,
        mode: u32,
    ) -> Result<ObjectStat, BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        let oid = tree.alloc();
        let node = Node::new_file(oid, parent, mode | FILE_MODE & 0o170_000);
        tree.insert_child(parent, name, node)
    }

    async fn mkdir(
        &self,
        container: ContainerId,
        parent: ObjectId,
        name: &str,
        mode: u32,
    ) -> Result<ObjectStat, BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        let oid = tree.alloc();
        let node = Node::new_dir(oid, Some(parent), mode);
        tree.insert_child(parent, name, node)
    }

    async fn unlink(&self, container: ContainerId, parent: ObjectId, name: &str) -> Result<(), BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        tree.remove_child(parent, name, false)
    }

    async fn rmdir(&self, container: ContainerId, parent: ObjectId, name: &str) -> Result<(), BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        tree.remove_child(parent, name, true)
    }

    async fn rename(
        &self,
        container: ContainerId,
        old_parent: ObjectId,
        old_name: &str,
        new_parent: ObjectId,
        new_name: &str,
    ) -> Result<(), BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        let oid = tree.child_of(old_parent, old_name)?;
        if let Ok(existing) = tree.child_of(new_parent, new_name) {
            let is_dir = tree.get(existing)?.is_dir;
            tree.remove_child(new_parent, new_name, is_dir)?;
        }
        {
            let old_parent_node = tree.get_mut(old_parent)?;
            old_parent_node.children.remove(old_name);
        }
        validate_name(new_name)?;
        {
            let new_parent_node = tree.get_mut(new_parent)?;
            new_parent_node.children.insert(new_name.to_string(), oid);
        }
        let node = tree.get_mut(oid)?;
        node.parent = Some(new_parent);
        node.ctime = SystemTime::now();
        Ok(())
    }

    async fn symlink(
        &self,
        container: ContainerId,
        parent: ObjectId,
        name: &str,
        target: &str,
    ) -> Result<ObjectStat, BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        let oid = tree.alloc();
        let mut node = Node::new_file(oid, parent, 0o120_777);
        node.symlink_target = Some(target.to_string());
        tree.insert_child(parent, name, node)
    }

    async fn readlink(&self, container: ContainerId, oid: ObjectId) -> Result<String, BackendError> {
        let tree = self.tree(container)?;
        let tree = tree.lock();
        tree.get(oid)?.symlink_target.clone().ok_or(BackendError::InvalidArgument)
    }

    async fn iterate(
        &self,
        container: ContainerId,
        dir: ObjectId,
        anchor: Option<IterAnchor>,
        limit: usize,
    ) -> Result<(Vec<DirEntryInfo>, Option<IterAnchor>), BackendError> {
        let tree = self.tree(container)?;
        let tree = tree.lock();
        let node = tree.get(dir)?;
        if !node.is_dir {
            return Err(BackendError::NotADirectory);
        }
        let resume_after = anchor
            .and_then(|a| String::from_utf8(a.0).ok())
            .unwrap_or_default();
        let mut entries = Vec::new();
        let mut next_anchor = None;
        for (name, oid) in node.children.range(resume_after.clone()..) {
            if !resume_after.is_empty() && name == &resume_after {
                continue;
            }
            if entries.len() == limit {
                next_anchor = Some(IterAnchor(name.clone().into_bytes()));
                break;
            }
            let child = tree.get(*oid)?;
            entries.push(DirEntryInfo {
                name: name.clone(),
                oid: *oid,
                is_dir: child.is_dir,
            });
        }
        Ok((entries, next_anchor))
    }

    async fn statfs(&self, container: ContainerId) -> Result<StatfsInfo, BackendError> {
        let tree = self.tree(container)?;
        let tree = tree.lock();
        Ok(StatfsInfo {
            blocks: 1 << 20,
            bfree: 1 << 19,
            bavail: 1 << 19,
            files: tree.nodes.len() as u64,
            ffree: u64::MAX - tree.nodes.len() as u64,
            bsize: 4096,
            namelen: NAME_MAX as u32,
        })
    }

    async fn getxattr(&self, container: ContainerId, oid: ObjectId, name: &str) -> Result<Vec<u8>, BackendError> {
        let tree = self.tree(container)?;
        let tree = tree.lock();
        tree.get(oid)?.xattrs.get(name).cloned().ok_or(BackendError::NotFound)
    }

    async fn setxattr(
        &self,
        container: ContainerId,
        oid: ObjectId,
        name: &str,
        value: &[u8],
    ) -> Result<(), BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        tree.get_mut(oid)?.xattrs.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn removexattr(&self, container: ContainerId, oid: ObjectId, name: &str) -> Result<(), BackendError> {
        let tree = self.tree(container)?;
        let mut tree = tree.lock();
        tree.get_mut(oid)?.xattrs.remove(name).ok_or(BackendError::NotFound)?;
        Ok(())
    }

    async fn listxattr(&self, container: ContainerId, oid: ObjectId) -> Result<Vec<String>, BackendError> {
        let tree = self.tree(container)?;
        let tree = tree.lock();
        Ok(tree.get(oid)?.xattrs.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mounted() -> (MemoryBackend, ContainerId, ObjectId) {
        let backend = MemoryBackend::new();
        let pool = PoolId::new();
        let container = ContainerId::new();
        backend.pool_connect(pool).await.unwrap();
        backend.cont_open(pool, container).await.unwrap();
        let (root, caps) = backend.dfs_mount(pool, container).await.unwrap();
        assert!(caps.supports_xattr);
        (backend, container, root)
    }

    #[tokio::test]
    async fn create_then_lookup_roundtrips() {
        let (backend, container, root) = mounted().await;
        let created = backend.create(container, root, "a.txt", 0o644).await.unwrap();
        let looked_up = backend.lookup(container, root, "a.txt").await.unwrap();
        assert_eq!(created.oid, looked_up.oid);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (backend, container, root) = mounted().await;
        backend.create(container, root, "a.txt", 0o644).await.unwrap();
        let err = backend.create(container, root, "a.txt", 0o644).await.unwrap_err();
        assert_eq!(err, BackendError::AlreadyExists);
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let (backend, container, root) = mounted().await;
        let stat = backend.create(container, root, "a.txt", 0o644).await.unwrap();
        backend.write(container, stat.oid, 0, b"hello world").await.unwrap();
        let mut buf = [0u8; 5];
        let n = backend.read(container, stat.oid, 6, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn rmdir_on_nonempty_directory_fails() {
        let (backend, container, root) = mounted().await;
        let dir = backend.mkdir(container, root, "d", 0o755).await.unwrap();
        backend.create(container, dir.oid, "f", 0o644).await.unwrap();
        let err = backend.rmdir(container, root, "d").await.unwrap_err();
        assert_eq!(err, BackendError::NotEmpty);
    }

    #[tokio::test]
    async fn rename_moves_entry_between_directories() {
        let (backend, container, root) = mounted().await;
        let dir = backend.mkdir(container, root, "d", 0o755).await.unwrap();
        backend.create(container, root, "f", 0o644).await.unwrap();
        backend.rename(container, root, "f", dir.oid, "g").await.unwrap();
        assert_eq!(backend.lookup(container, root, "f").await.unwrap_err(), BackendError::NotFound);
        assert!(backend.lookup(container, dir.oid, "g").await.is_ok());
    }

    #[tokio::test]
    async fn iterate_paginates_with_anchor() {
        let (backend, container, root) = mounted().await;
        for name in ["a", "b", "c"] {
            backend.create(container, root, name, 0o644).await.unwrap();
        }
        let (first, anchor) = backend.iterate(container, root, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let anchor = anchor.expect("more entries remain");
        let (rest, anchor2) = backend.iterate(container, root, Some(anchor), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(anchor2.is_none());
    }

    #[tokio::test]
    async fn xattr_set_get_list_remove() {
        let (backend, container, root) = mounted().await;
        let stat = backend.create(container, root, "a.txt", 0o644).await.unwrap();
        backend.setxattr(container, stat.oid, "user.tag", b"v1").await.unwrap();
        assert_eq!(backend.getxattr(container, stat.oid, "user.tag").await.unwrap(), b"v1");
        assert_eq!(backend.listxattr(container, stat.oid).await.unwrap(), vec!["user.tag".to_string()]);
        backend.removexattr(container, stat.oid, "user.tag").await.unwrap();
        assert_eq!(backend.getxattr(container, stat.oid, "user.tag").await.unwrap_err(), BackendError::NotFound);
    }
}
