//! Pool/container registry (§4.C).
//!
//! Mirrors the reference-counted hash-table entry pattern used throughout
//! the spec (`find_insert`/`addref`/`decref`/`free`) for pools and
//! containers instead of inodes. A container that's been unmounted is kept
//! around briefly as a "historic" shadow so in-flight operations that
//! captured its `container_ino` before the unmount don't immediately start
//! failing lookups against a gone-missing map entry.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use dfuse_core::{Backend, BackendCapabilities, BackendError, CachingAttrs, ContainerId, ObjectId, PoolId};
use thiserror::Error;
use tracing::{info, warn};

use crate::inode::ContainerInoAllocator;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("invalid caching attribute")]
    InvalidCachingAttribute,
    #[error("container not mounted")]
    NotMounted,
}

pub struct ContainerRecord {
    pub pool: PoolId,
    pub container: ContainerId,
    pub container_ino: u16,
    pub root_oid: ObjectId,
    pub root_ino: u64,
    pub caching: CachingAttrs,
    pub capabilities: BackendCapabilities,
}

/// Tracks which pools and containers are currently (or were recently)
/// mounted, and hands out the small per-container index `compute_ino`
/// needs.
pub struct Registry {
    backend: Arc<dyn Backend>,
    ino_alloc: ContainerInoAllocator,
    pools: DashMap<PoolId, ()>,
    live: DashMap<ContainerId, Arc<ContainerRecord>>,
    historic: DashMap<ContainerId, Arc<ContainerRecord>>,
}

impl Registry {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            ino_alloc: ContainerInoAllocator::default(),
            pools: DashMap::new(),
            live: DashMap::new(),
            historic: DashMap::new(),
        }
    }

    /// Mount a container, computing its inode-number namespace index and
    /// resolving its caching attributes (§4.C composite rules), and return
    /// the published record plus the root object id `dfuse-fs` should seed
    /// the root inode with.
    pub async fn mount(
        &self,
        pool: PoolId,
        container: ContainerId,
        raw_caching_attrs: &HashMap<String, String>,
        root_ino: u64,
    ) -> Result<Arc<ContainerRecord>, RegistryError> {
        if let Some(existing) = self.live.get(&container) {
            return Ok(existing.clone());
        }
        if self.pools.insert(pool, ()).is_none() {
            self.backend.pool_connect(pool).await?;
        }
        self.backend.cont_open(pool, container).await?;
        let (root_oid, capabilities) = self.backend.dfs_mount(pool, container).await?;

        let (caching, overridden) =
            CachingAttrs::from_raw(raw_caching_attrs).map_err(|_| RegistryError::InvalidCachingAttribute)?;
        if overridden {
            warn!(
                container = %container,
                "direct_io_disable is on and data cache was off; forcing data cache on"
            );
        }

        let record = Arc::new(ContainerRecord {
            pool,
            container,
            container_ino: self.ino_alloc.alloc(),
            root_oid,
            root_ino,
            caching,
            capabilities,
        });
        self.live.insert(container, record.clone());
        self.historic.remove(&container);
        info!(container = %container, container_ino = record.container_ino, "container mounted");
        Ok(record)
    }

    pub fn get(&self, container: ContainerId) -> Option<Arc<ContainerRecord>> {
        self.live.get(&container).map(|e| e.clone())
    }

    /// Same as [`Registry::get`] but also consults the historic shadow map,
    /// for code paths racing an unmount (§4.C).
    pub fn get_even_historic(&self, container: ContainerId) -> Option<Arc<ContainerRecord>> {
        self.get(container).or_else(|| self.historic.get(&container).map(|e| e.clone()))
    }

    pub async fn unmount(&self, container: ContainerId) -> Result<(), RegistryError> {
        let Some((_, record)) = self.live.remove(&container) else {
            return Err(RegistryError::NotMounted);
        };
        self.backend.dfs_umount(record.pool, container).await?;
        self.backend.cont_close(record.pool, container).await?;
        self.historic.insert(container, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfuse_backend::MemoryBackend;

    #[tokio::test]
    async fn mount_is_idempotent_and_assigns_distinct_container_inos() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let registry = Registry::new(backend);
        let pool = PoolId::new();
        let c1 = ContainerId::new();
        let c2 = ContainerId::new();
        let r1 = registry.mount(pool, c1, &HashMap::new(), 1).await.unwrap();
        let r1_again = registry.mount(pool, c1, &HashMap::new(), 1).await.unwrap();
        let r2 = registry.mount(pool, c2, &HashMap::new(), 1).await.unwrap();
        assert_eq!(r1.container_ino, r1_again.container_ino);
        assert_ne!(r1.container_ino, r2.container_ino);
    }

    #[tokio::test]
    async fn unmount_moves_record_to_historic_shadow() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let registry = Registry::new(backend);
        let pool = PoolId::new();
        let container = ContainerId::new();
        registry.mount(pool, container, &HashMap::new(), 1).await.unwrap();
        registry.unmount(container).await.unwrap();
        assert!(registry.get(container).is_none());
        assert!(registry.get_even_historic(container).is_some());
    }

    #[tokio::test]
    async fn direct_io_disable_with_data_cache_off_logs_and_forces_on() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let registry = Registry::new(backend);
        let pool = PoolId::new();
        let container = ContainerId::new();
        let mut raw = HashMap::new();
        raw.insert("direct_io_disable".to_string(), "on".to_string());
        raw.insert("data_timeout".to_string(), "off".to_string());
        let record = registry.mount(pool, container, &raw, 1).await.unwrap();
        assert!(record.caching.data_cache);
    }
}
