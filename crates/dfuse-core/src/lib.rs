//! dfuse-core - domain identifiers, configuration and the backend port.
//!
//! This crate contains nothing that knows about FUSE or about any concrete
//! backend. `ids` defines the UUID-based identifiers the pool/container
//! registry keys on, `config` defines the mount and per-container caching
//! configuration, `error` defines the error-kind taxonomy from the spec's
//! error handling design, and `backend` defines the `Backend` trait that
//! stands in for the `dfs` library, the object store and their RPC
//! transport.

pub mod backend;
pub mod config;
pub mod error;
pub mod ids;

pub use backend::{
    Backend, BackendCapabilities, BackendError, DirEntryInfo, IterAnchor, ObjectStat, SetAttrRequest,
    StatfsInfo,
};
pub use config::{CacheAttrValue, CachingAttrs, MountConfig};
pub use error::CoreError;
pub use ids::{ContainerId, ObjectId, PoolId};
