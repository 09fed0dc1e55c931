//! UUID-based identifiers for backend pools, containers and objects.
//!
//! These are newtypes over [`uuid::Uuid`] for the same reason the rest of
//! this codebase wraps raw identifiers: a pool UUID and a container UUID are
//! both 128 bits and nothing at the type level should let them be swapped.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Borrow the inner UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_newtype!(PoolId, "Identifier for a backend pool.");
uuid_newtype!(ContainerId, "Identifier for a backend container.");

/// A backend object identifier, as a (hi, lo) pair of 64-bit halves.
///
/// §3 of the spec derives the FUSE inode number from this value; kept as two
/// `u64` halves rather than a single `u128` because the inode-number formula
/// operates on each half independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

impl ObjectId {
    #[must_use]
    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{:016x}", self.hi, self.lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_roundtrips_through_uuid() {
        let uuid = Uuid::new_v4();
        let pool = PoolId::from_uuid(uuid);
        assert_eq!(*pool.as_uuid(), uuid);
        assert_eq!(pool.to_string(), uuid.to_string());
    }

    #[test]
    fn distinct_new_ids_are_not_equal() {
        assert_ne!(PoolId::new(), PoolId::new());
        assert_ne!(ContainerId::new(), ContainerId::new());
    }

    #[test]
    fn object_id_display_is_fixed_width_hex() {
        let id = ObjectId::new(0xdead_beef, 1);
        assert_eq!(id.to_string(), "00000000deadbeef.0000000000000001");
    }
}
