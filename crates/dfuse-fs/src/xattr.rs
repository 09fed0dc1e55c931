//! Extended attribute namespace rules (§6 "xattr surface").
//!
//! A full xattr namespace is an explicit Non-goal; what's implemented here
//! is the fixed set of namespace rules dfuse itself enforces regardless of
//! what the backend stores, grounded on `ops/{get,set,list,remove}xattr.c`.

use libc::c_int;

/// How a given xattr name should be handled before it ever reaches the
/// backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrPolicy {
    /// Pass straight through to the backend.
    PassThrough,
    /// Reserved for dfuse's own bookkeeping; user setattr/removexattr on
    /// this namespace always fails.
    Reserved,
    /// ACLs and other `security.*`/`system.posix_acl*` namespaces dfuse
    /// doesn't implement; reads report "no such attribute", writes report
    /// "not supported".
    Unsupported,
    /// The UNS descriptor attribute: triggers cross-container mount
    /// resolution rather than a plain xattr read (§4.F.1).
    UnsDescriptor,
}

const DFUSE_RESERVED_PREFIX: &str = "user.daos.dfuse.";
/// The UNS descriptor xattr name, public so the filesystem layer can issue
/// the `getxattr` that drives mount-point resolution (§4.F.1) without this
/// module needing to know about inodes or the registry.
pub const UNS_ATTR_NAME: &str = "user.daos.duns";

#[must_use]
pub fn classify(name: &str) -> XattrPolicy {
    if name == UNS_ATTR_NAME {
        return XattrPolicy::UnsDescriptor;
    }
    if name.starts_with(DFUSE_RESERVED_PREFIX) {
        return XattrPolicy::Reserved;
    }
    if name.starts_with("security.") || name.starts_with("system.posix_acl") {
        return XattrPolicy::Unsupported;
    }
    XattrPolicy::PassThrough
}

/// errno a `getxattr`/`listxattr` on an unsupported namespace should return.
#[must_use]
pub fn unsupported_read_errno() -> c_int {
    libc::ENODATA
}

/// errno a `setxattr`/`removexattr` on an unsupported or reserved namespace
/// should return.
#[must_use]
pub fn write_denied_errno(policy: XattrPolicy) -> c_int {
    match policy {
        XattrPolicy::Reserved => libc::EPERM,
        XattrPolicy::Unsupported => libc::ENOTSUP,
        XattrPolicy::UnsDescriptor | XattrPolicy::PassThrough => libc::EINVAL,
    }
}

/// A parsed UNS (Unified Namespace) descriptor, per the value stored in
/// `user.daos.duns` on a cross-container mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsDescriptor {
    pub pool: String,
    pub container: String,
}

/// Parse a `"pool/<uuid>/container/<uuid>"` UNS descriptor string.
pub fn parse_uns_descriptor(value: &str) -> Option<UnsDescriptor> {
    let mut parts = value.splitn(4, '/');
    if parts.next()? != "pool" {
        return None;
    }
    let pool = parts.next()?.to_string();
    if parts.next()? != "container" {
        return None;
    }
    let container = parts.next()?.to_string();
    Some(UnsDescriptor { pool, container })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_reserved_namespace() {
        assert_eq!(classify("user.daos.dfuse.anything"), XattrPolicy::Reserved);
    }

    #[test]
    fn classifies_security_and_acl_namespaces_as_unsupported() {
        assert_eq!(classify("security.selinux"), XattrPolicy::Unsupported);
        assert_eq!(classify("system.posix_acl_access"), XattrPolicy::Unsupported);
    }

    #[test]
    fn classifies_uns_attribute() {
        assert_eq!(classify(UNS_ATTR_NAME), XattrPolicy::UnsDescriptor);
    }

    #[test]
    fn everything_else_passes_through() {
        assert_eq!(classify("user.mine"), XattrPolicy::PassThrough);
    }

    #[test]
    fn parses_uns_descriptor() {
        let parsed = parse_uns_descriptor("pool/11111111-1111-1111-1111-111111111111/container/22222222-2222-2222-2222-222222222222").unwrap();
        assert_eq!(parsed.pool, "11111111-1111-1111-1111-111111111111");
        assert_eq!(parsed.container, "22222222-2222-2222-2222-222222222222");
    }

    #[test]
    fn rejects_malformed_uns_descriptor() {
        assert!(parse_uns_descriptor("garbage").is_none());
    }
}
