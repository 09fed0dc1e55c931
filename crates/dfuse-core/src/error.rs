//! Error-kind taxonomy shared between the backend port and the core.
//!
//! Mirrors the error handling table in §7 of the spec: every error that can
//! reach a FUSE reply is classified into one of these kinds before the
//! `dfuse-fs` crate maps it to an errno.

use thiserror::Error;

/// Errors raised at the domain/config boundary (not yet mapped to errno;
/// that mapping happens once a [`BackendError`](crate::backend::BackendError)
/// or a core error reaches `dfuse-fs::error::DfuseError`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A caching-attribute value didn't match the `<N>[dhms]` or
    /// `off|false|on|true|otoc` grammar from §4.C.
    #[error("invalid caching attribute {name}={value}")]
    InvalidCachingAttribute { name: String, value: String },

    /// A mount option string was not one of the recognized forms.
    #[error("invalid mount option: {0}")]
    InvalidMountOption(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_offending_value() {
        let err = CoreError::InvalidCachingAttribute {
            name: "dentry_timeout".into(),
            value: "3q".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid caching attribute dentry_timeout=3q"
        );
    }
}
