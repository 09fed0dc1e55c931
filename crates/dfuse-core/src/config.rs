//! Mount configuration and per-container caching attributes.
//!
//! `CachingAttrs` parsing follows §4.C of the spec: a bounded, named set of
//! attributes read off a container root, each accepting one of
//! `off`/`false`/`on`/`true`/`otoc`/`<N>[dhms]`. Kept free of any FUSE or
//! backend dependency so the grammar is unit-testable on its own, the way
//! the teacher's `Config::validate` is tested without a mounted filesystem.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A parsed but not-yet-specialized caching attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAttrValue {
    Off,
    On,
    /// "Open to close" - cache only for the lifetime of one open/close pair.
    Otoc,
    Duration(Duration),
}

/// Parse one caching-attribute string per the grammar in §4.C.
///
/// Accepts `off`, `false`, `on`, `true`, `otoc`, or an integer followed by
/// an optional single-letter suffix (`d` = 86400, `h` = 3600, `m` = 60,
/// `s` = 1; no suffix also means seconds). Anything else is rejected.
pub fn parse_caching_attr(raw: &str) -> Result<CacheAttrValue, CoreError> {
    match raw {
        "off" | "false" => return Ok(CacheAttrValue::Off),
        "on" | "true" => return Ok(CacheAttrValue::On),
        "otoc" => return Ok(CacheAttrValue::Otoc),
        _ => {}
    }
    parse_duration_suffix(raw)
        .map(CacheAttrValue::Duration)
        .ok_or_else(|| CoreError::InvalidCachingAttribute {
            name: String::new(),
            value: raw.to_string(),
        })
}

fn parse_duration_suffix(raw: &str) -> Option<Duration> {
    if raw.is_empty() {
        return None;
    }
    let (digits, multiplier) = match raw.as_bytes()[raw.len() - 1] {
        b'd' => (&raw[..raw.len() - 1], 86_400u64),
        b'h' => (&raw[..raw.len() - 1], 3_600u64),
        b'm' => (&raw[..raw.len() - 1], 60u64),
        b's' => (&raw[..raw.len() - 1], 1u64),
        b'0'..=b'9' => (raw, 1u64),
        _ => return None,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    Some(Duration::from_secs(n.saturating_mul(multiplier)))
}

/// The fixed, bounded set of caching-attribute names read off a container
/// root, per §14's note on `dfuse_da.c`.
pub const CACHING_ATTR_NAMES: &[&str] = &[
    "attr_timeout",
    "dentry_timeout",
    "dentry_dir_timeout",
    "ndentry_timeout",
    "data_timeout",
    "direct_io_disable",
    "data_otoc",
    "writeback",
];

/// Resolved per-container caching parameters (§3 "Container record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachingAttrs {
    pub attr_timeout: Duration,
    pub dentry_timeout: Duration,
    pub dentry_dir_timeout: Duration,
    pub negative_dentry_timeout: Duration,
    pub data_timeout: Duration,
    pub data_cache: bool,
    pub direct_io_disable: bool,
    pub data_otoc: bool,
    pub writeback: bool,
}

impl Default for CachingAttrs {
    fn default() -> Self {
        Self {
            attr_timeout: Duration::from_secs(1),
            dentry_timeout: Duration::from_secs(1),
            dentry_dir_timeout: Duration::from_secs(1),
            negative_dentry_timeout: Duration::from_secs(1),
            data_timeout: Duration::from_secs(1),
            data_cache: true,
            direct_io_disable: false,
            data_otoc: false,
            writeback: false,
        }
    }
}

impl CachingAttrs {
    /// Build from the raw `name -> value` map read off the container root,
    /// applying the §4.C composite rules:
    ///
    /// - if `direct_io_disable` is on and data caching is off, data caching
    ///   is forced on (the caller should log a warning when this fires);
    /// - if `dentry_timeout` is set but `dentry_dir_timeout` is not, the
    ///   latter inherits the former.
    ///
    /// Returns the resolved attributes plus `true` if the direct-io/data-
    /// cache override fired, so the caller can log it.
    pub fn from_raw(raw: &HashMap<String, String>) -> Result<(Self, bool), CoreError> {
        let mut attrs = Self::default();
        let mut dentry_timeout_set = false;
        let mut dentry_dir_timeout_set = false;
        let mut data_cache_explicit = None;

        for name in CACHING_ATTR_NAMES {
            let Some(value) = raw.get(*name) else {
                continue;
            };
            let parsed = parse_caching_attr(value).map_err(|_| CoreError::InvalidCachingAttribute {
                name: (*name).to_string(),
                value: value.clone(),
            })?;

            match *name {
                "attr_timeout" => attrs.attr_timeout = duration_of(parsed, name, value)?,
                "dentry_timeout" => {
                    attrs.dentry_timeout = duration_of(parsed, name, value)?;
                    dentry_timeout_set = true;
                }
                "dentry_dir_timeout" => {
                    attrs.dentry_dir_timeout = duration_of(parsed, name, value)?;
                    dentry_dir_timeout_set = true;
                }
                "ndentry_timeout" => attrs.negative_dentry_timeout = duration_of(parsed, name, value)?,
                "data_timeout" => {
                    attrs.data_timeout = duration_of(parsed, name, value)?;
                    attrs.data_cache = true;
                    data_cache_explicit = Some(true);
                }
                "direct_io_disable" => attrs.direct_io_disable = bool_of(parsed, name, value)?,
                "data_otoc" => attrs.data_otoc = bool_of(parsed, name, value)?,
                "writeback" => attrs.writeback = bool_of(parsed, name, value)?,
                _ => unreachable!("CACHING_ATTR_NAMES is exhaustive"),
            }

            if *name == "data_timeout" {
                if let CacheAttrValue::Off = parsed {
                    attrs.data_cache = false;
                    data_cache_explicit = Some(false);
                }
            }
        }

        if dentry_timeout_set && !dentry_dir_timeout_set {
            attrs.dentry_dir_timeout = attrs.dentry_timeout;
        }

        let mut overridden = false;
        if attrs.direct_io_disable && data_cache_explicit == Some(false) {
            attrs.data_cache = true;
            overridden = true;
        }

        Ok((attrs, overridden))
    }
}

fn duration_of(value: CacheAttrValue, name: &str, raw: &str) -> Result<Duration, CoreError> {
    match value {
        CacheAttrValue::Duration(d) => Ok(d),
        CacheAttrValue::Off => Ok(Duration::ZERO),
        CacheAttrValue::On | CacheAttrValue::Otoc => Err(CoreError::InvalidCachingAttribute {
            name: name.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn bool_of(value: CacheAttrValue, name: &str, raw: &str) -> Result<bool, CoreError> {
    match value {
        CacheAttrValue::On => Ok(true),
        CacheAttrValue::Off => Ok(false),
        CacheAttrValue::Otoc | CacheAttrValue::Duration(_) => Err(CoreError::InvalidCachingAttribute {
            name: name.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Top-level mount configuration (§6 "Kernel interface").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Directory to mount onto.
    pub mountpoint: PathBuf,
    /// Forces `ro` into the session options and blanks mutating vtable
    /// entries at startup (§4.H).
    pub read_only: bool,
    /// Forces `allow_other` into the session options.
    pub allow_other: bool,
    /// Number of event-queue worker threads (component A).
    pub worker_threads: usize,
}

impl MountConfig {
    /// Assemble the `fuser::MountOption` list per §6: the forced options
    /// (`fsname=dfuse`, `subtype=daos`, `default_permissions`, `noatime`)
    /// plus whichever conditional ones apply.
    pub fn session_option_strings(&self) -> Vec<String> {
        let mut opts = vec![
            "fsname=dfuse".to_string(),
            "subtype=daos".to_string(),
            "default_permissions".to_string(),
            "noatime".to_string(),
        ];
        if self.read_only {
            opts.push("ro".to_string());
        }
        if self.allow_other {
            opts.push("allow_other".to_string());
        }
        opts
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from("/mnt/dfuse"),
            read_only: false,
            allow_other: false,
            worker_threads: default_worker_threads(),
        }
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_off_and_on_and_otoc() {
        assert_eq!(parse_caching_attr("off").unwrap(), CacheAttrValue::Off);
        assert_eq!(parse_caching_attr("false").unwrap(), CacheAttrValue::Off);
        assert_eq!(parse_caching_attr("on").unwrap(), CacheAttrValue::On);
        assert_eq!(parse_caching_attr("true").unwrap(), CacheAttrValue::On);
        assert_eq!(parse_caching_attr("otoc").unwrap(), CacheAttrValue::Otoc);
    }

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(
            parse_caching_attr("2d").unwrap(),
            CacheAttrValue::Duration(Duration::from_secs(2 * 86_400))
        );
        assert_eq!(
            parse_caching_attr("3h").unwrap(),
            CacheAttrValue::Duration(Duration::from_secs(3 * 3_600))
        );
        assert_eq!(
            parse_caching_attr("5m").unwrap(),
            CacheAttrValue::Duration(Duration::from_secs(5 * 60))
        );
        assert_eq!(
            parse_caching_attr("7s").unwrap(),
            CacheAttrValue::Duration(Duration::from_secs(7))
        );
        assert_eq!(
            parse_caching_attr("42").unwrap(),
            CacheAttrValue::Duration(Duration::from_secs(42))
        );
    }

    #[test]
    fn rejects_unrecognized_forms() {
        assert!(parse_caching_attr("3q").is_err());
        assert!(parse_caching_attr("").is_err());
        assert!(parse_caching_attr("d5").is_err());
    }

    #[test]
    fn dentry_dir_timeout_inherits_dentry_timeout() {
        let mut raw = HashMap::new();
        raw.insert("dentry_timeout".to_string(), "30s".to_string());
        let (attrs, overridden) = CachingAttrs::from_raw(&raw).unwrap();
        assert_eq!(attrs.dentry_timeout, Duration::from_secs(30));
        assert_eq!(attrs.dentry_dir_timeout, Duration::from_secs(30));
        assert!(!overridden);
    }

    #[test]
    fn explicit_dentry_dir_timeout_is_not_overridden() {
        let mut raw = HashMap::new();
        raw.insert("dentry_timeout".to_string(), "30s".to_string());
        raw.insert("dentry_dir_timeout".to_string(), "90s".to_string());
        let (attrs, _) = CachingAttrs::from_raw(&raw).unwrap();
        assert_eq!(attrs.dentry_timeout, Duration::from_secs(30));
        assert_eq!(attrs.dentry_dir_timeout, Duration::from_secs(90));
    }

    #[test]
    fn direct_io_disable_forces_data_cache_on() {
        let mut raw = HashMap::new();
        raw.insert("direct_io_disable".to_string(), "on".to_string());
        raw.insert("data_timeout".to_string(), "off".to_string());
        let (attrs, overridden) = CachingAttrs::from_raw(&raw).unwrap();
        assert!(attrs.direct_io_disable);
        assert!(attrs.data_cache);
        assert!(overridden);
    }

    #[test]
    fn data_cache_off_without_direct_io_disable_stays_off() {
        let mut raw = HashMap::new();
        raw.insert("data_timeout".to_string(), "off".to_string());
        let (attrs, overridden) = CachingAttrs::from_raw(&raw).unwrap();
        assert!(!attrs.data_cache);
        assert!(!overridden);
    }

    #[test]
    fn session_options_include_forced_and_conditional_entries() {
        let mut cfg = MountConfig::default();
        cfg.read_only = true;
        cfg.allow_other = true;
        let opts = cfg.session_option_strings();
        assert!(opts.contains(&"fsname=dfuse".to_string()));
        assert!(opts.contains(&"subtype=daos".to_string()));
        assert!(opts.contains(&"default_permissions".to_string()));
        assert!(opts.contains(&"noatime".to_string()));
        assert!(opts.contains(&"ro".to_string()));
        assert!(opts.contains(&"allow_other".to_string()));
    }
}
