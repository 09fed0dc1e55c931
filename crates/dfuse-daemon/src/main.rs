//! dfuse - command-line entry point that mounts a container as a FUSE
//! filesystem.
//!
//! Wires the pieces built in `dfuse-core`/`dfuse-backend`/`dfuse-fs`
//! together the way the teacher's `lnxdrive mount` command wires
//! `LnxDriveFs` together: parse arguments, stand up the async backend,
//! mount the container through the registry, hand the resulting
//! `DfuseFs` to `fuser`, then block on Ctrl+C.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dfuse_backend::MemoryBackend;
use dfuse_core::{Backend, ContainerId, MountConfig, PoolId};
use dfuse_fs::{
    filesystem::spawn_invalidation,
    invalidation::InvalidationSink,
    inode_entry::ROOT_INO,
    registry::Registry,
    DfuseFs,
};

/// Mount a DAOS container at a local path.
#[derive(Debug, Parser)]
#[command(name = "dfuse", version, about = "Mount a DAOS container over FUSE")]
struct Cli {
    /// Directory to mount onto. Created if it doesn't already exist.
    mountpoint: PathBuf,

    /// Pool UUID to connect to.
    #[arg(long)]
    pool: Uuid,

    /// Container UUID to mount.
    #[arg(long)]
    container: Uuid,

    /// Mount read-only and disable mutating operations at startup (§4.H).
    #[arg(long)]
    ro: bool,

    /// Allow access to the mount by users other than the one who ran dfuse.
    #[arg(long)]
    allow_other: bool,

    /// Container caching attribute, e.g. `--caching-attr dentry_timeout=30s`.
    /// May be repeated.
    #[arg(long = "caching-attr", value_parser = parse_attr)]
    caching_attrs: Vec<(String, String)>,

    /// Verbose output (can be repeated: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_attr(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    Ok((name.to_string(), value.to_string()))
}

/// Forwards expired dentries to the kernel. The sync `fuser::mount2`/
/// `spawn_mount2` entry points hand back only a `BackgroundSession`, not the
/// lower-level `Session` a `Notifier` is built from, so there is no kernel
/// channel to push invalidations down outside of a real mount; this sink
/// just logs what it would have invalidated. Swapping in a
/// `fuser::Notifier`-backed sink only needs a different `InvalidationSink`
/// impl, not any change to the engine itself.
struct LoggingInvalidationSink;

#[async_trait::async_trait]
impl InvalidationSink for LoggingInvalidationSink {
    async fn notify_inval_entry(&self, ino: u64) -> Result<(), ()> {
        info!(ino, "dentry expired, invalidating");
        Ok(())
    }
}

fn mount_options(cfg: &MountConfig) -> Vec<fuser::MountOption> {
    let mut opts = vec![
        fuser::MountOption::FSName("dfuse".to_string()),
        fuser::MountOption::Subtype("daos".to_string()),
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::NoAtime,
    ];
    if cfg.read_only {
        opts.push(fuser::MountOption::RO);
    }
    if cfg.allow_other {
        opts.push(fuser::MountOption::AllowOther);
    }
    opts
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

    if !cli.mountpoint.exists() {
        info!(mountpoint = %cli.mountpoint.display(), "creating mount point directory");
        std::fs::create_dir_all(&cli.mountpoint).context("failed to create mount point directory")?;
    }
    if !std::path::Path::new("/dev/fuse").exists() {
        bail!("/dev/fuse does not exist; is the fuse kernel module loaded?");
    }

    let pool = PoolId::from_uuid(cli.pool);
    let container = ContainerId::from_uuid(cli.container);
    let caching_attrs: HashMap<String, String> = cli.caching_attrs.into_iter().collect();

    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let registry = Arc::new(Registry::new(backend.clone()));
    let record = registry
        .mount(pool, container, &caching_attrs, ROOT_INO)
        .await
        .context("failed to mount container")?;
    info!(container_ino = record.container_ino, "container mounted");

    let mount_config = MountConfig {
        mountpoint: cli.mountpoint.clone(),
        read_only: cli.ro,
        allow_other: cli.allow_other,
        worker_threads: default_worker_threads(),
    };

    let rt_handle = tokio::runtime::Handle::current();
    let fs = DfuseFs::new(rt_handle, backend, registry, record, cli.ro);
    let invalidation_engine = fs.invalidation_engine();

    let options = mount_options(&mount_config);
    info!(mountpoint = %cli.mountpoint.display(), "mounting filesystem");
    let session = fuser::spawn_mount2(fs, &cli.mountpoint, &options).context("failed to mount FUSE filesystem")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let invalidation_task = spawn_invalidation(invalidation_engine, Arc::new(LoggingInvalidationSink), shutdown_rx);

    info!("mounted, press Ctrl+C to unmount");
    signal::ctrl_c().await.context("failed to listen for Ctrl+C signal")?;
    info!("received Ctrl+C, unmounting");

    let _ = shutdown_tx.send(());
    if let Err(err) = invalidation_task.await {
        warn!(%err, "invalidation task did not shut down cleanly");
    }
    session.join();
    info!("unmounted");
    Ok(())
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_attr_splits_on_first_equals() {
        assert_eq!(
            parse_attr("dentry_timeout=30s").unwrap(),
            ("dentry_timeout".to_string(), "30s".to_string())
        );
    }

    #[test]
    fn parse_attr_rejects_missing_equals() {
        assert!(parse_attr("dentry_timeout").is_err());
    }

    #[test]
    fn mount_options_include_forced_entries() {
        let cfg = MountConfig {
            mountpoint: PathBuf::from("/tmp/x"),
            read_only: true,
            allow_other: true,
            worker_threads: 1,
        };
        let opts = mount_options(&cfg);
        assert!(opts.contains(&fuser::MountOption::RO));
        assert!(opts.contains(&fuser::MountOption::AllowOther));
        assert!(opts.contains(&fuser::MountOption::DefaultPermissions));
    }
}
