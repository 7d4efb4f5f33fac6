//! # FluidFS node
//!
//! Wires the FluidFS components into a running replica:
//!
//! - **Identity**: loads the hosts table and mints the local replica's
//!   precedence on first launch ([`replica`]).
//! - **Mounts**: reads the fstab and mounts one [`Filesystem`] per entry.
//! - **Storage**: opens the configured KV engine and the blob store, and
//!   builds the blob tree summary at startup ([`blobtree`]).
//! - **Background tasks**: the metadata flusher ([`flush`]) and the
//!   anti-entropy client and server loops ([`gossip`]).
//!
//! Tasks share a broadcast stop channel and an mpsc fatal-error channel:
//! any task may publish a fatal error, the supervisor then stops the rest,
//! runs a final flush pass, persists the hosts table, and closes the
//! engine.

use std::sync::Arc;
use std::time::Duration;

use fluid_core::blob::store::BlobStore;
use fluid_core::error::{Error, Result};
use fluid_core::kv::Engine;
use fluid_fs::meta::MetaStore;
use fluid_fs::tree::{Filesystem, FsContext, MountOptions};
use fluid_kv_memory::MemoryEngine;
use fluid_kv_redb::RedbEngine;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{error, info, warn};

pub mod blobtree;
pub mod config;
pub mod flush;
pub mod fstab;
pub mod gossip;
pub mod protocol;
pub mod replica;

pub use blobtree::{BlobTree, TreeSummary};
pub use config::{Config, DatabaseConfig, LogLevel, LoggingConfig};
pub use fstab::{Fstab, MountPoint};
pub use gossip::PushOutcome;
pub use replica::{Hosts, Replica};

/// Port replicas listen on when the hosts table does not say otherwise.
pub const DEFAULT_PORT: u16 = 4157;

/// Installs the tracing subscriber from the logging configuration. The
/// `RUST_LOG` environment variable still wins when set.
pub fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.level.directive()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Opens the configured KV engine; the default driver is the first
/// available one (redb).
pub fn open_engine(database: &DatabaseConfig) -> Result<Arc<dyn Engine>> {
    match database.driver.as_deref() {
        None | Some("redb") => {
            if database.path.as_os_str().is_empty() {
                return Err(Error::Config("database.path is required for redb".into()));
            }
            Ok(Arc::new(RedbEngine::open(&database.path)?))
        }
        Some("memory") => Ok(Arc::new(MemoryEngine::new())),
        Some(other) => Err(Error::Config(format!("unknown database driver '{other}'"))),
    }
}

/// A bootstrapped replica, ready to run.
pub struct FluidNode {
    pub config: Config,
    pub local: Replica,
    pub hosts: Arc<RwLock<Hosts>>,
    pub engine: Arc<dyn Engine>,
    pub store: BlobStore,
    pub blob_tree: Arc<BlobTree>,
    pub filesystems: Arc<Vec<Arc<Filesystem>>>,
}

impl std::fmt::Debug for FluidNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluidNode")
            .field("config", &self.config)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl FluidNode {
    /// Opens storage, loads identity and mount tables, and mounts every
    /// fstab entry.
    pub async fn bootstrap(config: Config) -> Result<FluidNode> {
        config.storage.validate()?;
        if config.storage.path.as_os_str().is_empty() {
            return Err(Error::Config("storage.path is required".into()));
        }

        let engine = open_engine(&config.database)?;
        let blob_tree = Arc::new(BlobTree::build(&config.storage.path).await?);
        // Every blob written from here on (flushes and anti-entropy
        // receipts alike) folds into the startup summary.
        let store = BlobStore::with_observer(&config.storage.path, {
            let tree = blob_tree.clone();
            Arc::new(move |path, size| {
                if let Err(err) = tree.add_file(path, size) {
                    warn!(path = %path.display(), "blob tree update failed: {err}");
                }
            })
        });

        let mut hosts = Hosts::load(&config.hosts)?;
        let mut rng = StdRng::seed_from_u64(config.seed());
        let name = config.replica_name();
        let local = hosts.ensure_local(&name, "127.0.0.1", DEFAULT_PORT, &mut rng)?;
        hosts.save(&config.hosts)?;

        let context = Arc::new(FsContext {
            meta: MetaStore::new(engine.clone()),
            blobs: store.clone(),
            storage: config.storage.clone(),
            pid: local.precedence,
        });

        let fstab = Fstab::load(&config.fstab)?;
        let mut filesystems = Vec::with_capacity(fstab.mounts.len());
        for mount in &fstab.mounts {
            let fs = Filesystem::mount(
                context.clone(),
                MountOptions {
                    prefix: mount.prefix.clone(),
                    uid: mount.uid,
                    gid: mount.gid,
                    read_only: mount.read_only(),
                },
            )
            .await?;
            info!(prefix = %mount.prefix, path = %mount.path.display(), "mounted");
            filesystems.push(Arc::new(fs));
        }

        Ok(FluidNode {
            config,
            local,
            hosts: Arc::new(RwLock::new(hosts)),
            engine,
            store,
            blob_tree,
            filesystems: Arc::new(filesystems),
        })
    }

    /// Runs the background tasks until a shutdown signal or a fatal error,
    /// then shuts down in order: stop tasks, final flush, persist hosts,
    /// close the engine.
    pub async fn run(self) -> Result<()> {
        let (stop_tx, _) = broadcast::channel::<()>(4);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(4);

        let flusher = tokio::spawn(flush::run_flusher(
            self.filesystems.clone(),
            Duration::from_millis(self.config.flush_delay),
            stop_tx.subscribe(),
            fatal_tx.clone(),
        ));

        let listener = TcpListener::bind(self.local.endpoint())
            .await
            .map_err(|err| Error::Network(format!("bind {}: {err}", self.local.endpoint())))?;
        info!(endpoint = %self.local.endpoint(), replica = %self.local.name, "anti-entropy listening");
        let server = tokio::spawn(gossip::serve(
            listener,
            self.store.clone(),
            self.blob_tree.clone(),
            self.config.storage.hashing,
            stop_tx.subscribe(),
        ));
        let client = tokio::spawn(gossip::run_client(
            self.store.clone(),
            self.blob_tree.clone(),
            self.hosts.clone(),
            self.local.name.clone(),
            Duration::from_millis(self.config.anti_entropy_delay),
            stop_tx.subscribe(),
        ));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            Some(err) = fatal_rx.recv() => error!("fatal error, shutting down: {err}"),
        }

        let _ = stop_tx.send(());
        let _ = tokio::join!(flusher, server, client);

        // The flusher already ran its final pass; sweep once more so
        // nothing dirtied during shutdown is dropped.
        for fs in self.filesystems.iter() {
            if let Err(err) = fs.flush_all().await {
                warn!(prefix = fs.prefix(), "final flush failed: {err}");
            }
        }
        self.hosts.read().await.save(&self.config.hosts)?;
        self.engine.close().await?;
        info!("node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_driver_is_a_config_error() {
        let result = open_engine(&DatabaseConfig {
            driver: Some("sqlite".into()),
            path: "meta.db".into(),
        });
        let err = match result {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), fluid_core::ErrorKind::Config);
    }

    #[test]
    fn memory_driver_needs_no_path() {
        let engine = open_engine(&DatabaseConfig {
            driver: Some("memory".into()),
            path: Default::default(),
        })
        .unwrap();
        assert_eq!(engine.name(), "memory");
    }
}
