//! starsrv - server-side core of the Starterm terminal workspace platform.
//!
//! The daemon owns a versioned object store (workspaces, tabs, blocks),
//! routes RPC between the desktop UI and remote wsh agents, broadcasts
//! events through a pub/sub broker, and manages SSH/WSL connection
//! lifecycles.

pub mod base;
pub mod blob;
pub mod config;
pub mod conn;
pub mod core;
pub mod obj;
pub mod pubsub;
pub mod rpc;
pub mod service;
pub mod shell;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod ws;

use std::sync::Arc;

use anyhow::Result;

use crate::base::Paths;
use crate::blob::{BlobStore, DirBlobStore};
use crate::config::ConfigWatcher;
use crate::conn::ConnManager;
use crate::core::{BlockControllerHost, NoopControllerHost};
use crate::pubsub::Broker;
use crate::rpc::{RpcRouter, TokenSigner};
use crate::store::Store;
use crate::telemetry::Telemetry;
use crate::ws::UiHost;

/// Root context wiring the process-lifetime subsystems together. Passed by
/// Arc instead of living in globals.
pub struct App {
    pub paths: Paths,
    pub store: Store,
    pub broker: Arc<Broker>,
    pub router: Arc<RpcRouter>,
    pub conns: Arc<ConnManager>,
    pub config: Arc<ConfigWatcher>,
    pub controllers: Arc<dyn BlockControllerHost>,
    pub telemetry: Arc<Telemetry>,
    pub ui: Arc<UiHost>,
}

impl App {
    /// Wire up every subsystem against the resolved paths. The caller is
    /// responsible for holding the instance lock first.
    pub async fn init(paths: Paths, jwt_secret: &[u8]) -> Result<Arc<Self>> {
        paths.ensure_dirs()?;
        let blob: Arc<dyn BlobStore> =
            Arc::new(DirBlobStore::new(paths.data_dir.join("blockstore")));
        let store = Store::open(&paths.db_file(), blob).await?;
        Self::assemble(paths, store, jwt_secret)
    }

    /// In-memory variant for tests: temp paths, in-memory DB.
    pub async fn init_in_memory(paths: Paths) -> Result<Arc<Self>> {
        paths.ensure_dirs()?;
        let blob: Arc<dyn BlobStore> =
            Arc::new(DirBlobStore::new(paths.data_dir.join("blockstore")));
        let store = Store::in_memory(blob).await?;
        Self::assemble(paths, store, b"test-secret")
    }

    fn assemble(paths: Paths, store: Store, jwt_secret: &[u8]) -> Result<Arc<Self>> {
        let broker = Arc::new(Broker::new());
        let router = Arc::new(RpcRouter::new(broker.clone(), TokenSigner::new(jwt_secret)));
        let conns = ConnManager::new(router.clone(), broker.clone(), paths.clone());
        let config = ConfigWatcher::new(paths.clone(), broker.clone());
        let app = Arc::new(Self {
            paths,
            store,
            broker,
            router,
            conns,
            config,
            controllers: Arc::new(NoopControllerHost),
            telemetry: Arc::new(Telemetry::new()),
            ui: Arc::new(UiHost::new()),
        });
        rpc::RpcServer::start(app.clone());
        Ok(app)
    }
}
