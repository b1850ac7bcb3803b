//! Versioned object store over SQLite.
//!
//! One logical connection (serialized writes, WAL journaling, busy timeout),
//! one table per entity type, embedded migrations applied at startup. Every
//! mutating operation runs inside a [`StoreTx`], which captures an
//! [`UpdateRecord`] per touched row; the buffer is handed back on commit so
//! callers can emit `starobj:update` events for everything the mutation
//! touched.

mod error;
mod ops;

pub use error::{StoreError, StoreResult};

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::blob::BlobStore;
use crate::obj::UpdateRecord;

const BUSY_TIMEOUT_SECS: u64 = 5;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    blob: Arc<dyn BlobStore>,
}

impl Store {
    /// Open (creating if missing) the database file and run migrations.
    pub async fn open(path: &Path, blob: Arc<dyn BlobStore>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .context("parsing database URL")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS));

        // a single connection serializes all writers
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("opening object store database")?;

        let store = Self { pool, blob };
        store.run_migrations().await?;
        debug!("object store initialized at {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory(blob: Arc<dyn BlobStore>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("opening in-memory database")?;
        let store = Self { pool, blob };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running object store migrations")?;
        Ok(())
    }

    /// Begin a transaction with a fresh update buffer.
    pub async fn begin(&self) -> StoreResult<StoreTx> {
        let tx = self.pool.begin().await?;
        Ok(StoreTx {
            tx,
            updates: Vec::new(),
            deleted_zones: Vec::new(),
            blob: self.blob.clone(),
        })
    }

    pub fn blob(&self) -> Arc<dyn BlobStore> {
        self.blob.clone()
    }
}

/// An open transaction plus its update buffer. All store operations live on
/// this type; see [`ops`]. Callers must not hold a transaction across IO to
/// remote peers or the blob store — zone deletions are queued and spawned
/// only after commit.
pub struct StoreTx {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    updates: Vec<UpdateRecord>,
    deleted_zones: Vec<String>,
    blob: Arc<dyn BlobStore>,
}

impl StoreTx {
    pub(crate) fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        &mut self.tx
    }

    pub(crate) fn add_update(&mut self, record: UpdateRecord) {
        self.updates.push(record);
    }

    pub(crate) fn add_deleted_zone(&mut self, zone_id: String) {
        self.deleted_zones.push(zone_id);
    }

    /// Commit and hand the captured updates to the caller. Blob zones of
    /// deleted objects are removed asynchronously, best-effort.
    pub async fn commit(self) -> StoreResult<Vec<UpdateRecord>> {
        self.tx.commit().await?;
        if !self.deleted_zones.is_empty() {
            let blob = self.blob.clone();
            let zones = self.deleted_zones;
            tokio::spawn(async move {
                for zone_id in zones {
                    if let Err(e) = blob.delete_zone(&zone_id).await {
                        warn!("error deleting blob zone {zone_id}: {e:#}");
                    }
                }
            });
        }
        Ok(self.updates)
    }

    /// Roll back, discarding the update buffer.
    pub async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
