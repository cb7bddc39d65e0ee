//! Run registry: resume-by-identity without knowing storage locations.
//!
//! A single shared SQLite database maps (config hash, label) to the per-run
//! store location across all runs ever started. Callers resolve identities;
//! only the engine knows the on-disk layout.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::phase::RunStatus;

/// One registered run.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub config_hash: String,
    pub label: String,
    /// Directory holding the run's checkpoint store.
    pub location: PathBuf,
    pub status: RunStatus,
    pub created_at: String,
}

/// Synchronous connection wrapper. Use through [`RunRegistry`] from async
/// code.
pub struct RegistryDb {
    conn: Connection,
}

impl RegistryDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open run registry at {}", path.display()))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .context("Failed to enable WAL")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory registry")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS runs (
                    config_hash TEXT NOT NULL,
                    label TEXT NOT NULL,
                    location TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (config_hash, label)
                );",
            )
            .context("Failed to create registry table")?;
        Ok(())
    }

    pub fn register(&self, entry: &RegistryEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs (config_hash, label, location, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.config_hash,
                    entry.label,
                    entry.location.to_string_lossy(),
                    entry.status.as_str(),
                    entry.created_at
                ],
            )
            .context("Failed to register run")?;
        Ok(())
    }

    pub fn resolve(&self, label: &str, config_hash: &str) -> Result<Option<RegistryEntry>> {
        self.conn
            .query_row(
                "SELECT config_hash, label, location, status, created_at
                 FROM runs WHERE label = ?1 AND config_hash = ?2",
                params![label, config_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to resolve run")?
            .map(|(config_hash, label, location, status, created_at)| {
                Ok(RegistryEntry {
                    config_hash,
                    label,
                    location: PathBuf::from(location),
                    status: status.parse()?,
                    created_at,
                })
            })
            .transpose()
    }

    pub fn update_status(&self, label: &str, config_hash: &str, status: RunStatus) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET status = ?3 WHERE label = ?1 AND config_hash = ?2",
                params![label, config_hash, status.as_str()],
            )
            .context("Failed to update run status")?;
        anyhow::ensure!(changed == 1, "no registry entry for '{label}'");
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<RegistryEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT config_hash, label, location, status, created_at
                 FROM runs ORDER BY created_at",
            )
            .context("Failed to prepare registry query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query registry")?;
        let mut entries = Vec::new();
        for row in rows {
            let (config_hash, label, location, status, created_at) =
                row.context("Failed to read registry row")?;
            entries.push(RegistryEntry {
                config_hash,
                label,
                location: PathBuf::from(location),
                status: status.parse()?,
                created_at,
            });
        }
        Ok(entries)
    }
}

/// Async-safe handle to the shared run registry, mirroring the checkpoint
/// store's spawn_blocking discipline.
#[derive(Clone)]
pub struct RunRegistry {
    inner: Arc<Mutex<RegistryDb>>,
}

impl RunRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RegistryDb::open(path)?)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RegistryDb::open_in_memory()?)),
        })
    }

    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RegistryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("registry lock poisoned: {e}"))?;
            f(&guard)
        })
        .await
        .context("Registry task panicked")?
    }

    pub async fn register(&self, entry: RegistryEntry) -> Result<()> {
        self.call(move |db| db.register(&entry)).await
    }

    pub async fn resolve(&self, label: String, config_hash: String) -> Result<Option<RegistryEntry>> {
        self.call(move |db| db.resolve(&label, &config_hash)).await
    }

    pub async fn update_status(
        &self,
        label: String,
        config_hash: String,
        status: RunStatus,
    ) -> Result<()> {
        self.call(move |db| db.update_status(&label, &config_hash, status))
            .await
    }

    pub async fn entries(&self) -> Result<Vec<RegistryEntry>> {
        self.call(|db| db.entries()).await
    }
}

/// A fresh registry entry for a run being created now.
pub fn new_entry(config_hash: &str, label: &str, location: &Path) -> RegistryEntry {
    RegistryEntry {
        config_hash: config_hash.to_string(),
        label: label.to_string(),
        location: location.to_path_buf(),
        status: RunStatus::Pending,
        created_at: Utc::now().to_rfc3339(),
    }
}
