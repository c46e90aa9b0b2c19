//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/pulse-dispatch/db";
/// The DB tree name used for dispatch records.
const TREE_DISPATCHES: &str = "dispatches";
/// The DB tree name used for future-fire trigger records.
const TREE_TRIGGERS: &str = "triggers";
/// The DB tree name used for client settings pass-through records.
const TREE_SETTINGS: &str = "settings";
/// The DB tree name used for leadership lease records.
const TREE_LEASES: &str = "leases";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the Pulse database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// System runtime config.
    #[allow(dead_code)]
    config: Arc<Config>,
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join(config.role.as_str());
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for pulse core database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { config, db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree for dispatch records.
    pub async fn get_dispatches_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_DISPATCHES).await
    }

    /// Get a handle to the DB tree for trigger records.
    pub async fn get_triggers_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_TRIGGERS).await
    }

    /// Get a handle to the DB tree for client settings records.
    pub async fn get_settings_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_SETTINGS).await
    }

    /// Get a handle to the DB tree for leadership leases.
    pub async fn get_leases_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_LEASES).await
    }

    async fn get_tree(&self, name: &'static str) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", name, err))))?;
        Ok(tree)
    }
}
