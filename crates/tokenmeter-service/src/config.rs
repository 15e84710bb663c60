//! Worker configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tokenmeter_core::ModelRegistry;

use crate::error::{CreditError, Result};
use crate::reconcile::DEFAULT_STUCK_AGE_MINUTES;

/// Which storage backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// PostgreSQL at `DATABASE_URL`.
    Postgres,
    /// `RocksDB` under `DATA_DIR`.
    RocksDb,
    /// Process-local maps; state is lost on exit.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "rocksdb" | "rocks" => Ok(Self::RocksDb),
            "memory" => Ok(Self::Memory),
            other => Err(CreditError::Config(format!(
                "unknown STORE_BACKEND {other:?}, expected postgres, rocksdb or memory"
            ))),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Postgres => "postgres",
            Self::RocksDb => "rocksdb",
            Self::Memory => "memory",
        })
    }
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Storage backend (default: postgres).
    pub store_backend: StoreBackend,

    /// PostgreSQL connection string.
    pub database_url: String,

    /// PostgreSQL pool size (default: 5).
    pub database_max_connections: u32,

    /// Path to `RocksDB` data directory (default: "/data/tokenmeter").
    pub data_dir: String,

    /// Age in minutes after which a pending transaction is stuck (default: 10).
    pub stuck_age_minutes: u32,

    /// Run a pass at this interval instead of once.
    pub reconcile_interval: Option<Duration>,

    /// JSON model table replacing the built-in one.
    pub model_registry_path: Option<PathBuf>,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Config` for an unknown `STORE_BACKEND`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let store_backend = match var("STORE_BACKEND") {
            Some(name) => name.parse()?,
            None => defaults.store_backend,
        };

        Ok(Self {
            store_backend,
            database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
            database_max_connections: var("DATABASE_MAX_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.database_max_connections),
            data_dir: var("DATA_DIR").unwrap_or(defaults.data_dir),
            stuck_age_minutes: var("STUCK_AGE_MINUTES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.stuck_age_minutes),
            reconcile_interval: var("RECONCILE_INTERVAL_SECONDS")
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            model_registry_path: var("MODEL_REGISTRY_PATH")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    /// Build the model registry: the configured JSON table, or the built-in one.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read or is invalid.
    pub fn load_registry(&self) -> Result<ModelRegistry> {
        match &self.model_registry_path {
            Some(path) => load_registry_file(path),
            None => Ok(ModelRegistry::builtin()),
        }
    }
}

fn load_registry_file(path: &Path) -> Result<ModelRegistry> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        CreditError::Config(format!("cannot read model table {}: {e}", path.display()))
    })?;
    let registry = ModelRegistry::from_json(&contents)?;
    tracing::info!(
        path = %path.display(),
        models = ?registry.model_ids(),
        "Loaded model table"
    );
    Ok(registry)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Postgres,
            database_url: "postgres://localhost/tokenmeter".into(),
            database_max_connections: 5,
            data_dir: "/data/tokenmeter".into(),
            stuck_age_minutes: DEFAULT_STUCK_AGE_MINUTES,
            reconcile_interval: None,
            model_registry_path: None,
        }
    }
}
