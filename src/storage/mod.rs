//! Storage backends for the check engine
//!
//! The engine reads check definitions, host snapshots, metric aggregates and
//! log counts, and appends one violation record per evaluation cycle.
//!
//! ## Design
//!
//! - **Trait-based**: `StorageBackend` groups the narrow per-concern traits
//! - **Selected once**: the daemon receives an `Arc<dyn StorageBackend>`
//!   built from configuration and never branches on the backend per call
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database, feature `storage-sqlite`
//! - **In-Memory**: No persistence, for testing and single-node trials
//!
//! ## Usage
//!
//! ```no_run
//! use fleet_checks::storage::sqlite::SqliteBackend;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./checks.db").await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod host_query;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::StorageConfig;

/// Build the backend selected in the configuration.
///
/// The backend must pass its health check before it is handed out.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    let backend = open(config).await?;
    ensure_healthy(backend).await
}

async fn ensure_healthy(backend: Arc<dyn StorageBackend>) -> StorageResult<Arc<dyn StorageBackend>> {
    let health = backend.health_check().await?;
    if !health.healthy {
        return Err(StorageError::ConnectionFailed(health.message));
    }

    debug!(metadata = ?health.metadata, "{}", health.message);
    Ok(backend)
}

async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::None => {
            info!("using in-memory storage, nothing will be persisted");
            Ok(Arc::new(memory::MemoryBackend::new()))
        }

        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("using sqlite storage at {}", path.display());
            Ok(Arc::new(sqlite::SqliteBackend::new(path).await?))
        }

        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::ConnectionFailed(
            "built without the storage-sqlite feature".to_string(),
        )),
    }
}
