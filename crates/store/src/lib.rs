//! Storage backends for OpsClaw.
//!
//! Every backend implements `opsclaw_core::Store`: conversation turns,
//! logic versions, flow steps, and reference-usage records.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use opsclaw_config::AppConfig;
use opsclaw_core::error::StoreError;
use opsclaw_core::store::Store;
use std::sync::Arc;

/// Open the backend named in `[store]`.
pub async fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config.store.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let path = match &config.store.path {
                Some(path) => path.clone(),
                None => {
                    let dir = AppConfig::config_dir();
                    std::fs::create_dir_all(&dir)
                        .map_err(|e| StoreError::Storage(format!("Cannot create {}: {e}", dir.display())))?;
                    format!("sqlite://{}", dir.join("opsclaw.db").display())
                }
            };
            Ok(Arc::new(SqliteStore::new(&path).await?))
        }
        other => Err(StoreError::Storage(format!("Unsupported store backend: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_config_builds_memory_store() {
        let store = build_from_config(&AppConfig::default()).await.unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn sqlite_backend_with_explicit_path() {
        let mut config = AppConfig::default();
        config.store.backend = "sqlite".into();
        config.store.path = Some("sqlite::memory:".into());
        let store = build_from_config(&config).await.unwrap();
        assert_eq!(store.name(), "sqlite");
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let mut config = AppConfig::default();
        config.store.backend = "cassandra".into();
        assert!(build_from_config(&config).await.is_err());
    }
}
