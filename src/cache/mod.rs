//! Best-effort result cache keyed by connection and normalized SQL.
//!
//! Store failures never reach callers: a broken cache behaves like an empty
//! one and the pipeline simply executes the query.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::connectors::QueryResult;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache configuration error: {0}")]
    Config(String),
}

#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> Option<QueryResult>;

    async fn set(&self, key: &str, value: &QueryResult, ttl: Duration);

    async fn delete(&self, key: &str);
}

/// SHA-256 over `"{connection_id}:{sql}"`, hex encoded. Not scoped to a user
/// or session, so identical SQL on one connection shares an entry.
pub fn cache_key(connection_id: &str, normalized_sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(connection_id.as_bytes());
    hasher.update(b":");
    hasher.update(normalized_sql.as_bytes());
    hex::encode(hasher.finalize())
}

pub async fn create_cache(config: &CacheConfig) -> Arc<dyn CacheProvider> {
    match config.backend.as_str() {
        "redis" => match redis::RedisCache::connect(config).await {
            Ok(cache) => {
                info!("Using Redis result cache");
                return Arc::new(cache);
            }
            Err(e) => warn!("Redis cache unavailable, falling back to memory: {}", e),
        },
        "memory" => {}
        other => warn!("Unknown cache backend '{}', using memory", other),
    }

    info!("Using in-memory result cache ({} entries max)", config.max_entries);
    Arc::new(memory::MemoryCache::new(config.max_entries))
}
