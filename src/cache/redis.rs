use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{info, warn};

use super::{CacheError, CacheProvider};
use crate::config::CacheConfig;
use crate::connectors::QueryResult;

const KEY_PREFIX: &str = "datamind:cache:";

/// Shared cache for multi-instance deployments. Values are JSON under
/// `datamind:cache:<key>` and expire through `SETEX`.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| CacheError::Config("redis_url is required for the redis cache".to_string()))?;

        info!("Connecting to Redis at {}", url);
        let client = redis::Client::open(url)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(5))
            .set_response_timeout(Duration::from_secs(2))
            .set_number_of_retries(2);
        let manager = ConnectionManager::new_with_config(client, manager_config).await?;

        Ok(Self { manager })
    }

    fn build_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    async fn try_get(&self, key: &str) -> Result<Option<QueryResult>, CacheError> {
        let mut conn = self.manager.clone();
        let data: Option<Vec<u8>> = conn.get(Self::build_key(key)).await?;
        match data {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn try_set(&self, key: &str, value: &QueryResult, ttl: Duration) -> Result<(), CacheError> {
        let serialized = serde_json::to_vec(value)?;
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(Self::build_key(key), serialized, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheProvider for RedisCache {
    async fn get(&self, key: &str) -> Option<QueryResult> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Redis cache get failed, treating as miss: {}", e);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &QueryResult, ttl: Duration) {
        if let Err(e) = self.try_set(key, value, ttl).await {
            warn!("Redis cache set failed: {}", e);
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.manager.clone();
        if let Err(e) = conn.del::<_, ()>(Self::build_key(key)).await {
            warn!("Redis cache delete failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(RedisCache::build_key("abc"), "datamind:cache:abc");
    }

    #[tokio::test]
    async fn missing_url_is_a_config_error() {
        let config = CacheConfig {
            backend: "redis".to_string(),
            redis_url: None,
            ttl_seconds: 300,
            max_entries: 10,
        };
        assert!(matches!(RedisCache::connect(&config).await, Err(CacheError::Config(_))));
    }
}
