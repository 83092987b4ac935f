use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::{Client as RedisClient, ClientLike, Config as RedisConfig, Expiration, KeysInterface};
use fred::types::SetOptions;
use tokio::time::timeout;
use tracing::info;

use super::{ttl_seconds, CacheStore, StoreError};
use crate::config::WritePolicy;

/// Redis/Valkey backed store. Values are JSON strings written with
/// `SET key value EX ttl [NX]`, so the expiry lands in the same command.
#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, StoreError> {
        let config = RedisConfig::from_url(url)?;
        let client = RedisClient::new(config, None, None, None);
        client.connect();

        timeout(connect_timeout, client.wait_for_connect())
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))??;

        let store = Self { client };
        store.ping().await?;
        info!("connected to cache store");
        Ok(store)
    }

    pub async fn quit(&self) -> Result<(), StoreError> {
        self.client.quit().await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.client.get::<Option<String>, _>(key).await?)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        policy: WritePolicy,
    ) -> Result<(), StoreError> {
        let options = match policy {
            WritePolicy::Overwrite => None,
            WritePolicy::IfAbsent => Some(SetOptions::NX),
        };

        // NX replies nil when the key is already live.
        let reply: Option<String> = self
            .client
            .set(key, value, Some(Expiration::EX(ttl_seconds(ttl))), options, false)
            .await?;

        match (policy, reply) {
            (WritePolicy::IfAbsent, None) => Err(StoreError::KeyExists(key.to_owned())),
            _ => Ok(()),
        }
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.client.flushall::<()>(false).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client.ping::<String>(None).await?;
        Ok(())
    }
}
