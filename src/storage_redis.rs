#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;
#[cfg(feature = "redis")]
use std::collections::HashMap;

#[cfg(feature = "redis")]
use crate::cursor::Cursor;
#[cfg(feature = "redis")]
use crate::error::{HubError, Result};
#[cfg(feature = "redis")]
use crate::storage::Storage;
#[cfg(feature = "redis")]
use crate::types::{Webhook, WebhookName};

/// Redis-backed storage: one hash for webhook definitions, one for cursors,
/// both keyed by webhook name and holding JSON values.
#[cfg(feature = "redis")]
pub struct RedisStorage {
    client: redis::Client,
    prefix: String,
}

#[cfg(feature = "redis")]
impl RedisStorage {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn webhooks_key(&self) -> String {
        format!("{}:webhooks", self.prefix)
    }

    fn cursors_key(&self) -> String {
        format!("{}:cursors", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::Connection> {
        self.client
            .get_tokio_connection()
            .await
            .map_err(HubError::storage)
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl Storage for RedisStorage {
    async fn save_webhook(&self, webhook: &Webhook) -> Result<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(webhook).map_err(HubError::storage)?;
        conn.hset::<_, _, _, ()>(self.webhooks_key(), webhook.name().as_str(), payload)
            .await
            .map_err(HubError::storage)
    }

    async fn remove_webhook(&self, name: &WebhookName) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.hdel::<_, _, ()>(self.webhooks_key(), name.as_str())
            .await
            .map_err(HubError::storage)?;
        conn.hdel::<_, _, ()>(self.cursors_key(), name.as_str())
            .await
            .map_err(HubError::storage)
    }

    async fn load_webhooks(&self) -> Result<Vec<Webhook>> {
        let mut conn = self.connection().await?;
        let values: HashMap<String, String> = conn
            .hgetall(self.webhooks_key())
            .await
            .map_err(HubError::storage)?;
        values
            .into_values()
            .map(|value| serde_json::from_str::<Webhook>(&value).map_err(HubError::storage))
            .collect()
    }

    async fn save_cursor(&self, name: &WebhookName, cursor: &Cursor) -> Result<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(cursor).map_err(HubError::storage)?;
        conn.hset::<_, _, _, ()>(self.cursors_key(), name.as_str(), payload)
            .await
            .map_err(HubError::storage)
    }

    async fn load_cursors(&self) -> Result<HashMap<WebhookName, Cursor>> {
        let mut conn = self.connection().await?;
        let values: HashMap<String, String> = conn
            .hgetall(self.cursors_key())
            .await
            .map_err(HubError::storage)?;
        values
            .into_iter()
            .map(|(name, value)| {
                let cursor = serde_json::from_str::<Cursor>(&value).map_err(HubError::storage)?;
                Ok((WebhookName(name), cursor))
            })
            .collect()
    }
}
