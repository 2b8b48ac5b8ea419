use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::cursor::Cursor;
use crate::error::Result;
use crate::types::{Webhook, WebhookName};

/// Persistence for webhook definitions and delivery cursors.
///
/// A dispatcher built with [`Dispatcher::with_storage`](crate::Dispatcher::with_storage)
/// reloads both and resumes every webhook from its stored cursor.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save_webhook(&self, webhook: &Webhook) -> Result<()>;
    /// Removes the webhook and its cursor.
    async fn remove_webhook(&self, name: &WebhookName) -> Result<()>;
    async fn load_webhooks(&self) -> Result<Vec<Webhook>>;
    async fn save_cursor(&self, name: &WebhookName, cursor: &Cursor) -> Result<()>;
    async fn load_cursors(&self) -> Result<HashMap<WebhookName, Cursor>>;
}

/// In-memory storage for lightweight deployments and tests.
#[derive(Default)]
pub struct InMemoryStorage {
    webhooks: Mutex<HashMap<WebhookName, Webhook>>,
    cursors: Mutex<HashMap<WebhookName, Cursor>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.webhooks
            .lock()
            .await
            .insert(webhook.name().clone(), webhook.clone());
        Ok(())
    }

    async fn remove_webhook(&self, name: &WebhookName) -> Result<()> {
        self.webhooks.lock().await.remove(name);
        self.cursors.lock().await.remove(name);
        Ok(())
    }

    async fn load_webhooks(&self) -> Result<Vec<Webhook>> {
        Ok(self.webhooks.lock().await.values().cloned().collect())
    }

    async fn save_cursor(&self, name: &WebhookName, cursor: &Cursor) -> Result<()> {
        self.cursors.lock().await.insert(name.clone(), *cursor);
        Ok(())
    }

    async fn load_cursors(&self) -> Result<HashMap<WebhookName, Cursor>> {
        Ok(self.cursors.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WebhookDefinition, WebhookState};

    #[tokio::test]
    async fn removing_a_webhook_drops_its_cursor() {
        let storage = InMemoryStorage::new();
        let name = WebhookName::from("hook");
        let webhook = Webhook {
            definition: WebhookDefinition::new("hook", "http://cb.local/", "orders"),
            channel: "orders".into(),
            state: WebhookState::Active,
            errors: Vec::new(),
            created_at: chrono::Utc::now(),
        };

        storage.save_webhook(&webhook).await.unwrap();
        storage.save_cursor(&name, &Cursor::new(4)).await.unwrap();
        assert_eq!(storage.load_webhooks().await.unwrap(), vec![webhook]);
        assert_eq!(storage.load_cursors().await.unwrap()[&name].position(), 4);

        storage.remove_webhook(&name).await.unwrap();
        assert!(storage.load_webhooks().await.unwrap().is_empty());
        assert!(storage.load_cursors().await.unwrap().is_empty());
    }
}
