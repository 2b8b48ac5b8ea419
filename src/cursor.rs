//! Per-webhook delivery cursors.
//!
//! A cursor is the single source of truth for what a webhook delivers next. It
//! only moves forward, and only after a callback acknowledged the items it
//! moves past. Each cursor has one writer: its webhook's delivery worker.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{HubError, Result};
use crate::storage::Storage;
use crate::types::WebhookName;

/// Delivery position of one webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Resolved start sequence (exclusive).
    pub start: u64,

    /// Last acknowledged sequence, `None` before the first delivery.
    pub last_delivered: Option<u64>,
}

impl Cursor {
    pub fn new(start: u64) -> Self {
        Self {
            start,
            last_delivered: None,
        }
    }

    /// Items with a sequence above this value are still to be delivered.
    pub fn position(&self) -> u64 {
        self.last_delivered.unwrap_or(self.start)
    }
}

pub struct CursorTracker {
    cursors: RwLock<HashMap<WebhookName, Cursor>>,
    storage: Arc<dyn Storage>,
}

impl CursorTracker {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            cursors: RwLock::new(HashMap::new()),
            storage,
        }
    }

    /// Create the cursor for a new webhook. Keeps an existing cursor untouched.
    pub async fn init(&self, name: &WebhookName, start: u64) -> Result<Cursor> {
        let mut guard = self.cursors.write().await;
        if let Some(existing) = guard.get(name) {
            return Ok(*existing);
        }
        let cursor = Cursor::new(start);
        self.storage.save_cursor(name, &cursor).await?;
        guard.insert(name.clone(), cursor);
        debug!(webhook = %name, start, "cursor initialised");
        Ok(cursor)
    }

    /// Put back a cursor loaded from storage.
    pub async fn restore(&self, name: &WebhookName, cursor: Cursor) {
        self.cursors.write().await.insert(name.clone(), cursor);
    }

    /// Last delivered sequence, or the resolved start if nothing was delivered.
    pub async fn get(&self, name: &WebhookName) -> Result<u64> {
        Ok(self.cursor(name).await?.position())
    }

    pub async fn cursor(&self, name: &WebhookName) -> Result<Cursor> {
        let guard = self.cursors.read().await;
        guard.get(name).copied().ok_or_else(|| HubError::WebhookNotFound {
            name: name.to_string(),
        })
    }

    /// Record that everything up to and including `sequence` was acknowledged.
    ///
    /// Re-confirming the current value is a no-op so retries stay idempotent.
    /// Any other value at or below the current position is an `OutOfOrder` error.
    pub async fn advance(&self, name: &WebhookName, sequence: u64) -> Result<()> {
        let mut guard = self.cursors.write().await;
        let cursor = guard.get_mut(name).ok_or_else(|| HubError::WebhookNotFound {
            name: name.to_string(),
        })?;

        if cursor.last_delivered == Some(sequence) {
            return Ok(());
        }
        let current = cursor.position();
        if sequence <= current {
            return Err(HubError::OutOfOrder {
                webhook: name.clone(),
                current,
                attempted: sequence,
            });
        }

        let next = Cursor {
            start: cursor.start,
            last_delivered: Some(sequence),
        };
        self.storage.save_cursor(name, &next).await?;
        *cursor = next;
        debug!(webhook = %name, sequence, "cursor advanced");
        Ok(())
    }

    pub async fn remove(&self, name: &WebhookName) {
        self.cursors.write().await.remove(name);
    }
}
