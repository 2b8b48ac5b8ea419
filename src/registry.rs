//! Webhook definitions and lifecycle state.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::error::{HubError, Result};
use crate::types::{
    parse_channel_url, ChannelName, StartPolicy, Webhook, WebhookDefinition, WebhookName,
    WebhookState,
};

pub struct WebhookRegistry {
    webhooks: RwLock<HashMap<WebhookName, Webhook>>,

    /// How many recent delivery errors each webhook keeps.
    max_errors: usize,
}

impl WebhookRegistry {
    pub fn new(max_errors: usize) -> Self {
        Self {
            webhooks: RwLock::new(HashMap::new()),
            max_errors,
        }
    }

    /// Check a definition is well formed and return the channel it targets.
    pub fn validate(definition: &WebhookDefinition) -> Result<ChannelName> {
        definition.name.validate()?;

        let callback = Url::parse(&definition.callback_url).map_err(|err| {
            HubError::validation(format!(
                "invalid callbackUrl {}: {err}",
                definition.callback_url
            ))
        })?;
        if !matches!(callback.scheme(), "http" | "https") || callback.host().is_none() {
            return Err(HubError::validation(format!(
                "callbackUrl must be an absolute http(s) URL: {}",
                definition.callback_url
            )));
        }

        let channel = parse_channel_url(&definition.channel_url).ok_or_else(|| {
            HubError::validation(format!("invalid channelUrl: {}", definition.channel_url))
        })?;
        channel.validate()?;

        if let StartPolicy::FromItem(item) = &definition.start_policy {
            if item.channel != channel {
                return Err(HubError::validation(format!(
                    "startItem belongs to channel {}, webhook targets {}",
                    item.channel, channel
                )));
            }
        }

        if definition.max_attempts == Some(0) {
            return Err(HubError::validation("maxAttempts must be at least 1"));
        }
        if definition.callback_timeout.is_some_and(|t| t.is_zero()) {
            return Err(HubError::validation("callbackTimeout must be positive"));
        }

        Ok(channel)
    }

    /// Store a new webhook or update the delivery settings of an existing one.
    ///
    /// New webhooks start in `created`, or `paused` when requested. Updates keep
    /// the current state; moving a webhook to another channel is rejected.
    /// Returns the stored webhook and whether it was newly created.
    pub async fn register(&self, definition: WebhookDefinition) -> Result<(Webhook, bool)> {
        let channel = Self::validate(&definition)?;
        let mut guard = self.webhooks.write().await;

        if let Some(existing) = guard.get_mut(&definition.name) {
            if existing.channel != channel {
                return Err(HubError::validation(format!(
                    "webhook {} already targets channel {}",
                    definition.name, existing.channel
                )));
            }
            // The start position only applies on creation.
            let start_policy = existing.definition.start_policy.clone();
            existing.definition = WebhookDefinition {
                start_policy,
                ..definition
            };
            debug!(webhook = %existing.name(), "webhook updated");
            return Ok((existing.clone(), false));
        }

        let state = if definition.paused {
            WebhookState::Paused
        } else {
            WebhookState::Created
        };
        let webhook = Webhook {
            channel,
            state,
            errors: Vec::new(),
            created_at: Utc::now(),
            definition,
        };
        info!(webhook = %webhook.name(), channel = %webhook.channel, "webhook registered");
        guard.insert(webhook.name().clone(), webhook.clone());
        Ok((webhook, true))
    }

    /// Put back a webhook loaded from storage.
    pub async fn restore(&self, webhook: Webhook) {
        let mut guard = self.webhooks.write().await;
        guard.insert(webhook.name().clone(), webhook);
    }

    pub async fn get(&self, name: &WebhookName) -> Result<Webhook> {
        let guard = self.webhooks.read().await;
        guard.get(name).cloned().ok_or_else(|| not_found(name))
    }

    pub async fn list(&self) -> Vec<Webhook> {
        let guard = self.webhooks.read().await;
        let mut webhooks: Vec<_> = guard.values().cloned().collect();
        webhooks.sort_by(|a, b| a.name().cmp(b.name()));
        webhooks
    }

    pub async fn remove(&self, name: &WebhookName) -> Result<Webhook> {
        let mut guard = self.webhooks.write().await;
        let removed = guard.remove(name).ok_or_else(|| not_found(name))?;
        info!(webhook = %name, "webhook removed");
        Ok(removed)
    }

    /// Move a webhook to `next`, returning the updated record.
    ///
    /// Fails with a validation error on an edge the state machine does not have.
    pub async fn transition(&self, name: &WebhookName, next: WebhookState) -> Result<Webhook> {
        let mut guard = self.webhooks.write().await;
        let webhook = guard.get_mut(name).ok_or_else(|| not_found(name))?;
        if !webhook.state.can_transition_to(next) {
            return Err(HubError::validation(format!(
                "webhook {name} cannot move from {} to {next}",
                webhook.state
            )));
        }
        if webhook.state != next {
            info!(webhook = %name, from = %webhook.state, to = %next, "webhook state changed");
            webhook.state = next;
        }
        Ok(webhook.clone())
    }

    /// Remember a delivery error, dropping the oldest beyond the history size.
    pub async fn record_error(&self, name: &WebhookName, message: impl Into<String>) {
        let mut guard = self.webhooks.write().await;
        let Some(webhook) = guard.get_mut(name) else {
            return;
        };
        webhook
            .errors
            .push(format!("{} {}", Utc::now().to_rfc3339(), message.into()));
        let overflow = webhook.errors.len().saturating_sub(self.max_errors);
        webhook.errors.drain(..overflow);
    }
}

fn not_found(name: &WebhookName) -> HubError {
    HubError::WebhookNotFound {
        name: name.to_string(),
    }
}
