//! Request/response facade matching the hub's HTTP surface.
//!
//! Routing and the HTTP server itself live outside this crate. A transport
//! maps each route onto one method here and writes `Response::status` and the
//! JSON-serialized `Response::body`; errors map through
//! [`HubError::status_code`](crate::HubError::status_code).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::callback::CallbackClient;
use crate::channel::ChannelStore;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{HubError, Result};
use crate::types::{
    BatchPolicy, Channel, ChannelMetadata, ChannelName, Content, Item, StartPolicy, TimeWindow,
    WebhookDefinition, WebhookName, WebhookState, WebhookStatus,
};

const DEFAULT_BUNDLE_SIZE: usize = 50;

/// Status code plus JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response<T> {
    pub status: u16,
    pub body: T,
}

impl<T> Response<T> {
    fn ok(body: T) -> Self {
        Self { status: 200, body }
    }

    fn created(body: T) -> Self {
        Self { status: 201, body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
}

impl Link {
    fn new(href: impl Into<String>) -> Self {
        Self { href: href.into() }
    }
}

/// Body of `PUT /channel/{name}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelRequest {
    pub owner: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelLinks {
    #[serde(rename = "self")]
    pub self_link: Link,
    pub latest: Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBody {
    #[serde(rename = "_links")]
    pub links: ChannelLinks,
    pub name: String,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub creation_date: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub latest_sequence: u64,
}

impl From<Channel> for ChannelBody {
    fn from(channel: Channel) -> Self {
        Self {
            links: ChannelLinks {
                latest: Link::new(format!("{}/latest", channel.href)),
                self_link: Link::new(channel.href),
            },
            name: channel.name.0,
            owner: channel.metadata.owner,
            description: channel.metadata.description,
            tags: channel.metadata.tags,
            creation_date: channel.created_at,
            last_updated: channel.updated_at,
            latest_sequence: channel.latest_sequence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemLinks {
    #[serde(rename = "self")]
    pub self_link: Link,
    pub channel: Link,
}

/// Body returned by `POST /channel/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    #[serde(rename = "_links")]
    pub links: ItemLinks,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl ItemBody {
    fn new(item: &Item, channel_href: &str) -> Self {
        Self {
            links: ItemLinks {
                self_link: Link::new(item.href.clone()),
                channel: Link::new(channel_href),
            },
            sequence: item.sequence,
            timestamp: item.created_at,
        }
    }
}

/// Body of `PUT /webhook/{name}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    pub callback_url: String,
    pub channel_url: String,
    /// `now` (default), `previous`, `earliest` or an item href.
    pub start_item: Option<String>,
    /// `SINGLE` (default), `BUNDLE`, `SECOND` or `MINUTE`.
    pub batch: Option<String>,
    pub max_items: Option<usize>,
    pub callback_timeout_seconds: Option<u64>,
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub paused: bool,
    pub secret: Option<String>,
}

impl WebhookRequest {
    pub fn into_definition(self, name: &str) -> Result<WebhookDefinition> {
        let start_policy = match self.start_item.as_deref() {
            Some(raw) => StartPolicy::parse(raw)?,
            None => StartPolicy::default(),
        };
        let batch = match self.batch.as_deref().map(str::to_ascii_uppercase).as_deref() {
            None | Some("SINGLE") => BatchPolicy::Single,
            Some("BUNDLE") => BatchPolicy::Bundle {
                max_items: self.max_items.unwrap_or(DEFAULT_BUNDLE_SIZE),
            },
            Some("SECOND") => BatchPolicy::Timed { window: TimeWindow::Second },
            Some("MINUTE") => BatchPolicy::Timed { window: TimeWindow::Minute },
            Some(other) => {
                return Err(HubError::validation(format!("unknown batch mode: {other}")));
            }
        };

        let mut definition = WebhookDefinition::new(name, self.callback_url, self.channel_url)
            .with_start_policy(start_policy)
            .with_batch(batch)
            .with_paused(self.paused);
        if let Some(seconds) = self.callback_timeout_seconds {
            definition = definition.with_callback_timeout(Duration::from_secs(seconds));
        }
        if let Some(max_attempts) = self.max_attempts {
            definition = definition.with_max_attempts(max_attempts);
        }
        if let Some(secret) = self.secret {
            definition = definition.with_secret(secret.into_bytes());
        }
        Ok(definition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookLinks {
    #[serde(rename = "self")]
    pub self_link: Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookBody {
    #[serde(rename = "_links")]
    pub links: WebhookLinks,
    pub name: String,
    pub callback_url: String,
    pub channel_url: String,
    pub batch: String,
    pub paused: bool,
    pub state: WebhookState,
    pub cursor: u64,
    pub latest_sequence: u64,
    pub errors: Vec<String>,
}

/// Channel and webhook operations behind one handle.
pub struct Hub {
    channels: Arc<ChannelStore>,
    dispatcher: Dispatcher,
}

impl Hub {
    /// Hub delivering callbacks over HTTP.
    #[cfg(feature = "http")]
    pub fn new(config: DispatcherConfig) -> Self {
        let channels = Arc::new(ChannelStore::new(config.base_url.clone()));
        let dispatcher = Dispatcher::new(config, channels.clone());
        Self { channels, dispatcher }
    }

    pub fn with_client(config: DispatcherConfig, client: Arc<dyn CallbackClient>) -> Self {
        let channels = Arc::new(ChannelStore::new(config.base_url.clone()));
        let dispatcher = Dispatcher::with_client(config, channels.clone(), client);
        Self { channels, dispatcher }
    }

    /// Assemble a hub from an existing store and dispatcher.
    ///
    /// The dispatcher must have been built over the same store.
    pub fn from_parts(dispatcher: Dispatcher) -> Self {
        Self {
            channels: dispatcher.channels().clone(),
            dispatcher,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelStore> {
        &self.channels
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// `PUT /channel/{name}`. Always `201`, metadata is last-write-wins.
    pub async fn put_channel(&self, name: &str, request: ChannelRequest) -> Result<Response<ChannelBody>> {
        let metadata = ChannelMetadata {
            owner: request.owner,
            description: request.description,
            tags: request.tags,
        };
        let (channel, _) = self
            .channels
            .put_channel(&ChannelName::from(name), metadata)
            .await?;
        Ok(Response::created(channel.into()))
    }

    /// `GET /channel/{name}`.
    ///
    /// Reads the store directly, so `cached=false` and the default behave the same.
    pub async fn get_channel(&self, name: &str) -> Result<Response<ChannelBody>> {
        let channel = self.channels.get_channel(&ChannelName::from(name)).await?;
        Ok(Response::ok(channel.into()))
    }

    /// `POST /channel/{name}`.
    pub async fn post_item(&self, name: &str, content: Content) -> Result<Response<ItemBody>> {
        let channel = ChannelName::from(name);
        let item = self.channels.append(&channel, content).await?;
        let channel_href = crate::types::channel_href(self.channels.base_url(), &channel);
        Ok(Response::created(ItemBody::new(&item, &channel_href)))
    }

    /// `GET /channel/{name}/{sequence}`.
    pub async fn get_item(&self, name: &str, sequence: u64) -> Result<Arc<Item>> {
        self.channels.get_item(&ChannelName::from(name), sequence).await
    }

    /// `GET /channel/{name}/latest`.
    pub async fn latest_item(&self, name: &str) -> Result<Arc<Item>> {
        let channel = ChannelName::from(name);
        self.channels
            .latest(&channel)
            .await?
            .ok_or_else(|| HubError::ItemNotFound {
                channel: channel.to_string(),
                sequence: 0,
            })
    }

    /// `PUT /webhook/{name}`. `201` on creation, `200` on update.
    pub async fn put_webhook(&self, name: &str, request: WebhookRequest) -> Result<Response<WebhookBody>> {
        let definition = request.into_definition(name)?;
        let (webhook, created) = self.dispatcher.register_webhook(definition).await?;
        let body = self.webhook_body(webhook.name()).await?;
        Ok(if created {
            Response::created(body)
        } else {
            Response::ok(body)
        })
    }

    /// `GET /webhook/{name}`.
    pub async fn get_webhook(&self, name: &str) -> Result<Response<WebhookBody>> {
        let body = self.webhook_body(&WebhookName::from(name)).await?;
        Ok(Response::ok(body))
    }

    /// `DELETE /webhook/{name}`.
    pub async fn delete_webhook(&self, name: &str) -> Result<Response<()>> {
        self.dispatcher.remove(&WebhookName::from(name)).await?;
        Ok(Response::ok(()))
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    async fn webhook_body(&self, name: &WebhookName) -> Result<WebhookBody> {
        let webhook = self.dispatcher.get_webhook(name).await?;
        let WebhookStatus {
            state,
            cursor,
            latest_sequence,
            errors,
            ..
        } = self.dispatcher.webhook_status(name).await?;
        Ok(WebhookBody {
            links: WebhookLinks {
                self_link: Link::new(format!(
                    "{}/webhook/{}",
                    self.channels.base_url().trim_end_matches('/'),
                    name
                )),
            },
            name: name.to_string(),
            callback_url: webhook.definition.callback_url,
            channel_url: webhook.definition.channel_url,
            batch: webhook.definition.batch.mode().to_string(),
            paused: webhook.definition.paused,
            state,
            cursor,
            latest_sequence,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: &str) -> WebhookRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn webhook_request_defaults() {
        let definition = request(r#"{"callbackUrl":"http://cb/","channelUrl":"http://hub/channel/c"}"#)
            .into_definition("hook")
            .unwrap();
        assert_eq!(definition.start_policy, StartPolicy::Now);
        assert_eq!(definition.batch, BatchPolicy::Single);
        assert!(!definition.paused);
        assert_eq!(definition.max_attempts, None);
    }

    #[test]
    fn webhook_request_full() {
        let definition = request(
            r#"{
                "callbackUrl": "http://cb/",
                "channelUrl": "http://hub/channel/c",
                "startItem": "previous",
                "batch": "bundle",
                "maxItems": 5,
                "callbackTimeoutSeconds": 3,
                "maxAttempts": 4,
                "paused": true,
                "secret": "s3cret"
            }"#,
        )
        .into_definition("hook")
        .unwrap();
        assert_eq!(definition.start_policy, StartPolicy::Previous);
        assert_eq!(definition.batch, BatchPolicy::Bundle { max_items: 5 });
        assert_eq!(definition.callback_timeout, Some(Duration::from_secs(3)));
        assert_eq!(definition.max_attempts, Some(4));
        assert!(definition.paused);
        assert_eq!(definition.secret.as_deref(), Some(&b"s3cret"[..]));
    }

    #[test]
    fn webhook_request_timed_batches() {
        let definition = request(r#"{"callbackUrl":"http://cb/","channelUrl":"c","batch":"minute"}"#)
            .into_definition("hook")
            .unwrap();
        assert_eq!(
            definition.batch,
            BatchPolicy::Timed { window: TimeWindow::Minute }
        );
        assert_eq!(definition.batch.mode(), "MINUTE");
    }

    #[test]
    fn webhook_request_rejects_unknown_batch() {
        let err = request(r#"{"callbackUrl":"http://cb/","channelUrl":"c","batch":"HOUR"}"#)
            .into_definition("hook")
            .unwrap_err();
        assert!(matches!(err, HubError::Validation { .. }));
    }

    #[test]
    fn item_body_serializes_self_link() {
        let item = Item {
            channel: ChannelName::from("c"),
            sequence: 1,
            content: b"x".to_vec(),
            content_type: None,
            created_at: Utc::now(),
            href: "http://hub/channel/c/1".into(),
        };
        let json = serde_json::to_value(ItemBody::new(&item, "http://hub/channel/c")).unwrap();
        assert_eq!(json["_links"]["self"]["href"], "http://hub/channel/c/1");
        assert_eq!(json["_links"]["channel"]["href"], "http://hub/channel/c");
    }
}
