#![allow(dead_code)]

use std::future::Future;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use channel_webhooks::{
    CallbackClient, CallbackRequest, ChannelMetadata, ChannelName, ChannelStore, Content, Cursor,
    DeliveryPayload, Dispatcher, DispatcherConfig, FailureReason, HubError, InMemoryStorage,
    Storage, Webhook, WebhookName,
};

pub const BASE_URL: &str = "http://hub.test";
pub const CALLBACK_URL: &str = "http://receiver.test/callback";

pub fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        base_url: BASE_URL.to_string(),
        poll_interval_ms: 20,
        callback_timeout_ms: 1_000,
        max_attempts: 5,
        retry_base_ms: 5,
        retry_max_ms: 20,
        retry_jitter_ms: 0,
        timed_stable_ms: 50,
        ..Default::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn item_href(channel: &str, sequence: u64) -> String {
    format!("{BASE_URL}/channel/{channel}/{sequence}")
}

/// Callback receiver that records every acknowledged payload and can be told
/// to fail the next N attempts.
#[derive(Default)]
pub struct RecordingClient {
    received: Mutex<Vec<DeliveryPayload>>,
    attempted: Mutex<Vec<DeliveryPayload>>,
    requests: Mutex<Vec<CallbackRequest>>,
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<DeliveryPayload> {
        self.received.lock().unwrap().clone()
    }

    /// All acknowledged item hrefs, in delivery order.
    pub fn uris(&self) -> Vec<String> {
        self.payloads()
            .into_iter()
            .flat_map(|payload| payload.uris)
            .collect()
    }

    /// Item hrefs of every attempt, failed ones included.
    pub fn attempted_uris(&self) -> Vec<Vec<String>> {
        self.attempted
            .lock()
            .unwrap()
            .iter()
            .map(|payload| payload.uris.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<CallbackRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallbackClient for RecordingClient {
    async fn deliver(&self, request: &CallbackRequest) -> Result<(), FailureReason> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let payload: DeliveryPayload =
            serde_json::from_slice(&request.body).map_err(|_| FailureReason::Encoding)?;
        self.attempted.lock().unwrap().push(payload.clone());
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FailureReason::RemoteError(500));
        }
        self.received.lock().unwrap().push(payload);
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Receiver that never answers.
pub struct HangingClient {
    pub attempts: AtomicU32,
}

#[async_trait]
impl CallbackClient for HangingClient {
    async fn deliver(&self, _request: &CallbackRequest) -> Result<(), FailureReason> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// In-memory storage whose webhook writes can be switched off.
#[derive(Default)]
pub struct FlakyStorage {
    inner: InMemoryStorage,
    fail_saves: AtomicBool,
}

impl FlakyStorage {
    pub fn set_failing(&self, failing: bool) {
        self.fail_saves.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn save_webhook(&self, webhook: &Webhook) -> channel_webhooks::Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(HubError::Storage {
                message: "storage unavailable".to_string(),
            });
        }
        self.inner.save_webhook(webhook).await
    }

    async fn remove_webhook(&self, name: &WebhookName) -> channel_webhooks::Result<()> {
        self.inner.remove_webhook(name).await
    }

    async fn load_webhooks(&self) -> channel_webhooks::Result<Vec<Webhook>> {
        self.inner.load_webhooks().await
    }

    async fn save_cursor(&self, name: &WebhookName, cursor: &Cursor) -> channel_webhooks::Result<()> {
        self.inner.save_cursor(name, cursor).await
    }

    async fn load_cursors(&self) -> channel_webhooks::Result<HashMap<WebhookName, Cursor>> {
        self.inner.load_cursors().await
    }
}

pub async fn channel_with_items(
    channels: &ChannelStore,
    name: &str,
    count: usize,
) -> ChannelName {
    let channel = ChannelName::from(name);
    channels
        .put_channel(&channel, ChannelMetadata::default())
        .await
        .unwrap();
    for i in 0..count {
        channels
            .append(&channel, Content::new(format!("item-{i}")))
            .await
            .unwrap();
    }
    channel
}

pub fn dispatcher_with(client: Arc<RecordingClient>) -> (Dispatcher, Arc<ChannelStore>) {
    let channels = Arc::new(ChannelStore::new(BASE_URL));
    let dispatcher = Dispatcher::with_client(fast_config(), channels.clone(), client);
    (dispatcher, channels)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    eventually_within(Duration::from_secs(2), check).await
}

pub async fn eventually_within<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
