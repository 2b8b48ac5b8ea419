use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::CallbackClient;
use crate::channel::ChannelStore;
use crate::cursor::CursorTracker;
use crate::error::{HubError, Result};
use crate::registry::WebhookRegistry;
use crate::storage::{InMemoryStorage, Storage};
use crate::telemetry::metric_inc;
use crate::types::{Webhook, WebhookDefinition, WebhookName, WebhookState, WebhookStatus};
use crate::worker::{run_worker, WorkerContext, WorkerExit, WorkerSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Prefix for channel and item hrefs.
    pub base_url: String,
    /// Fallback wake-up for idle workers when no change notification arrives.
    pub poll_interval_ms: u64,
    pub callback_timeout_ms: u64,
    /// Consecutive failed attempts before a webhook moves to `error`.
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,
    /// Recent delivery errors kept per webhook.
    pub max_errors: usize,
    /// Restarts allowed after a cursor ordering fault before suspending.
    pub max_worker_restarts: u32,
    /// Grace period after a timed window ends before it is delivered.
    pub timed_stable_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            poll_interval_ms: 1_000,
            callback_timeout_ms: 30_000,
            max_attempts: 10,
            retry_base_ms: 100,
            retry_max_ms: 5_000,
            retry_jitter_ms: 50,
            max_errors: 10,
            max_worker_restarts: 3,
            timed_stable_ms: 1_000,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms.max(1))
    }
}

struct WorkerHandle {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type WorkerMap = Arc<Mutex<HashMap<WebhookName, WorkerHandle>>>;

/// Owns the delivery workers: at most one per webhook.
///
/// Lifecycle operations on one webhook (register, pause, resume, reset,
/// remove) run one at a time under that webhook's lifecycle lock.
pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
    workers: WorkerMap,
    lifecycle: Mutex<HashMap<WebhookName, Arc<Mutex<()>>>>,
    is_running: Arc<AtomicBool>,
    next_generation: AtomicU64,
}

impl Dispatcher {
    /// Dispatcher delivering over HTTP with in-memory cursor storage.
    #[cfg(feature = "http")]
    pub fn new(config: DispatcherConfig, channels: Arc<ChannelStore>) -> Self {
        Self::with_client(
            config,
            channels,
            Arc::new(crate::callback::HttpCallbackClient::new()),
        )
    }

    pub fn with_client(
        config: DispatcherConfig,
        channels: Arc<ChannelStore>,
        client: Arc<dyn CallbackClient>,
    ) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        Self::build(config, channels, client, storage)
    }

    /// Dispatcher that persists webhooks and cursors, resuming whatever the
    /// storage already holds.
    ///
    /// Channel content is not part of `Storage`: PUT the channels into
    /// `channels` before calling this. Webhooks that were `created` or
    /// `active` get a worker again, starting from their stored cursor;
    /// `paused` and `error` webhooks stay suspended. A webhook whose channel
    /// does not exist yet is restored without a worker and can be started
    /// later with [`resume`](Self::resume).
    pub async fn with_storage(
        config: DispatcherConfig,
        channels: Arc<ChannelStore>,
        client: Arc<dyn CallbackClient>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let dispatcher = Self::build(config, channels, client, storage.clone());

        let cursors = storage.load_cursors().await?;
        for (name, cursor) in cursors {
            dispatcher.ctx.cursors.restore(&name, cursor).await;
        }

        let webhooks = storage.load_webhooks().await?;
        let mut resumed = 0usize;
        let mut deferred = 0usize;
        for webhook in webhooks {
            let name = webhook.name().clone();
            let channel = webhook.channel.clone();
            let state = webhook.state;
            dispatcher.ctx.registry.restore(webhook).await;
            if state.is_suspended() {
                continue;
            }
            if dispatcher.ctx.channels.get_channel(&channel).await.is_err() {
                warn!(webhook = %name, channel = %channel, "channel missing, webhook left stopped");
                deferred += 1;
                continue;
            }
            dispatcher.start_worker(&name).await?;
            resumed += 1;
        }

        info!(resumed, deferred, "dispatcher restored from storage");
        Ok(dispatcher)
    }

    fn build(
        config: DispatcherConfig,
        channels: Arc<ChannelStore>,
        client: Arc<dyn CallbackClient>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let ctx = Arc::new(WorkerContext {
            channels,
            registry: Arc::new(WebhookRegistry::new(config.max_errors)),
            cursors: Arc::new(CursorTracker::new(storage.clone())),
            client,
            storage,
            config,
        });

        Self {
            ctx,
            workers: Arc::new(Mutex::new(HashMap::new())),
            lifecycle: Mutex::new(HashMap::new()),
            is_running: Arc::new(AtomicBool::new(true)),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.ctx.config
    }

    pub fn channels(&self) -> &Arc<ChannelStore> {
        &self.ctx.channels
    }

    /// Register a new webhook or update an existing one.
    ///
    /// New webhooks get their start policy resolved against the channel as it
    /// is right now, then a worker unless they are registered paused. Updates
    /// keep the cursor; the webhook's worker restarts with the new settings.
    /// Returns the webhook and whether it was newly created.
    pub async fn register_webhook(&self, definition: WebhookDefinition) -> Result<(Webhook, bool)> {
        self.ensure_running()?;
        let channel = WebhookRegistry::validate(&definition)?;
        let name = definition.name.clone();
        let _lifecycle = self.lock_webhook(&name).await;

        if self.ctx.registry.get(&name).await.is_ok() {
            return self.update_webhook(definition).await;
        }

        let start = self
            .ctx
            .channels
            .resolve_start_sequence(&channel, &definition.start_policy)
            .await?;
        let (webhook, _) = self.ctx.registry.register(definition).await?;

        self.ctx.cursors.init(&name, start).await?;
        self.ctx.storage.save_webhook(&webhook).await?;
        metric_inc("webhook.registered");
        info!(webhook = %name, channel = %channel, start, "webhook created");

        if webhook.state != WebhookState::Paused {
            self.start_worker(&name).await?;
        }
        Ok((self.ctx.registry.get(&name).await?, true))
    }

    async fn update_webhook(&self, definition: WebhookDefinition) -> Result<(Webhook, bool)> {
        let name = definition.name.clone();
        let paused = definition.paused;
        let (webhook, _) = self.ctx.registry.register(definition).await?;
        self.ctx.storage.save_webhook(&webhook).await?;

        match (paused, webhook.state) {
            (true, WebhookState::Created | WebhookState::Active) => self.pause_locked(&name).await?,
            (false, WebhookState::Paused) => self.resume_locked(&name).await?,
            (false, WebhookState::Created | WebhookState::Active) => {
                // Pick up the new callback settings.
                self.stop_worker(&name).await;
                self.start_worker(&name).await?;
            }
            _ => {}
        }
        Ok((self.ctx.registry.get(&name).await?, false))
    }

    pub async fn get_webhook(&self, name: &WebhookName) -> Result<Webhook> {
        self.ctx.registry.get(name).await
    }

    pub async fn list_webhooks(&self) -> Vec<Webhook> {
        self.ctx.registry.list().await
    }

    pub async fn webhook_status(&self, name: &WebhookName) -> Result<WebhookStatus> {
        let webhook = self.ctx.registry.get(name).await?;
        let cursor = self.ctx.cursors.get(name).await?;
        let latest_sequence = self.ctx.channels.latest_sequence(&webhook.channel).await?;
        let worker_running = self.is_worker_running(name).await;
        Ok(WebhookStatus {
            name: name.clone(),
            channel: webhook.channel,
            state: webhook.state,
            cursor,
            latest_sequence,
            worker_running,
            errors: webhook.errors,
        })
    }

    /// Stop delivery. The cursor stays where the last acknowledged batch left it.
    pub async fn pause(&self, name: &WebhookName) -> Result<()> {
        let _lifecycle = self.lock_webhook(name).await;
        self.pause_locked(name).await
    }

    async fn pause_locked(&self, name: &WebhookName) -> Result<()> {
        self.ctx.registry.get(name).await?;
        self.stop_worker(name).await;
        let webhook = self.ctx.registry.transition(name, WebhookState::Paused).await?;
        self.ctx.storage.save_webhook(&webhook).await?;
        Ok(())
    }

    /// Restart delivery of a paused webhook from its stored cursor.
    ///
    /// Also starts a webhook restored before its channel existed. A webhook in
    /// `error` is not resumed; it needs [`reset`](Self::reset).
    pub async fn resume(&self, name: &WebhookName) -> Result<()> {
        let _lifecycle = self.lock_webhook(name).await;
        self.resume_locked(name).await
    }

    async fn resume_locked(&self, name: &WebhookName) -> Result<()> {
        let webhook = self.ctx.registry.get(name).await?;
        if webhook.state == WebhookState::Error {
            return Err(HubError::WebhookSuspended { name: name.clone() });
        }
        self.start_worker(name).await
    }

    /// Operator action: bring a webhook out of `error`.
    ///
    /// Delivery restarts at the batch that exhausted its attempts.
    pub async fn reset(&self, name: &WebhookName) -> Result<()> {
        let _lifecycle = self.lock_webhook(name).await;
        let webhook = self.ctx.registry.get(name).await?;
        if webhook.state != WebhookState::Error {
            return Err(HubError::validation(format!(
                "webhook {name} is {}, only webhooks in error can be reset",
                webhook.state
            )));
        }
        // Reap the worker that suspended the webhook, if it is still winding down.
        self.stop_worker(name).await;
        info!(webhook = %name, "webhook reset");
        self.start_worker(name).await
    }

    /// Remove a webhook together with its worker and cursor.
    pub async fn remove(&self, name: &WebhookName) -> Result<Webhook> {
        let _lifecycle = self.lock_webhook(name).await;
        self.ctx.registry.get(name).await?;
        self.stop_worker(name).await;
        let webhook = self.ctx.registry.remove(name).await?;
        self.ctx.cursors.remove(name).await;
        self.ctx.storage.remove_webhook(name).await?;
        metric_inc("webhook.removed");
        Ok(webhook)
    }

    pub async fn is_worker_running(&self, name: &WebhookName) -> bool {
        let guard = self.workers.lock().await;
        guard.get(name).is_some_and(|w| !w.handle.is_finished())
    }

    /// Stop every worker. Webhook states and cursors are left as they are.
    pub async fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        let workers: Vec<_> = {
            let mut guard = self.workers.lock().await;
            guard.drain().collect()
        };
        for (_, worker) in &workers {
            worker.cancel.cancel();
        }
        for (name, worker) in workers {
            if let Err(err) = worker.handle.await {
                warn!(webhook = %name, error = %err, "delivery worker panicked");
            }
        }
        info!("dispatcher shut down");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(HubError::Shutdown)
        }
    }

    /// Take the lifecycle lock of one webhook.
    async fn lock_webhook(&self, name: &WebhookName) -> OwnedMutexGuard<()> {
        let lock = {
            let mut guard = self.lifecycle.lock().await;
            guard.entry(name.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Start the webhook's worker unless one is already live, moving the
    /// webhook to `active`.
    ///
    /// Callers hold the webhook's lifecycle lock. The channel must exist; a
    /// webhook without a cursor gets one from its start policy first.
    async fn start_worker(&self, name: &WebhookName) -> Result<()> {
        self.ensure_running()?;
        let mut guard = self.workers.lock().await;
        if let Some(existing) = guard.get(name) {
            if !existing.handle.is_finished() {
                return Ok(());
            }
            guard.remove(name);
        }

        let current = self.ctx.registry.get(name).await?;
        if !current.state.can_transition_to(WebhookState::Active) {
            return Err(HubError::validation(format!(
                "webhook {name} cannot move from {} to active",
                current.state
            )));
        }
        if self.ctx.cursors.cursor(name).await.is_err() {
            let start = self
                .ctx
                .channels
                .resolve_start_sequence(&current.channel, &current.definition.start_policy)
                .await?;
            self.ctx.cursors.init(name, start).await?;
        } else {
            self.ctx.channels.get_channel(&current.channel).await?;
        }

        // Storage is written before the registry changes.
        let mut stored = current;
        stored.state = WebhookState::Active;
        self.ctx.storage.save_webhook(&stored).await?;
        let webhook = self.ctx.registry.transition(name, WebhookState::Active).await?;

        let settings = WorkerSettings::for_webhook(&webhook, &self.ctx.config);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let ctx = self.ctx.clone();
        let workers = self.workers.clone();
        let worker_cancel = cancel.clone();
        let worker_name = name.clone();
        let handle = tokio::spawn(async move {
            let exit = run_worker(ctx, settings, worker_cancel).await;
            if exit == WorkerExit::Suspended {
                let mut guard = workers.lock().await;
                if guard.get(&worker_name).is_some_and(|w| w.generation == generation) {
                    guard.remove(&worker_name);
                }
            }
        });

        guard.insert(
            name.clone(),
            WorkerHandle {
                generation,
                cancel,
                handle,
            },
        );
        metric_inc("webhook.worker.started");
        debug!(webhook = %name, generation, "delivery worker spawned");
        Ok(())
    }

    /// Cancel the webhook's worker and wait until it has stopped.
    async fn stop_worker(&self, name: &WebhookName) {
        let worker = {
            let mut guard = self.workers.lock().await;
            guard.remove(name)
        };
        let Some(worker) = worker else { return };
        worker.cancel.cancel();
        if let Err(err) = worker.handle.await {
            warn!(webhook = %name, error = %err, "delivery worker panicked");
        }
        metric_inc("webhook.worker.stopped");
    }
}
