use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::{CallbackClient, CallbackRequest};
use crate::channel::ChannelStore;
use crate::cursor::CursorTracker;
use crate::dispatcher::DispatcherConfig;
use crate::error::{FailureReason, HubError, Result};
use crate::registry::WebhookRegistry;
use crate::signing::build_signature_headers;
use crate::storage::Storage;
use crate::telemetry::metric_inc_webhook;
use crate::types::{
    BatchPolicy, ChannelName, DeliveryPayload, Item, TimeWindow, Webhook, WebhookName, WebhookState,
};

/// Shared context for all delivery workers.
pub(crate) struct WorkerContext {
    pub channels: Arc<ChannelStore>,
    pub registry: Arc<WebhookRegistry>,
    pub cursors: Arc<CursorTracker>,
    pub client: Arc<dyn CallbackClient>,
    pub storage: Arc<dyn Storage>,
    pub config: DispatcherConfig,
}

/// Delivery settings of one webhook, fixed for the lifetime of its worker.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub name: WebhookName,
    pub channel: ChannelName,
    pub callback_url: String,
    pub batch: BatchPolicy,
    pub callback_timeout: Duration,
    pub max_attempts: u32,
    pub secret: Option<Vec<u8>>,
}

impl WorkerSettings {
    pub fn for_webhook(webhook: &Webhook, config: &DispatcherConfig) -> Self {
        let definition = &webhook.definition;
        Self {
            name: definition.name.clone(),
            channel: webhook.channel.clone(),
            callback_url: definition.callback_url.clone(),
            batch: definition.batch,
            callback_timeout: definition
                .callback_timeout
                .unwrap_or_else(|| config.callback_timeout()),
            max_attempts: definition.max_attempts.unwrap_or(config.max_attempts).max(1),
            secret: definition.secret.clone(),
        }
    }
}

/// Where a delivery worker is in its loop.
///
/// `Idle → Fetching → Delivering → Advancing → Idle`, with `BackingOff` and
/// `Suspended` as the failure branches.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkerPhase {
    /// Caught up; waiting for a change notification or the poll interval.
    Idle,
    Fetching,
    /// The oldest pending time window is still open.
    AwaitingWindow { delay: Duration },
    Delivering { batch: Vec<Arc<Item>>, attempt: u32 },
    BackingOff { batch: Vec<Arc<Item>>, attempt: u32, delay: Duration },
    Advancing { through: u64 },
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// Stopped by pause, removal or shutdown.
    Cancelled,
    /// Moved the webhook to `error`.
    Suspended,
}

/// Restarts allowed after cursor ordering faults. A delivered batch refills it.
#[derive(Debug)]
struct RestartBudget {
    used: u32,
    max: u32,
}

impl RestartBudget {
    fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    fn refill(&mut self) {
        self.used = 0;
    }

    fn try_restart(&mut self) -> bool {
        if self.used >= self.max {
            return false;
        }
        self.used += 1;
        true
    }
}

/// Run a webhook's delivery worker until it is cancelled or suspends itself.
///
/// An `OutOfOrder` cursor error ends the current loop instance; a fresh one
/// restarts from the stored cursor, up to `max_worker_restarts` times in a row
/// without a delivery in between. Any other error suspends the webhook.
pub(crate) async fn run_worker(
    ctx: Arc<WorkerContext>,
    settings: WorkerSettings,
    cancel: CancellationToken,
) -> WorkerExit {
    let mut budget = RestartBudget::new(ctx.config.max_worker_restarts);
    loop {
        match worker_loop(&ctx, &settings, &cancel, &mut budget).await {
            Ok(exit) => {
                info!(webhook = %settings.name, ?exit, "delivery worker stopped");
                return exit;
            }
            Err(err) if matches!(err, HubError::OutOfOrder { .. }) && budget.try_restart() => {
                warn!(
                    webhook = %settings.name,
                    error = %err,
                    restarts = budget.used,
                    "delivery worker restarting from stored cursor"
                );
            }
            Err(err) => {
                warn!(webhook = %settings.name, error = %err, "delivery worker failed");
                ctx.registry.record_error(&settings.name, err.to_string()).await;
                suspend(&ctx, &settings.name).await;
                return WorkerExit::Suspended;
            }
        }
    }
}

async fn worker_loop(
    ctx: &WorkerContext,
    settings: &WorkerSettings,
    cancel: &CancellationToken,
    budget: &mut RestartBudget,
) -> Result<WorkerExit> {
    let mut changes = ctx.channels.subscribe(&settings.channel).await?;
    let mut notifications_open = true;
    let mut phase = WorkerPhase::Fetching;

    debug!(webhook = %settings.name, channel = %settings.channel, "delivery worker started");

    loop {
        phase = match phase {
            WorkerPhase::Idle => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(WorkerExit::Cancelled),
                    changed = changes.changed(), if notifications_open => {
                        if changed.is_err() {
                            notifications_open = false;
                        }
                    }
                    _ = sleep(ctx.config.poll_interval()) => {}
                }
                WorkerPhase::Fetching
            }

            WorkerPhase::Fetching => {
                // Mark the tail as seen before reading so no append slips between.
                let _ = changes.borrow_and_update();
                let after = ctx.cursors.get(&settings.name).await?;
                let batch = ctx
                    .channels
                    .read_from(&settings.channel, after, settings.batch.limit())
                    .await?;
                match settings.batch {
                    BatchPolicy::Timed { window } => {
                        match select_window(batch, window, ctx.config.timed_stable_ms, Utc::now()) {
                            WindowSelection::Empty => WorkerPhase::Idle,
                            WindowSelection::Pending { delay } => {
                                WorkerPhase::AwaitingWindow { delay }
                            }
                            WindowSelection::Ready(batch) => {
                                WorkerPhase::Delivering { batch, attempt: 1 }
                            }
                        }
                    }
                    _ if batch.is_empty() => WorkerPhase::Idle,
                    _ => WorkerPhase::Delivering { batch, attempt: 1 },
                }
            }

            WorkerPhase::AwaitingWindow { delay } => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(WorkerExit::Cancelled),
                    _ = sleep(delay) => {}
                }
                WorkerPhase::Fetching
            }

            WorkerPhase::Delivering { batch, attempt } => {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(WorkerExit::Cancelled),
                    result = deliver(ctx.client.as_ref(), settings, &batch) => result,
                };
                match result {
                    Ok(()) => {
                        metric_inc_webhook("webhook.delivery.success", &settings.name);
                        let through = batch.last().map(|item| item.sequence).unwrap_or_default();
                        debug!(webhook = %settings.name, items = batch.len(), through, "batch delivered");
                        WorkerPhase::Advancing { through }
                    }
                    Err(reason) => {
                        metric_inc_webhook("webhook.delivery.failure", &settings.name);
                        warn!(
                            webhook = %settings.name,
                            attempt,
                            max_attempts = settings.max_attempts,
                            error = %reason,
                            "callback failed"
                        );
                        ctx.registry
                            .record_error(&settings.name, describe_failure(&batch, attempt, &reason))
                            .await;

                        if attempt >= settings.max_attempts {
                            WorkerPhase::Suspended
                        } else {
                            let delay = retry_delay_for_attempt(attempt, &ctx.config)
                                + jitter_delay(ctx.config.retry_jitter_ms);
                            WorkerPhase::BackingOff { batch, attempt, delay }
                        }
                    }
                }
            }

            WorkerPhase::BackingOff { batch, attempt, delay } => {
                metric_inc_webhook("webhook.delivery.retry_scheduled", &settings.name);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(WorkerExit::Cancelled),
                    _ = sleep(delay) => {}
                }
                WorkerPhase::Delivering { batch, attempt: attempt + 1 }
            }

            WorkerPhase::Advancing { through } => {
                ctx.cursors.advance(&settings.name, through).await?;
                budget.refill();
                WorkerPhase::Fetching
            }

            WorkerPhase::Suspended => {
                metric_inc_webhook("webhook.suspended", &settings.name);
                suspend(ctx, &settings.name).await;
                return Ok(WorkerExit::Suspended);
            }
        };
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WindowSelection {
    Empty,
    Pending { delay: Duration },
    Ready(Vec<Arc<Item>>),
}

/// Pick the items of the oldest pending window once it is closed.
///
/// A window counts as closed `stable_ms` after its end, which leaves room for
/// appends stamped just before the boundary.
fn select_window(
    mut items: Vec<Arc<Item>>,
    window: TimeWindow,
    stable_ms: u64,
    now: DateTime<Utc>,
) -> WindowSelection {
    let Some(first) = items.first() else {
        return WindowSelection::Empty;
    };
    let start = window.start_of(first.created_at);
    let closes_at = start
        .saturating_add(window.millis())
        .saturating_add(i64::try_from(stable_ms).unwrap_or(i64::MAX));
    let now_ms = now.timestamp_millis();
    if now_ms < closes_at {
        let wait = u64::try_from(closes_at - now_ms).unwrap_or_default();
        return WindowSelection::Pending {
            delay: Duration::from_millis(wait),
        };
    }

    let end = items
        .iter()
        .position(|item| window.start_of(item.created_at) != start)
        .unwrap_or(items.len());
    items.truncate(end);
    WindowSelection::Ready(items)
}

/// Make one callback attempt for a batch.
async fn deliver(
    client: &dyn CallbackClient,
    settings: &WorkerSettings,
    batch: &[Arc<Item>],
) -> std::result::Result<(), FailureReason> {
    let payload = DeliveryPayload {
        name: settings.name.to_string(),
        uris: batch.iter().map(|item| item.href.clone()).collect(),
    };
    let body = serde_json::to_vec(&payload).map_err(|_| FailureReason::Encoding)?;
    let headers = match &settings.secret {
        Some(secret) => build_signature_headers(secret, &body, now_secs()),
        None => Vec::new(),
    };
    let request = CallbackRequest {
        url: settings.callback_url.clone(),
        body,
        headers,
        timeout: settings.callback_timeout,
    };

    // Hard bound for clients that do not enforce the timeout themselves.
    match timeout(settings.callback_timeout, client.deliver(&request)).await {
        Ok(result) => result,
        Err(_) => Err(FailureReason::Timeout),
    }
}

async fn suspend(ctx: &WorkerContext, name: &WebhookName) {
    match ctx.registry.transition(name, WebhookState::Error).await {
        Ok(webhook) => {
            if let Err(err) = ctx.storage.save_webhook(&webhook).await {
                warn!(webhook = %name, error = %err, "failed to persist suspended webhook");
            }
        }
        Err(err) => warn!(webhook = %name, error = %err, "could not suspend webhook"),
    }
}

fn describe_failure(batch: &[Arc<Item>], attempt: u32, reason: &FailureReason) -> String {
    let first = batch.first().map(|item| item.sequence).unwrap_or_default();
    let last = batch.last().map(|item| item.sequence).unwrap_or_default();
    if first == last {
        format!("attempt {attempt} for item {first}: {reason}")
    } else {
        format!("attempt {attempt} for items {first}-{last}: {reason}")
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at the configured max.
fn retry_delay_for_attempt(attempt: u32, config: &DispatcherConfig) -> Duration {
    let base = config.retry_base_ms.max(1);
    let max = config.retry_max_ms.max(base);
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base.saturating_mul(pow).min(max))
}
