use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HubError, Result};

const MAX_NAME_LEN: usize = 48;

/// Name of a channel.
///
/// Strongly typed so channel names never get mixed up with webhook names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelName(pub String);

/// Name of a webhook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookName(pub String);

macro_rules! name_impls {
    ($ty:ident, $kind:literal) => {
        impl $ty {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Check the name is 1-48 characters of `[A-Za-z0-9_-]`.
            pub fn validate(&self) -> Result<()> {
                validate_name($kind, &self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(name: &str) -> Self {
                Self(name.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(name: String) -> Self {
                Self(name)
            }
        }
    };
}

name_impls!(ChannelName, "channel");
name_impls!(WebhookName, "webhook");

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(HubError::validation(format!("{kind} name cannot be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(HubError::validation(format!(
            "{kind} name too long: {} characters (max {MAX_NAME_LEN})",
            name.len()
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(HubError::validation(format!(
            "{kind} name may only contain letters, digits, '_' and '-': {name}"
        )));
    }
    Ok(())
}

/// Content handed to the channel store for appending.
///
/// The store treats the payload as opaque bytes.
#[derive(Debug, Clone, Default)]
pub struct Content {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
}

impl Content {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// An immutable item in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub channel: ChannelName,

    /// Position in the channel. The first item is 1.
    pub sequence: u64,

    pub content: Vec<u8>,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,

    /// Stable locator, `{base_url}/channel/{name}/{sequence}`.
    pub href: String,
}

/// Simple channel attributes. Last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMetadata {
    pub owner: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl ChannelMetadata {
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Point-in-time view of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: ChannelName,
    pub metadata: ChannelMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Sequence of the newest item, 0 when the channel is empty.
    pub latest_sequence: u64,

    pub href: String,
}

/// Reference to one item of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub channel: ChannelName,
    pub sequence: u64,
}

impl ItemRef {
    /// Parse an item href of the form `.../channel/{name}/{sequence}`.
    ///
    /// Works for absolute URLs and for bare paths.
    pub fn parse_href(href: &str) -> Option<Self> {
        let path = strip_query(href);
        let mut segments = path.trim_end_matches('/').rsplit('/');
        let sequence = segments.next()?.parse::<u64>().ok()?;
        let channel = segments.next()?;
        if segments.next()? != "channel" || channel.is_empty() {
            return None;
        }
        Some(Self {
            channel: ChannelName::from(channel),
            sequence,
        })
    }
}

/// Extract the channel name from a channel URL (`.../channel/{name}`)
/// or accept a bare channel name.
pub fn parse_channel_url(channel_url: &str) -> Option<ChannelName> {
    let path = strip_query(channel_url).trim_end_matches('/');
    if !path.contains('/') {
        return (!path.is_empty()).then(|| ChannelName::from(path));
    }
    let mut segments = path.rsplit('/');
    let name = segments.next()?;
    if segments.next()? != "channel" || name.is_empty() {
        return None;
    }
    Some(ChannelName::from(name))
}

fn strip_query(raw: &str) -> &str {
    raw.split(['?', '#']).next().unwrap_or(raw)
}

pub(crate) fn channel_href(base_url: &str, channel: &ChannelName) -> String {
    format!("{}/channel/{}", base_url.trim_end_matches('/'), channel)
}

pub(crate) fn item_href(base_url: &str, channel: &ChannelName, sequence: u64) -> String {
    format!("{}/{}", channel_href(base_url, channel), sequence)
}

/// Where a new webhook starts in its channel's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPolicy {
    /// Only items appended after registration.
    Now,
    /// The most recent existing item, then everything after it.
    Previous,
    /// The whole history.
    Earliest,
    /// Everything strictly after the referenced item.
    FromItem(ItemRef),
}

impl StartPolicy {
    /// Parse a `startItem` value: `now`, `previous`, `earliest` or an item href.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "now" => Ok(Self::Now),
            "previous" => Ok(Self::Previous),
            "earliest" => Ok(Self::Earliest),
            other => ItemRef::parse_href(other)
                .map(Self::FromItem)
                .ok_or_else(|| HubError::validation(format!("invalid startItem: {other}"))),
        }
    }
}

impl Default for StartPolicy {
    fn default() -> Self {
        Self::Now
    }
}

/// How items are grouped into callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    Single,
    /// Up to `max_items` already-available items per callback.
    Bundle { max_items: usize },
    /// One callback per closed time window holding the items created in it.
    ///
    /// Windows without items are skipped. A window with more than
    /// [`TIMED_READ_LIMIT`] items is split across consecutive callbacks.
    Timed { window: TimeWindow },
}

/// Most items read for a single timed callback.
pub const TIMED_READ_LIMIT: usize = 1_000;

impl BatchPolicy {
    pub fn limit(&self) -> usize {
        match self {
            BatchPolicy::Single => 1,
            BatchPolicy::Bundle { max_items } => (*max_items).max(1),
            BatchPolicy::Timed { .. } => TIMED_READ_LIMIT,
        }
    }

    /// Name used on the wire: `SINGLE`, `BUNDLE`, `SECOND` or `MINUTE`.
    pub fn mode(&self) -> &'static str {
        match self {
            BatchPolicy::Single => "SINGLE",
            BatchPolicy::Bundle { .. } => "BUNDLE",
            BatchPolicy::Timed { window: TimeWindow::Second } => "SECOND",
            BatchPolicy::Timed { window: TimeWindow::Minute } => "MINUTE",
        }
    }
}

/// Width of a timed delivery window. Windows are aligned to UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Second,
    Minute,
}

impl TimeWindow {
    pub fn millis(&self) -> i64 {
        match self {
            TimeWindow::Second => 1_000,
            TimeWindow::Minute => 60_000,
        }
    }

    /// Start of the window containing `at`, in epoch milliseconds.
    pub fn start_of(&self, at: DateTime<Utc>) -> i64 {
        let ms = at.timestamp_millis();
        ms - ms.rem_euclid(self.millis())
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::Single
    }
}

/// Lifecycle state of a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookState {
    Created,
    Active,
    Paused,
    Error,
}

impl WebhookState {
    /// No delivery attempts happen in a suspend state.
    pub fn is_suspended(&self) -> bool {
        matches!(self, WebhookState::Paused | WebhookState::Error)
    }

    pub fn can_transition_to(&self, next: WebhookState) -> bool {
        use WebhookState::*;
        *self == next
            || matches!(
                (self, next),
                (Created, Active)
                    | (Created, Paused)
                    | (Active, Paused)
                    | (Active, Error)
                    | (Paused, Active)
                    | (Error, Active)
                    | (Error, Paused)
            )
    }
}

impl fmt::Display for WebhookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WebhookState::Created => "created",
            WebhookState::Active => "active",
            WebhookState::Paused => "paused",
            WebhookState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Webhook configuration as submitted by a client.
///
/// A `WebhookDefinition` is a pure configuration object. Unset delivery
/// settings fall back to the dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDefinition {
    pub name: WebhookName,

    /// Target URL for callbacks.
    pub callback_url: String,

    /// Channel URL (`.../channel/{name}`) or bare channel name.
    pub channel_url: String,

    pub start_policy: StartPolicy,
    pub batch: BatchPolicy,

    /// Maximum time allowed for a single callback call.
    pub callback_timeout: Option<Duration>,

    /// Consecutive failed attempts before the webhook moves to `error`.
    pub max_attempts: Option<u32>,

    /// Optional secret for HMAC-signed callbacks.
    pub secret: Option<Vec<u8>>,

    /// Register (or keep) the webhook paused.
    pub paused: bool,
}

impl WebhookDefinition {
    /// Create a definition with default delivery settings, starting `now`.
    pub fn new(
        name: impl Into<String>,
        callback_url: impl Into<String>,
        channel_url: impl Into<String>,
    ) -> Self {
        Self {
            name: WebhookName(name.into()),
            callback_url: callback_url.into(),
            channel_url: channel_url.into(),
            start_policy: StartPolicy::Now,
            batch: BatchPolicy::Single,
            callback_timeout: None,
            max_attempts: None,
            secret: None,
            paused: false,
        }
    }

    pub fn with_start_policy(mut self, start_policy: StartPolicy) -> Self {
        self.start_policy = start_policy;
        self
    }

    pub fn with_batch(mut self, batch: BatchPolicy) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }
}

/// A registered webhook and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub definition: WebhookDefinition,
    pub channel: ChannelName,
    pub state: WebhookState,

    /// Most recent delivery errors, oldest first.
    pub errors: Vec<String>,

    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn name(&self) -> &WebhookName {
        &self.definition.name
    }
}

/// JSON body POSTed to a webhook callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub name: String,
    pub uris: Vec<String>,
}

/// Operator view of a webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookStatus {
    pub name: WebhookName,
    pub channel: ChannelName,
    pub state: WebhookState,

    /// Last delivered sequence, or the resolved start before any delivery.
    pub cursor: u64,

    /// Newest sequence in the channel.
    pub latest_sequence: u64,

    pub worker_running: bool,
    pub errors: Vec<String>,
}
