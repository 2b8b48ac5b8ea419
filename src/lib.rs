//! Ordered channels with in-order webhook delivery.
//!
//! A **channel** is an append-only log of immutable items, each with a
//! sequence number that is unique and gap-free within the channel. A
//! **webhook** delivers a channel's items to a callback URL, in sequence
//! order, starting from a chosen point in the channel's history
//! (`now`, `previous`, `earliest` or an explicit item).
//!
//! ## Guarantees
//! - Gap-free, strictly increasing sequence numbers per channel
//! - In-order, at-least-once delivery per webhook
//! - A webhook's cursor only moves past acknowledged items
//! - One delivery worker per webhook; webhooks never block each other
//!
//! ## Non-Guarantees
//! - Exactly-once delivery (receivers dedup on item href)
//! - Cross-channel transactions
//! - Durability of channel content across restarts
//!
//! The HTTP server is not part of this crate. [`Hub`] exposes the request and
//! response shapes a transport needs.

mod callback;
mod channel;
mod cursor;
mod dispatcher;
mod error;
mod hub;
mod registry;
mod signing;
mod storage;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod storage_redis;

pub use callback::{CallbackClient, CallbackRequest};
#[cfg(feature = "http")]
pub use callback::HttpCallbackClient;
pub use channel::ChannelStore;
pub use cursor::{Cursor, CursorTracker};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{FailureReason, HubError, Result};
pub use hub::{
    ChannelBody, ChannelLinks, ChannelRequest, Hub, ItemBody, ItemLinks, Link, Response,
    WebhookBody, WebhookLinks, WebhookRequest,
};
pub use registry::WebhookRegistry;
pub use signing::{
    build_signature_headers,
    compute_signature,
    verify_signature,
    is_timestamp_fresh,
    parse_signature_headers,
    ParsedSignature,
    verify_callback,
    VerificationError,
    SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
pub use storage::{InMemoryStorage, Storage};
pub use types::{
    parse_channel_url, BatchPolicy, Channel, ChannelMetadata, ChannelName, Content,
    DeliveryPayload, Item, ItemRef, StartPolicy, TimeWindow, Webhook, WebhookDefinition,
    WebhookName, WebhookState, WebhookStatus, TIMED_READ_LIMIT,
};

#[cfg(feature = "redis")]
pub use storage_redis::RedisStorage;
