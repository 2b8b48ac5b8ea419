//! Append-only channel log.
//!
//! Each channel owns its items and a `next_sequence` counter. Appends take the
//! channel's write lock, which is the single point where sequence numbers are
//! allocated, so concurrent appends never collide or reorder. Readers share the
//! read lock and only ever observe a growing log.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::error::{HubError, Result};
use crate::telemetry::metric_inc;
use crate::types::{
    channel_href, item_href, Channel, ChannelMetadata, ChannelName, Content, Item, StartPolicy,
};

struct ChannelState {
    log: RwLock<ChannelLog>,

    /// Newest sequence, published on every append.
    tail: watch::Sender<u64>,
}

struct ChannelLog {
    metadata: ChannelMetadata,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,

    /// `items[n]` holds sequence `n + 1`.
    items: Vec<Arc<Item>>,
    next_sequence: u64,
}

impl ChannelLog {
    fn latest_sequence(&self) -> u64 {
        self.next_sequence - 1
    }
}

/// Ordered item store shared by producers and delivery workers.
pub struct ChannelStore {
    base_url: String,
    channels: RwLock<HashMap<ChannelName, Arc<ChannelState>>>,
}

impl ChannelStore {
    /// `base_url` prefixes every channel and item href.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a channel or overwrite its metadata.
    ///
    /// Returns the channel and whether it was newly created.
    pub async fn put_channel(
        &self,
        name: &ChannelName,
        metadata: ChannelMetadata,
    ) -> Result<(Channel, bool)> {
        name.validate()?;
        let now = Utc::now();

        let (state, created) = {
            let mut guard = self.channels.write().await;
            match guard.get(name) {
                Some(state) => (state.clone(), false),
                None => {
                    let (tail, _) = watch::channel(0);
                    let state = Arc::new(ChannelState {
                        log: RwLock::new(ChannelLog {
                            metadata: metadata.clone(),
                            created_at: now,
                            updated_at: now,
                            items: Vec::new(),
                            next_sequence: 1,
                        }),
                        tail,
                    });
                    guard.insert(name.clone(), state.clone());
                    (state, true)
                }
            }
        };

        let mut log = state.log.write().await;
        if created {
            info!(channel = %name, "channel created");
        } else {
            log.metadata = metadata;
            log.updated_at = now;
            debug!(channel = %name, "channel metadata updated");
        }
        Ok((self.snapshot(name, &log), created))
    }

    pub async fn get_channel(&self, name: &ChannelName) -> Result<Channel> {
        let state = self.state(name).await?;
        let log = state.log.read().await;
        Ok(self.snapshot(name, &log))
    }

    pub async fn channel_names(&self) -> Vec<ChannelName> {
        let guard = self.channels.read().await;
        let mut names: Vec<_> = guard.keys().cloned().collect();
        names.sort();
        names
    }

    /// Append one item and return it with its assigned sequence and href.
    pub async fn append(&self, channel: &ChannelName, content: Content) -> Result<Arc<Item>> {
        let state = self.state(channel).await?;
        let mut log = state.log.write().await;
        let item = self.push_item(channel, &mut log, content);
        state.tail.send_replace(item.sequence);
        metric_inc("channel.append.items");
        debug!(channel = %channel, sequence = item.sequence, "item appended");
        Ok(item)
    }

    /// Append several items as one contiguous run.
    ///
    /// No other append interleaves with the run.
    pub async fn append_bulk(
        &self,
        channel: &ChannelName,
        contents: Vec<Content>,
    ) -> Result<Vec<Arc<Item>>> {
        let state = self.state(channel).await?;
        let mut log = state.log.write().await;
        let items: Vec<_> = contents
            .into_iter()
            .map(|content| self.push_item(channel, &mut log, content))
            .collect();
        if let Some(last) = items.last() {
            state.tail.send_replace(last.sequence);
            debug!(
                channel = %channel,
                first = items[0].sequence,
                last = last.sequence,
                "bulk items appended"
            );
        }
        metric_inc("channel.append.bulk");
        Ok(items)
    }

    fn push_item(&self, channel: &ChannelName, log: &mut ChannelLog, content: Content) -> Arc<Item> {
        let sequence = log.next_sequence;
        log.next_sequence += 1;
        let item = Arc::new(Item {
            channel: channel.clone(),
            sequence,
            content: content.data,
            content_type: content.content_type,
            created_at: Utc::now(),
            href: item_href(&self.base_url, channel, sequence),
        });
        log.items.push(item.clone());
        item
    }

    /// Items with a sequence strictly greater than `after`, ascending, at most `limit`.
    ///
    /// An empty result means the reader has caught up.
    pub async fn read_from(
        &self,
        channel: &ChannelName,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Arc<Item>>> {
        let state = self.state(channel).await?;
        let log = state.log.read().await;
        let len = log.items.len();
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(limit).min(len);
        Ok(log.items[start..end].to_vec())
    }

    pub async fn get_item(&self, channel: &ChannelName, sequence: u64) -> Result<Arc<Item>> {
        let state = self.state(channel).await?;
        let log = state.log.read().await;
        sequence
            .checked_sub(1)
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| log.items.get(index).cloned())
            .ok_or_else(|| HubError::ItemNotFound {
                channel: channel.to_string(),
                sequence,
            })
    }

    /// The most recently appended item, if any.
    pub async fn latest(&self, channel: &ChannelName) -> Result<Option<Arc<Item>>> {
        let state = self.state(channel).await?;
        let log = state.log.read().await;
        Ok(log.items.last().cloned())
    }

    pub async fn latest_sequence(&self, channel: &ChannelName) -> Result<u64> {
        let state = self.state(channel).await?;
        let log = state.log.read().await;
        Ok(log.latest_sequence())
    }

    /// Receiver that changes whenever the channel's newest sequence moves.
    pub async fn subscribe(&self, channel: &ChannelName) -> Result<watch::Receiver<u64>> {
        let state = self.state(channel).await?;
        Ok(state.tail.subscribe())
    }

    /// Translate a start policy into an exclusive starting cursor.
    ///
    /// Delivery begins with the first item whose sequence is greater than the
    /// returned value.
    pub async fn resolve_start_sequence(
        &self,
        channel: &ChannelName,
        policy: &StartPolicy,
    ) -> Result<u64> {
        let state = self.state(channel).await?;
        let log = state.log.read().await;
        let latest = log.latest_sequence();

        match policy {
            StartPolicy::Now => Ok(latest),
            // Empty channel: latest is 0, which is the same as earliest.
            StartPolicy::Previous => Ok(latest.saturating_sub(1)),
            StartPolicy::Earliest => Ok(0),
            StartPolicy::FromItem(item) => {
                if item.channel != *channel || item.sequence == 0 || item.sequence > latest {
                    return Err(HubError::ItemNotFound {
                        channel: item.channel.to_string(),
                        sequence: item.sequence,
                    });
                }
                Ok(item.sequence)
            }
        }
    }

    async fn state(&self, channel: &ChannelName) -> Result<Arc<ChannelState>> {
        let guard = self.channels.read().await;
        guard
            .get(channel)
            .cloned()
            .ok_or_else(|| HubError::ChannelNotFound {
                name: channel.to_string(),
            })
    }

    fn snapshot(&self, name: &ChannelName, log: &ChannelLog) -> Channel {
        Channel {
            name: name.clone(),
            metadata: log.metadata.clone(),
            created_at: log.created_at,
            updated_at: log.updated_at,
            latest_sequence: log.latest_sequence(),
            href: channel_href(&self.base_url, name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemRef;

    async fn store_with(name: &str, items: usize) -> (ChannelStore, ChannelName) {
        let store = ChannelStore::new("http://hub");
        let channel = ChannelName::from(name);
        store.put_channel(&channel, ChannelMetadata::default()).await.unwrap();
        for i in 0..items {
            store
                .append(&channel, Content::new(format!("item-{i}")))
                .await
                .unwrap();
        }
        (store, channel)
    }

    #[tokio::test]
    async fn append_assigns_sequence_and_href() {
        let (store, channel) = store_with("orders", 0).await;
        let first = store.append(&channel, Content::new("a")).await.unwrap();
        let second = store
            .append(&channel, Content::new("b").with_content_type("text/plain"))
            .await
            .unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.href, "http://hub/channel/orders/1");
        assert_eq!(second.content_type.as_deref(), Some("text/plain"));
        assert_eq!(store.latest_sequence(&channel).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn append_to_unknown_channel_fails() {
        let store = ChannelStore::new("http://hub");
        let err = store
            .append(&ChannelName::from("missing"), Content::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ChannelNotFound { .. }));
    }

    #[tokio::test]
    async fn read_from_is_exclusive_and_limited() {
        let (store, channel) = store_with("orders", 5).await;

        let items = store.read_from(&channel, 2, 2).await.unwrap();
        let seqs: Vec<_> = items.iter().map(|i| i.sequence).collect();
        assert_eq!(seqs, vec![3, 4]);

        assert!(store.read_from(&channel, 5, 10).await.unwrap().is_empty());
        assert!(store.read_from(&channel, 99, 10).await.unwrap().is_empty());
        assert_eq!(store.read_from(&channel, 0, 100).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn bulk_append_is_contiguous() {
        let (store, channel) = store_with("orders", 1).await;
        let items = store
            .append_bulk(&channel, vec![Content::new("x"), Content::new("y")])
            .await
            .unwrap();
        let seqs: Vec<_> = items.iter().map(|i| i.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[tokio::test]
    async fn resolves_start_policies() {
        let (store, channel) = store_with("orders", 3).await;

        assert_eq!(store.resolve_start_sequence(&channel, &StartPolicy::Now).await.unwrap(), 3);
        assert_eq!(
            store.resolve_start_sequence(&channel, &StartPolicy::Previous).await.unwrap(),
            2
        );
        assert_eq!(
            store.resolve_start_sequence(&channel, &StartPolicy::Earliest).await.unwrap(),
            0
        );

        let from = StartPolicy::FromItem(ItemRef {
            channel: channel.clone(),
            sequence: 1,
        });
        assert_eq!(store.resolve_start_sequence(&channel, &from).await.unwrap(), 1);

        let missing = StartPolicy::FromItem(ItemRef {
            channel: channel.clone(),
            sequence: 9,
        });
        assert!(matches!(
            store.resolve_start_sequence(&channel, &missing).await,
            Err(HubError::ItemNotFound { sequence: 9, .. })
        ));
    }

    #[tokio::test]
    async fn previous_on_empty_channel_is_earliest() {
        let (store, channel) = store_with("empty", 0).await;
        assert_eq!(
            store.resolve_start_sequence(&channel, &StartPolicy::Previous).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn put_channel_is_last_write_wins() {
        let store = ChannelStore::new("http://hub");
        let channel = ChannelName::from("owned");

        let (first, created) = store
            .put_channel(&channel, ChannelMetadata::default().with_owner("the man"))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.metadata.owner.as_deref(), Some("the man"));

        let (_, created) = store
            .put_channel(&channel, ChannelMetadata::default().with_owner("stuff"))
            .await
            .unwrap();
        assert!(!created);

        let fetched = store.get_channel(&channel).await.unwrap();
        assert_eq!(fetched.metadata.owner.as_deref(), Some("stuff"));
        assert_eq!(fetched.created_at, first.created_at);
    }

    #[tokio::test]
    async fn subscribers_see_new_tail() {
        let (store, channel) = store_with("orders", 0).await;
        let mut rx = store.subscribe(&channel).await.unwrap();
        store.append(&channel, Content::new("a")).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_form_a_contiguous_run() {
        let store = Arc::new(ChannelStore::new("http://hub"));
        let channel = ChannelName::from("busy");
        store.put_channel(&channel, ChannelMetadata::default()).await.unwrap();

        let mut handles = Vec::new();
        for producer in 0..8 {
            let store = store.clone();
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                let mut seqs = Vec::new();
                for i in 0..50 {
                    let item = store
                        .append(&channel, Content::new(format!("{producer}-{i}")))
                        .await
                        .unwrap();
                    seqs.push(item.sequence);
                }
                seqs
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (1..=400).collect::<Vec<u64>>());
    }
}
