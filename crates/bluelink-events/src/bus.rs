use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bluelink_domain::ChannelId;
use bluelink_state::{CleanupOperation, EventRecord, StateContainer};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::EventError;

/// Per-subscriber queue depth. A subscriber that falls this far behind is
/// dropped and has to resubscribe from its last event ID.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// Where a subscription starts replaying from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeFrom {
    /// Every retained event on the channel.
    Beginning,
    /// Events with ID strictly greater than this — gap-free reconnects.
    LastEventId(u64),
    /// Events within the configured recent window.
    Recent,
}

struct ChannelState {
    next_id: u64,
    subscribers: Vec<mpsc::Sender<EventRecord>>,
    completed: bool,
}

/// Per-operation event channels with monotonic IDs, replay and completion
/// sentinels, persisted through the state container.
pub struct EventBus {
    store: Arc<dyn StateContainer>,
    channels: tokio::sync::Mutex<HashMap<ChannelId, ChannelState>>,
    recent_window: Duration,
}

impl EventBus {
    pub fn new(store: Arc<dyn StateContainer>, recent_window: Duration) -> Self {
        Self {
            store,
            channels: tokio::sync::Mutex::new(HashMap::new()),
            recent_window,
        }
    }

    /// Append an event to a channel: assigns the next monotonic ID, persists
    /// the record, then fans out to live subscribers. `end` completes the
    /// channel — it is the last record the channel will ever carry.
    pub async fn publish(
        &self,
        channel: &ChannelId,
        payload: Value,
        end: bool,
    ) -> Result<EventRecord, EventError> {
        let mut channels = self.channels.lock().await;
        let next_id_if_new = if channels.contains_key(channel) {
            0
        } else {
            self.store.last_event_id(channel).await?.map_or(1, |id| id + 1)
        };
        let state = channels.entry(channel.clone()).or_insert(ChannelState {
            next_id: next_id_if_new,
            subscribers: Vec::new(),
            completed: false,
        });
        if state.completed {
            return Err(EventError::ChannelCompleted(channel.to_string()));
        }

        let record = EventRecord {
            id: state.next_id,
            channel_id: channel.clone(),
            payload,
            timestamp: Utc::now(),
            end,
        };
        self.store.append_event(&record).await?;
        state.next_id += 1;

        state
            .subscribers
            .retain(|sender| sender.try_send(record.clone()).is_ok());
        if end {
            state.completed = true;
            state.subscribers.clear();
            debug!(channel = %channel, "event channel completed");
        }
        Ok(record)
    }

    /// Subscribe to a channel. Replayed events and the live registration
    /// happen under one lock, so the stream has no gap and no duplicates.
    ///
    /// On a completed channel the receiver yields the replay (ending with
    /// the sentinel record) and then closes.
    pub async fn subscribe(
        &self,
        channel: &ChannelId,
        from: SubscribeFrom,
    ) -> Result<mpsc::Receiver<EventRecord>, EventError> {
        let mut channels = self.channels.lock().await;

        let after_id = match from {
            SubscribeFrom::LastEventId(id) => Some(id),
            SubscribeFrom::Beginning | SubscribeFrom::Recent => None,
        };
        let mut replay = self.store.list_events(channel, after_id).await?;
        if from == SubscribeFrom::Recent {
            let cutoff = self.recent_cutoff();
            replay.retain(|e| e.timestamp >= cutoff);
        }

        let completed = replay.last().map_or(false, |e| e.end)
            || channels.get(channel).map_or(false, |s| s.completed);

        let (sender, receiver) = mpsc::channel(replay.len() + SUBSCRIBER_QUEUE_DEPTH);
        for event in replay {
            // Capacity covers the whole replay; a failure here means the
            // receiver is already gone.
            if sender.try_send(event).is_err() {
                break;
            }
        }

        if !completed {
            let next_id_if_new = if channels.contains_key(channel) {
                0
            } else {
                self.store.last_event_id(channel).await?.map_or(1, |id| id + 1)
            };
            let state = channels.entry(channel.clone()).or_insert(ChannelState {
                next_id: next_id_if_new,
                subscribers: Vec::new(),
                completed: false,
            });
            state.subscribers.push(sender);
        }
        Ok(receiver)
    }

    pub async fn last_event_id(&self, channel: &ChannelId) -> Result<Option<u64>, EventError> {
        Ok(self.store.last_event_id(channel).await?)
    }

    /// Sweep persisted events older than `threshold`.
    pub async fn cleanup(&self, threshold: DateTime<Utc>) -> Result<CleanupOperation, EventError> {
        Ok(self.store.cleanup_events(threshold).await?)
    }

    fn recent_cutoff(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.recent_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        Utc::now() - window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_state::MemfileStateContainer;
    use serde_json::json;

    fn bus_with_store() -> (EventBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MemfileStateContainer::open(dir.path(), 1024 * 1024, 10 * 1024 * 1024).unwrap();
        (
            EventBus::new(Arc::new(store), Duration::from_secs(300)),
            dir,
        )
    }

    #[tokio::test]
    async fn ids_are_monotonic_within_a_channel() {
        let (bus, _dir) = bus_with_store();
        let channel = ChannelId::new("op-1");

        let first = bus.publish(&channel, json!({"n": 1}), false).await.unwrap();
        let second = bus.publish(&channel, json!({"n": 2}), false).await.unwrap();
        let third = bus.publish(&channel, json!({"n": 3}), true).await.unwrap();
        assert_eq!((first.id, second.id, third.id), (1, 2, 3));
    }

    #[tokio::test]
    async fn live_subscriber_sees_events_in_order() {
        let (bus, _dir) = bus_with_store();
        let channel = ChannelId::new("op-2");

        let mut receiver = bus
            .subscribe(&channel, SubscribeFrom::Beginning)
            .await
            .unwrap();
        bus.publish(&channel, json!({"n": 1}), false).await.unwrap();
        bus.publish(&channel, json!({"n": 2}), true).await.unwrap();

        let a = receiver.recv().await.unwrap();
        let b = receiver.recv().await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert!(b.end, "sentinel arrives last");
        assert!(receiver.recv().await.is_none(), "channel closes after sentinel");
    }

    #[tokio::test]
    async fn reconnect_from_last_event_id_has_no_gap() {
        let (bus, _dir) = bus_with_store();
        let channel = ChannelId::new("op-3");

        for n in 1..=5u64 {
            bus.publish(&channel, json!({"n": n}), false).await.unwrap();
        }

        let mut receiver = bus
            .subscribe(&channel, SubscribeFrom::LastEventId(2))
            .await
            .unwrap();
        bus.publish(&channel, json!({"n": 6}), true).await.unwrap();

        let mut ids = Vec::new();
        while let Some(event) = receiver.recv().await {
            ids.push(event.id);
        }
        assert_eq!(ids, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn completed_channel_replays_then_closes() {
        let (bus, _dir) = bus_with_store();
        let channel = ChannelId::new("op-4");

        bus.publish(&channel, json!({"n": 1}), false).await.unwrap();
        bus.publish(&channel, json!({"n": 2}), true).await.unwrap();

        let mut receiver = bus
            .subscribe(&channel, SubscribeFrom::Beginning)
            .await
            .unwrap();
        assert_eq!(receiver.recv().await.unwrap().id, 1);
        let sentinel = receiver.recv().await.unwrap();
        assert!(sentinel.end);
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_after_completion_is_rejected() {
        let (bus, _dir) = bus_with_store();
        let channel = ChannelId::new("op-5");

        bus.publish(&channel, json!({}), true).await.unwrap();
        let err = bus.publish(&channel, json!({}), false).await.unwrap_err();
        assert!(matches!(err, EventError::ChannelCompleted(_)));
    }

    #[tokio::test]
    async fn ids_continue_across_bus_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ChannelId::new("op-6");

        {
            let store =
                MemfileStateContainer::open(dir.path(), 1024 * 1024, 10 * 1024 * 1024).unwrap();
            let bus = EventBus::new(Arc::new(store), Duration::from_secs(300));
            bus.publish(&channel, json!({"n": 1}), false).await.unwrap();
            bus.publish(&channel, json!({"n": 2}), false).await.unwrap();
        }
        {
            let store =
                MemfileStateContainer::open(dir.path(), 1024 * 1024, 10 * 1024 * 1024).unwrap();
            let bus = EventBus::new(Arc::new(store), Duration::from_secs(300));
            let third = bus.publish(&channel, json!({"n": 3}), false).await.unwrap();
            assert_eq!(third.id, 3, "monotonic IDs survive a restart");
        }
    }
}
