use bluelink_domain::ChannelId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One persisted event on an operation channel.
///
/// `id` is monotonic within the channel; the payload is the serialized tagged
/// event and stays opaque to the store and bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: u64,
    pub channel_id: ChannelId,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Completion sentinel — the last record a channel will ever carry.
    #[serde(default)]
    pub end: bool,
}
