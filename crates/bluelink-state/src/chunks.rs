use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bluelink_domain::ChannelId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::events::EventRecord;

/// A record that can live in a chunked collection.
pub trait ChunkRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable identifier used as the index key.
    fn record_id(&self) -> String;
}

/// Location of a record: chunk file number and slot within its array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkLocation {
    pub chunk_number: u32,
    pub index_in_chunk: u32,
}

/// An entity class persisted as numbered JSON-array chunk files plus an
/// index file mapping record ID to chunk and slot.
///
/// The chunk cap is a soft guide: a write that would push the current chunk
/// past it starts a new chunk, but an individual record larger than the cap
/// still persists (alone in its chunk). All methods do synchronous file I/O;
/// the caller holds the entity-class lock.
#[derive(Debug)]
pub struct ChunkedCollection<T: ChunkRecord> {
    entity: &'static str,
    dir: PathBuf,
    max_chunk_size: u64,
    records: HashMap<String, T>,
    index: HashMap<String, ChunkLocation>,
    /// Record IDs per chunk, in slot order. Mirrors the on-disk arrays.
    chunk_members: Vec<Vec<String>>,
}

impl<T: ChunkRecord> ChunkedCollection<T> {
    /// Load an entity class from `dir`, verifying chunk/index agreement.
    pub fn load(entity: &'static str, dir: &Path, max_chunk_size: u64) -> Result<Self, StateError> {
        let mut collection = Self {
            entity,
            dir: dir.to_path_buf(),
            max_chunk_size,
            records: HashMap::new(),
            index: HashMap::new(),
            chunk_members: Vec::new(),
        };

        let index_path = collection.index_path();
        let index: HashMap<String, ChunkLocation> = if index_path.exists() {
            let bytes = std::fs::read(&index_path).map_err(|e| StateError::Io {
                path: index_path.display().to_string(),
                source: e,
            })?;
            serde_json::from_slice(&bytes).map_err(|e| StateError::Malformed {
                entity: entity.to_string(),
                message: format!("index file unreadable: {e}"),
            })?
        } else {
            HashMap::new()
        };

        let mut chunk_number = 0u32;
        loop {
            let path = collection.chunk_path(chunk_number);
            if !path.exists() {
                break;
            }
            let bytes = std::fs::read(&path).map_err(|e| StateError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            let items: Vec<T> = serde_json::from_slice(&bytes).map_err(|e| StateError::Malformed {
                entity: entity.to_string(),
                message: format!("chunk {chunk_number} unreadable: {e}"),
            })?;

            let mut members = Vec::with_capacity(items.len());
            for (slot, item) in items.into_iter().enumerate() {
                let id = item.record_id();
                let expected = ChunkLocation {
                    chunk_number,
                    index_in_chunk: slot as u32,
                };
                match index.get(&id) {
                    Some(loc) if *loc == expected => {}
                    Some(loc) => {
                        return Err(StateError::Malformed {
                            entity: entity.to_string(),
                            message: format!(
                                "index maps '{id}' to chunk {} slot {} but it lives in chunk {} slot {}",
                                loc.chunk_number, loc.index_in_chunk,
                                expected.chunk_number, expected.index_in_chunk
                            ),
                        });
                    }
                    None => {
                        return Err(StateError::Malformed {
                            entity: entity.to_string(),
                            message: format!("record '{id}' present in chunk {chunk_number} but missing from index"),
                        });
                    }
                }
                members.push(id.clone());
                collection.records.insert(id, item);
            }
            collection.chunk_members.push(members);
            chunk_number += 1;
        }

        // Every index entry must point at a loaded record.
        for id in index.keys() {
            if !collection.records.contains_key(id) {
                return Err(StateError::Malformed {
                    entity: entity.to_string(),
                    message: format!("index entry '{id}' points at a missing record"),
                });
            }
        }
        collection.index = index;
        Ok(collection)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.records.get(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_members.len() as u32
    }

    /// Insert or replace a record, persisting the affected chunk and index.
    pub fn insert(&mut self, record: T) -> Result<(), StateError> {
        let id = record.record_id();
        if let Some(loc) = self.index.get(&id).copied() {
            self.records.insert(id, record);
            self.write_chunk(loc.chunk_number)?;
            return Ok(());
        }

        let record_size = serde_json::to_vec(&record)?.len() as u64;
        let needs_new_chunk = match self.chunk_members.last() {
            None => true,
            Some(members) if members.is_empty() => false,
            Some(_) => {
                let current = self.chunk_size(self.chunk_count() - 1)?;
                current + record_size > self.max_chunk_size
            }
        };
        if needs_new_chunk {
            self.chunk_members.push(Vec::new());
        }
        let chunk_number = self.chunk_count() - 1;

        let slot = self.chunk_members[chunk_number as usize].len() as u32;
        self.chunk_members[chunk_number as usize].push(id.clone());
        self.index.insert(
            id.clone(),
            ChunkLocation {
                chunk_number,
                index_in_chunk: slot,
            },
        );
        self.records.insert(id, record);
        self.write_chunk(chunk_number)?;
        self.write_index()
    }

    /// Remove a record, compacting its chunk and re-slotting the survivors.
    pub fn remove(&mut self, id: &str) -> Result<Option<T>, StateError> {
        let Some(loc) = self.index.remove(id) else {
            return Ok(None);
        };
        let removed = self.records.remove(id);

        let mut members = std::mem::take(&mut self.chunk_members[loc.chunk_number as usize]);
        members.retain(|m| m != id);
        for (slot, member) in members.iter().enumerate() {
            self.index.insert(
                member.clone(),
                ChunkLocation {
                    chunk_number: loc.chunk_number,
                    index_in_chunk: slot as u32,
                },
            );
        }
        self.chunk_members[loc.chunk_number as usize] = members;
        self.write_chunk(loc.chunk_number)?;
        self.write_index()?;
        Ok(removed)
    }

    /// Destructive rebuild: wipe every chunk and the index, then re-append
    /// the given records through the normal path so chunk sizing re-applies.
    pub fn replace_all(&mut self, survivors: Vec<T>) -> Result<(), StateError> {
        for chunk_number in 0..self.chunk_count() {
            let path = self.chunk_path(chunk_number);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| StateError::Io {
                    path: path.display().to_string(),
                    source: e,
                })?;
            }
        }
        let index_path = self.index_path();
        if index_path.exists() {
            std::fs::remove_file(&index_path).map_err(|e| StateError::Io {
                path: index_path.display().to_string(),
                source: e,
            })?;
        }
        self.records.clear();
        self.index.clear();
        self.chunk_members.clear();

        for record in survivors {
            self.insert(record)?;
        }
        if self.records.is_empty() {
            self.write_index()?;
        }
        Ok(())
    }

    fn chunk_path(&self, chunk_number: u32) -> PathBuf {
        self.dir.join(format!("{}_c{}.json", self.entity, chunk_number))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(format!("{}_index.json", self.entity))
    }

    fn chunk_size(&self, chunk_number: u32) -> Result<u64, StateError> {
        let path = self.chunk_path(chunk_number);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StateError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    fn write_chunk(&self, chunk_number: u32) -> Result<(), StateError> {
        let members = &self.chunk_members[chunk_number as usize];
        let items: Vec<&T> = members
            .iter()
            .filter_map(|id| self.records.get(id))
            .collect();
        let bytes = serde_json::to_vec(&items)?;
        let path = self.chunk_path(chunk_number);
        std::fs::write(&path, bytes).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    fn write_index(&self) -> Result<(), StateError> {
        let bytes = serde_json::to_vec(&self.index)?;
        let path = self.index_path();
        std::fs::write(&path, bytes).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }
}

// ── Event partitions ──────────────────────────────────────────────────────────

/// Per-channel append-only event partitions with a hard size cap.
///
/// Unlike entity chunks, an append that would push the partition past the
/// cap fails — events are the one record class allowed to refuse a write.
pub struct EventLog {
    dir: PathBuf,
    hard_cap: u64,
    channels: HashMap<ChannelId, Vec<EventRecord>>,
}

impl EventLog {
    pub fn load(dir: &Path, hard_cap: u64) -> Result<Self, StateError> {
        std::fs::create_dir_all(dir).map_err(|e| StateError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;

        let mut channels: HashMap<ChannelId, Vec<EventRecord>> = HashMap::new();
        let entries = std::fs::read_dir(dir).map_err(|e| StateError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| StateError::Io {
                path: dir.display().to_string(),
                source: e,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".json") else { continue };
            let Some((channel, _partition)) = stem.rsplit_once("_p") else {
                continue;
            };
            let bytes = std::fs::read(entry.path()).map_err(|e| StateError::Io {
                path: entry.path().display().to_string(),
                source: e,
            })?;
            let mut events: Vec<EventRecord> =
                serde_json::from_slice(&bytes).map_err(|e| StateError::Malformed {
                    entity: "events".to_string(),
                    message: format!("partition '{name}' unreadable: {e}"),
                })?;
            let bucket = channels.entry(ChannelId::new(channel)).or_default();
            bucket.append(&mut events);
        }
        for events in channels.values_mut() {
            events.sort_by_key(|e| e.id);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            hard_cap,
            channels,
        })
    }

    pub fn append(&mut self, record: &EventRecord) -> Result<(), StateError> {
        let events = self.channels.entry(record.channel_id.clone()).or_default();
        events.push(record.clone());
        let bytes = match serde_json::to_vec(&events) {
            Ok(b) => b,
            Err(e) => {
                events.pop();
                return Err(StateError::Serialization(e));
            }
        };
        if bytes.len() as u64 > self.hard_cap {
            events.pop();
            return Err(StateError::EventPartitionFull {
                channel: record.channel_id.to_string(),
                size: bytes.len() as u64,
                cap: self.hard_cap,
            });
        }
        let path = self.partition_path(&record.channel_id);
        std::fs::write(&path, bytes).map_err(|e| {
            self.channels
                .get_mut(&record.channel_id)
                .map(|evs| evs.pop());
            StateError::Io {
                path: path.display().to_string(),
                source: e,
            }
        })
    }

    pub fn list(&self, channel: &ChannelId, after_id: Option<u64>) -> Vec<EventRecord> {
        let Some(events) = self.channels.get(channel) else {
            return Vec::new();
        };
        events
            .iter()
            .filter(|e| after_id.map_or(true, |after| e.id > after))
            .cloned()
            .collect()
    }

    pub fn last_id(&self, channel: &ChannelId) -> Option<u64> {
        self.channels.get(channel)?.last().map(|e| e.id)
    }

    /// Drop events older than `threshold`; empty channels lose their file.
    /// Returns the number of events removed.
    pub fn cleanup(&mut self, threshold: chrono::DateTime<chrono::Utc>) -> Result<u64, StateError> {
        let mut deleted = 0u64;
        let channel_ids: Vec<ChannelId> = self.channels.keys().cloned().collect();
        for channel in channel_ids {
            let events = self.channels.get_mut(&channel).map(|evs| {
                let before = evs.len();
                evs.retain(|e| e.timestamp >= threshold);
                before - evs.len()
            });
            let removed = events.unwrap_or(0);
            if removed == 0 {
                continue;
            }
            deleted += removed as u64;

            let path = self.partition_path(&channel);
            let now_empty = self.channels[&channel].is_empty();
            if now_empty {
                self.channels.remove(&channel);
                if path.exists() {
                    std::fs::remove_file(&path).map_err(|e| StateError::Io {
                        path: path.display().to_string(),
                        source: e,
                    })?;
                }
            } else {
                let bytes = serde_json::to_vec(&self.channels[&channel])?;
                std::fs::write(&path, bytes).map_err(|e| StateError::Io {
                    path: path.display().to_string(),
                    source: e,
                })?;
            }
        }
        Ok(deleted)
    }

    fn partition_path(&self, channel: &ChannelId) -> PathBuf {
        self.dir.join(format!("{}_p0.json", channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        body: String,
    }

    impl ChunkRecord for Doc {
        fn record_id(&self) -> String {
            self.id.clone()
        }
    }

    fn doc(id: &str, body: &str) -> Doc {
        Doc {
            id: id.into(),
            body: body.into(),
        }
    }

    #[test]
    fn small_cap_splits_into_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut coll: ChunkedCollection<Doc> =
            ChunkedCollection::load("doc", dir.path(), 100).unwrap();

        for i in 0..5 {
            coll.insert(doc(&format!("doc-{i}"), &"x".repeat(40))).unwrap();
        }
        assert!(coll.chunk_count() >= 2, "expected a chunk split");

        // Round-trips through a fresh load.
        let reloaded: ChunkedCollection<Doc> =
            ChunkedCollection::load("doc", dir.path(), 100).unwrap();
        assert_eq!(reloaded.len(), 5);
        for i in 0..5 {
            assert!(reloaded.get(&format!("doc-{i}")).is_some());
        }
    }

    #[test]
    fn oversized_record_still_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut coll: ChunkedCollection<Doc> =
            ChunkedCollection::load("doc", dir.path(), 50).unwrap();

        coll.insert(doc("big", &"y".repeat(500))).unwrap();
        let reloaded: ChunkedCollection<Doc> =
            ChunkedCollection::load("doc", dir.path(), 50).unwrap();
        assert!(reloaded.get("big").is_some());
    }

    #[test]
    fn in_place_update_keeps_location() {
        let dir = tempfile::tempdir().unwrap();
        let mut coll: ChunkedCollection<Doc> =
            ChunkedCollection::load("doc", dir.path(), 1024).unwrap();

        coll.insert(doc("a", "one")).unwrap();
        coll.insert(doc("b", "two")).unwrap();
        coll.insert(doc("a", "three")).unwrap();

        assert_eq!(coll.len(), 2);
        assert_eq!(coll.get("a").unwrap().body, "three");

        let reloaded: ChunkedCollection<Doc> =
            ChunkedCollection::load("doc", dir.path(), 1024).unwrap();
        assert_eq!(reloaded.get("a").unwrap().body, "three");
    }

    #[test]
    fn remove_reslots_chunk_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let mut coll: ChunkedCollection<Doc> =
            ChunkedCollection::load("doc", dir.path(), 4096).unwrap();

        coll.insert(doc("a", "one")).unwrap();
        coll.insert(doc("b", "two")).unwrap();
        coll.insert(doc("c", "three")).unwrap();
        coll.remove("b").unwrap();

        let reloaded: ChunkedCollection<Doc> =
            ChunkedCollection::load("doc", dir.path(), 4096).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.get("a").is_some());
        assert!(reloaded.get("c").is_some());
    }

    #[test]
    fn replace_all_rebuilds_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let mut coll: ChunkedCollection<Doc> =
            ChunkedCollection::load("doc", dir.path(), 100).unwrap();

        for i in 0..6 {
            coll.insert(doc(&format!("doc-{i}"), &"z".repeat(40))).unwrap();
        }
        let chunks_before = coll.chunk_count();
        assert!(chunks_before >= 2);

        coll.replace_all(vec![doc("doc-0", "tiny")]).unwrap();
        assert_eq!(coll.len(), 1);
        assert_eq!(coll.chunk_count(), 1);

        let reloaded: ChunkedCollection<Doc> =
            ChunkedCollection::load("doc", dir.path(), 100).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("doc-0").unwrap().body, "tiny");
    }

    #[test]
    fn tampered_index_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut coll: ChunkedCollection<Doc> =
                ChunkedCollection::load("doc", dir.path(), 1024).unwrap();
            coll.insert(doc("a", "one")).unwrap();
        }
        // Point the index at a slot that does not exist.
        std::fs::write(
            dir.path().join("doc_index.json"),
            serde_json::to_vec(&json!({"a": {"chunkNumber": 3, "indexInChunk": 9}})).unwrap(),
        )
        .unwrap();

        let err = ChunkedCollection::<Doc>::load("doc", dir.path(), 1024).unwrap_err();
        assert!(matches!(err, StateError::Malformed { .. }));
    }

    #[test]
    fn event_partition_hard_cap_fails_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = EventLog::load(dir.path(), 200).unwrap();
        let channel = ChannelId::new("op-1");

        let mut id = 0u64;
        let mut record = || {
            id += 1;
            EventRecord {
                id,
                channel_id: channel.clone(),
                payload: json!({"kind": "resource-update", "body": "x".repeat(60)}),
                timestamp: Utc::now(),
                end: false,
            }
        };

        log.append(&record()).unwrap();
        let err = loop {
            match log.append(&record()) {
                Ok(()) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, StateError::EventPartitionFull { .. }));

        // The failed append must not leave a partial record behind.
        let before = log.list(&channel, None).len();
        let reloaded = EventLog::load(dir.path(), 200).unwrap();
        assert_eq!(reloaded.list(&channel, None).len(), before);
    }

    #[test]
    fn event_cleanup_drops_old_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = EventLog::load(dir.path(), 10_000).unwrap();
        let channel = ChannelId::new("op-2");

        let old = EventRecord {
            id: 1,
            channel_id: channel.clone(),
            payload: json!({}),
            timestamp: Utc::now() - chrono::Duration::days(30),
            end: false,
        };
        log.append(&old).unwrap();

        let deleted = log.cleanup(Utc::now() - chrono::Duration::days(7)).unwrap();
        assert_eq!(deleted, 1);
        assert!(log.list(&channel, None).is_empty());
        assert!(!dir.path().join("op-2_p0.json").exists());
    }
}
