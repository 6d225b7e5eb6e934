//! Cross-agent content relay
//!
//! Durable handoff store keyed by (from agent, to agent). Writes are
//! last-write-wins per pair; every write takes a fresh insertion sequence so
//! "everything from one agent" reads come back in insertion order.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::store::JsonStore;
use crate::core::{RelayError, Result};

/// Content handed from one agent to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub content: String,
    pub inserted_at: DateTime<Utc>,
    /// Monotonic insertion order, refreshed on overwrite
    pub sequence: u64,
}

/// Relay of processed content between agents
pub struct ContentRelay {
    records: DashMap<(String, String), ContentRecord>,
    next_sequence: AtomicU64,
    write_lock: Mutex<()>,
    store: JsonStore,
}

impl ContentRelay {
    pub fn in_memory() -> Self {
        Self {
            records: DashMap::new(),
            next_sequence: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            store: JsonStore::in_memory(),
        }
    }

    /// Open a relay backed by `store`, restoring saved records
    pub async fn open(store: JsonStore) -> Result<Self> {
        let saved: Vec<ContentRecord> = store.load().await?.unwrap_or_default();
        let next = saved.iter().map(|r| r.sequence + 1).max().unwrap_or(0);

        let records = DashMap::new();
        for record in saved {
            records.insert(
                (record.from_agent_id.clone(), record.to_agent_id.clone()),
                record,
            );
        }

        debug!(records = records.len(), "content relay opened");
        Ok(Self {
            records,
            next_sequence: AtomicU64::new(next),
            write_lock: Mutex::new(()),
            store,
        })
    }

    /// Store `content` for the (from, to) pair, replacing any previous record.
    ///
    /// The record becomes visible only once it is persisted; a failed write
    /// leaves the relay unchanged.
    pub async fn save(&self, from_agent_id: &str, to_agent_id: &str, content: &str) -> Result<()> {
        if from_agent_id.is_empty() || to_agent_id.is_empty() {
            return Err(RelayError::storage("relay keys must be non-empty agent ids"));
        }

        // Writers are serialized so sequences follow commit order and every
        // persisted snapshot includes all earlier commits
        let _write = self.write_lock.lock().await;

        let record = ContentRecord {
            from_agent_id: from_agent_id.to_string(),
            to_agent_id: to_agent_id.to_string(),
            content: content.to_string(),
            inserted_at: Utc::now(),
            sequence: self.next_sequence.load(Ordering::SeqCst),
        };

        let mut snapshot = self.snapshot();
        snapshot.retain(|r| !(r.from_agent_id == from_agent_id && r.to_agent_id == to_agent_id));
        snapshot.push(record.clone());
        self.store.save(&snapshot).await?;

        self.next_sequence.store(record.sequence + 1, Ordering::SeqCst);
        self.records
            .insert((from_agent_id.to_string(), to_agent_id.to_string()), record);

        debug!(from = %from_agent_id, to = %to_agent_id, bytes = content.len(), "content saved");
        Ok(())
    }

    /// Read handed-off content.
    ///
    /// With `multi`, `to_agent_id` is ignored and every record from
    /// `from_agent_id` is returned in insertion order. A missing record is an
    /// empty result.
    pub fn load(&self, from_agent_id: &str, to_agent_id: &str, multi: bool) -> Vec<String> {
        if multi {
            return self
                .records_from(from_agent_id)
                .into_iter()
                .map(|r| r.content)
                .collect();
        }

        self.records
            .get(&(from_agent_id.to_string(), to_agent_id.to_string()))
            .map(|r| vec![r.content.clone()])
            .unwrap_or_default()
    }

    /// Records sent by one agent, oldest first
    pub fn records_from(&self, from_agent_id: &str) -> Vec<ContentRecord> {
        let mut records: Vec<ContentRecord> = self
            .records
            .iter()
            .filter(|r| r.from_agent_id == from_agent_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.sequence);
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn snapshot(&self) -> Vec<ContentRecord> {
        let mut records: Vec<ContentRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.sequence);
        records
    }
}
