//! In-process topic-log broker.
//!
//! Each topic is an append-only record log. Consumer groups keep a cursor
//! per (group, topic); a cursor advances when records are handed out, so
//! each group sees each record once per subscription lifetime and ordering
//! is preserved per topic. Single partition per topic (partition 0); the
//! configured partition count is retained as metadata.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{BusError, Result};

/// A record delivered to a consumer.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Value,
    pub partition: u32,
    pub offset: u64,
    pub producer_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Record {
    key: Option<String>,
    payload: Value,
    timestamp: DateTime<Utc>,
}

struct TopicLog {
    partitions: u32,
    records: RwLock<Vec<Record>>,
}

/// Shared in-process broker. Clone the `Arc` freely; producer writes and
/// consumer iteration are safe from different tasks.
pub struct MemoryBroker {
    topics: DashMap<String, Arc<TopicLog>>,
    /// (group, topic) → next offset to hand out.
    cursors: DashMap<(String, String), u64>,
    /// Wakes pollers whenever any topic is appended to.
    appended: Notify,
    accepting: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            cursors: DashMap::new(),
            appended: Notify::new(),
            accepting: AtomicBool::new(true),
        })
    }

    /// Create any missing topics with the given partition count.
    /// Idempotent; never deletes or resizes existing topics.
    pub fn ensure_topics(&self, names: &[&str], partitions: u32) {
        for name in names {
            let created = !self.topics.contains_key(*name);
            self.topics
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(TopicLog {
                        partitions: partitions.max(1),
                        records: RwLock::new(Vec::new()),
                    })
                });
            if created {
                debug!(topic = %name, partitions = partitions.max(1), "Topic created");
            }
        }
        info!(count = names.len(), "Topics ensured");
    }

    /// Append a record, returning its offset. Topics are auto-created with
    /// a single partition when a producer reaches them first.
    pub fn append(
        &self,
        topic: &str,
        key: Option<String>,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<u64> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("broker is paused".to_string()));
        }

        let log = {
            let entry = self.topics.entry(topic.to_string()).or_insert_with(|| {
                debug!(topic = %topic, "Auto-creating topic on first produce");
                Arc::new(TopicLog {
                    partitions: 1,
                    records: RwLock::new(Vec::new()),
                })
            });
            Arc::clone(entry.value())
        };

        let offset = {
            let mut records = log.records.write();
            records.push(Record {
                key,
                payload,
                timestamp,
            });
            (records.len() - 1) as u64
        };

        self.appended.notify_waiters();
        Ok(offset)
    }

    /// Next batch for a consumer group on one topic. Advances the group
    /// cursor past everything returned.
    pub fn fetch(&self, group: &str, topic: &str, max: usize) -> Vec<BusMessage> {
        let Some(log) = self.topics.get(topic).map(|e| Arc::clone(e.value())) else {
            return Vec::new();
        };

        let cursor_key = (group.to_string(), topic.to_string());
        let mut cursor = self.cursors.entry(cursor_key).or_insert(0);

        let records = log.records.read();
        let start = *cursor as usize;
        if start >= records.len() {
            return Vec::new();
        }

        let end = records.len().min(start + max);
        let batch: Vec<BusMessage> = records[start..end]
            .iter()
            .enumerate()
            .map(|(i, record)| BusMessage {
                topic: topic.to_string(),
                key: record.key.clone(),
                payload: record.payload.clone(),
                partition: 0,
                offset: (start + i) as u64,
                producer_timestamp: record.timestamp,
            })
            .collect();

        *cursor = end as u64;
        batch
    }

    /// Registered future that resolves when any topic is appended to.
    /// Create it before checking for data to avoid lost wakeups.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.appended.notified()
    }

    /// Number of records in a topic log (all groups).
    pub fn topic_len(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|log| log.records.read().len())
            .unwrap_or(0)
    }

    pub fn partitions(&self, topic: &str) -> Option<u32> {
        self.topics.get(topic).map(|log| log.partitions)
    }

    /// Simulate broker unavailability; producers see `BusUnavailable`.
    pub fn pause(&self) {
        warn!("Broker paused - producers will queue to their outbox");
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        info!("Broker resumed");
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_and_fetch_preserve_order() {
        let broker = MemoryBroker::new();
        broker.ensure_topics(&["t"], 1);

        for i in 0..5 {
            broker
                .append("t", None, json!({ "i": i }), Utc::now())
                .unwrap();
        }

        let batch = broker.fetch("g", "t", 10);
        assert_eq!(batch.len(), 5);
        for (i, msg) in batch.iter().enumerate() {
            assert_eq!(msg.offset, i as u64);
            assert_eq!(msg.payload["i"], i);
        }

        // Cursor advanced; nothing left for this group.
        assert!(broker.fetch("g", "t", 10).is_empty());
        // A different group starts from the beginning.
        assert_eq!(broker.fetch("g2", "t", 10).len(), 5);
    }

    #[test]
    fn ensure_topics_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.ensure_topics(&["a", "b"], 2);
        broker.append("a", None, json!(1), Utc::now()).unwrap();
        broker.ensure_topics(&["a", "b"], 4);

        // Existing topic untouched.
        assert_eq!(broker.partitions("a"), Some(2));
        assert_eq!(broker.topic_len("a"), 1);
    }

    #[test]
    fn paused_broker_rejects_appends() {
        let broker = MemoryBroker::new();
        broker.pause();
        let err = broker.append("t", None, json!(1), Utc::now()).unwrap_err();
        assert!(matches!(err, BusError::Unavailable(_)));

        broker.resume();
        broker.append("t", None, json!(1), Utc::now()).unwrap();
    }
}
