//! Bus client: validated produce with bounded retry and outbox, plus
//! consumer-group subscriptions.

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{BusMessage, MemoryBroker};
use crate::registry::SchemaRegistry;
use crate::{BusError, Result};

#[derive(Debug, Clone)]
pub struct BusClientConfig {
    pub send_timeout: Duration,
    pub max_send_attempts: u32,
    /// Per-topic outbox bound; overflow drops the oldest entry.
    pub outbox_capacity: usize,
}

impl Default for BusClientConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            max_send_attempts: 3,
            outbox_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct OutboxEntry {
    key: Option<String>,
    payload: Value,
}

/// Topic-scoped producer/subscriber handle. Safe to share across tasks.
pub struct BusClient {
    broker: Arc<MemoryBroker>,
    client_id: String,
    config: BusClientConfig,
    outbox: Mutex<HashMap<String, VecDeque<OutboxEntry>>>,
    dropped: AtomicU64,
}

impl BusClient {
    pub fn new(broker: Arc<MemoryBroker>, client_id: impl Into<String>) -> Self {
        Self::with_config(broker, client_id, BusClientConfig::default())
    }

    pub fn with_config(
        broker: Arc<MemoryBroker>,
        client_id: impl Into<String>,
        config: BusClientConfig,
    ) -> Self {
        Self {
            broker,
            client_id: client_id.into(),
            config,
            outbox: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Publish with schema validation.
    pub async fn produce<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        key: Option<&str>,
    ) -> Result<()> {
        self.produce_with(topic, payload, key, true).await
    }

    /// Publish, optionally bypassing validation.
    ///
    /// An `InvalidPayload` is returned to the caller and nothing is sent.
    /// A `BusUnavailable` after the bounded retries queues the record in
    /// the per-topic outbox instead of failing the call.
    pub async fn produce_with<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        key: Option<&str>,
        validate: bool,
    ) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        let canonical = if validate {
            SchemaRegistry::global().validate(topic, &value)?
        } else {
            value
        };

        // Anything already queued for this topic must go out first so the
        // per-producer ordering contract holds.
        if self.has_pending(topic) {
            self.flush_topic(topic).await;
            if self.has_pending(topic) {
                self.enqueue_outbox(topic, key.map(str::to_string), canonical);
                return Ok(());
            }
        }

        match self
            .send_with_retry(topic, key.map(str::to_string), canonical.clone())
            .await
        {
            Ok(offset) => {
                debug!(
                    client = %self.client_id,
                    topic = %topic,
                    offset = offset,
                    "Message produced"
                );
                Ok(())
            }
            // Unreachable broker or an exhausted send window both queue
            // the record for a later retry.
            Err(e @ (BusError::Unavailable(_) | BusError::SendTimeout(_))) => {
                warn!(
                    client = %self.client_id,
                    topic = %topic,
                    reason = %e,
                    "Send failed, queueing message to outbox"
                );
                self.enqueue_outbox(topic, key.map(str::to_string), canonical);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send_with_retry(
        &self,
        topic: &str,
        key: Option<String>,
        payload: Value,
    ) -> Result<u64> {
        let deadline = Instant::now() + self.config.send_timeout;
        let mut last_err = BusError::Unavailable("no attempt made".to_string());

        for attempt in 0..self.config.max_send_attempts {
            if attempt > 0 {
                let backoff = backoff_with_jitter(attempt);
                if Instant::now() + backoff > deadline {
                    return Err(BusError::SendTimeout(self.config.send_timeout));
                }
                tokio::time::sleep(backoff).await;
            }

            match self.broker.append(topic, key.clone(), payload.clone(), Utc::now()) {
                Ok(offset) => return Ok(offset),
                Err(e) => {
                    debug!(
                        topic = %topic,
                        attempt = attempt + 1,
                        error = %e,
                        "Produce attempt failed"
                    );
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    fn has_pending(&self, topic: &str) -> bool {
        self.outbox
            .lock()
            .get(topic)
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    fn enqueue_outbox(&self, topic: &str, key: Option<String>, payload: Value) {
        let mut outbox = self.outbox.lock();
        let queue = outbox.entry(topic.to_string()).or_default();
        if queue.len() >= self.config.outbox_capacity {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::counter!("edt_bus_outbox_dropped_total").increment(1);
            warn!(
                client = %self.client_id,
                topic = %topic,
                dropped_total = dropped,
                "Outbox full, dropped oldest message"
            );
        }
        queue.push_back(OutboxEntry { key, payload });
    }

    /// Retry queued records for one topic, oldest first, stopping at the
    /// first failure to keep ordering intact.
    async fn flush_topic(&self, topic: &str) {
        loop {
            let entry = {
                let mut outbox = self.outbox.lock();
                match outbox.get_mut(topic) {
                    Some(queue) => queue.pop_front(),
                    None => None,
                }
            };
            let Some(entry) = entry else { break };

            match self.broker.append(topic, entry.key.clone(), entry.payload.clone(), Utc::now()) {
                Ok(_) => continue,
                Err(_) => {
                    // Put it back at the head and give up for now.
                    self.outbox
                        .lock()
                        .entry(topic.to_string())
                        .or_default()
                        .push_front(entry);
                    break;
                }
            }
        }
    }

    /// Retry every queued record. Returns how many are still pending.
    pub async fn flush(&self) -> usize {
        let topics: Vec<String> = self.outbox.lock().keys().cloned().collect();
        for topic in &topics {
            self.flush_topic(topic).await;
        }
        self.pending_outbox()
    }

    pub fn pending_outbox(&self) -> usize {
        self.outbox.lock().values().map(|q| q.len()).sum()
    }

    /// Messages dropped from the outbox since this client was created.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Subscribe a consumer group to a set of topics.
    pub fn subscribe(&self, topic_names: &[&str], group_id: &str) -> Subscription {
        debug!(
            client = %self.client_id,
            group = %group_id,
            topics = ?topic_names,
            "Subscribed"
        );
        Subscription {
            broker: Arc::clone(&self.broker),
            group: group_id.to_string(),
            topics: topic_names.iter().map(|t| t.to_string()).collect(),
            round_robin: 0,
        }
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 100u64.saturating_mul(1 << attempt.min(6));
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter_ms)
}

/// A consumer-group cursor over one or more topics. Ordering is preserved
/// per topic; topics are interleaved round-robin.
pub struct Subscription {
    broker: Arc<MemoryBroker>,
    group: String,
    topics: Vec<String>,
    round_robin: usize,
}

impl Subscription {
    /// Next message, waiting up to `timeout` for one to arrive.
    pub async fn poll(&mut self, timeout: Duration) -> Option<BusMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before checking, to avoid a lost-wakeup
            // race between fetch and notify.
            let broker = Arc::clone(&self.broker);
            let notified = broker.notified();

            if let Some(msg) = self.try_next() {
                return Some(msg);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
            if Instant::now() >= deadline {
                // One last look; an append may have landed at the deadline.
                return self.try_next();
            }
        }
    }

    /// Non-blocking fetch of the next available message.
    pub fn try_next(&mut self) -> Option<BusMessage> {
        let n = self.topics.len();
        for i in 0..n {
            let idx = (self.round_robin + i) % n;
            let batch = self.broker.fetch(&self.group, &self.topics[idx], 1);
            if let Some(msg) = batch.into_iter().next() {
                self.round_robin = (idx + 1) % n;
                return Some(msg);
            }
        }
        None
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edt_common::schemas::SimulationControl;
    use edt_common::topics;
    use serde_json::json;

    #[tokio::test]
    async fn produce_validates_against_registry() {
        let broker = MemoryBroker::new();
        let client = BusClient::new(Arc::clone(&broker), "test");

        client
            .produce(topics::SIMULATION_CONTROL, &SimulationControl::set_speed(2.0), None)
            .await
            .unwrap();

        let err = client
            .produce(topics::SIMULATION_CONTROL, &json!({"nope": true}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidPayload { .. }));
        assert_eq!(broker.topic_len(topics::SIMULATION_CONTROL), 1);
    }

    #[tokio::test]
    async fn subscription_sees_messages_in_order() {
        let broker = MemoryBroker::new();
        let client = BusClient::new(Arc::clone(&broker), "test");
        let mut sub = client.subscribe(&["free-form"], "g1");

        for i in 0..3 {
            client
                .produce_with("free-form", &json!({ "seq": i }), None, false)
                .await
                .unwrap();
        }

        for i in 0..3 {
            let msg = sub.poll(Duration::from_millis(100)).await.unwrap();
            assert_eq!(msg.payload["seq"], i);
            assert_eq!(msg.offset, i as u64);
        }
        assert!(sub.poll(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn unavailable_broker_routes_to_outbox_and_flushes() {
        let broker = MemoryBroker::new();
        let config = BusClientConfig {
            send_timeout: Duration::from_millis(200),
            max_send_attempts: 1,
            outbox_capacity: 10,
        };
        let client = BusClient::with_config(Arc::clone(&broker), "test", config);

        broker.pause();
        client
            .produce_with("t", &json!({"a": 1}), None, false)
            .await
            .unwrap();
        assert_eq!(client.pending_outbox(), 1);
        assert_eq!(broker.topic_len("t"), 0);

        broker.resume();
        let remaining = client.flush().await;
        assert_eq!(remaining, 0);
        assert_eq!(broker.topic_len("t"), 1);
    }

    #[tokio::test]
    async fn outbox_overflow_drops_oldest() {
        let broker = MemoryBroker::new();
        let config = BusClientConfig {
            send_timeout: Duration::from_millis(200),
            max_send_attempts: 1,
            outbox_capacity: 2,
        };
        let client = BusClient::with_config(Arc::clone(&broker), "test", config);

        broker.pause();
        for i in 0..4 {
            client
                .produce_with("t", &json!({ "seq": i }), None, false)
                .await
                .unwrap();
        }
        assert_eq!(client.pending_outbox(), 2);
        assert_eq!(client.dropped_messages(), 2);

        broker.resume();
        client.flush().await;

        // The two oldest were dropped; 2 and 3 survive in order.
        let mut sub = client.subscribe(&["t"], "g");
        assert_eq!(sub.try_next().unwrap().payload["seq"], 2);
        assert_eq!(sub.try_next().unwrap().payload["seq"], 3);
    }

    #[tokio::test]
    async fn ordering_holds_across_an_outage() {
        let broker = MemoryBroker::new();
        let config = BusClientConfig {
            send_timeout: Duration::from_millis(200),
            max_send_attempts: 1,
            outbox_capacity: 10,
        };
        let client = BusClient::with_config(Arc::clone(&broker), "test", config);

        client.produce_with("t", &json!({"seq": 0}), None, false).await.unwrap();
        broker.pause();
        client.produce_with("t", &json!({"seq": 1}), None, false).await.unwrap();
        broker.resume();
        // The next produce must flush the outbox before sending seq 2.
        client.produce_with("t", &json!({"seq": 2}), None, false).await.unwrap();

        let mut sub = client.subscribe(&["t"], "g");
        for i in 0..3 {
            assert_eq!(sub.try_next().unwrap().payload["seq"], i);
        }
    }
}
