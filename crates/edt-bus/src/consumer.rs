//! Consumer loop helper.
//!
//! Handlers are synchronous and short; long work belongs in the owning
//! component's own task. On shutdown the loop drains whatever is already
//! in the log for up to 5 seconds, then exits.

use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::BusMessage;
use crate::client::Subscription;

const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// Decode a message payload into its typed schema. Returns `None` and
/// logs on mismatch so callers can skip the message and move on.
pub fn decode_payload<T: DeserializeOwned>(msg: &BusMessage) -> Option<T> {
    match serde_json::from_value(msg.payload.clone()) {
        Ok(typed) => Some(typed),
        Err(e) => {
            warn!(
                topic = %msg.topic,
                offset = msg.offset,
                error = %e,
                "Skipping undecodable message"
            );
            metrics::counter!("edt_bus_decode_skipped_total").increment(1);
            None
        }
    }
}

/// Spawn a consumer loop that dispatches each message to `handler` exactly
/// once per delivery, honouring the process-wide stop signal.
pub fn spawn_consumer_loop<F>(
    mut subscription: Subscription,
    mut shutdown: broadcast::Receiver<()>,
    name: &str,
    mut handler: F,
) -> JoinHandle<()>
where
    F: FnMut(BusMessage) + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        info!(consumer = %name, group = %subscription.group(), "Consumer loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    drain(&mut subscription, &name, &mut handler).await;
                    break;
                }
                msg = subscription.poll(POLL_TIMEOUT) => {
                    if let Some(msg) = msg {
                        handler(msg);
                    }
                }
            }
        }
        info!(consumer = %name, "Consumer loop exited");
    })
}

async fn drain<F>(subscription: &mut Subscription, name: &str, handler: &mut F)
where
    F: FnMut(BusMessage),
{
    let deadline = Instant::now() + DRAIN_BUDGET;
    let mut drained = 0usize;
    while Instant::now() < deadline {
        match subscription.try_next() {
            Some(msg) => {
                handler(msg);
                drained += 1;
            }
            None => break,
        }
    }
    debug!(consumer = %name, drained = drained, "Drained before exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::client::BusClient;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn handler_sees_each_message_once() {
        let broker = MemoryBroker::new();
        let client = BusClient::new(Arc::clone(&broker), "test");
        let (shutdown_tx, _) = broadcast::channel(1);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let sub = client.subscribe(&["t"], "g");
        let handle = spawn_consumer_loop(sub, shutdown_tx.subscribe(), "test", move |_msg| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..5 {
            client
                .produce_with("t", &json!({ "seq": i }), None, false)
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_messages() {
        let broker = MemoryBroker::new();
        let client = BusClient::new(Arc::clone(&broker), "test");
        let (shutdown_tx, _) = broadcast::channel(1);

        // Publish before the consumer ever polls.
        for i in 0..3 {
            client
                .produce_with("t", &json!({ "seq": i }), None, false)
                .await
                .unwrap();
        }

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let sub = client.subscribe(&["t"], "g");
        let handle = spawn_consumer_loop(sub, shutdown_tx.subscribe(), "test", move |_msg| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn decode_skips_malformed_payloads() {
        let msg = BusMessage {
            topic: "t".into(),
            key: None,
            payload: json!({"not": "a control"}),
            partition: 0,
            offset: 0,
            producer_timestamp: chrono::Utc::now(),
        };
        let decoded: Option<edt_common::schemas::SimulationControl> = decode_payload(&msg);
        assert!(decoded.is_none());
    }
}
