//! Fan-out of incoming messages to concurrent relay tasks.
//!
//! Each message runs parse → relay in its own task under its own root span,
//! so one message's failure (or panic) never affects another. The number of
//! relays in flight is bounded; a message arriving at the bound is dropped
//! and logged instead of queueing behind the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::errors::PipelineError;
use crate::payload;
use crate::relay::Relay;

/// Hands each message to an isolated relay task.
pub struct MessageDispatcher {
    relay: Arc<dyn Relay>,
    limiter: Arc<Semaphore>,
    max_in_flight: usize,
    tasks: TaskTracker,
    dropped: AtomicU64,
}

impl MessageDispatcher {
    /// Create a dispatcher allowing at most `max_in_flight` concurrent relays.
    pub fn new(relay: Arc<dyn Relay>, max_in_flight: usize) -> Self {
        debug!(max_in_flight = max_in_flight, "Creating message dispatcher");
        Self {
            relay,
            limiter: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            tasks: TaskTracker::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Accept one message without waiting for its relay.
    ///
    /// Returns `false` when the message was dropped because the dispatcher
    /// is at capacity or shutting down. Must be called within a tokio runtime.
    pub fn on_message(&self, topic: &str, payload: Bytes) -> bool {
        if self.tasks.is_closed() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %topic, "Dispatcher is shutting down, dropping message");
            return false;
        }

        let permit = match Arc::clone(&self.limiter).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = %topic,
                    max_in_flight = self.max_in_flight,
                    "Relay capacity exhausted, dropping message"
                );
                return false;
            }
        };

        let span = info_span!(
            parent: Span::none(),
            "relay_message",
            topic = %topic,
            payload_size = payload.len(),
            sensor = tracing::field::Empty,
        );

        let relay = Arc::clone(&self.relay);
        self.tasks.spawn(
            async move {
                let _permit = permit;
                match process_message(relay.as_ref(), &payload).await {
                    Ok(response) => info!(response = %response, "Relayed reading to gateway"),
                    Err(PipelineError::Payload(e)) => warn!(error = %e, "Dropping malformed payload"),
                    Err(PipelineError::Relay(e)) => error!(error = %e, "Failed to relay reading"),
                }
            }
            .instrument(span),
        );
        true
    }

    /// Relays currently running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Messages dropped for capacity or shutdown since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting messages and wait up to `grace` for running relays.
    ///
    /// Returns the number of relays still running when the grace period
    /// ended; those are abandoned.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.tasks.close();
        info!(in_flight = self.tasks.len(), "Waiting for in-flight relays");

        match tokio::time::timeout(grace, self.tasks.wait()).await {
            Ok(()) => {
                debug!("All in-flight relays finished");
                0
            }
            Err(_) => {
                let abandoned = self.tasks.len();
                warn!(
                    abandoned = abandoned,
                    grace_secs = grace.as_secs_f64(),
                    "Abandoning in-flight relays after grace period"
                );
                abandoned
            }
        }
    }
}

/// Parse one payload and relay the resulting reading.
pub async fn process_message(relay: &dyn Relay, payload: &[u8]) -> Result<String, PipelineError> {
    let reading = payload::parse(payload)?;
    Span::current().record("sensor", reading.sensor_name());
    debug!(value = reading.value(), "Parsed reading");

    Ok(relay.relay(&reading).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{CredentialError, RelayError};
    use crate::payload::Reading;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    /// Records relayed readings; fails, panics or blocks on magic sensor names.
    #[derive(Default)]
    struct MockRelay {
        relayed: Mutex<Vec<(String, f64)>>,
        release: Notify,
    }

    #[async_trait]
    impl Relay for MockRelay {
        async fn relay(&self, reading: &Reading) -> Result<String, RelayError> {
            match reading.sensor_name() {
                "fail" => {
                    return Err(RelayError::Credential(CredentialError::InvalidResponse(
                        "no token".to_string(),
                    )))
                }
                "panic" => panic!("relay exploded"),
                "block" => self.release.notified().await,
                _ => {}
            }
            self.relayed
                .lock()
                .push((reading.sensor_name().to_string(), reading.value()));
            Ok("{\"status\":\"ok\"}".to_string())
        }
    }

    fn message(sensor: &str, value: &str) -> Bytes {
        Bytes::from(format!("\"sensor\":\"{}\", \"value\": {}}}", sensor, value))
    }

    #[tokio::test]
    async fn test_process_message_relays_parsed_reading() {
        let relay = MockRelay::default();
        let response = process_message(&relay, &message("T1", "23,5")).await.unwrap();

        assert_eq!(response, "{\"status\":\"ok\"}");
        assert_eq!(relay.relayed.lock().as_slice(), &[("T1".to_string(), 23.5)]);
    }

    #[tokio::test]
    async fn test_process_message_rejects_malformed_payload() {
        let relay = MockRelay::default();
        let err = process_message(&relay, &message("T2", "abc")).await.unwrap_err();

        assert!(matches!(err, PipelineError::Payload(_)));
        assert!(relay.relayed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let relay = Arc::new(MockRelay::default());
        let dispatcher = MessageDispatcher::new(relay.clone(), 16);

        assert!(dispatcher.on_message("sensors", message("A", "1")));
        assert!(dispatcher.on_message("sensors", message("fail", "2")));
        assert!(dispatcher.on_message("sensors", message("panic", "3")));
        assert!(dispatcher.on_message("sensors", message("B", "nope")));
        assert!(dispatcher.on_message("sensors", message("C", "4.25")));

        assert_eq!(dispatcher.shutdown(Duration::from_secs(5)).await, 0);

        let mut relayed = relay.relayed.lock().clone();
        relayed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(relayed, vec![("A".to_string(), 1.0), ("C".to_string(), 4.25)]);
    }

    #[tokio::test]
    async fn test_capacity_bound_drops_excess_messages() {
        let relay = Arc::new(MockRelay::default());
        let dispatcher = MessageDispatcher::new(relay.clone(), 2);

        assert!(dispatcher.on_message("sensors", message("block", "1")));
        assert!(dispatcher.on_message("sensors", message("block", "2")));
        assert!(!dispatcher.on_message("sensors", message("C", "3")));
        assert_eq!(dispatcher.dropped(), 1);
        assert_eq!(dispatcher.in_flight(), 2);

        relay.release.notify_waiters();
        tokio::task::yield_now().await;
        // notify_waiters only wakes tasks already waiting
        while dispatcher.in_flight() > 0 {
            relay.release.notify_waiters();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(dispatcher.on_message("sensors", message("C", "3")));
        assert_eq!(dispatcher.shutdown(Duration::from_secs(5)).await, 0);
        assert_eq!(relay.relayed.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_stuck_relays_and_rejects_new_messages() {
        let relay = Arc::new(MockRelay::default());
        let dispatcher = MessageDispatcher::new(relay.clone(), 4);

        assert!(dispatcher.on_message("sensors", message("block", "1")));
        let abandoned = dispatcher.shutdown(Duration::from_millis(50)).await;
        assert_eq!(abandoned, 1);

        assert!(!dispatcher.on_message("sensors", message("A", "1")));
        assert_eq!(dispatcher.dropped(), 1);
    }
}
