//! Event system infrastructure for the sensor stream bridge.
//!
//! This crate provides the in-process event bus that decouples the broker
//! client pool (producer) from the WebSocket connection registry (consumer).
//!
//! # Architecture
//!
//! - **BrokerEvent**: The single event shape carried by the bus, "a broker
//!   message arrived on behalf of identity U".
//! - **EventHandler**: Trait implemented by the consumer side.
//! - **EventBus**: A typed broadcast channel. Publishing never blocks and
//!   never fails the producer; events published while nobody listens are
//!   dropped.
//!
//! This crate has no dependencies on internal crates, avoiding circular
//! dependencies. Identities are carried as plain strings.

use async_trait::async_trait;
use log::*;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Default number of in-flight events a listener may fall behind before it
/// starts losing the oldest ones.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A message received from the broker on behalf of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerEvent {
    /// The identity whose broker session received the message.
    pub identity: String,
    /// Fully qualified broker topic, `<identity>/<sensor>`.
    pub topic: String,
    /// Raw broker payload, untouched.
    pub payload: Vec<u8>,
}

impl BrokerEvent {
    pub fn new(identity: impl Into<String>, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            identity: identity.into(),
            topic: topic.into(),
            payload,
        }
    }

    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Trait for handling broker events.
/// Implementations perform side effects like fanning the message out to
/// live client connections.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &BrokerEvent);
}

/// In-process publish/subscribe channel for [`BrokerEvent`]s.
///
/// Cloning the bus is cheap; all clones publish into the same channel.
/// Ordering is preserved per producer, so messages of one broker session
/// reach the listener in broker arrival order.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to the attached listeners.
    ///
    /// Returns `false` when the event was dropped because nobody is
    /// listening. This is not an error: delivery is best-effort.
    pub fn publish(&self, event: BrokerEvent) -> bool {
        match self.sender.send(event) {
            Ok(_) => true,
            Err(broadcast::error::SendError(event)) => {
                debug!(
                    "Dropping broker event for identity {} on {}: no listener attached",
                    event.identity, event.topic
                );
                false
            }
        }
    }

    /// Attach a handler and start forwarding events to it on a dedicated task.
    ///
    /// The subscription is taken before this returns, so every event
    /// published afterwards reaches the handler.
    pub fn listen(&self, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        let mut receiver = self.sender.subscribe();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler.handle(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event bus listener lagged, {skipped} broker event(s) dropped");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed, listener stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Number of currently attached listeners.
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, Notify};
    use tokio::time::{timeout, Duration};

    struct Collect(mpsc::UnboundedSender<BrokerEvent>);

    #[async_trait]
    impl EventHandler for Collect {
        async fn handle(&self, event: &BrokerEvent) {
            let _ = self.0.send(event.clone());
        }
    }

    #[tokio::test]
    async fn test_publish_without_listener_is_dropped() {
        let bus = EventBus::new(8);
        assert_eq!(bus.listener_count(), 0);
        assert!(!bus.publish(BrokerEvent::new("u1", "u1/t", b"1".to_vec())));
    }

    #[tokio::test]
    async fn test_listener_receives_events_in_publish_order() {
        let bus = EventBus::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _listener = bus.listen(Arc::new(Collect(tx)));

        for i in 0..5u8 {
            assert!(bus.publish(BrokerEvent::new("u1", "u1/t", vec![i])));
        }

        for i in 0..5u8 {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("event not delivered")
                .expect("channel closed");
            assert_eq!(event.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_events_published_before_listen_are_not_replayed() {
        let bus = EventBus::new(8);
        bus.publish(BrokerEvent::new("u1", "u1/t", b"early".to_vec()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _listener = bus.listen(Arc::new(Collect(tx)));
        bus.publish(BrokerEvent::new("u1", "u1/t", b"late".to_vec()));

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload_text(), "late");
    }

    #[tokio::test]
    async fn test_lagging_listener_keeps_running() {
        struct Slow {
            gate: Arc<Notify>,
            out: mpsc::UnboundedSender<BrokerEvent>,
        }

        #[async_trait]
        impl EventHandler for Slow {
            async fn handle(&self, event: &BrokerEvent) {
                self.gate.notified().await;
                let _ = self.out.send(event.clone());
            }
        }

        let bus = EventBus::new(2);
        let gate = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _listener = bus.listen(Arc::new(Slow {
            gate: gate.clone(),
            out: tx,
        }));

        for i in 0..10u8 {
            bus.publish(BrokerEvent::new("u1", "u1/t", vec![i]));
        }

        // Release the handler for the first event plus whatever survives the lag.
        for _ in 0..4 {
            gate.notify_one();
            tokio::task::yield_now().await;
        }

        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.identity, "u1");
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_payload_text_is_lossy() {
        let event = BrokerEvent::new("u1", "u1/t", vec![0x68, 0x69, 0xff]);
        assert_eq!(event.payload_text(), "hi\u{fffd}");
    }
}
