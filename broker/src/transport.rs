//! The seam between the pool and a concrete broker protocol client.
//!
//! The pool only needs to open a connection on behalf of an identity, issue
//! subscribe/unsubscribe requests on it, and tear it down. Incoming broker
//! messages flow back through the [`MessageSink`] handed to the connector.

use async_trait::async_trait;
use domain::{Error, Identity, Topic};
use events::{BrokerEvent, EventBus};
use log::*;

/// Receives the publishes arriving on one identity's broker connection and
/// forwards them onto the event bus.
#[derive(Clone)]
pub struct MessageSink {
    identity: Identity,
    bus: EventBus,
}

impl MessageSink {
    pub fn new(identity: Identity, bus: EventBus) -> Self {
        Self { identity, bus }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Forwards one broker message. Fire-and-forget.
    pub fn deliver(&self, topic: &str, payload: Vec<u8>) {
        if !self.identity.owns(topic) {
            warn!(
                "Dropping broker message on {topic}: outside the namespace of {}",
                self.identity
            );
            return;
        }

        trace!("Broker message for {} on {topic}", self.identity);
        self.bus
            .publish(BrokerEvent::new(self.identity.as_str(), topic, payload));
    }
}

/// Opens broker connections.
pub trait BrokerConnector: Send + Sync {
    /// Opens a broker connection on behalf of `identity`, authenticating as
    /// the service principal. Must not block: the link connects (and
    /// reconnects) in the background and buffers requests until it is up.
    fn connect(&self, identity: &Identity, sink: MessageSink) -> Box<dyn BrokerLink>;
}

/// One live broker connection.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Subscribes to `topic`, resolving once the broker acknowledged it.
    async fn subscribe(&self, topic: &Topic) -> Result<(), Error>;

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), Error>;

    /// Disconnects. Broker-side subscriptions die with the connection.
    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::EventHandler;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    struct Collect(mpsc::UnboundedSender<BrokerEvent>);

    #[async_trait]
    impl EventHandler for Collect {
        async fn handle(&self, event: &BrokerEvent) {
            let _ = self.0.send(event.clone());
        }
    }

    #[tokio::test]
    async fn test_deliver_drops_messages_outside_namespace() {
        let bus = EventBus::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _listener = bus.listen(Arc::new(Collect(tx)));
        let sink = MessageSink::new(Identity::parse("u1").unwrap(), bus);

        sink.deliver("u2/temperature", b"19".to_vec());
        sink.deliver("u1/temperature", b"21".to_vec());

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, "u1/temperature");
        assert_eq!(event.payload_text(), "21");
        assert!(rx.try_recv().is_err());
    }
}
