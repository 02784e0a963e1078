use crate::connection::ConnectionRegistry;
use crate::message::{Delivery, Outbound};
use async_trait::async_trait;
use domain::Identity;
use events::{BrokerEvent, EventHandler};
use log::*;
use std::sync::Arc;

/// Handles broker events by forwarding them to every connection of the
/// identity that owns the broker session.
///
/// The pool decides which identity an event belongs to; this handler only
/// routes. A delivery is serialized once and handed to each connection.
pub struct BrokerEventHandler {
    registry: Arc<ConnectionRegistry>,
}

impl BrokerEventHandler {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for BrokerEventHandler {
    async fn handle(&self, event: &BrokerEvent) {
        let identity = match Identity::parse(event.identity.as_str()) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Dropping broker event with bad identity: {e}");
                return;
            }
        };

        let delivery = Delivery {
            topic: event.topic.clone(),
            message: event.payload_text(),
        };
        let message = match Outbound::json(&delivery) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to serialize delivery for {}: {e}", event.topic);
                return;
            }
        };

        let sent = self.registry.send_to_identity(&identity, &message);
        debug!(
            "Forwarded {} to {sent} connection(s) of {identity}",
            event.topic
        );
    }
}
