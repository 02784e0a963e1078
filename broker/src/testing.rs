//! In-memory broker used by tests in this and dependent crates.
//!
//! Enabled with the `test-util` feature.

use crate::transport::{BrokerConnector, BrokerLink, MessageSink};
use async_trait::async_trait;
use domain::error::{broker_error, BrokerErrorKind};
use domain::{Error, Identity, Topic};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    connects: HashMap<Identity, usize>,
    disconnects: HashMap<Identity, usize>,
    subscribes: HashMap<Topic, usize>,
    unsubscribes: HashMap<Topic, usize>,
    rejected: HashSet<Topic>,
    /// Live links: their sink and broker-side subscriptions.
    live: HashMap<u64, (MessageSink, HashSet<Topic>)>,
    next_link: u64,
}

/// A broker that lives in memory and records every request it sees.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every future subscribe to `topic` fail as if the broker refused it.
    pub fn reject_subscriptions_to(&self, topic: &Topic) {
        self.state().rejected.insert(topic.clone());
    }

    /// Publishes `payload` on `topic` to every live link subscribed to it.
    ///
    /// Returns whether at least one link received it.
    pub fn publish(&self, topic: &Topic, payload: &[u8]) -> bool {
        let sinks: Vec<MessageSink> = self
            .state()
            .live
            .values()
            .filter(|(_, topics)| topics.contains(topic))
            .map(|(sink, _)| sink.clone())
            .collect();

        for sink in &sinks {
            sink.deliver(topic.as_str(), payload.to_vec());
        }
        !sinks.is_empty()
    }

    pub fn connect_count(&self, identity: &Identity) -> usize {
        self.state().connects.get(identity).copied().unwrap_or(0)
    }

    pub fn disconnect_count(&self, identity: &Identity) -> usize {
        self.state().disconnects.get(identity).copied().unwrap_or(0)
    }

    pub fn subscribe_count(&self, topic: &Topic) -> usize {
        self.state().subscribes.get(topic).copied().unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, topic: &Topic) -> usize {
        self.state().unsubscribes.get(topic).copied().unwrap_or(0)
    }

    /// Number of links currently connected.
    pub fn live_links(&self) -> usize {
        self.state().live.len()
    }
}

impl BrokerConnector for FakeBroker {
    fn connect(&self, identity: &Identity, sink: MessageSink) -> Box<dyn BrokerLink> {
        let mut state = self.state();
        *state.connects.entry(identity.clone()).or_default() += 1;
        let id = state.next_link;
        state.next_link += 1;
        state.live.insert(id, (sink, HashSet::new()));

        Box::new(FakeLink {
            id,
            identity: identity.clone(),
            broker: self.clone(),
        })
    }
}

struct FakeLink {
    id: u64,
    identity: Identity,
    broker: FakeBroker,
}

#[async_trait]
impl BrokerLink for FakeLink {
    async fn subscribe(&self, topic: &Topic) -> Result<(), Error> {
        let mut state = self.broker.state();
        if state.rejected.contains(topic) {
            return Err(broker_error(
                BrokerErrorKind::SubscribeRejected,
                "subscription refused by broker",
            ));
        }
        let State { live, subscribes, .. } = &mut *state;
        let (_, topics) = live.get_mut(&self.id).ok_or_else(|| {
            broker_error(BrokerErrorKind::SessionClosed, "link already disconnected")
        })?;
        topics.insert(topic.clone());
        *subscribes.entry(topic.clone()).or_default() += 1;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), Error> {
        let mut state = self.broker.state();
        let State {
            live, unsubscribes, ..
        } = &mut *state;
        if let Some((_, topics)) = live.get_mut(&self.id) {
            topics.remove(topic);
        }
        *unsubscribes.entry(topic.clone()).or_default() += 1;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.broker.state();
        if state.live.remove(&self.id).is_some() {
            *state.disconnects.entry(self.identity.clone()).or_default() += 1;
        }
    }
}
