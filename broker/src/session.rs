use crate::transport::BrokerLink;
use domain::{Error, Identity, Topic};
use log::*;
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::Mutex;

/// Result of a subscribe request against a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The broker acknowledged a new subscription.
    Subscribed,
    /// The topic was already subscribed on this session; nothing was sent.
    AlreadySubscribed,
}

/// The single broker connection owned on behalf of one identity.
pub struct BrokerSession {
    identity: Identity,
    link: Box<dyn BrokerLink>,
    /// Held across the broker round trip so subscribes for one identity are
    /// serialized and a topic is never subscribed twice.
    topics: Mutex<HashSet<Topic>>,
    created_at: Instant,
}

impl BrokerSession {
    pub(crate) fn new(identity: Identity, link: Box<dyn BrokerLink>) -> Self {
        Self {
            identity,
            link,
            topics: Mutex::new(HashSet::new()),
            created_at: Instant::now(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) async fn subscribe(&self, topic: &Topic) -> Result<SubscribeOutcome, Error> {
        let mut topics = self.topics.lock().await;
        if topics.contains(topic) {
            debug!("{} already subscribed to {topic}", self.identity);
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        self.link.subscribe(topic).await?;
        topics.insert(topic.clone());
        info!("{} subscribed to {topic}", self.identity);
        Ok(SubscribeOutcome::Subscribed)
    }

    /// Returns `false` when the topic was not subscribed.
    pub(crate) async fn unsubscribe(&self, topic: &Topic) -> Result<bool, Error> {
        let mut topics = self.topics.lock().await;
        if !topics.contains(topic) {
            return Ok(false);
        }

        self.link.unsubscribe(topic).await?;
        topics.remove(topic);
        info!("{} unsubscribed from {topic}", self.identity);
        Ok(true)
    }

    pub(crate) async fn close(&self) {
        self.link.disconnect().await;
        info!(
            "Broker session for {} closed after {:?}",
            self.identity,
            self.created_at.elapsed()
        );
    }

    /// Snapshot of the subscribed topics.
    pub async fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.topics.lock().await.iter().cloned().collect();
        topics.sort();
        topics
    }
}
