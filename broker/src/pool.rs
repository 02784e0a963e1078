use crate::session::{BrokerSession, SubscribeOutcome};
use crate::transport::{BrokerConnector, MessageSink};
use dashmap::DashMap;
use domain::{Error, Identity, Topic};
use events::EventBus;
use log::*;
use std::sync::Arc;

/// Owns one lazily-created broker session per identity.
///
/// Sessions are created by the first subscribe for an identity and live until
/// the connection registry releases the identity (its last client connection
/// closed). Creation happens under the map entry lock, so there is never more
/// than one session per identity.
pub struct BrokerClientPool {
    sessions: DashMap<Identity, Arc<BrokerSession>>,
    connector: Arc<dyn BrokerConnector>,
    bus: EventBus,
}

impl BrokerClientPool {
    pub fn new(connector: Arc<dyn BrokerConnector>, bus: EventBus) -> Self {
        Self {
            sessions: DashMap::new(),
            connector,
            bus,
        }
    }

    /// Returns the identity's session, opening one if needed.
    fn session_for(&self, identity: &Identity) -> Arc<BrokerSession> {
        self.sessions
            .entry(identity.clone())
            .or_insert_with(|| {
                info!("Opening broker session for {identity}");
                let sink = MessageSink::new(identity.clone(), self.bus.clone());
                let link = self.connector.connect(identity, sink);
                Arc::new(BrokerSession::new(identity.clone(), link))
            })
            .clone()
    }

    /// Subscribes `identity`'s session to `topic`.
    ///
    /// A failed subscribe leaves the session in place.
    pub async fn subscribe(
        &self,
        identity: &Identity,
        topic: &Topic,
    ) -> Result<SubscribeOutcome, Error> {
        let session = self.session_for(identity);
        session.subscribe(topic).await.inspect_err(|e| {
            warn!("Failed to subscribe {identity} to {topic}: {e}");
        })
    }

    /// Unsubscribes `identity`'s session from `topic`.
    ///
    /// Returns `false` when there was nothing to unsubscribe.
    pub async fn unsubscribe(&self, identity: &Identity, topic: &Topic) -> Result<bool, Error> {
        let session = match self.sessions.get(identity) {
            Some(session) => session.clone(),
            None => return Ok(false),
        };
        session.unsubscribe(topic).await
    }

    /// Removes the identity's session from the pool without closing it.
    ///
    /// Synchronous so the caller can do it while holding its own lock; the
    /// caller must then `close` the returned session.
    pub fn detach(&self, identity: &Identity) -> Option<Arc<BrokerSession>> {
        self.sessions.remove(identity).map(|(_, session)| session)
    }

    /// Closes a session previously returned by [`Self::detach`].
    pub async fn close(&self, session: Arc<BrokerSession>) {
        session.close().await;
    }

    /// Tears down the identity's session. Idempotent.
    ///
    /// Returns whether a session existed.
    pub async fn release_identity(&self, identity: &Identity) -> bool {
        match self.detach(identity) {
            Some(session) => {
                session.close().await;
                true
            }
            None => {
                debug!("No broker session to release for {identity}");
                false
            }
        }
    }

    pub fn has_session(&self, identity: &Identity) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Topics currently subscribed for `identity`, if it has a session.
    pub async fn topics(&self, identity: &Identity) -> Option<Vec<Topic>> {
        let session = self.sessions.get(identity)?.clone();
        Some(session.topics().await)
    }

    /// Closes every session. Used on process shutdown.
    pub async fn shutdown(&self) {
        let identities: Vec<Identity> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for identity in identities {
            self.release_identity(&identity).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBroker;
    use domain::error::{BrokerErrorKind, ErrorKind};
    use events::{BrokerEvent, EventHandler};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    fn identity(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    fn topic(owner: &str, sensor: &str) -> Topic {
        Topic::for_sensor(&identity(owner), sensor).unwrap()
    }

    fn pool(broker: &FakeBroker) -> BrokerClientPool {
        BrokerClientPool::new(Arc::new(broker.clone()), EventBus::new(16))
    }

    #[tokio::test]
    async fn test_first_subscribe_opens_exactly_one_session() {
        let broker = FakeBroker::new();
        let pool = pool(&broker);
        let u1 = identity("u1");

        assert!(!pool.has_session(&u1));
        let outcome = pool.subscribe(&u1, &topic("u1", "temperature")).await.unwrap();
        assert_eq!(outcome, SubscribeOutcome::Subscribed);
        pool.subscribe(&u1, &topic("u1", "humidity")).await.unwrap();

        assert!(pool.has_session(&u1));
        assert_eq!(pool.session_count(), 1);
        assert_eq!(broker.connect_count(&u1), 1);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_hits_broker_once() {
        let broker = FakeBroker::new();
        let pool = pool(&broker);
        let u1 = identity("u1");
        let t = topic("u1", "temperature");

        assert_eq!(
            pool.subscribe(&u1, &t).await.unwrap(),
            SubscribeOutcome::Subscribed
        );
        assert_eq!(
            pool.subscribe(&u1, &t).await.unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );
        assert_eq!(broker.subscribe_count(&t), 1);
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_share_one_session() {
        let broker = FakeBroker::new();
        let pool = Arc::new(pool(&broker));
        let u1 = identity("u1");
        let t = topic("u1", "temperature");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let (u1, t) = (u1.clone(), t.clone());
            handles.push(tokio::spawn(async move { pool.subscribe(&u1, &t).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(pool.session_count(), 1);
        assert_eq!(broker.connect_count(&u1), 1);
        assert_eq!(broker.subscribe_count(&t), 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_keeps_session() {
        let broker = FakeBroker::new();
        let pool = pool(&broker);
        let u1 = identity("u1");
        let good = topic("u1", "temperature");
        let bad = topic("u1", "forbidden");
        broker.reject_subscriptions_to(&bad);

        pool.subscribe(&u1, &good).await.unwrap();
        let err = pool.subscribe(&u1, &bad).await.unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Broker(BrokerErrorKind::SubscribeRejected)
        );

        assert!(pool.has_session(&u1));
        assert_eq!(pool.topics(&u1).await.unwrap(), vec![good]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_resubscribe_starts_fresh() {
        let broker = FakeBroker::new();
        let pool = pool(&broker);
        let u1 = identity("u1");

        pool.subscribe(&u1, &topic("u1", "temperature")).await.unwrap();
        assert!(pool.release_identity(&u1).await);
        assert!(!pool.release_identity(&u1).await);
        assert_eq!(broker.disconnect_count(&u1), 1);
        assert!(!pool.has_session(&u1));

        pool.subscribe(&u1, &topic("u1", "humidity")).await.unwrap();
        assert_eq!(broker.connect_count(&u1), 2);
        assert_eq!(
            pool.topics(&u1).await.unwrap(),
            vec![topic("u1", "humidity")]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_absent_is_noop() {
        let broker = FakeBroker::new();
        let pool = pool(&broker);
        let u1 = identity("u1");
        let t = topic("u1", "temperature");

        assert!(!pool.unsubscribe(&u1, &t).await.unwrap());
        pool.subscribe(&u1, &t).await.unwrap();
        assert!(pool.unsubscribe(&u1, &t).await.unwrap());
        assert!(!pool.unsubscribe(&u1, &t).await.unwrap());
        assert_eq!(broker.unsubscribe_count(&t), 1);
    }

    #[tokio::test]
    async fn test_broker_messages_are_published_per_identity() {
        struct Collect(mpsc::UnboundedSender<BrokerEvent>);

        #[async_trait::async_trait]
        impl EventHandler for Collect {
            async fn handle(&self, event: &BrokerEvent) {
                let _ = self.0.send(event.clone());
            }
        }

        let broker = FakeBroker::new();
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _listener = bus.listen(Arc::new(Collect(tx)));
        let pool = BrokerClientPool::new(Arc::new(broker.clone()), bus);

        let t1 = topic("u1", "temperature");
        let t2 = topic("u2", "temperature");
        pool.subscribe(&identity("u1"), &t1).await.unwrap();
        pool.subscribe(&identity("u2"), &t2).await.unwrap();

        assert!(broker.publish(&t1, b"21.5"));
        assert!(broker.publish(&t2, b"19.0"));

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, BrokerEvent::new("u1", "u1/temperature", b"21.5".to_vec()));
        assert_eq!(second, BrokerEvent::new("u2", "u2/temperature", b"19.0".to_vec()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_session() {
        let broker = FakeBroker::new();
        let pool = pool(&broker);

        pool.subscribe(&identity("u1"), &topic("u1", "a")).await.unwrap();
        pool.subscribe(&identity("u2"), &topic("u2", "a")).await.unwrap();
        pool.shutdown().await;

        assert_eq!(pool.session_count(), 0);
        assert_eq!(broker.disconnect_count(&identity("u1")), 1);
        assert_eq!(broker.disconnect_count(&identity("u2")), 1);
    }
}
