use crate::broker_event_handler::BrokerEventHandler;
use crate::connection::{ConnectionId, ConnectionRegistry, Unregistered};
use crate::handshake::ConnectionState;
use crate::message::{
    Action, ClientRequest, CloseReason, ErrorCode, Inbound, Outbound, Reply,
};
use crate::rate_gate::{RateDecision, RateGate};
use broker::BrokerClientPool;
use domain::error::{
    auth_error, rate_limited_error, transport_error, AuthErrorKind, Error, TransportErrorKind,
};
use domain::jwt::CredentialVerifier;
use domain::{Identity, Topic};
use events::EventHandler;
use futures::{Stream, StreamExt};
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

/// Connection timing knobs.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// How long a new connection may stay unauthenticated.
    pub handshake_timeout: Duration,
    /// Ping period. A client that misses one pong is dropped on the next tick.
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Ties client connections to per-identity broker sessions.
///
/// Owns the connection registry and drives every connection through the
/// handshake, request handling and teardown. Broker messages reach clients
/// through the handler returned by [`Manager::event_handler`].
pub struct Manager {
    registry: Arc<ConnectionRegistry>,
    pool: Arc<BrokerClientPool>,
    rate_gate: Arc<RateGate>,
    verifier: Arc<dyn CredentialVerifier>,
    settings: ConnectionSettings,
    shutting_down: AtomicBool,
}

impl Manager {
    pub fn new(
        pool: Arc<BrokerClientPool>,
        rate_gate: Arc<RateGate>,
        verifier: Arc<dyn CredentialVerifier>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            pool,
            rate_gate,
            verifier,
            settings,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Fails once [`Self::shutdown`] has started.
    pub fn ensure_accepting(&self) -> Result<(), Error> {
        if self.is_shutting_down() {
            return Err(transport_error(
                TransportErrorKind::ShuttingDown,
                "server is shutting down",
            ));
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<BrokerClientPool> {
        &self.pool
    }

    /// Handler that fans broker events out to this manager's connections.
    pub fn event_handler(&self) -> Arc<dyn EventHandler> {
        Arc::new(BrokerEventHandler::new(self.registry.clone()))
    }

    /// Register a new, unauthenticated connection and return its unique ID
    pub fn accept(&self, sender: UnboundedSender<Outbound>) -> ConnectionId {
        let connection_id = self.registry.register(sender);
        info!("Accepted connection {connection_id}");
        connection_id
    }

    /// Runs the handshake for a connection.
    ///
    /// On failure the connection is closed with "Authentication failed" and
    /// removed before the error is returned.
    pub async fn handle_first_message(
        &self,
        connection_id: &ConnectionId,
        raw: &str,
    ) -> Result<Identity, Error> {
        match self.authenticate(connection_id, raw).await {
            Ok(identity) => {
                info!("Connection {connection_id} authenticated as {identity}");
                self.reply(connection_id, &Reply::Authenticated);
                Ok(identity)
            }
            Err(e) => {
                warn!("Handshake failed on connection {connection_id}: {e}");
                self.close_with(connection_id, CloseReason::AUTHENTICATION_FAILED)
                    .await;
                Err(e)
            }
        }
    }

    async fn authenticate(&self, connection_id: &ConnectionId, raw: &str) -> Result<Identity, Error> {
        let state = ConnectionState::Unauthenticated
            .on_handshake(raw, self.verifier.as_ref())
            .await?;
        let identity = state.identity().cloned().ok_or_else(|| {
            auth_error(AuthErrorKind::InvalidClaims, "handshake did not authenticate")
        })?;

        if !self.registry.bind_identity(connection_id, identity.clone()) {
            return Err(transport_error(
                TransportErrorKind::ClientClosed,
                "connection gone or already authenticated",
            ));
        }
        Ok(identity)
    }

    /// Handles one client message after the handshake.
    ///
    /// Request problems become error replies and leave the connection open.
    /// The only error returned is for a connection that never authenticated,
    /// which is closed and removed.
    pub async fn handle_message(&self, connection_id: &ConnectionId, raw: &str) -> Result<(), Error> {
        let Some(identity) = self.registry.identity_of(connection_id) else {
            warn!("Rejecting message from unauthenticated connection {connection_id}");
            self.close_with(connection_id, CloseReason::AUTHENTICATION_FAILED)
                .await;
            return Err(auth_error(
                AuthErrorKind::MissingToken,
                "message received before handshake",
            ));
        };

        if self.rate_gate.check(connection_id) == RateDecision::Blocked {
            let e = rate_limited_error();
            debug!("Dropping message on connection {connection_id}: {e}");
            self.reply(connection_id, &Reply::error(ErrorCode::for_request_error(&e)));
            return Ok(());
        }

        let request = match ClientRequest::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("Bad request on connection {connection_id}: {e}");
                self.reply(
                    connection_id,
                    &Reply::error(ErrorCode::for_request_error(&e)),
                );
                return Ok(());
            }
        };

        let topic = match Topic::for_sensor(&identity, &request.sensor) {
            Ok(topic) => topic,
            Err(e) => {
                debug!("Bad sensor on connection {connection_id}: {e}");
                self.reply(
                    connection_id,
                    &Reply::sensor_error(ErrorCode::InvalidSensor, &request.sensor, None),
                );
                return Ok(());
            }
        };

        let reply = match request.action {
            Action::Subscribe => self.subscribe(connection_id, &identity, &topic).await,
            Action::Unsubscribe => self.unsubscribe(connection_id, &identity, &topic).await,
        };
        self.reply(connection_id, &reply);
        Ok(())
    }

    async fn subscribe(&self, connection_id: &ConnectionId, identity: &Identity, topic: &Topic) -> Reply {
        let newly_added = self.registry.add_topic(connection_id, topic);

        match self.pool.subscribe(identity, topic).await {
            Ok(outcome) => {
                debug!("Connection {connection_id} subscribed to {topic} ({outcome:?})");
                Reply::Subscribed {
                    sensor: topic.sensor().to_string(),
                    topic: topic.to_string(),
                }
            }
            Err(e) => {
                error!("Subscribe to {topic} failed for connection {connection_id}: {e}");
                if newly_added {
                    self.registry.remove_topic(connection_id, topic);
                }
                Reply::sensor_error(ErrorCode::SubscribeFailed, topic.sensor(), Some(topic.as_str()))
            }
        }
    }

    async fn unsubscribe(&self, connection_id: &ConnectionId, identity: &Identity, topic: &Topic) -> Reply {
        let unsubscribed = Reply::Unsubscribed {
            sensor: topic.sensor().to_string(),
            topic: topic.to_string(),
        };

        if !self.registry.remove_topic(connection_id, topic) {
            debug!("Connection {connection_id} was not subscribed to {topic}");
            return unsubscribed;
        }
        if self.registry.identity_wants(identity, topic) {
            debug!("{topic} still wanted by another connection of {identity}");
            return unsubscribed;
        }

        if let Err(e) = self.pool.unsubscribe(identity, topic).await {
            error!("Unsubscribe from {topic} failed for {identity}: {e}");
            return Reply::sensor_error(
                ErrorCode::UnsubscribeFailed,
                topic.sensor(),
                Some(topic.as_str()),
            );
        }

        // Another connection may have asked for the topic while the broker
        // unsubscribe was in flight.
        if self.registry.identity_wants(identity, topic) {
            if let Err(e) = self.pool.subscribe(identity, topic).await {
                error!("Restoring {topic} for {identity} failed: {e}");
            }
        }
        unsubscribed
    }

    /// Removes a connection. Releases the identity's broker session when this
    /// was its last connection. Safe to call more than once.
    pub async fn handle_close(&self, connection_id: &ConnectionId) {
        self.rate_gate.forget(connection_id);

        let Some(removed) = self
            .registry
            .unregister(connection_id, |identity| self.pool.detach(identity))
        else {
            return;
        };

        match removed {
            Unregistered {
                identity: Some(identity),
                last: Some(session),
            } => {
                info!("Last connection of {identity} closed");
                if let Some(session) = session {
                    self.pool.close(session).await;
                }
            }
            Unregistered { identity, .. } => {
                debug!("Connection {connection_id} closed (identity: {identity:?})");
            }
        }
    }

    async fn close_with(&self, connection_id: &ConnectionId, reason: CloseReason) {
        self.registry.send(connection_id, Outbound::Close(reason));
        self.handle_close(connection_id).await;
    }

    fn reply(&self, connection_id: &ConnectionId, reply: &Reply) {
        match Outbound::json(reply) {
            Ok(message) => {
                trace!("Replying to {connection_id}: {reply:?}");
                if !self.registry.send(connection_id, message) {
                    debug!("Connection {connection_id} closed before reply");
                }
            }
            Err(e) => error!("Failed to serialize reply: {e}"),
        }
    }

    /// Drives one connection from accept to close.
    ///
    /// `inbound` yields the client's frames; `outbound` receives everything
    /// the server sends. The connection is cleaned up when this returns.
    pub async fn run_connection<S>(&self, outbound: UnboundedSender<Outbound>, mut inbound: S)
    where
        S: Stream<Item = Inbound> + Unpin + Send,
    {
        let connection_id = self.accept(outbound);
        let handshake_deadline = Instant::now() + self.settings.handshake_timeout;
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = (!period.is_zero()).then(|| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut alive = true;
        let mut state = ConnectionState::Unauthenticated;

        loop {
            match &state {
                ConnectionState::Unauthenticated => {
                    let frame = tokio::select! {
                        frame = inbound.next() => frame,
                        _ = sleep_until(handshake_deadline) => {
                            let e = auth_error(AuthErrorKind::Timeout, "no handshake before deadline");
                            info!("Closing connection {connection_id}: {e}");
                            self.registry
                                .send(&connection_id, Outbound::Close(CloseReason::AUTHENTICATION_TIMEOUT));
                            state = ConnectionState::Closed;
                            continue;
                        }
                    };

                    match frame {
                        Some(Inbound::Text(raw)) => {
                            match self.handle_first_message(&connection_id, &raw).await {
                                Ok(identity) => state = ConnectionState::Authenticated(identity),
                                Err(_) => return,
                            }
                        }
                        Some(Inbound::Pong) => {}
                        Some(Inbound::Close) | None => state = ConnectionState::Closed,
                    }
                }
                ConnectionState::Authenticated(_) => {
                    tokio::select! {
                        frame = inbound.next() => match frame {
                            Some(Inbound::Text(raw)) => {
                                if self.handle_message(&connection_id, &raw).await.is_err() {
                                    return;
                                }
                            }
                            Some(Inbound::Pong) => alive = true,
                            Some(Inbound::Close) | None => state = ConnectionState::Closed,
                        },
                        _ = next_tick(&mut heartbeat) => {
                            if alive {
                                alive = false;
                                self.registry.send(&connection_id, Outbound::Ping);
                            } else {
                                warn!("Connection {connection_id} missed a heartbeat");
                                self.registry
                                    .send(&connection_id, Outbound::Close(CloseReason::HEARTBEAT_TIMEOUT));
                                state = ConnectionState::Closed;
                            }
                        }
                    }
                }
                ConnectionState::Closed => break,
            }
        }

        self.handle_close(&connection_id).await;
    }

    /// Closes every client and every broker session.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        info!(
            "Shutting down {} connection(s)",
            self.registry.connection_count()
        );
        self.registry
            .broadcast(&Outbound::Close(CloseReason::SHUTTING_DOWN));
        self.pool.shutdown().await;
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
