//! MQTT implementation of the broker transport, built on `rumqttc`.
//!
//! Each [`MqttLink`] owns one `AsyncClient` and a task that drives its event
//! loop. The task reconnects with a fixed backoff after any connection error
//! and re-issues every acknowledged subscription after a reconnect, since the
//! bridge uses clean sessions.

use crate::transport::{BrokerConnector, BrokerLink, MessageSink};
use async_trait::async_trait;
use domain::error::{broker_error, BrokerErrorKind, Error, ErrorKind};
use domain::{Identity, Topic};
use log::*;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use url::Url;

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTTS_PORT: u16 = 8883;
/// How long a closing link keeps polling to flush its DISCONNECT packet.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Where the broker lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parses `mqtt://host[:port]` (also `tcp://`) or `mqtts://host[:port]`
    /// (also `ssl://`).
    pub fn parse(broker_url: &str) -> Result<Self, Error> {
        let url = Url::parse(broker_url).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::Config,
        })?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            other => {
                return Err(Error {
                    source: Some(format!("unsupported broker URL scheme '{other}'").into()),
                    error_kind: ErrorKind::Config,
                })
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error {
                source: Some("broker URL has no host".into()),
                error_kind: ErrorKind::Config,
            })?
            .to_string();

        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_MQTTS_PORT } else { DEFAULT_MQTT_PORT });

        Ok(Self { host, port, tls })
    }
}

/// Settings shared by every broker connection the pool opens.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub address: BrokerAddress,
    /// Service principal the bridge authenticates as.
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub ack_timeout: Duration,
    pub reconnect_backoff: Duration,
    /// Capacity of the client request channel.
    pub request_capacity: usize,
}

/// Opens one MQTT connection per identity.
pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options_for(&self, identity: &Identity) -> MqttOptions {
        let settings = &self.settings;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let client_id = format!("user_{identity}_{}", &suffix[..8]);

        let mut options =
            MqttOptions::new(client_id, settings.address.host.clone(), settings.address.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = &settings.username {
            options.set_credentials(
                username.clone(),
                settings.password.clone().unwrap_or_default(),
            );
        }
        if settings.address.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

impl BrokerConnector for MqttConnector {
    fn connect(&self, identity: &Identity, sink: MessageSink) -> Box<dyn BrokerLink> {
        let options = self.options_for(identity);
        debug!(
            "Connecting MQTT client {} for {identity}",
            options.client_id()
        );

        let (client, eventloop) = AsyncClient::new(options, self.settings.request_capacity.max(1));
        let shared = Arc::new(Shared::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(drive(
            eventloop,
            client.clone(),
            sink,
            shared.clone(),
            self.settings.reconnect_backoff,
            shutdown_rx,
        ));

        Box::new(MqttLink {
            identity: identity.clone(),
            client,
            shared,
            ack_timeout: self.settings.ack_timeout,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }
}

type AckSender = oneshot::Sender<Result<(), Error>>;

/// Correlates SUBSCRIBE requests with their SUBACKs.
///
/// Requests are queued in the order they are handed to the client; the event
/// loop sends them in that same order, so each outgoing SUBSCRIBE packet id is
/// paired with the oldest queued waiter. Resubscriptions after a reconnect
/// queue a `None` waiter.
#[derive(Default)]
struct PendingAcks {
    queued: VecDeque<Option<AckSender>>,
    in_flight: HashMap<u16, Option<AckSender>>,
}

impl PendingAcks {
    fn outgoing(&mut self, pkid: u16) {
        // A packet id already in flight is the event loop replaying it after
        // a reconnect.
        if self.in_flight.contains_key(&pkid) {
            return;
        }
        match self.queued.pop_front() {
            Some(waiter) => {
                self.in_flight.insert(pkid, waiter);
            }
            None => warn!("SUBSCRIBE {pkid} sent with no queued request"),
        }
    }

    fn acked(&mut self, ack: &SubAck) {
        let accepted = ack
            .return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)));

        if let Some(Some(waiter)) = self.in_flight.remove(&ack.pkid) {
            let result = if accepted {
                Ok(())
            } else {
                Err(broker_error(
                    BrokerErrorKind::SubscribeRejected,
                    "broker refused the subscription",
                ))
            };
            // The requester may have timed out already.
            let _ = waiter.send(result);
        }
    }
}

#[derive(Default)]
struct Shared {
    pending: Mutex<PendingAcks>,
    /// Acknowledged subscriptions, re-issued after a reconnect.
    topics: Mutex<HashSet<String>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingAcks> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn topics(&self) -> MutexGuard<'_, HashSet<String>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn client_error(kind: BrokerErrorKind, err: ClientError) -> Error {
    Error {
        source: Some(Box::new(err)),
        error_kind: ErrorKind::Broker(kind),
    }
}

pub struct MqttLink {
    identity: Identity,
    client: AsyncClient,
    shared: Arc<Shared>,
    ack_timeout: Duration,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn subscribe(&self, topic: &Topic) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        {
            // Queue and hand over under one lock so queue order matches send order.
            let mut pending = self.shared.pending();
            pending.queued.push_back(Some(tx));
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                pending.queued.pop_back();
                return Err(client_error(BrokerErrorKind::Unreachable, e));
            }
        }

        match timeout(self.ack_timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                self.shared.topics().insert(topic.to_string());
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(broker_error(
                BrokerErrorKind::SessionClosed,
                "broker session closed before the subscription was acknowledged",
            )),
            Err(_) => Err(broker_error(
                BrokerErrorKind::Timeout,
                "broker did not acknowledge the subscription in time",
            )),
        }
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), Error> {
        self.client
            .try_unsubscribe(topic.as_str())
            .map_err(|e| client_error(BrokerErrorKind::UnsubscribeFailed, e))?;
        self.shared.topics().remove(topic.as_str());
        Ok(())
    }

    async fn disconnect(&self) {
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("MQTT task for {} ended abnormally: {e}", self.identity);
                }
            }
        }
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}

/// Drives one client's event loop until shutdown.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    sink: MessageSink,
    shared: Arc<Shared>,
    reconnect_backoff: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let identity = sink.identity().clone();
    let mut connected_once = false;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                flush_disconnect(&mut eventloop, &client).await;
                debug!("MQTT client for {identity} stopped");
                break;
            }
            res = eventloop.poll() => match res {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if connected_once {
                        info!("MQTT client reconnected for {identity}");
                        resubscribe(&client, &shared);
                    } else {
                        info!("MQTT client connected for {identity}");
                        connected_once = true;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    sink.deliver(&publish.topic, publish.payload.to_vec());
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    shared.pending().acked(&ack);
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    shared.pending().outgoing(pkid);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "MQTT connection error for {identity}: {e}; reconnecting in {}ms",
                        reconnect_backoff.as_millis()
                    );
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = sleep(reconnect_backoff) => {}
                    }
                }
            }
        }
    }
}

fn resubscribe(client: &AsyncClient, shared: &Shared) {
    let topics: Vec<String> = shared.topics().iter().cloned().collect();
    let mut pending = shared.pending();
    for topic in topics {
        pending.queued.push_back(None);
        if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
            pending.queued.pop_back();
            warn!("Failed to re-subscribe to {topic}: {e}");
        }
    }
}

async fn flush_disconnect(eventloop: &mut EventLoop, client: &AsyncClient) {
    if client.try_disconnect().is_err() {
        return;
    }
    let _ = timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
}
