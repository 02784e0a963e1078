use broker::mqtt::{BrokerAddress, MqttConnector, MqttSettings};
use broker::{BrokerClientPool, BrokerConnector};
use config::Config;
use domain::jwt::JwtVerifier;
use domain::Error;
use events::EventBus;
use log::info;
use std::sync::Arc;
use ws::{ConnectionSettings, Manager, RateGate, RateGateSettings};

pub mod config;
pub mod logging;

/// Capacity of each broker client's outgoing request channel.
const MQTT_REQUEST_CAPACITY: usize = 64;

/// Builds the connection manager backed by the configured MQTT broker.
///
/// Must be called from within a Tokio runtime: the event bus listener and the
/// rate gate sweeper are spawned here.
pub fn init_manager(config: &Config) -> Result<Arc<Manager>, Error> {
    let address = BrokerAddress::parse(config.mqtt_broker_url())?;
    info!(
        "Broker config: host={}, port={}, tls={}, ack_timeout={:?}, reconnect_backoff={:?}",
        address.host,
        address.port,
        address.tls,
        config.broker_ack_timeout(),
        config.broker_reconnect_backoff(),
    );

    let connector = MqttConnector::new(MqttSettings {
        address,
        username: config.mqtt_username(),
        password: config.mqtt_password(),
        keep_alive: config.mqtt_keep_alive(),
        ack_timeout: config.broker_ack_timeout(),
        reconnect_backoff: config.broker_reconnect_backoff(),
        request_capacity: MQTT_REQUEST_CAPACITY,
    });

    Ok(init_manager_with(config, Arc::new(connector)))
}

/// Builds the connection manager on top of any broker transport.
pub fn init_manager_with(config: &Config, connector: Arc<dyn BrokerConnector>) -> Arc<Manager> {
    let bus = EventBus::new(config.event_bus_capacity);
    let pool = Arc::new(BrokerClientPool::new(connector, bus.clone()));

    let rate_gate = Arc::new(RateGate::new(RateGateSettings {
        window: config.rate_window(),
        capacity: config.rate_capacity,
        block_duration: config.rate_block_duration(),
        sweep_interval: config.rate_sweep_interval(),
    }));
    rate_gate.spawn_sweeper();

    let manager = Arc::new(Manager::new(
        pool,
        rate_gate,
        Arc::new(JwtVerifier::new(config.jwt_secret())),
        ConnectionSettings {
            handshake_timeout: config.handshake_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        },
    ));
    bus.listen(manager.event_handler());

    manager
}

// Service-level state containing only infrastructure concerns
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub config: Config,
}

impl AppState {
    pub fn new(app_config: Config, manager: &Arc<Manager>) -> Self {
        Self {
            manager: Arc::clone(manager),
            config: app_config,
        }
    }
}
