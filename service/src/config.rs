use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// The secret used to verify HS256 session tokens presented in the WebSocket handshake
    #[arg(long, env, hide_env_values = true)]
    jwt_secret: String,

    /// The MQTT broker to connect to, e.g. mqtt://localhost:1883 or mqtts://broker:8883
    #[arg(long, env, default_value = "mqtt://localhost:1883")]
    mqtt_broker_url: String,

    /// The service principal the bridge authenticates to the broker as
    #[arg(long, env)]
    mqtt_username: Option<String>,

    #[arg(long, env, hide_env_values = true)]
    mqtt_password: Option<String>,

    /// MQTT keep-alive interval in seconds
    #[arg(long, env, default_value_t = 60)]
    pub mqtt_keep_alive_secs: u64,

    /// Seconds to wait for the broker to acknowledge a subscribe
    #[arg(
        long,
        env,
        default_value_t = 4,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub broker_ack_timeout_secs: u64,

    /// Milliseconds to wait before reconnecting a dropped broker session
    #[arg(
        long,
        env,
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub broker_reconnect_backoff_ms: u64,

    /// Seconds a new WebSocket connection may take to authenticate
    #[arg(
        long,
        env,
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub handshake_timeout_secs: u64,

    /// Seconds between heartbeat pings
    #[arg(
        long,
        env,
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub heartbeat_interval_secs: u64,

    /// Largest WebSocket message accepted from a client, in bytes
    #[arg(
        long,
        env,
        default_value_t = 65536,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub max_ws_message_size: usize,

    /// Length of the per-connection rate limit window in milliseconds
    #[arg(
        long,
        env,
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub rate_window_ms: u64,

    /// Messages a connection may send per rate limit window
    #[arg(
        long,
        env,
        default_value_t = 10,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub rate_capacity: usize,

    /// Seconds a connection stays blocked after exceeding its rate limit
    #[arg(long, env, default_value_t = 60)]
    pub rate_block_secs: u64,

    /// Seconds between sweeps of stale rate limit records
    #[arg(
        long,
        env,
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub rate_sweep_interval_secs: u64,

    /// Broker events buffered for a slow event bus listener before it starts dropping
    #[arg(
        long,
        env,
        default_value_t = 1024,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub event_bus_capacity: usize,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn jwt_secret(&self) -> &str {
        &self.jwt_secret
    }

    pub fn mqtt_broker_url(&self) -> &str {
        &self.mqtt_broker_url
    }

    pub fn mqtt_username(&self) -> Option<String> {
        self.mqtt_username.clone()
    }

    pub fn mqtt_password(&self) -> Option<String> {
        self.mqtt_password.clone()
    }

    pub fn mqtt_keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keep_alive_secs)
    }

    pub fn broker_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_ack_timeout_secs)
    }

    pub fn broker_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.broker_reconnect_backoff_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn rate_block_duration(&self) -> Duration {
        Duration::from_secs(self.rate_block_secs)
    }

    pub fn rate_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.rate_sweep_interval_secs)
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }
}
