//! Per-identity broker client pool.
//!
//! The bridge never shares a broker connection between users. Each
//! authenticated identity gets its own session, opened lazily on its first
//! subscribe and torn down when the identity's last WebSocket connection
//! closes. Messages arriving on a session are published onto the event bus,
//! tagged with the identity that owns the session.
//!
//! # Modules
//!
//! - `pool`: `BrokerClientPool`, the identity → session map
//! - `session`: `BrokerSession`, one identity's connection and topic set
//! - `transport`: `BrokerConnector`/`BrokerLink` traits and the `MessageSink`
//! - `mqtt`: the `rumqttc` backed transport used in production
//! - `testing`: an in-memory broker (feature `test-util`)

pub mod mqtt;
pub mod pool;
pub mod session;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;

pub use pool::BrokerClientPool;
pub use session::{BrokerSession, SubscribeOutcome};
pub use transport::{BrokerConnector, BrokerLink, MessageSink};
