//! WebSocket connection handling for the sensor bridge.
//!
//! This crate owns everything between an accepted WebSocket and the broker
//! client pool: the handshake, request handling, rate control and the fan-out
//! of broker messages to the right clients. It is transport agnostic; the web
//! crate adapts axum sockets to the `Inbound`/`Outbound` frames used here.
//!
//! # Architecture
//!
//! - **Many connections per identity**: a user may open any number of
//!   connections. They share one broker session, opened on the first
//!   subscribe and released when the last connection closes.
//! - **Dual-index registry**: O(1) lookups for both connection management and
//!   identity-scoped delivery via separate DashMap indices.
//! - **Handshake first**: nothing but a token is accepted until the
//!   connection authenticates; anything else closes it.
//! - **Ephemeral messages**: broker messages are forwarded at most once. A
//!   client that is offline misses them.
//!
//! # Message Flow
//!
//! 1. Client opens a WebSocket on `/ws` and sends `{"token": "..."}`
//! 2. `Manager` verifies the token and binds the identity to the connection
//! 3. `{"action": "subscribe", "sensor": "temperature"}` becomes a broker
//!    subscription to `<identity>/temperature`
//! 4. The broker session publishes incoming messages on the event bus
//! 5. `BrokerEventHandler` looks up the identity's connections and forwards
//!    `{"type": "<topic>", "message": "<payload>"}` to each of them
//!
//! # Modules
//!
//! - `connection`: ConnectionRegistry with dual-index architecture and type-safe ConnectionId
//! - `handshake`: the per-connection state machine
//! - `manager`: connection lifecycle and request handling
//! - `message`: wire types for both directions
//! - `rate_gate`: per-connection sliding-window rate control
//! - `broker_event_handler`: event bus consumer that delivers broker messages

pub mod broker_event_handler;
pub mod connection;
pub mod handshake;
pub mod manager;
pub mod message;
pub mod rate_gate;

pub use manager::{ConnectionSettings, Manager};
pub use message::{Inbound, Outbound};
pub use rate_gate::{RateGate, RateGateSettings};
