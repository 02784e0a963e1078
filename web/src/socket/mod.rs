//! WebSocket HTTP handler for the web layer.
//!
//! This module only adapts axum sockets to the frames the `ws` crate works
//! with. Connection handling itself (Manager, ConnectionRegistry, wire types)
//! lives in the `ws` crate.

pub mod handler;
