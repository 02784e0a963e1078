//! Domain types shared by every layer of the bridge.
//!
//! - `error`: the workspace-wide error tree
//! - `identity`: authenticated identities and the topics namespaced under them
//! - `jwt`: credential verification for the WebSocket handshake

pub mod error;
pub mod identity;
pub mod jwt;

pub use error::{Error, ErrorKind};
pub use identity::{Identity, Topic};
