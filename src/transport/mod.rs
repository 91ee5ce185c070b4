//! The `transport` module is responsible for network communication with
//! consumers over WebSockets.
//!
//! It resolves request paths to queues and topics, applies their
//! access-control lists during the handshake, and pumps frames between the
//! socket and the broker.

pub mod acl;
pub mod server;
pub mod websocket;

pub use acl::{AccessGate, AccessRequest, Ace, Acl};
pub use server::{Server, ServerStats};
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod tests;
