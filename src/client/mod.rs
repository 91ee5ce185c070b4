//! Client side of the broker: a consumer that listens on a queue or
//! subscribes to a topic over WebSocket, acknowledges what it processed and
//! reconnects with Fibonacci backoff when the socket drops.

pub mod backoff;
pub mod consumer;

pub use backoff::Fibonacci;
pub use consumer::{Client, Listener};

#[cfg(test)]
mod tests;
