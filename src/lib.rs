//! # wsqueue
//!
//! `wsqueue` is a message broker served over WebSockets. It offers two
//! delivery models:
//!
//! - work queues, where each message goes to exactly one consumer chosen by
//!   a least-loaded balancer, must be acknowledged, and is kept in storage
//!   and retried until some consumer can take it
//! - topics, where each message is fanned out to every current subscriber
//!
//! ## Core Modules
//!
//! - `broker`: queues, topics, messages, connection tracking and acks.
//! - `client`: a consumer that listens, acknowledges and reconnects.
//! - `config`: loading server, broker, queue and topic configuration.
//! - `persistence`: storage drivers for undelivered messages.
//! - `transport`: the WebSocket server, routing and access control.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
