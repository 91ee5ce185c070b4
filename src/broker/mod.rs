//! Broker core
//!
//! - `message`: the immutable envelope and payload classification
//! - `connection`: connection handle, lifecycle observer, `Endpoint`
//! - `registry`: live connections per queue or topic, one lock each
//! - `balancer`: least-loaded consumer selection
//! - `acks`: pending acknowledgment bookkeeping
//! - `queue`: work-queue delivery, redelivery and the retry loop
//! - `topic`: fan-out to every subscriber

pub mod acks;
pub mod balancer;
pub mod connection;
pub mod message;
pub mod queue;
pub mod registry;
pub mod topic;

pub use connection::{ConnId, Connection, ConnectionObserver, Endpoint, NoopObserver};
pub use message::{ContentType, Json, Message, Payload};
pub use queue::{Delivery, Queue, QueueOptions};
pub use topic::{Topic, TopicOptions};
