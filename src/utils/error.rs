//! Error types shared across the broker, storage drivers, and the client
//! helper.
//!
//! Only `BrokerError::Encoding` ever reaches a caller of `Queue::send`; the
//! remaining broker variants are recovered locally by requeuing to storage.

use thiserror::Error;

use crate::broker::connection::ConnId;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The payload could not be serialized. Nothing was sent or stored.
    #[error("failed to encode payload: {0}")]
    Encoding(#[from] serde_json::Error),

    /// No live connection could take the message. Internal signal only.
    #[error("no connection available")]
    NoConnectionAvailable,

    #[error("failed to write to connection {0}")]
    TransportWrite(ConnId),

    /// Handshake refused by the endpoint's ACL. Answered with 401.
    #[error("Not Authorized by ACL")]
    Unauthorized,

    /// Handshake for a path no queue or topic is served at. Answered with 404.
    #[error("no queue or topic is served at {0}")]
    UnknownRoute(String),

    /// A queue of that name is already registered on the server.
    #[error("queue {0} is already registered")]
    AlreadyRegistered(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Returned by application `on_message` hooks.
    #[error("observer rejected message: {0}")]
    Observer(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("failed to (de)serialize stored message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid storage option `{key}`: {reason}")]
    InvalidOption { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unable to connect to {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },

    #[error("listener is closed")]
    Closed,
}
