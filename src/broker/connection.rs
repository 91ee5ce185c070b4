//! Connection handle
//!
//! A `Connection` owns the sending side of a per-connection channel. The
//! transport drains the other side into the socket; once that write loop
//! ends the channel closes and further writes fail with
//! `BrokerError::TransportWrite`.

use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::message::Message;
use crate::transport::acl::AccessRequest;
use crate::utils::error::BrokerError;

pub type ConnId = String;

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnId,
    sender: UnboundedSender<WsMessage>,
}

impl Connection {
    /// Create a connection with a fresh UUID.
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), sender)
    }

    pub fn with_id(id: impl Into<ConnId>, sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: id.into(),
            sender,
        }
    }

    pub fn write(&self, frame: WsMessage) -> Result<(), BrokerError> {
        self.sender
            .send(frame)
            .map_err(|_| BrokerError::TransportWrite(self.id.clone()))
    }

    /// Ask the write loop to send a close frame. No-op if already closed.
    pub fn close(&self) {
        let _ = self.sender.send(WsMessage::Close(None));
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Lifecycle hooks for the application owning a queue or topic.
///
/// `on_opened` runs on its own task and never blocks admission.
/// `on_closed` runs synchronously when a connection is evicted.
/// `on_message` receives every inbound frame except acknowledgments, which
/// the queue consumes itself.
pub trait ConnectionObserver: Send + Sync {
    fn on_opened(&self, _conn: &Connection) {}

    fn on_closed(&self, _conn: &Connection) {}

    fn on_message(&self, _conn: &Connection, _msg: &Message) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

/// A queue or topic as seen by the transport: something a connection can be
/// authorized for, attached to, fed frames, and detached from.
pub trait Endpoint: Send + Sync {
    fn name(&self) -> &str;

    fn authorize(&self, request: &AccessRequest) -> bool;

    fn connect(&self, sender: UnboundedSender<WsMessage>) -> Connection;

    fn disconnect(&self, id: &str);

    /// Handle one inbound text frame.
    fn on_frame(&self, conn: &Connection, text: &str);
}
