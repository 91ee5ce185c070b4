//! Topic fan-out
//!
//! A published message goes to every connection subscribed at that moment.
//! There is no load balancing, acknowledgment, or storage: a subscriber that
//! cannot be written to simply misses the message.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{Span, debug, info_span, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::connection::{Connection, ConnectionObserver, Endpoint};
use crate::broker::message::{Message, Payload};
use crate::broker::registry::Registry;
use crate::transport::acl::{AccessGate, AccessRequest, Acl};
use crate::utils::error::BrokerError;

#[derive(Debug, Clone, Default)]
pub struct TopicOptions {
    pub acl: Acl,
}

pub struct Topic {
    name: String,
    options: TopicOptions,
    registry: Registry,
    span: Span,
}

impl Topic {
    pub fn new(
        name: impl Into<String>,
        options: TopicOptions,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        let name = name.into();
        Self {
            span: info_span!("topic", name = %name),
            name,
            options,
            registry: Registry::new((), observer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &TopicOptions {
        &self.options
    }

    pub fn subscribe(&self, sender: UnboundedSender<WsMessage>) -> Connection {
        let _enter = self.span.enter();
        self.registry.admit(sender)
    }

    pub fn unsubscribe(&self, id: &str) -> Option<Connection> {
        let _enter = self.span.enter();
        self.registry.evict(id)
    }

    pub fn subscribers(&self) -> usize {
        self.registry.len()
    }

    /// Send `payload` to every current subscriber. Returns how many were
    /// reached.
    pub fn publish<P: Payload + ?Sized>(&self, payload: &P) -> Result<usize, BrokerError> {
        let message = Message::new(payload)?;
        let frame = message.to_frame()?;
        let _enter = self.span.enter();

        let mut reached = 0;
        for conn in self.registry.snapshot() {
            match conn.write(frame.clone()) {
                Ok(()) => reached += 1,
                Err(err) => warn!(%err, "failed to publish to subscriber"),
            }
        }
        debug!(msg_id = message.id(), reached, "published");
        Ok(reached)
    }

    /// Close every subscriber.
    pub fn teardown(&self) {
        let _enter = self.span.enter();
        self.registry.drain();
    }
}

impl Endpoint for Topic {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorize(&self, request: &AccessRequest) -> bool {
        self.options.acl.authorize(request)
    }

    fn connect(&self, sender: UnboundedSender<WsMessage>) -> Connection {
        self.subscribe(sender)
    }

    fn disconnect(&self, id: &str) {
        self.unsubscribe(id);
    }

    fn on_frame(&self, conn: &Connection, text: &str) {
        let _enter = self.span.enter();
        match Message::from_json(text) {
            Ok(message) => {
                if let Err(err) = self.registry.observer().on_message(conn, &message) {
                    warn!(conn = %conn.id, %err, "on_message failed");
                }
            }
            Err(err) => warn!(conn = %conn.id, %err, "cannot unmarshal frame"),
        }
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .finish()
    }
}
