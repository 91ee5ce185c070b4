//! Consumer helper for processes outside the broker.
//!
//! A [`Listener`] owns a background task that dials the queue or topic,
//! forwards every decoded message, and sends acknowledgments back on the
//! same socket. Lost connections are re-dialled with Fibonacci backoff; once
//! `max_retries` consecutive attempts fail the listener yields
//! `ClientError::RetriesExhausted` and ends.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::Message;
use crate::client::backoff::Fibonacci;
use crate::transport::server::{QUEUE_ROUTE, TOPIC_ROUTE};
use crate::utils::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_MAX_RETRIES: u32 = 100;

#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    max_retries: u32,
    backoff_unit: Duration,
}

impl Client {
    /// `base_url` is the server address plus its route prefix, e.g.
    /// `ws://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_unit: Duration::from_secs(1),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn queue_url(&self, queue: &str) -> String {
        format!("{}{QUEUE_ROUTE}{queue}", self.base_url)
    }

    pub fn topic_url(&self, topic: &str) -> String {
        format!("{}{TOPIC_ROUTE}{topic}", self.base_url)
    }

    /// Consume from a work queue. Every message should be acknowledged.
    pub fn listen(&self, queue: &str) -> Listener {
        info!("Listening to queue {queue}");
        self.spawn(self.queue_url(queue))
    }

    /// Subscribe to a topic.
    pub fn subscribe(&self, topic: &str) -> Listener {
        info!("Subscribing to topic {topic}");
        self.spawn(self.topic_url(topic))
    }

    fn spawn(&self, url: String) -> Listener {
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let (acks, acks_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(
            url,
            self.max_retries,
            self.backoff_unit,
            messages_tx,
            acks_rx,
        ));
        Listener { messages, acks }
    }
}

#[derive(Debug)]
pub struct Listener {
    messages: UnboundedReceiver<Result<Message, ClientError>>,
    acks: UnboundedSender<String>,
}

impl Listener {
    /// Next message or error. `None` once the background task has ended.
    pub async fn recv(&mut self) -> Option<Result<Message, ClientError>> {
        self.messages.recv().await
    }

    pub fn ack(&self, message: &Message) -> Result<(), ClientError> {
        self.acks
            .send(message.id().to_string())
            .map_err(|_| ClientError::Closed)
    }
}

async fn run(
    url: String,
    max_retries: u32,
    unit: Duration,
    messages: UnboundedSender<Result<Message, ClientError>>,
    mut acks: UnboundedReceiver<String>,
) {
    loop {
        let mut ws = match connect(&url, max_retries, unit).await {
            Ok(ws) => ws,
            Err(e) => {
                let _ = messages.send(Err(e));
                return;
            }
        };
        debug!("connected to {url}");

        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let decoded = Message::from_json(text.as_str()).map_err(ClientError::from);
                        if messages.send(decoded).is_err() {
                            let _ = ws.close(None).await;
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        if messages.send(Err(ClientError::Transport(e))).is_err() {
                            return;
                        }
                        break;
                    }
                },
                ack = acks.recv() => match ack {
                    Some(id) => {
                        let frame = match Message::ack(&id).to_frame() {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("cannot encode ack for {id}: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = ws.send(frame).await {
                            warn!("failed to send ack for {id}: {e}");
                            break;
                        }
                    }
                    None => {
                        let _ = ws.close(None).await;
                        return;
                    }
                },
            }
        }

        debug!("connection to {url} lost, reconnecting");
    }
}

async fn connect(url: &str, max_retries: u32, unit: Duration) -> Result<WsStream, ClientError> {
    let mut backoff = Fibonacci::new();
    let mut attempts = 0;
    loop {
        attempts += 1;
        match connect_async(url).await {
            Ok((ws, _)) => return Ok(ws),
            // the server answered and refused: retrying will not help
            Err(tungstenite::Error::Http(response)) if response.status().is_client_error() => {
                warn!("{url} refused connection: {}", response.status());
                return Err(ClientError::Transport(tungstenite::Error::Http(response)));
            }
            Err(e) => {
                if attempts > max_retries {
                    warn!("Unable to connect to {url}: {e}");
                    return Err(ClientError::RetriesExhausted {
                        url: url.to_string(),
                        attempts,
                    });
                }
                debug!("Waiting before retry connection to {url}: {e}");
                backoff.wait(unit).await;
            }
        }
    }
}
