//! Work queue
//!
//! Every message goes to exactly one consumer, chosen by the least-loaded
//! [`LoadBalancer`]. Messages that cannot be delivered right now (no
//! consumer, failed write, consumer lost before acknowledging, optional ack
//! timeout) are pushed to the queue's [`Storage`] and picked up again by the
//! retry loop, one per tick.
//!
//! Concurrency notes:
//! - Connections, balancer counters and pending acks share the registry
//!   lock, so a selection and its counter increment are indivisible and a
//!   lost consumer's pending messages are requeued in the same step that
//!   removes it.
//! - Writes go into the connection's channel while the lock is held; they
//!   never block, and sends on one queue are serialized.
//! - Storage has its own lock and is always taken after the registry lock.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::acks::{AckState, AckTracker};
use crate::broker::balancer::LoadBalancer;
use crate::broker::connection::{ConnId, Connection, ConnectionObserver, Endpoint};
use crate::broker::message::{Message, Payload};
use crate::broker::registry::{Membership, Registry};
use crate::persistence::{Storage, StorageDriver, StorageOptions};
use crate::transport::acl::{AccessGate, AccessRequest, Acl};
use crate::utils::error::{BrokerError, StorageError};

/// Default period of the retry loop.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Shortest period the retry loop runs at; smaller values are raised to it.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub acl: Acl,
    pub storage: StorageDriver,
    pub storage_options: StorageOptions,
    pub retry_interval: Duration,
    /// Requeue messages left unacknowledged for longer than this.
    /// `None` keeps them pending until their connection goes away.
    pub ack_timeout: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            acl: Acl::default(),
            storage: StorageDriver::default(),
            storage_options: StorageOptions::new(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            ack_timeout: None,
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent(ConnId),
    Stored,
}

struct Dispatch {
    balancer: LoadBalancer,
    acks: AckTracker,
    storage: Arc<dyn Storage>,
}

impl Membership for Dispatch {
    fn admitted(&mut self, id: &str) {
        self.balancer.admit(id);
    }

    fn evicted(&mut self, id: &str) {
        self.balancer.evict(id);
        for message in self.acks.on_consumer_lost(id) {
            info!(conn = id, msg_id = message.id(), "consumer lost before ack, requeuing");
            store(self.storage.as_ref(), message);
        }
    }
}

struct RetryLoop {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Queue {
    name: String,
    options: QueueOptions,
    registry: Registry<Dispatch>,
    storage: Arc<dyn Storage>,
    span: Span,
    retry: Mutex<Option<RetryLoop>>,
}

impl Queue {
    /// Create a queue, opening the storage driver named in `options`.
    pub fn new(
        name: impl Into<String>,
        options: QueueOptions,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Self, StorageError> {
        let name = name.into();
        let storage = options.storage.open(&name, &options.storage_options)?;
        Ok(Self::with_storage(name, options, storage, observer))
    }

    pub fn with_storage(
        name: impl Into<String>,
        options: QueueOptions,
        storage: Arc<dyn Storage>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        let name = name.into();
        let dispatch = Dispatch {
            balancer: LoadBalancer::new(),
            acks: AckTracker::new(),
            storage: storage.clone(),
        };
        Self {
            span: info_span!("queue", name = %name),
            name,
            options,
            registry: Registry::new(dispatch, observer),
            storage,
            retry: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Admit a consumer. Resets every balancer counter.
    pub fn connect(&self, sender: UnboundedSender<WsMessage>) -> Connection {
        let _enter = self.span.enter();
        self.registry.admit(sender)
    }

    pub fn connect_as(&self, conn: Connection) -> Connection {
        let _enter = self.span.enter();
        self.registry.admit_connection(conn)
    }

    /// Evict a consumer and requeue whatever it had not acknowledged.
    /// Idempotent.
    pub fn disconnect(&self, id: &str) -> Option<Connection> {
        let _enter = self.span.enter();
        self.registry.evict(id)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.registry.snapshot()
    }

    pub fn consumers(&self) -> usize {
        self.registry.len()
    }

    /// Wrap `payload` in a message and hand it to a consumer, or to storage
    /// when none can take it. Only encoding failures are reported.
    pub fn send<P: Payload + ?Sized>(&self, payload: &P) -> Result<(), BrokerError> {
        let message = Message::new(payload)?;
        if self.registry.is_empty() {
            let _enter = self.span.enter();
            debug!(msg_id = message.id(), "no consumer, storing");
            store(self.storage.as_ref(), message);
            return Ok(());
        }
        self.deliver(message);
        Ok(())
    }

    /// One delivery attempt for an already built message.
    pub fn deliver(&self, message: Message) -> Delivery {
        let _enter = self.span.enter();

        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, msg_id = message.id(), "cannot serialize message");
                store(self.storage.as_ref(), message);
                return Delivery::Stored;
            }
        };

        let outcome = self.registry.write_with(|live, dispatch| {
            let conn = match dispatch.balancer.next(live) {
                Ok(conn) => conn,
                Err(_) => {
                    debug!(msg_id = message.id(), "no connection available");
                    return Err((message, None));
                }
            };

            dispatch.acks.mark_sent(&message, &conn.id);
            match conn.write(frame) {
                Ok(()) => Ok(conn.id),
                Err(err) => {
                    warn!(%err, msg_id = message.id(), "delivery failed, requeuing");
                    dispatch.acks.clear(message.id());
                    dispatch.balancer.rollback(&conn.id);
                    let dead = conn.is_closed().then_some(conn.id);
                    Err((message, dead))
                }
            }
        });

        match outcome {
            Ok(conn) => {
                debug!(%conn, "message delivered");
                Delivery::Sent(conn)
            }
            Err((message, dead)) => {
                store(self.storage.as_ref(), message);
                if let Some(id) = dead {
                    self.registry.evict(&id);
                }
                Delivery::Stored
            }
        }
    }

    pub fn mark_acked(&self, message_id: &str) -> bool {
        self.registry
            .write_with(|_, dispatch| dispatch.acks.mark_acked(message_id))
    }

    pub fn ack_state(&self, message_id: &str) -> Option<AckState> {
        self.registry
            .read_with(|_, dispatch| dispatch.acks.state(message_id))
    }

    pub fn pending_acks(&self) -> usize {
        self.registry
            .read_with(|_, dispatch| dispatch.acks.pending_len())
    }

    /// Messages delivered to `conn` since the last fairness reset.
    pub fn delivered(&self, conn: &str) -> u64 {
        self.registry
            .read_with(|_, dispatch| dispatch.balancer.delivered(conn))
    }

    /// Route an inbound message: acknowledgments are consumed here, anything
    /// else goes to the observer.
    pub fn handle_message(&self, conn: &Connection, message: Message) -> Result<(), BrokerError> {
        if let Some(id) = message.acknowledged_id() {
            let _enter = self.span.enter();
            if self.mark_acked(id) {
                debug!(conn = %conn.id, msg_id = id, "ack received");
            } else {
                debug!(conn = %conn.id, msg_id = id, "ack for unknown message");
            }
            return Ok(());
        }
        self.registry.observer().on_message(conn, &message)
    }

    /// One retry step: prune acknowledged entries, requeue expired pending
    /// ones, then pop a single stored message and try to deliver it.
    ///
    /// Runs on the calling thread, storage I/O included. A tick touches at
    /// most one stored message, so the sled driver's `pop_max`/`insert` stay
    /// short enough for a runtime worker.
    pub fn retry_tick(&self) -> Option<Delivery> {
        let ack_timeout = self.options.ack_timeout;
        self.registry.write_with(|_, dispatch| {
            dispatch.acks.prune();
            if let Some(timeout) = ack_timeout {
                for message in dispatch.acks.take_expired(timeout, Instant::now()) {
                    let _enter = self.span.enter();
                    info!(msg_id = message.id(), "ack timed out, requeuing");
                    store(dispatch.storage.as_ref(), message);
                }
            }
        });

        match self.storage.pop() {
            Ok(Some(message)) => Some(self.deliver(message)),
            Ok(None) => None,
            Err(err) => {
                let _enter = self.span.enter();
                error!(%err, "cannot pop from storage");
                None
            }
        }
    }

    /// Spawn the retry loop on the current runtime. Returns the token that
    /// stops it; calling again while it runs returns the same token.
    pub fn start_retry_loop(self: &Arc<Self>) -> CancellationToken {
        let mut retry = self.retry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = retry.as_ref() {
            if !running.task.is_finished() {
                return running.token.clone();
            }
        }

        let mut period = self.options.retry_interval;
        if period < MIN_RETRY_INTERVAL {
            let _enter = self.span.enter();
            warn!(?period, "retry interval too small, using {MIN_RETRY_INTERVAL:?}");
            period = MIN_RETRY_INTERVAL;
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(
            retry_loop(Arc::downgrade(self), period, token.clone())
                .instrument(self.span.clone()),
        );
        *retry = Some(RetryLoop {
            token: token.clone(),
            task,
        });
        token
    }

    /// Cancel the retry loop. Await the returned handle to wait for exit.
    pub fn stop_retry_loop(&self) -> Option<JoinHandle<()>> {
        let running = self
            .retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        running.token.cancel();
        Some(running.task)
    }

    /// Stop retrying and close every consumer. Unacknowledged messages end
    /// up in storage.
    pub fn teardown(&self) -> Option<JoinHandle<()>> {
        let task = self.stop_retry_loop();
        let _enter = self.span.enter();
        let closed = self.registry.drain();
        info!(closed = closed.len(), stored = self.storage.len(), "queue torn down");
        task
    }
}

impl Endpoint for Queue {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorize(&self, request: &AccessRequest) -> bool {
        self.options.acl.authorize(request)
    }

    fn connect(&self, sender: UnboundedSender<WsMessage>) -> Connection {
        Queue::connect(self, sender)
    }

    fn disconnect(&self, id: &str) {
        Queue::disconnect(self, id);
    }

    fn on_frame(&self, conn: &Connection, text: &str) {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(err) => {
                let _enter = self.span.enter();
                warn!(conn = %conn.id, %err, "cannot unmarshal frame");
                return;
            }
        };
        if let Err(err) = self.handle_message(conn, message) {
            let _enter = self.span.enter();
            warn!(conn = %conn.id, %err, "on_message failed");
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("storage", &self.storage)
            .finish()
    }
}

async fn retry_loop(queue: Weak<Queue>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(queue) = queue.upgrade() else { break };
                // synchronous: a popped message is delivered or pushed back
                // before the next cancellation check
                queue.retry_tick();
            }
        }
    }
    debug!("retry loop stopped");
}

/// Push to storage, logging instead of failing: delivery paths have no
/// caller left to report to.
fn store(storage: &dyn Storage, message: Message) {
    let id = message.id().to_string();
    if let Err(err) = storage.push(message) {
        error!(%err, msg_id = %id, "failed to store message, message lost");
    }
}
