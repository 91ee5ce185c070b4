//! Connection registry
//!
//! Owns the live connections of one queue or topic together with any state
//! that must change in the same critical section as membership (load
//! balancer counters and pending acks for a queue). Every mutation takes the
//! single write lock; enumeration takes the read lock.
//!
//! Hooks:
//! - `Membership::admitted` / `Membership::evicted` run under the lock.
//! - `ConnectionObserver::on_closed` runs after the lock is released, on the
//!   evicting task.
//! - `ConnectionObserver::on_opened` runs on a separate task.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{Instrument, debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::connection::{ConnId, Connection, ConnectionObserver};

/// Live connections ordered by id.
pub type Connections = BTreeMap<ConnId, Connection>;

/// State kept in lock-step with registry membership.
pub trait Membership: Send + Sync {
    fn admitted(&mut self, _id: &str) {}

    fn evicted(&mut self, _id: &str) {}
}

impl Membership for () {}

struct Inner<S> {
    connections: Connections,
    state: S,
}

pub struct Registry<S = ()> {
    inner: RwLock<Inner<S>>,
    observer: Arc<dyn ConnectionObserver>,
}

impl<S: Membership> Registry<S> {
    pub fn new(state: S, observer: Arc<dyn ConnectionObserver>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                connections: Connections::new(),
                state,
            }),
            observer,
        }
    }

    /// Register a new connection writing into `sender`.
    pub fn admit(&self, sender: UnboundedSender<WsMessage>) -> Connection {
        self.admit_connection(Connection::new(sender))
    }

    /// Register `conn`. A live entry with the same id is closed and evicted
    /// first, with its `on_closed` hook completing before `conn` is inserted.
    pub fn admit_connection(&self, conn: Connection) -> Connection {
        loop {
            let stale = {
                let mut inner = self.write();
                let Inner { connections, state } = &mut *inner;
                match connections.entry(conn.id.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(conn.clone());
                        state.admitted(&conn.id);
                        None
                    }
                    Entry::Occupied(slot) => {
                        let stale = slot.remove();
                        state.evicted(&stale.id);
                        Some(stale)
                    }
                }
            };

            match stale {
                Some(stale) => {
                    warn!(conn = %stale.id, "connection id collision, closing stale connection");
                    stale.close();
                    self.observer.on_closed(&stale);
                }
                None => break,
            }
        }

        debug!(conn = %conn.id, "connection admitted");
        self.spawn_opened(conn.clone());
        conn
    }

    /// Remove a connection. Returns `None` (and fires nothing) if it was
    /// already gone.
    pub fn evict(&self, id: &str) -> Option<Connection> {
        let removed = {
            let mut inner = self.write();
            let Inner { connections, state } = &mut *inner;
            let removed = connections.remove(id);
            if removed.is_some() {
                state.evicted(id);
            }
            removed
        };

        if let Some(conn) = &removed {
            debug!(conn = %conn.id, "connection evicted");
            self.observer.on_closed(conn);
        }
        removed
    }

    /// Close and evict every connection.
    pub fn drain(&self) -> Vec<Connection> {
        let ids: Vec<ConnId> = self.read().connections.keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.evict(id))
            .inspect(Connection::close)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Connection> {
        self.read().connections.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().connections.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().connections.contains_key(id)
    }

    pub fn observer(&self) -> &Arc<dyn ConnectionObserver> {
        &self.observer
    }

    /// Run `f` under the shared lock.
    pub fn read_with<R>(&self, f: impl FnOnce(&Connections, &S) -> R) -> R {
        let inner = self.read();
        f(&inner.connections, &inner.state)
    }

    /// Run `f` under the exclusive lock.
    pub fn write_with<R>(&self, f: impl FnOnce(&Connections, &mut S) -> R) -> R {
        let mut inner = self.write();
        let Inner { connections, state } = &mut *inner;
        f(connections, state)
    }

    fn spawn_opened(&self, conn: Connection) {
        let observer = self.observer.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { observer.on_opened(&conn) }.in_current_span());
            }
            Err(_) => {
                std::thread::spawn(move || observer.on_opened(&conn));
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<S>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<S>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self
            .inner
            .read()
            .map(|inner| inner.connections.len())
            .unwrap_or_default();
        f.debug_struct("Registry").field("live", &live).finish()
    }
}
