//! Queue and topic registry for one listening server.
//!
//! Queues are served at `{prefix}/wsqueue/queue/{name}`, topics at
//! `{prefix}/wsqueue/topic/{name}`, and the counters as JSON at
//! `{prefix}/vars`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{info, warn};

use crate::broker::connection::{ConnectionObserver, Endpoint};
use crate::broker::queue::{Queue, QueueOptions};
use crate::broker::topic::{Topic, TopicOptions};
use crate::utils::error::BrokerError;

pub const QUEUE_ROUTE: &str = "/wsqueue/queue/";
pub const TOPIC_ROUTE: &str = "/wsqueue/topic/";
pub const VARS_ROUTE: &str = "/vars";

/// Point-in-time server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub queues: u64,
    pub topics: u64,
    pub clients: u64,
    pub messages: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) clients: AtomicU64,
    pub(crate) messages: AtomicU64,
}

#[derive(Debug, Default)]
pub struct Server {
    route_prefix: String,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    pub(crate) counters: Counters,
}

impl Server {
    pub fn new(route_prefix: impl Into<String>) -> Self {
        Self {
            route_prefix: route_prefix.into().trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    pub fn route_prefix(&self) -> &str {
        &self.route_prefix
    }

    pub fn queue_route(&self, name: &str) -> String {
        format!("{}{QUEUE_ROUTE}{name}", self.route_prefix)
    }

    pub fn topic_route(&self, name: &str) -> String {
        format!("{}{TOPIC_ROUTE}{name}", self.route_prefix)
    }

    /// Plain HTTP route answering with the [`ServerStats`] JSON snapshot.
    pub fn vars_route(&self) -> String {
        format!("{}{VARS_ROUTE}", self.route_prefix)
    }

    /// Build a queue, register it, and start its retry loop. Must be called
    /// from within a Tokio runtime.
    pub fn create_queue(
        &self,
        name: &str,
        options: QueueOptions,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<Queue>, BrokerError> {
        if self.queue(name).is_some() {
            return Err(BrokerError::AlreadyRegistered(name.to_string()));
        }
        let queue = Arc::new(Queue::new(name, options, observer)?);
        self.register_queue(queue.clone())?;
        Ok(queue)
    }

    /// Register a queue and start its retry loop. A registered queue is
    /// never replaced: its storage may still hold messages.
    pub fn register_queue(&self, queue: Arc<Queue>) -> Result<(), BrokerError> {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        if queues.contains_key(queue.name()) {
            warn!("Queue {} is already registered", queue.name());
            return Err(BrokerError::AlreadyRegistered(queue.name().to_string()));
        }
        info!(
            "Register queue {} on route {}",
            queue.name(),
            self.queue_route(queue.name())
        );
        queue.start_retry_loop();
        queues.insert(queue.name().to_string(), queue);
        Ok(())
    }

    pub fn create_topic(
        &self,
        name: &str,
        options: TopicOptions,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Arc<Topic> {
        let topic = Arc::new(Topic::new(name, options, observer));
        self.register_topic(topic.clone());
        topic
    }

    /// Register a topic. A topic of the same name is replaced and its
    /// subscribers closed; topics hold no messages.
    pub fn register_topic(&self, topic: Arc<Topic>) {
        info!(
            "Register topic {} on route {}",
            topic.name(),
            self.topic_route(topic.name())
        );
        let previous = self
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.name().to_string(), topic);
        if let Some(previous) = previous {
            previous.teardown();
        }
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Map a request path to the queue or topic served there.
    pub fn resolve(&self, path: &str) -> Option<Arc<dyn Endpoint>> {
        let route = path.strip_prefix(self.route_prefix.as_str())?;
        if let Some(name) = route.strip_prefix(QUEUE_ROUTE) {
            return self
                .queue(name)
                .map(|queue| queue as Arc<dyn Endpoint>);
        }
        if let Some(name) = route.strip_prefix(TOPIC_ROUTE) {
            return self
                .topic(name)
                .map(|topic| topic as Arc<dyn Endpoint>);
        }
        None
    }

    pub fn stats(&self) -> ServerStats {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner).len();
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner).len();
        ServerStats {
            queues: queues as u64,
            topics: topics as u64,
            clients: self.counters.clients.load(Ordering::Relaxed),
            messages: self.counters.messages.load(Ordering::Relaxed),
        }
    }

    /// Stop every retry loop and close every connection.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<Queue>> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let topics: Vec<Arc<Topic>> = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for queue in queues {
            if let Some(task) = queue.teardown() {
                let _ = task.await;
            }
        }
        for topic in topics {
            topic.teardown();
        }
        info!("server shut down");
    }
}
