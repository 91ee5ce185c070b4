//! Least-loaded load balancer
//!
//! Counts messages delivered to each connection since the last fairness
//! reset and always hands the next message to a connection with the lowest
//! count. Ties go to the lowest connection id. Callers hold the registry
//! write lock, so selection and increment are a single step.

use std::collections::BTreeMap;

use crate::broker::connection::{ConnId, Connection};
use crate::broker::registry::Connections;
use crate::utils::error::BrokerError;

#[derive(Debug, Default)]
pub struct LoadBalancer {
    counters: BTreeMap<ConnId, u64>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fairness reset: every counter goes back to zero and `id` joins at zero.
    pub fn admit(&mut self, id: &str) {
        for count in self.counters.values_mut() {
            *count = 0;
        }
        self.counters.insert(id.to_string(), 0);
    }

    pub fn evict(&mut self, id: &str) {
        self.counters.remove(id);
    }

    /// Pick the least-loaded live connection and count a delivery to it.
    pub fn next(&mut self, live: &Connections) -> Result<Connection, BrokerError> {
        let min = live
            .keys()
            .map(|id| self.delivered(id))
            .min()
            .ok_or(BrokerError::NoConnectionAvailable)?;

        // BTreeMap iteration is ordered, so the first match has the lowest id.
        let conn = live
            .values()
            .find(|conn| self.delivered(&conn.id) == min)
            .ok_or(BrokerError::NoConnectionAvailable)?;

        *self.counters.entry(conn.id.clone()).or_insert(0) += 1;
        Ok(conn.clone())
    }

    /// Undo the increment of a delivery attempt that failed.
    pub fn rollback(&mut self, id: &str) {
        if let Some(count) = self.counters.get_mut(id) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn delivered(&self, id: &str) -> u64 {
        self.counters.get(id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
