//! Acknowledgment tracking
//!
//! Per message: `sent (pending) -> acked`, or `sent -> requeued` when the
//! owning connection goes away first. Pending entries remember which
//! connection they were handed to so a lost consumer's messages can be
//! returned to storage. Acked entries stay until the next `prune`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::broker::connection::ConnId;
use crate::broker::message::{Message, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
}

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message: Message,
    pub conn: ConnId,
    pub sent_at: Instant,
    seq: u64,
}

#[derive(Debug)]
enum Entry {
    Pending(PendingMessage),
    Acked,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    entries: HashMap<MessageId, Entry>,
    next_seq: u64,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_sent(&mut self, message: &Message, conn: &str) {
        self.mark_sent_at(message, conn, Instant::now());
    }

    pub fn mark_sent_at(&mut self, message: &Message, conn: &str, sent_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            message.id().to_string(),
            Entry::Pending(PendingMessage {
                message: message.clone(),
                conn: conn.to_string(),
                sent_at,
                seq,
            }),
        );
    }

    /// Returns `false` for unknown or already acknowledged ids.
    pub fn mark_acked(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if matches!(entry, Entry::Pending(_)) => {
                *entry = Entry::Acked;
                true
            }
            _ => false,
        }
    }

    /// Forget a pending entry whose delivery never happened.
    pub fn clear(&mut self, id: &str) -> Option<PendingMessage> {
        match self.entries.remove(id) {
            Some(Entry::Pending(pending)) => Some(pending),
            Some(acked) => {
                self.entries.insert(id.to_string(), acked);
                None
            }
            None => None,
        }
    }

    /// Remove and return every message still pending on `conn`, oldest first.
    pub fn on_consumer_lost(&mut self, conn: &str) -> Vec<Message> {
        self.take_pending(|pending| pending.conn == conn)
    }

    /// Remove and return pending messages sent more than `timeout` before `now`.
    pub fn take_expired(&mut self, timeout: Duration, now: Instant) -> Vec<Message> {
        self.take_pending(|pending| now.saturating_duration_since(pending.sent_at) > timeout)
    }

    /// Drop acknowledged entries. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| matches!(entry, Entry::Pending(_)));
        before - self.entries.len()
    }

    pub fn state(&self, id: &str) -> Option<AckState> {
        self.entries.get(id).map(|entry| match entry {
            Entry::Pending(_) => AckState::Pending,
            Entry::Acked => AckState::Acked,
        })
    }

    pub fn pending(&self, id: &str) -> Option<&PendingMessage> {
        match self.entries.get(id) {
            Some(Entry::Pending(pending)) => Some(pending),
            _ => None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry, Entry::Pending(_)))
            .count()
    }

    pub fn pending_for(&self, conn: &str) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry, Entry::Pending(p) if p.conn == conn))
            .count()
    }

    fn take_pending(&mut self, mut select: impl FnMut(&PendingMessage) -> bool) -> Vec<Message> {
        let ids: Vec<MessageId> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Pending(pending) if select(pending) => Some(id.clone()),
                _ => None,
            })
            .collect();

        let mut taken: Vec<PendingMessage> = ids
            .iter()
            .filter_map(|id| match self.entries.remove(id) {
                Some(Entry::Pending(pending)) => Some(pending),
                _ => None,
            })
            .collect();
        taken.sort_by_key(|pending| pending.seq);
        taken.into_iter().map(|pending| pending.message).collect()
    }
}
