//! The `persistence` module holds undelivered messages until a consumer can
//! take them.
//!
//! Every driver implements [`Storage`]: a thread-safe, ordered container
//! with last-in-first-out discipline, so the most recently failed delivery
//! is retried before older backlog. Two drivers ship with the crate:
//! - [`Stack`]: in-memory, the default
//! - [`SledStore`]: backed by a `sled` tree named after the queue

pub mod sled_store;
pub mod stack;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::broker::message::Message;
use crate::utils::error::StorageError;

pub use sled_store::SledStore;
pub use stack::Stack;

/// Driver-specific options, e.g. `path` for [`SledStore`].
pub type StorageOptions = HashMap<String, String>;

pub trait Storage: Send + Sync + Debug {
    /// Open the container backing the queue called `queue`.
    fn open(queue: &str, options: &StorageOptions) -> Result<Self, StorageError>
    where
        Self: Sized;

    fn push(&self, message: Message) -> Result<(), StorageError>;

    /// Remove and return the most recently pushed message.
    fn pop(&self) -> Result<Option<Message>, StorageError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which driver a queue is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageDriver {
    #[default]
    Memory,
    Sled,
}

impl StorageDriver {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "memory" | "stack" => Some(StorageDriver::Memory),
            "sled" => Some(StorageDriver::Sled),
            _ => None,
        }
    }

    pub fn open(
        &self,
        queue: &str,
        options: &StorageOptions,
    ) -> Result<Arc<dyn Storage>, StorageError> {
        Ok(match self {
            StorageDriver::Memory => Arc::new(Stack::open(queue, options)?),
            StorageDriver::Sled => Arc::new(SledStore::open(queue, options)?),
        })
    }
}

#[cfg(test)]
mod tests;
