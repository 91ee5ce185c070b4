use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::broker::message::Message;
use crate::persistence::{Storage, StorageOptions};
use crate::utils::error::StorageError;

/// Thread-safe in-memory LIFO stack.
#[derive(Debug, Default)]
pub struct Stack {
    items: Mutex<Vec<Message>>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Top of the stack, without removing it.
    pub fn peek(&self) -> Option<Message> {
        self.items().last().cloned()
    }

    /// The `index`-th item counting from the bottom (oldest push).
    pub fn get(&self, index: usize) -> Option<Message> {
        self.items().get(index).cloned()
    }

    fn items(&self) -> MutexGuard<'_, Vec<Message>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for Stack {
    fn open(_queue: &str, _options: &StorageOptions) -> Result<Self, StorageError> {
        Ok(Self::new())
    }

    fn push(&self, message: Message) -> Result<(), StorageError> {
        self.items().push(message);
        Ok(())
    }

    fn pop(&self) -> Result<Option<Message>, StorageError> {
        Ok(self.items().pop())
    }

    fn len(&self) -> usize {
        self.items().len()
    }
}
