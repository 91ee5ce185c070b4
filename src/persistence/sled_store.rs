//! Storage driver backed by `sled`
//!
//! Each queue gets its own tree, named after the queue, inside a database
//! shared by every queue opened on the same path. Keys are ids from
//! `Db::generate_id`, which only ever grow, so `pop_max` yields the most
//! recent push and the tree behaves as a stack that survives restarts.
//!
//! Options:
//! - `path`: database directory (default `wsqueue_db`)

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock, PoisonError};

use sled::{Db, Tree};
use tracing::debug;

use crate::broker::message::Message;
use crate::persistence::{Storage, StorageOptions};
use crate::utils::error::StorageError;

pub const DEFAULT_PATH: &str = "wsqueue_db";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    tree: Tree,
}

impl SledStore {
    /// Use an already opened database.
    pub fn with_db(db: Db, queue: &str) -> Result<Self, StorageError> {
        let tree = db.open_tree(queue)?;
        debug!(queue, stored = tree.len(), "opened sled tree");
        Ok(Self { db, tree })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.tree.flush()?;
        Ok(())
    }
}

impl Storage for SledStore {
    fn open(queue: &str, options: &StorageOptions) -> Result<Self, StorageError> {
        let path = options
            .get("path")
            .map(String::as_str)
            .unwrap_or(DEFAULT_PATH);
        if path.trim().is_empty() {
            return Err(StorageError::InvalidOption {
                key: "path".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Self::with_db(shared_db(path)?, queue)
    }

    fn push(&self, message: Message) -> Result<(), StorageError> {
        let key = self.db.generate_id()?;
        let value = serde_json::to_vec(&message)?;
        self.tree.insert(key.to_be_bytes(), value)?;
        Ok(())
    }

    fn pop(&self) -> Result<Option<Message>, StorageError> {
        match self.tree.pop_max()? {
            Some((_, value)) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn len(&self) -> usize {
        self.tree.len()
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("tree", &String::from_utf8_lossy(&self.tree.name()))
            .finish()
    }
}

/// sled holds an exclusive lock on its directory, so queues opened on the
/// same path share one handle.
fn shared_db(path: &str) -> Result<Db, StorageError> {
    static OPEN: OnceLock<Mutex<HashMap<PathBuf, Db>>> = OnceLock::new();

    let mut open = OPEN
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let key = PathBuf::from(path);
    if let Some(db) = open.get(&key) {
        return Ok(db.clone());
    }
    let db = sled::open(&key)?;
    open.insert(key, db.clone());
    Ok(db)
}
