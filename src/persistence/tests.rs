use super::{SledStore, Stack, Storage, StorageDriver, StorageOptions};
use crate::broker::message::{Json, Message};

use serde::Serialize;
use tempfile::tempdir;

fn sled_options(path: &std::path::Path) -> StorageOptions {
    let mut options = StorageOptions::new();
    options.insert("path".to_string(), path.to_str().unwrap().to_string());
    options
}

#[test]
fn test_stack_is_lifo() {
    let stack = Stack::new();
    let a = Message::new("A").unwrap();
    let b = Message::new("B").unwrap();

    stack.push(a.clone()).unwrap();
    stack.push(b.clone()).unwrap();

    assert_eq!(stack.pop().unwrap(), Some(b));
    assert_eq!(stack.pop().unwrap(), Some(a));
    assert_eq!(stack.pop().unwrap(), None);
}

#[test]
fn test_stack_len_peek_and_get() {
    let stack = Stack::new();
    assert!(stack.is_empty());
    assert!(stack.peek().is_none());

    let first = Message::new(&1i64).unwrap();
    let second = Message::new(&2i64).unwrap();
    stack.push(first.clone()).unwrap();
    stack.push(second.clone()).unwrap();

    assert_eq!(stack.len(), 2);
    assert_eq!(stack.peek(), Some(second.clone()));
    assert_eq!(stack.get(0), Some(first));
    assert_eq!(stack.get(1), Some(second));
    assert_eq!(stack.get(2), None);
    // peek does not remove
    assert_eq!(stack.len(), 2);
}

#[test]
fn test_stack_shared_between_threads() {
    let stack = std::sync::Arc::new(Stack::new());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let stack = stack.clone();
            std::thread::spawn(move || {
                for j in 0..25i64 {
                    stack.push(Message::new(&(i * 100 + j)).unwrap()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(stack.len(), 100);
}

#[test]
fn test_sled_store_is_lifo() {
    let dir = tempdir().unwrap();
    let store = SledStore::open("lifo", &sled_options(dir.path())).unwrap();
    let a = Message::new("A").unwrap();
    let b = Message::new("B").unwrap();

    store.push(a.clone()).unwrap();
    store.push(b.clone()).unwrap();
    assert_eq!(store.len(), 2);

    assert_eq!(store.pop().unwrap(), Some(b));
    assert_eq!(store.pop().unwrap(), Some(a));
    assert_eq!(store.pop().unwrap(), None);
    assert!(store.is_empty());
}

#[test]
fn test_sled_store_keeps_queues_apart() {
    let dir = tempdir().unwrap();
    let options = sled_options(dir.path());
    let jobs = SledStore::open("jobs", &options).unwrap();
    let mails = SledStore::open("mails", &options).unwrap();

    jobs.push(Message::new("job").unwrap()).unwrap();

    assert_eq!(jobs.len(), 1);
    assert!(mails.is_empty());
    assert_eq!(mails.pop().unwrap(), None);
}

#[test]
fn test_sled_store_preserves_envelope() {
    #[derive(Serialize)]
    struct Order {
        sku: String,
        quantity: u32,
    }

    let dir = tempdir().unwrap();
    let store = SledStore::open("orders", &sled_options(dir.path())).unwrap();
    let message = Message::new(&Json(Order {
        sku: "A-1".to_string(),
        quantity: 3,
    }))
    .unwrap();

    store.push(message.clone()).unwrap();
    store.flush().unwrap();
    let popped = store.pop().unwrap().unwrap();

    assert_eq!(popped, message);
    assert_eq!(popped.id(), message.id());
}

#[test]
fn test_sled_store_rejects_empty_path() {
    let mut options = StorageOptions::new();
    options.insert("path".to_string(), "  ".to_string());
    assert!(SledStore::open("bad", &options).is_err());
}

#[test]
fn test_storage_driver_parse_and_open() {
    assert_eq!(StorageDriver::parse("memory"), Some(StorageDriver::Memory));
    assert_eq!(StorageDriver::parse("Sled"), Some(StorageDriver::Sled));
    assert_eq!(StorageDriver::parse("redis"), None);

    let dir = tempdir().unwrap();
    let store = StorageDriver::Sled
        .open("driver", &sled_options(dir.path()))
        .unwrap();
    store.push(Message::new("x").unwrap()).unwrap();
    assert_eq!(store.len(), 1);

    let memory = StorageDriver::default()
        .open("driver", &StorageOptions::new())
        .unwrap();
    assert!(memory.is_empty());
}
