use std::time::Duration;

use super::backoff::Fibonacci;
use super::consumer::Client;
use crate::utils::error::ClientError;

#[test]
fn test_fibonacci_sequence() {
    let delays: Vec<u64> = Fibonacci::new().take(6).collect();
    assert_eq!(delays, vec![2, 3, 5, 8, 13, 21]);
}

#[test]
fn test_fibonacci_durations_scale_with_unit() {
    let mut backoff = Fibonacci::default();
    let unit = Duration::from_millis(10);
    assert_eq!(backoff.next_duration(unit), Duration::from_millis(20));
    assert_eq!(backoff.next_duration(unit), Duration::from_millis(30));
    assert_eq!(backoff.next_duration(unit), Duration::from_millis(50));
}

#[test]
fn test_fibonacci_saturates() {
    let mut backoff = Fibonacci::new();
    let last = backoff.by_ref().nth(200).unwrap();
    assert_eq!(last, u64::MAX);
    assert_eq!(
        backoff.next_duration(Duration::from_secs(1)),
        Duration::from_secs(u64::from(u32::MAX))
    );
}

#[test]
fn test_client_urls() {
    let client = Client::new("ws://127.0.0.1:8080/bus/");
    assert_eq!(
        client.queue_url("jobs"),
        "ws://127.0.0.1:8080/bus/wsqueue/queue/jobs"
    );
    assert_eq!(
        client.topic_url("news"),
        "ws://127.0.0.1:8080/bus/wsqueue/topic/news"
    );
}

#[tokio::test]
async fn test_listener_gives_up_after_max_retries() {
    // nothing listens on port 1
    let client = Client::new("ws://127.0.0.1:1")
        .with_max_retries(2)
        .with_backoff_unit(Duration::from_millis(1));
    let mut listener = client.listen("jobs");

    let result = tokio::time::timeout(Duration::from_secs(5), listener.recv())
        .await
        .expect("listener did not give up in time");
    match result {
        Some(Err(ClientError::RetriesExhausted { url, attempts })) => {
            assert_eq!(url, "ws://127.0.0.1:1/wsqueue/queue/jobs");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(listener.recv().await.is_none());
}
