use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::{self, HeaderValue, StatusCode};
use tungstenite::protocol::Message as WsMessage;

use super::acl::{AccessGate, AccessRequest, Ace, Acl};
use super::server::Server;
use super::websocket::{rejection, serve};
use crate::broker::acks::AckState;
use crate::broker::connection::{Endpoint, NoopObserver};
use crate::broker::message::Message;
use crate::broker::queue::{Queue, QueueOptions};
use crate::broker::topic::TopicOptions;
use crate::client::Client;
use crate::utils::error::{BrokerError, ClientError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn digest(username: &str, password: &str) -> Ace {
    Ace::Digest {
        username: username.to_string(),
        password: password.to_string(),
    }
}

fn basic(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

async fn start(server: Arc<Server>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, server));
    addr
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn next_message(ws: &mut WsStream) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        if let WsMessage::Text(text) = frame {
            return Message::from_json(text.as_str()).unwrap();
        }
    }
}

type Handshake = Result<(WsStream, tungstenite::handshake::client::Response), tungstenite::Error>;

fn rejected_status(result: Handshake) -> StatusCode {
    match result {
        Err(tungstenite::Error::Http(response)) => response.status(),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

#[test]
fn test_acl_entries() {
    let peer: SocketAddr = "192.168.1.20:5000".parse().unwrap();
    let anonymous = AccessRequest {
        peer: Some(peer),
        ..AccessRequest::default()
    };

    assert!(Acl::default().authorize(&anonymous));
    assert!(Acl::world().authorize(&anonymous));

    let by_ip = Acl::new(vec![Ace::Ip {
        ip: "192.168.1.20".to_string(),
    }]);
    assert!(by_ip.authorize(&anonymous));

    let forwarded = AccessRequest {
        forwarded_for: Some("10.1.1.1".to_string()),
        ..anonymous.clone()
    };
    assert!(!by_ip.authorize(&forwarded));

    let by_digest = Acl::new(vec![digest("alice", "secret")]);
    assert!(!by_digest.authorize(&anonymous));
    let with_credentials = AccessRequest {
        credentials: Some(("alice".to_string(), "secret".to_string())),
        ..anonymous.clone()
    };
    assert!(by_digest.authorize(&with_credentials));
    let wrong_password = AccessRequest {
        credentials: Some(("alice".to_string(), "guess".to_string())),
        ..anonymous
    };
    assert!(!by_digest.authorize(&wrong_password));
}

#[test]
fn test_access_request_from_http() {
    let request = http::Request::builder()
        .uri("/wsqueue/queue/jobs")
        .header("X-Forwarded-For", "10.0.0.1, 172.16.0.1")
        .header("Authorization", basic("bob", "pa:ss"))
        .body(())
        .unwrap();
    let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

    let access = AccessRequest::from_http(&request, Some(peer));
    assert_eq!(access.forwarded_for.as_deref(), Some("10.0.0.1"));
    assert_eq!(
        access.credentials,
        Some(("bob".to_string(), "pa:ss".to_string()))
    );
    assert!(
        Acl::new(vec![Ace::Ip {
            ip: "10.0.0.1".to_string()
        }])
        .authorize(&access)
    );

    let garbage = http::Request::builder()
        .uri("/")
        .header("Authorization", "Basic !!!")
        .body(())
        .unwrap();
    assert_eq!(AccessRequest::from_http(&garbage, None).credentials, None);
}

#[test]
fn test_acl_serde_schemes() {
    let acl: Acl = serde_json::from_str(
        r#"[{"scheme":"WORLD"},{"scheme":"IP","ip":"1.2.3.4"},{"scheme":"DIGEST","username":"u","password":"p"}]"#,
    )
    .unwrap();
    assert_eq!(
        acl.entries(),
        &[
            Ace::World,
            Ace::Ip {
                ip: "1.2.3.4".to_string()
            },
            digest("u", "p"),
        ]
    );
}

#[tokio::test]
async fn test_server_routes() {
    let server = Server::new("/bus/");
    assert_eq!(server.route_prefix(), "/bus");
    server
        .create_queue("jobs", QueueOptions::default(), Arc::new(NoopObserver))
        .unwrap();
    server.create_topic("news", TopicOptions::default(), Arc::new(NoopObserver));

    assert_eq!(server.queue_route("jobs"), "/bus/wsqueue/queue/jobs");
    assert_eq!(server.topic_route("news"), "/bus/wsqueue/topic/news");

    assert_eq!(server.resolve("/bus/wsqueue/queue/jobs").unwrap().name(), "jobs");
    assert_eq!(server.resolve("/bus/wsqueue/topic/news").unwrap().name(), "news");
    assert!(server.resolve("/wsqueue/queue/jobs").is_none());
    assert!(server.resolve("/bus/wsqueue/queue/news").is_none());
    assert!(server.resolve("/bus/wsqueue/other/jobs").is_none());

    let stats = server.stats();
    assert_eq!((stats.queues, stats.topics, stats.clients), (1, 1, 0));

    server.shutdown().await;
}

#[tokio::test]
async fn test_queue_round_trip_over_websocket() {
    let server = Arc::new(Server::new(""));
    let queue = server
        .create_queue("jobs", QueueOptions::default(), Arc::new(NoopObserver))
        .unwrap();
    let addr = start(server.clone()).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/wsqueue/queue/jobs"))
        .await
        .unwrap();
    eventually(|| queue.consumers() == 1).await;
    eventually(|| server.stats().clients == 1).await;

    queue.send("hello").unwrap();
    let message = next_message(&mut ws).await;
    assert_eq!(message.body(), "hello");
    assert_eq!(queue.ack_state(message.id()), Some(AckState::Pending));

    ws.send(Message::ack(message.id()).to_frame().unwrap())
        .await
        .unwrap();
    eventually(|| queue.ack_state(message.id()) == Some(AckState::Acked)).await;
    assert_eq!(server.stats().messages, 1);

    ws.close(None).await.unwrap();
    eventually(|| queue.consumers() == 0).await;
    eventually(|| server.stats().clients == 0).await;
    assert_eq!(queue.storage().len(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unacked_message_is_requeued_when_consumer_drops() {
    let server = Arc::new(Server::new(""));
    let queue = server
        .create_queue("jobs", QueueOptions::default(), Arc::new(NoopObserver))
        .unwrap();
    let addr = start(server.clone()).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/wsqueue/queue/jobs"))
        .await
        .unwrap();
    eventually(|| queue.consumers() == 1).await;
    queue.send("unfinished").unwrap();
    assert_eq!(next_message(&mut ws).await.body(), "unfinished");

    drop(ws);
    eventually(|| queue.consumers() == 0).await;
    assert_eq!(queue.storage().len(), 1);
    assert_eq!(queue.pending_acks(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_rejections() {
    let server = Arc::new(Server::new(""));
    let options = QueueOptions {
        acl: Acl::new(vec![digest("alice", "secret")]),
        ..QueueOptions::default()
    };
    let queue = server
        .create_queue("private", options, Arc::new(NoopObserver))
        .unwrap();
    let addr = start(server.clone()).await;

    let missing = connect_async(format!("ws://{addr}/wsqueue/queue/missing")).await;
    assert_eq!(rejected_status(missing), StatusCode::NOT_FOUND);

    let url = format!("ws://{addr}/wsqueue/queue/private");
    let anonymous = connect_async(url.as_str()).await;
    assert_eq!(rejected_status(anonymous), StatusCode::UNAUTHORIZED);

    let mut request = url.as_str().into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&basic("alice", "wrong")).unwrap(),
    );
    assert_eq!(
        rejected_status(connect_async(request).await),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(queue.consumers(), 0);

    let mut request = url.as_str().into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&basic("alice", "secret")).unwrap(),
    );
    let (_ws, _) = connect_async(request).await.unwrap();
    eventually(|| queue.consumers() == 1).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_listener_acknowledges() {
    let server = Arc::new(Server::new("/bus"));
    let queue = server
        .create_queue("jobs", QueueOptions::default(), Arc::new(NoopObserver))
        .unwrap();
    let addr = start(server.clone()).await;

    let client = Client::new(format!("ws://{addr}/bus"));
    let mut listener = client.listen("jobs");
    eventually(|| queue.consumers() == 1).await;

    queue.send(&17i32).unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), listener.recv())
        .await
        .expect("timed out")
        .expect("listener ended")
        .expect("listener error");
    assert_eq!(message.decode::<i32>().unwrap(), 17);

    listener.ack(&message).unwrap();
    eventually(|| queue.ack_state(message.id()) == Some(AckState::Acked)).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_refused_by_acl_does_not_retry() {
    let server = Arc::new(Server::new(""));
    let options = QueueOptions {
        acl: Acl::new(vec![digest("alice", "secret")]),
        ..QueueOptions::default()
    };
    server
        .create_queue("private", options, Arc::new(NoopObserver))
        .unwrap();
    let addr = start(server.clone()).await;

    let mut listener = Client::new(format!("ws://{addr}")).listen("private");
    let result = tokio::time::timeout(Duration::from_secs(2), listener.recv())
        .await
        .expect("timed out");
    match result {
        Some(Err(ClientError::Transport(tungstenite::Error::Http(response)))) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        other => panic!("unexpected result: {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_topic_fan_out_over_websocket() {
    let server = Arc::new(Server::new(""));
    let topic = server.create_topic("news", TopicOptions::default(), Arc::new(NoopObserver));
    let addr = start(server.clone()).await;

    let client = Client::new(format!("ws://{addr}"));
    let mut first = client.subscribe("news");
    let mut second = client.subscribe("news");
    eventually(|| topic.subscribers() == 2).await;

    assert_eq!(topic.publish("extra").unwrap(), 2);
    for listener in [&mut first, &mut second] {
        let message = tokio::time::timeout(Duration::from_secs(2), listener.recv())
            .await
            .expect("timed out")
            .expect("listener ended")
            .expect("listener error");
        assert_eq!(message.body(), "extra");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = Arc::new(Server::new(""));
    let queue = server
        .create_queue("jobs", QueueOptions::default(), Arc::new(NoopObserver))
        .unwrap();
    let addr = start(server.clone()).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/wsqueue/queue/jobs"))
        .await
        .unwrap();
    eventually(|| queue.consumers() == 1).await;

    server.shutdown().await;
    assert_eq!(queue.consumers(), 0);

    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out");
    assert!(matches!(frame, Some(Ok(WsMessage::Close(_))) | None));
}

#[test]
fn test_rejection_responses() {
    let response = rejection(&BrokerError::Unauthorized);
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.body().as_deref(), Some("Not Authorized by ACL"));

    let response = rejection(&BrokerError::UnknownRoute("/nope".to_string()));
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.body().as_deref(),
        Some("no queue or topic is served at /nope")
    );
}

#[tokio::test]
async fn test_duplicate_queue_is_refused_and_keeps_backlog() {
    let server = Server::new("");
    let queue = server
        .create_queue("jobs", QueueOptions::default(), Arc::new(NoopObserver))
        .unwrap();
    queue.send("x").unwrap();

    let err = server
        .create_queue("jobs", QueueOptions::default(), Arc::new(NoopObserver))
        .unwrap_err();
    assert!(matches!(err, BrokerError::AlreadyRegistered(ref name) if name == "jobs"));

    let replacement =
        Arc::new(Queue::new("jobs", QueueOptions::default(), Arc::new(NoopObserver)).unwrap());
    assert!(server.register_queue(replacement).is_err());

    let registered = server.queue("jobs").unwrap();
    assert!(Arc::ptr_eq(&registered, &queue));
    assert_eq!(registered.storage().len(), 1);
    assert_eq!(server.stats().queues, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_vars_route_serves_stats() {
    let server = Arc::new(Server::new("/bus"));
    server
        .create_queue("jobs", QueueOptions::default(), Arc::new(NoopObserver))
        .unwrap();
    server.create_topic("news", TopicOptions::default(), Arc::new(NoopObserver));
    let addr = start(server.clone()).await;
    assert_eq!(server.vars_route(), "/bus/vars");

    let (_ws, _) = connect_async(format!("ws://{addr}/bus/wsqueue/queue/jobs"))
        .await
        .unwrap();
    eventually(|| server.stats().clients == 1).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /bus/vars HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .expect("timed out")
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Type: application/json\r\n"));
    let (_, body) = response.split_once("\r\n\r\n").unwrap();
    let vars: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(vars["queues"], 1);
    assert_eq!(vars["topics"], 1);
    assert_eq!(vars["clients"], 1);
    assert_eq!(vars["messages"], 0);

    // the stats request itself is not counted as a client
    assert_eq!(server.stats().clients, 1);

    server.shutdown().await;
}
