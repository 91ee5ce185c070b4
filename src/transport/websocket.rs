//! WebSocket transport
//!
//! Responsibilities:
//! - Accept TCP connections and run the WebSocket handshake
//! - During the handshake, resolve the request path to a queue or topic and
//!   run its access-control gate; unknown routes get 404 and rejected
//!   requests get 401, and in both cases nothing is registered
//! - Attach the connection, then run a write loop (channel to socket) and a
//!   read loop (socket to `Endpoint::on_frame`) until either side ends
//! - Detach the connection when either loop ends; detaching twice is harmless
//! - Answer a plain `GET {prefix}/vars` with the server counters instead of
//!   upgrading

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tracing::{Instrument, debug, info, info_span, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::connection::Endpoint;
use crate::transport::acl::AccessRequest;
use crate::transport::server::Server;
use crate::utils::error::BrokerError;

/// Bind `addr` and serve `server` until the task is dropped.
pub async fn start_websocket_server(addr: &str, server: Arc<Server>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve(listener, server).await;
    Ok(())
}

/// Accept loop on an already bound listener.
pub async fn serve(listener: TcpListener, server: Arc<Server>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(server.clone(), stream, peer));
            }
            Err(e) => warn!("Failed to accept connection: {e}"),
        }
    }
}

async fn handle_connection(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    if requests_route(&stream, &server.vars_route()).await {
        if let Err(e) = serve_vars(stream, &server).await {
            debug!(%peer, "failed to answer stats request: {e}");
        }
        return;
    }

    let mut endpoint: Option<Arc<dyn Endpoint>> = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        let Some(target) = server.resolve(path) else {
            let err = BrokerError::UnknownRoute(path.to_string());
            warn!(%peer, "{err}");
            return Err(rejection(&err));
        };
        if !target.authorize(&AccessRequest::from_http(request, Some(peer))) {
            let err = BrokerError::Unauthorized;
            warn!(%peer, path, "{err}");
            return Err(rejection(&err));
        }
        endpoint = Some(target);
        Ok(response)
    };

    let handshake = accept_hdr_async(stream, callback).await;
    let ws_stream = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, "WebSocket handshake error: {e}");
            return;
        }
    };
    let Some(endpoint) = endpoint else {
        return;
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let conn = endpoint.connect(tx);
    let span = info_span!("conn", id = %conn.id, endpoint = endpoint.name());
    server.counters.clients.fetch_add(1, Ordering::Relaxed);

    {
        let endpoint = endpoint.clone();
        let id = conn.id.clone();
        tokio::spawn(
            async move {
                while let Some(frame) = rx.recv().await {
                    let closing = matches!(frame, WsMessage::Close(_));
                    if let Err(e) = ws_sender.send(frame).await {
                        warn!("Failed to send message: {e}");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                // closing the channel makes further writes fail immediately
                drop(rx);
                endpoint.disconnect(&id);
                debug!("write loop closed");
            }
            .instrument(span.clone()),
        );
    }

    async {
        debug!(%peer, "connection opened");
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    server.counters.messages.fetch_add(1, Ordering::Relaxed);
                    endpoint.on_frame(&conn, text.as_str());
                }
                Ok(WsMessage::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        server.counters.messages.fetch_add(1, Ordering::Relaxed);
                        endpoint.on_frame(&conn, text);
                    }
                    Err(_) => warn!("ignoring non UTF-8 binary frame"),
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("read error: {e}");
                    break;
                }
            }
        }
        endpoint.disconnect(&conn.id);
        conn.close();
        debug!("connection closed");
    }
    .instrument(span)
    .await;

    server.counters.clients.fetch_sub(1, Ordering::Relaxed);
}

/// Handshake refusal carrying `err` as its body.
pub(crate) fn rejection(err: &BrokerError) -> ErrorResponse {
    let status = match err {
        BrokerError::Unauthorized => StatusCode::UNAUTHORIZED,
        BrokerError::UnknownRoute(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = status;
    response
}

/// Whether the request line waiting on `stream` is a `GET` for `route`.
/// Only peeks, so the bytes stay available to the WebSocket handshake.
async fn requests_route(stream: &TcpStream, route: &str) -> bool {
    let mut buf = [0u8; 1024];
    let Ok(n) = stream.peek(&mut buf).await else {
        return false;
    };
    let head = String::from_utf8_lossy(&buf[..n]);
    let mut parts = head.lines().next().unwrap_or_default().split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => target.split('?').next() == Some(route),
        _ => false,
    }
}

/// Answer a plain HTTP request with the server counters as JSON.
async fn serve_vars(stream: TcpStream, server: &Server) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || line.trim_end().is_empty() {
            break;
        }
    }

    let body = serde_json::to_string(&server.stats()).map_err(std::io::Error::other)?;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
