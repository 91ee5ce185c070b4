//! Access control
//!
//! An [`Acl`] is a list of entries; a connection request is authorized when
//! the list is empty or any entry matches it:
//! - `WORLD`: everyone
//! - `DIGEST`: HTTP basic credentials equal to `username`/`password`
//! - `IP`: the first `X-Forwarded-For` hop, or else the peer address, equals `ip`
//!
//! The check runs during the WebSocket handshake, before any connection is
//! registered.

use std::net::SocketAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tungstenite::handshake::server::Request;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "UPPERCASE")]
pub enum Ace {
    World,
    Digest { username: String, password: String },
    Ip { ip: String },
}

impl Ace {
    pub fn matches(&self, request: &AccessRequest) -> bool {
        match self {
            Ace::World => true,
            Ace::Digest { username, password } => request
                .credentials
                .as_ref()
                .is_some_and(|(u, p)| u == username && p == password),
            Ace::Ip { ip } => match &request.forwarded_for {
                Some(forwarded) => forwarded == ip,
                None => request.peer.is_some_and(|peer| peer.ip().to_string() == *ip),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Acl(pub Vec<Ace>);

impl Acl {
    pub fn new(entries: Vec<Ace>) -> Self {
        Self(entries)
    }

    pub fn world() -> Self {
        Self(vec![Ace::World])
    }

    pub fn entries(&self) -> &[Ace] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What the gate gets to see of an inbound connection request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRequest {
    pub peer: Option<SocketAddr>,
    pub forwarded_for: Option<String>,
    pub credentials: Option<(String, String)>,
}

impl AccessRequest {
    pub fn from_http(request: &Request, peer: Option<SocketAddr>) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
        };

        let forwarded_for = header("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(|hop| hop.trim().to_string())
            .filter(|hop| !hop.is_empty());

        let credentials = header("authorization").and_then(parse_basic);

        Self {
            peer,
            forwarded_for,
            credentials,
        }
    }
}

fn parse_basic(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Yes/no decision on whether a request may attach to a queue or topic.
pub trait AccessGate: Send + Sync {
    fn authorize(&self, request: &AccessRequest) -> bool;
}

impl AccessGate for Acl {
    fn authorize(&self, request: &AccessRequest) -> bool {
        self.0.is_empty() || self.0.iter().any(|ace| ace.matches(request))
    }
}
