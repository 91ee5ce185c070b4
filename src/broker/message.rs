//! Message envelope
//!
//! A `Message` is created once per send and never mutated afterwards. Its
//! header always carries:
//! - `id`: UUID used as the sole key for acknowledgment bookkeeping
//! - `content-type`: one of `string`, `int`, `bool`, `application/json`
//!   (or `ack` for acknowledgment frames)
//! - `date` and `host`: provenance of the broker that created it
//!
//! JSON payloads additionally carry `application-type`, the Rust type name
//! of the value that was encoded.
//!
//! On the wire the envelope is `{"metadata": {...}, "data": "..."}`, with
//! `metadata` omitted when empty.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::utils::error::BrokerError;

pub type Header = BTreeMap<String, String>;
pub type MessageId = String;

pub const HEADER_ID: &str = "id";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_APPLICATION_TYPE: &str = "application-type";
pub const HEADER_DATE: &str = "date";
pub const HEADER_HOST: &str = "host";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Text,
    Int,
    Bool,
    Json,
    Ack,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "string",
            ContentType::Int => "int",
            ContentType::Bool => "bool",
            ContentType::Json => "application/json",
            ContentType::Ack => "ack",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "string" => Some(ContentType::Text),
            "int" => Some(ContentType::Int),
            "bool" => Some(ContentType::Bool),
            "application/json" => Some(ContentType::Json),
            "ack" => Some(ContentType::Ack),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can be sent through a queue or published on a topic.
///
/// Strings, signed integers and booleans are sent as their plain text
/// representation. Any other `Serialize` value is wrapped in [`Json`].
pub trait Payload {
    fn content_type(&self) -> ContentType;

    fn encode(&self) -> Result<String, serde_json::Error>;

    /// Logical type of a JSON payload.
    fn application_type(&self) -> Option<&'static str> {
        None
    }
}

impl Payload for str {
    fn content_type(&self) -> ContentType {
        ContentType::Text
    }

    fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(self.to_string())
    }
}

impl Payload for String {
    fn content_type(&self) -> ContentType {
        ContentType::Text
    }

    fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(self.clone())
    }
}

impl Payload for bool {
    fn content_type(&self) -> ContentType {
        ContentType::Bool
    }

    fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(self.to_string())
    }
}

macro_rules! int_payload {
    ($($t:ty),*) => {
        $(
            impl Payload for $t {
                fn content_type(&self) -> ContentType {
                    ContentType::Int
                }

                fn encode(&self) -> Result<String, serde_json::Error> {
                    Ok(self.to_string())
                }
            }
        )*
    };
}

int_payload!(i8, i16, i32, i64, i128, isize);

impl<T: Payload + ?Sized> Payload for &T {
    fn content_type(&self) -> ContentType {
        (**self).content_type()
    }

    fn encode(&self) -> Result<String, serde_json::Error> {
        (**self).encode()
    }

    fn application_type(&self) -> Option<&'static str> {
        (**self).application_type()
    }
}

/// Sends `T` as `application/json`, recording its type name.
#[derive(Debug, Clone)]
pub struct Json<T>(pub T);

impl<T: Serialize> Payload for Json<T> {
    fn content_type(&self) -> ContentType {
        ContentType::Json
    }

    fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    fn application_type(&self) -> Option<&'static str> {
        Some(std::any::type_name::<T>())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(
        rename = "metadata",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    header: Header,
    #[serde(rename = "data", default)]
    body: String,
}

impl Message {
    /// Classify and encode `payload`, then stamp id, date and host.
    pub fn new<P: Payload + ?Sized>(payload: &P) -> Result<Self, BrokerError> {
        let body = payload.encode()?;
        let mut header = Header::new();
        header.insert(
            HEADER_CONTENT_TYPE.to_string(),
            payload.content_type().as_str().to_string(),
        );
        if let Some(application_type) = payload.application_type() {
            header.insert(
                HEADER_APPLICATION_TYPE.to_string(),
                application_type.to_string(),
            );
        }
        Ok(Self::stamped(header, body))
    }

    /// Acknowledgment frame for the message identified by `message_id`.
    pub fn ack(message_id: &str) -> Self {
        let mut header = Header::new();
        header.insert(
            HEADER_CONTENT_TYPE.to_string(),
            ContentType::Ack.as_str().to_string(),
        );
        Self::stamped(header, message_id.to_string())
    }

    fn stamped(mut header: Header, body: String) -> Self {
        header.insert(HEADER_ID.to_string(), Uuid::new_v4().to_string());
        header.insert(HEADER_DATE.to_string(), chrono::Utc::now().to_rfc3339());
        header.insert(HEADER_HOST.to_string(), local_hostname().to_string());
        Self { header, body }
    }

    /// Empty for frames that were not produced by this crate.
    pub fn id(&self) -> &str {
        self.header.get(HEADER_ID).map(String::as_str).unwrap_or("")
    }

    pub fn content_type(&self) -> Option<ContentType> {
        self.header
            .get(HEADER_CONTENT_TYPE)
            .and_then(|v| ContentType::parse(v))
    }

    /// `None` unless the content type is `application/json`.
    pub fn application_type(&self) -> Option<&str> {
        self.header.get(HEADER_APPLICATION_TYPE).map(String::as_str)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Id of the message this frame acknowledges, if it is an ack frame.
    pub fn acknowledged_id(&self) -> Option<&str> {
        match self.content_type() {
            Some(ContentType::Ack) => Some(self.body.as_str()),
            _ => None,
        }
    }

    /// Decode the body as JSON. Works for `int`, `bool` and
    /// `application/json` bodies.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_frame(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::text(self.to_json()?))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---HEADER---")?;
        for (key, value) in &self.header {
            writeln!(f, "{key}:{value}")?;
        }
        writeln!(f, "---BODY---")?;
        write!(f, "{}", self.body)
    }
}

fn local_hostname() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default()
    })
}
