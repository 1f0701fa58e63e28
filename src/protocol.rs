//! The two message shapes exchanged between agents and the host, and their
//! JSON encodings.
//!
//! Messages travel as concatenated JSON objects over TLS (see
//! [`transport::codec`](crate::transport::codec)). Field names are
//! capitalized and byte fields are base64 strings, which keeps the encoding
//! identical to what existing deployments produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The type tag of a [`HostMessage`] or [`ClientMessage`].
///
/// `Register`, `Heartbeat`, `Authorization`, and `Decode` are control types
/// owned by the transport; everything else is an application-defined log
/// type which passes through opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MessageType {
    Register,
    Heartbeat,
    Authorization,
    Decode,
    Log(String),
}

impl From<MessageType> for String {
    fn from(message_type: MessageType) -> String {
        match message_type {
            MessageType::Register => "Register".into(),
            MessageType::Heartbeat => "Heartbeat".into(),
            MessageType::Authorization => "Authorization".into(),
            MessageType::Decode => "Decode".into(),
            MessageType::Log(name) => name,
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> MessageType {
        match name.as_str() {
            "Register" => MessageType::Register,
            "Heartbeat" => MessageType::Heartbeat,
            "Authorization" => MessageType::Authorization,
            "Decode" => MessageType::Decode,
            _ => MessageType::Log(name),
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from(self.clone()))
    }
}

/// Outcome of handling a [`HostMessage`], reported back to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Successful,
    Failed,
}

/// A frame sent from an agent to the host: either a control message
/// (registration, heartbeat) or one spooled log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostMessage {
    /// Spool id of the record, echoed back in the ack. Empty for control
    /// messages.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "Type")]
    pub message_type: MessageType,
    #[serde(default = "zero_time")]
    pub time: DateTime<Utc>,
    /// The log line itself, or the registration password.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub message: Vec<u8>,
    /// Serialized structured payload attached to the log line.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
}

impl HostMessage {
    /// The registration handshake carrying the shared password as its body.
    pub fn register(machine: &str, service: &str, password: &str) -> Self {
        HostMessage {
            id: String::new(),
            message_type: MessageType::Register,
            time: Utc::now(),
            message: password.as_bytes().to_vec(),
            context: Vec::new(),
            machine: machine.to_string(),
            service: service.to_string(),
        }
    }

    /// A zero-body liveness tick.
    pub fn heartbeat(machine: &str, service: &str) -> Self {
        HostMessage {
            id: String::new(),
            message_type: MessageType::Heartbeat,
            time: Utc::now(),
            message: Vec::new(),
            context: Vec::new(),
            machine: machine.to_string(),
            service: service.to_string(),
        }
    }

    /// One log record lifted out of the spool.
    pub fn log(
        id: String,
        log_type: String,
        time: DateTime<Utc>,
        message: Vec<u8>,
        context: Vec<u8>,
    ) -> Self {
        HostMessage {
            id,
            message_type: MessageType::Log(log_type),
            time,
            message,
            context,
            machine: String::new(),
            service: String::new(),
        }
    }
}

/// A frame sent from the host back to an agent: an ack for a specific
/// record (non-empty `id`), an ack for a control message, or a transport
/// error (`Authorization`, `Decode`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientMessage {
    #[serde(rename = "Type")]
    pub message_type: MessageType,
    pub status: Status,
    /// Human-readable failure description; empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
}

impl ClientMessage {
    pub fn successful(message_type: MessageType, id: &str) -> Self {
        ClientMessage {
            message_type,
            status: Status::Successful,
            message: String::new(),
            id: id.to_string(),
        }
    }

    pub fn failed(message_type: MessageType, id: &str, detail: impl Display) -> Self {
        ClientMessage {
            message_type,
            status: Status::Failed,
            message: detail.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == Status::Successful
    }
}

fn zero_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
