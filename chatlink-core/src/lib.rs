use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod envelope;
pub mod message;
pub mod timeline;

pub use envelope::{
    CallAnswer, CallOffer, CallTarget, ChatFrame, ContactInfo, ContactNotice, Envelope,
    EnvelopeKind, Membership, Payload, ReadReceipt, ReceiptStatus, StatusNotice, TypingNotice,
    decode_frame, encode_frame,
};
pub use message::{Message, MessageKind, MessageRecord, MessageState, OutgoingMessage};
pub use timeline::{ChatTimeline, MessageRef, ReceiptBuffer, TimelineDiff};

pub const MAX_FRAME_BYTES: usize = 512 * 1024;
pub const NORMAL_CLOSE_CODE: u16 = 1000;
pub const CLIENT_CLOSE_REASON: &str = "Client disconnecting";
/// Receipts held for messages not seen yet, per buffer.
pub const DEFAULT_RECEIPT_BUFFER: usize = 256;
const SERVER_LOCAL_ID_PREFIX: &str = "srv:";

/// Server-assigned identifier. Deployments have shipped both numeric ids and
/// UUID strings, so both are accepted and re-encoded in the form they arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Num(u64),
    Text(String),
}

pub type ChatId = Id;
pub type UserId = Id;

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Num(value) => write!(f, "{value}"),
            Id::Text(value) => f.write_str(value),
        }
    }
}

impl FromStr for Id {
    type Err = Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.parse::<u64>() {
            Ok(number) => Id::Num(number),
            Err(_) => Id::Text(value.to_owned()),
        })
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id::Num(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Text(value.to_owned())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::Text(value)
    }
}

/// Client-generated identity of a message. It is fixed at composition time and
/// survives retries, which is what lets a server echo be matched to its draft.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Deterministic local id for a server record that carried none, so merging
    /// the same record twice lands on the same entry.
    #[must_use]
    pub fn for_server_id(id: &Id) -> Self {
        Self(format!("{SERVER_LOCAL_ID_PREFIX}{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(SERVER_LOCAL_ID_PREFIX)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocalId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for LocalId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("frame exceeds max size of {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("unknown envelope type {0:?}")]
    UnknownEnvelopeType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
