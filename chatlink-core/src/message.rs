use serde::{Deserialize, Serialize};

use crate::{ChatId, Id, LocalId, UserId};

/// Delivery lifecycle of a message. `Sending < Sent < Delivered < Read` is a
/// strict progression; `Failed` sits outside it and is only reachable from
/// `Sending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageState {
    fn rank(self) -> Option<u8> {
        match self {
            MessageState::Sending => Some(0),
            MessageState::Sent => Some(1),
            MessageState::Delivered => Some(2),
            MessageState::Read => Some(3),
            MessageState::Failed => None,
        }
    }

    /// The state reached when `next` is observed while in `self`, or `None`
    /// when the observation is stale or not a legal move.
    ///
    /// A failed message may go back to `Sending` on retry, or straight to a
    /// server-confirmed state when the server reports it after all.
    pub fn advance(self, next: MessageState) -> Option<MessageState> {
        match (self, next) {
            (current, next) if current == next => None,
            (MessageState::Sending, MessageState::Failed) | (MessageState::Failed, _) => Some(next),
            (_, MessageState::Failed) => None,
            (current, next) => match (current.rank(), next.rank()) {
                (Some(from), Some(to)) if to > from => Some(next),
                _ => None,
            },
        }
    }

    pub fn merge(self, other: MessageState) -> MessageState {
        self.advance(other).unwrap_or(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    Voice,
    File,
    Sticker,
    Location,
    System,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Voice => "voice",
            MessageKind::File => "file",
            MessageKind::Sticker => "sticker",
            MessageKind::Location => "location",
            MessageKind::System => "system",
            MessageKind::Other(kind) => kind,
        }
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "text" => MessageKind::Text,
            "image" => MessageKind::Image,
            "video" => MessageKind::Video,
            "audio" => MessageKind::Audio,
            "voice" => MessageKind::Voice,
            "file" => MessageKind::File,
            "sticker" => MessageKind::Sticker,
            "location" => MessageKind::Location,
            "system" => MessageKind::System,
            _ => MessageKind::Other(value),
        }
    }
}

impl From<MessageKind> for String {
    fn from(value: MessageKind) -> Self {
        value.as_str().to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Option<Id>,
    pub local_id: LocalId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: i64,
    pub state: MessageState,
    pub reply_to_id: Option<Id>,
    pub edited: bool,
}

impl Message {
    /// Optimistic entry for a draft that has not been confirmed yet.
    pub fn pending(draft: &OutgoingMessage, sender_id: UserId, created_at: i64) -> Self {
        Self {
            id: None,
            local_id: draft.local_id.clone(),
            chat_id: draft.chat_id.clone(),
            sender_id,
            content: draft.content.clone(),
            kind: draft.kind.clone(),
            created_at,
            state: MessageState::Sending,
            reply_to_id: draft.reply_to_id.clone(),
            edited: false,
        }
    }
}

/// What the client hands to the server when persisting a message. The same
/// `local_id` is reused on every retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub chat_id: ChatId,
    pub local_id: LocalId,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Id>,
}

impl From<&Message> for OutgoingMessage {
    fn from(message: &Message) -> Self {
        Self {
            chat_id: message.chat_id.clone(),
            local_id: message.local_id.clone(),
            content: message.content.clone(),
            kind: message.kind.clone(),
            reply_to_id: message.reply_to_id.clone(),
        }
    }
}

/// Message as the server stores it, shared by REST bodies and `new_message`
/// pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Id,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(with = "wire_time")]
    pub created_at: i64,
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        let state = match record.status {
            None | Some(MessageState::Sending) | Some(MessageState::Failed) => MessageState::Sent,
            Some(state) => state,
        };
        let local_id = record
            .local_id
            .unwrap_or_else(|| LocalId::for_server_id(&record.id));
        Self {
            id: Some(record.id),
            local_id,
            chat_id: record.chat_id,
            sender_id: record.sender_id,
            content: record.content,
            kind: record.kind,
            created_at: record.created_at,
            state,
            reply_to_id: record.reply_to_id,
            edited: record.is_edited,
        }
    }
}

/// Timestamps arrive as epoch milliseconds from clients and as RFC 3339
/// strings from the REST backend; both normalize to epoch milliseconds.
pub(crate) mod wire_time {
    use chrono::DateTime;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTime {
        Millis(i64),
        Fractional(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match RawTime::deserialize(deserializer)? {
            RawTime::Millis(value) => Ok(value),
            RawTime::Fractional(value) => Ok(value as i64),
            RawTime::Text(text) => parse_rfc3339_ms(&text)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp {text:?}"))),
        }
    }

    pub fn parse_rfc3339_ms(text: &str) -> Option<i64> {
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.timestamp_millis())
    }
}
