use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, MessageKind, MessageRecord, MessageState, OutgoingMessage, wire_time};
use crate::timeline::MessageRef;
use crate::{ChatId, CoreError, Id, LocalId, MAX_FRAME_BYTES, UserId, now_unix_ms};

const TYPE_CHAT: &str = "chat";
const TYPE_NEW_MESSAGE: &str = "new_message";
const TYPE_TYPING: &str = "typing";
const TYPE_USER_STATUS: &str = "user_status";
const TYPE_CALL_OFFER: &str = "call_offer";
const TYPE_CALL_ANSWER: &str = "call_answer";
const TYPE_CALL_REJECT: &str = "call_reject";
const TYPE_CALL_END: &str = "call_end";
const TYPE_MESSAGE_READ: &str = "message_read";
const TYPE_USER_JOINED: &str = "user_joined";
const TYPE_USER_LEFT: &str = "user_left";
const TYPE_NEW_CONTACT: &str = "new_contact";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    ChatMessage,
    TypingIndicator,
    Presence,
    CallOffer,
    CallAnswer,
    CallReject,
    CallEnd,
    MessageRead,
    UserJoined,
    UserLeft,
    ContactAdded,
}

/// Relayed chat content as one client sends it to the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    pub chat_id: ChatId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Id>,
}

impl ChatFrame {
    /// Relayed frames are never persisted, so the receive time stands in for
    /// the missing server timestamp.
    pub fn to_message(&self, sender_id: UserId, received_at: i64) -> Message {
        Message {
            id: None,
            local_id: self.local_id.clone().unwrap_or_else(LocalId::generate),
            chat_id: self.chat_id.clone(),
            sender_id,
            content: self.content.clone(),
            kind: self.message_type.clone(),
            created_at: received_at,
            state: MessageState::Sent,
            reply_to_id: self.reply_to_id.clone(),
            edited: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    pub chat_id: ChatId,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    pub user_id: UserId,
    pub status: String,
}

impl StatusNotice {
    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("online")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOffer {
    pub target_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default)]
    pub offer: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnswer {
    pub target_user_id: UserId,
    #[serde(default)]
    pub answer: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTarget {
    pub target_user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Delivered,
    #[default]
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(default)]
    pub status: ReceiptStatus,
}

impl ReadReceipt {
    pub fn state(&self) -> MessageState {
        match self.status {
            ReceiptStatus::Delivered => MessageState::Delivered,
            ReceiptStatus::Read => MessageState::Read,
        }
    }

    /// Server id wins over local id when both are present.
    pub fn target(&self) -> Option<MessageRef> {
        self.message_id
            .clone()
            .map(MessageRef::Server)
            .or_else(|| self.local_id.clone().map(MessageRef::Local))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactNotice {
    pub contact_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactInfo>,
    #[serde(default)]
    pub nickname: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Chat(ChatFrame),
    NewMessage(MessageRecord),
    Typing(TypingNotice),
    UserStatus(StatusNotice),
    CallOffer(CallOffer),
    CallAnswer(CallAnswer),
    CallReject(CallTarget),
    CallEnd(CallTarget),
    MessageRead(ReadReceipt),
    UserJoined(Membership),
    UserLeft(Membership),
    NewContact(ContactNotice),
}

impl Payload {
    pub fn wire_type(&self) -> &'static str {
        match self {
            Payload::Chat(_) => TYPE_CHAT,
            Payload::NewMessage(_) => TYPE_NEW_MESSAGE,
            Payload::Typing(_) => TYPE_TYPING,
            Payload::UserStatus(_) => TYPE_USER_STATUS,
            Payload::CallOffer(_) => TYPE_CALL_OFFER,
            Payload::CallAnswer(_) => TYPE_CALL_ANSWER,
            Payload::CallReject(_) => TYPE_CALL_REJECT,
            Payload::CallEnd(_) => TYPE_CALL_END,
            Payload::MessageRead(_) => TYPE_MESSAGE_READ,
            Payload::UserJoined(_) => TYPE_USER_JOINED,
            Payload::UserLeft(_) => TYPE_USER_LEFT,
            Payload::NewContact(_) => TYPE_NEW_CONTACT,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Payload::Chat(_) | Payload::NewMessage(_) => EnvelopeKind::ChatMessage,
            Payload::Typing(_) => EnvelopeKind::TypingIndicator,
            Payload::UserStatus(_) => EnvelopeKind::Presence,
            Payload::CallOffer(_) => EnvelopeKind::CallOffer,
            Payload::CallAnswer(_) => EnvelopeKind::CallAnswer,
            Payload::CallReject(_) => EnvelopeKind::CallReject,
            Payload::CallEnd(_) => EnvelopeKind::CallEnd,
            Payload::MessageRead(_) => EnvelopeKind::MessageRead,
            Payload::UserJoined(_) => EnvelopeKind::UserJoined,
            Payload::UserLeft(_) => EnvelopeKind::UserLeft,
            Payload::NewContact(_) => EnvelopeKind::ContactAdded,
        }
    }

    fn from_wire(wire_type: &str, data: Value) -> Result<Self, CoreError> {
        Ok(match wire_type {
            TYPE_CHAT => Payload::Chat(parse_data(TYPE_CHAT, data)?),
            TYPE_NEW_MESSAGE => Payload::NewMessage(parse_data(TYPE_NEW_MESSAGE, data)?),
            TYPE_TYPING => Payload::Typing(parse_data(TYPE_TYPING, data)?),
            TYPE_USER_STATUS => Payload::UserStatus(parse_data(TYPE_USER_STATUS, data)?),
            TYPE_CALL_OFFER => Payload::CallOffer(parse_data(TYPE_CALL_OFFER, data)?),
            TYPE_CALL_ANSWER => Payload::CallAnswer(parse_data(TYPE_CALL_ANSWER, data)?),
            TYPE_CALL_REJECT => Payload::CallReject(parse_data(TYPE_CALL_REJECT, data)?),
            TYPE_CALL_END => Payload::CallEnd(parse_data(TYPE_CALL_END, data)?),
            TYPE_MESSAGE_READ => Payload::MessageRead(parse_data(TYPE_MESSAGE_READ, data)?),
            TYPE_USER_JOINED => Payload::UserJoined(parse_data(TYPE_USER_JOINED, data)?),
            TYPE_USER_LEFT => Payload::UserLeft(parse_data(TYPE_USER_LEFT, data)?),
            TYPE_NEW_CONTACT => Payload::NewContact(parse_data(TYPE_NEW_CONTACT, data)?),
            other => return Err(CoreError::UnknownEnvelopeType(other.to_owned())),
        })
    }

    fn to_data(&self) -> Result<Value, CoreError> {
        let data = match self {
            Payload::Chat(data) => serde_json::to_value(data),
            Payload::NewMessage(data) => serde_json::to_value(data),
            Payload::Typing(data) => serde_json::to_value(data),
            Payload::UserStatus(data) => serde_json::to_value(data),
            Payload::CallOffer(data) => serde_json::to_value(data),
            Payload::CallAnswer(data) => serde_json::to_value(data),
            Payload::CallReject(data) | Payload::CallEnd(data) => serde_json::to_value(data),
            Payload::MessageRead(data) => serde_json::to_value(data),
            Payload::UserJoined(data) | Payload::UserLeft(data) => serde_json::to_value(data),
            Payload::NewContact(data) => serde_json::to_value(data),
        };
        data.map_err(|err| CoreError::Serialization(err.to_string()))
    }
}

fn parse_data<T: DeserializeOwned>(kind: &'static str, data: Value) -> Result<T, CoreError> {
    serde_json::from_value(data).map_err(|err| CoreError::InvalidPayload {
        kind,
        reason: err.to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    wire_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default, with = "wire_time")]
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
}

/// One realtime unit on the wire: `{"type", "data", "timestamp"}` plus the
/// `user_id` the server stamps on relayed frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload: Payload,
    pub sent_at: i64,
    pub origin_user_id: Option<UserId>,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            sent_at: now_unix_ms(),
            origin_user_id: None,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        match &self.payload {
            Payload::Chat(frame) => Some(&frame.chat_id),
            Payload::NewMessage(record) => Some(&record.chat_id),
            Payload::Typing(notice) => Some(&notice.chat_id),
            Payload::MessageRead(receipt) => receipt.chat_id.as_ref(),
            Payload::UserJoined(membership) | Payload::UserLeft(membership) => {
                membership.chat_id.as_ref()
            }
            _ => None,
        }
    }

    pub fn chat(message: &OutgoingMessage) -> Self {
        Self::new(Payload::Chat(ChatFrame {
            chat_id: message.chat_id.clone(),
            content: message.content.clone(),
            message_type: message.kind.clone(),
            local_id: Some(message.local_id.clone()),
            reply_to_id: message.reply_to_id.clone(),
        }))
    }

    pub fn typing(chat_id: ChatId, is_typing: bool) -> Self {
        Self::new(Payload::Typing(TypingNotice {
            chat_id,
            is_typing,
            user_id: None,
        }))
    }

    pub fn read_receipt(message_id: Id, chat_id: Option<ChatId>) -> Self {
        Self::new(Payload::MessageRead(ReadReceipt {
            message_id: Some(message_id),
            local_id: None,
            chat_id,
            status: ReceiptStatus::Read,
        }))
    }

    pub fn call_offer(target_user_id: UserId, call_type: Option<String>, offer: Value) -> Self {
        Self::new(Payload::CallOffer(CallOffer {
            target_user_id,
            call_type,
            offer,
        }))
    }

    pub fn call_answer(target_user_id: UserId, answer: Value) -> Self {
        Self::new(Payload::CallAnswer(CallAnswer {
            target_user_id,
            answer,
        }))
    }

    pub fn call_reject(target_user_id: UserId) -> Self {
        Self::new(Payload::CallReject(CallTarget { target_user_id }))
    }

    pub fn call_end(target_user_id: UserId) -> Self {
        Self::new(Payload::CallEnd(CallTarget { target_user_id }))
    }

    pub fn encode(&self) -> Result<String, CoreError> {
        let wire = WireEnvelope {
            wire_type: self.payload.wire_type().to_owned(),
            data: self.payload.to_data()?,
            timestamp: self.sent_at,
            user_id: self.origin_user_id.clone(),
        };
        serde_json::to_string(&wire).map_err(|err| CoreError::Serialization(err.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, CoreError> {
        let wire: WireEnvelope =
            serde_json::from_str(text).map_err(|err| CoreError::Serialization(err.to_string()))?;
        Ok(Self {
            payload: Payload::from_wire(&wire.wire_type, wire.data)?,
            sent_at: wire.timestamp,
            origin_user_id: wire.user_id,
        })
    }
}

pub fn encode_frame(envelope: &Envelope) -> Result<String, CoreError> {
    let text = envelope.encode()?;
    if text.len() > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(text)
}

/// Decodes one transport frame. The server may batch several envelopes into a
/// single frame separated by newlines; each line decodes independently so one
/// bad line does not take the rest down with it.
pub fn decode_frame(frame: &str) -> Vec<Result<Envelope, CoreError>> {
    if frame.len() > MAX_FRAME_BYTES {
        return vec![Err(CoreError::FrameTooLarge {
            max: MAX_FRAME_BYTES,
        })];
    }
    let decoded: Vec<_> = frame
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Envelope::decode)
        .collect();
    if decoded.is_empty() {
        return vec![Err(CoreError::EmptyFrame)];
    }
    decoded
}
