//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Message envelope and wire codec."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
//! Envelope model and the JSON wire codec.
//!
//! On the wire an envelope looks like:
//!
//! ```json
//! {
//!   "header": {
//!     "version": "4.0",
//!     "messageType": "Reply",
//!     "id": "r1",
//!     "messageDescription": { "topic": "AlexaClient", "action": "GetState", "replyToId": "m1" }
//!   },
//!   "payload": { "state": "IDLE" }
//! }
//! ```
//!
//! The payload is opaque to the broker. A payload that is itself a JSON
//! document is embedded verbatim; any other text travels as a JSON string.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

/// Protocol version stamped into every outbound header.
pub const PROTOCOL_VERSION: &str = "4.0";

/// Payload key conventionally used to reference a binary stream.
pub const STREAM_ID_KEY: &str = "streamId";

/// Discriminates ordinary publishes from replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Directive, event or request.
    Publish,
    /// Answer to an earlier message, identified by `replyToId`.
    Reply,
}

/// Routed unit of communication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Envelope {
    /// Sender-generated identifier, unique among in-flight messages.
    pub message_id: String,
    /// Identifier of the message this envelope answers.
    pub reply_to_id: Option<String>,
    /// Coarse routing category (e.g. `Navigation`).
    pub topic: String,
    /// Operation within the topic (e.g. `StartNavigation`).
    pub action: String,
    /// Opaque payload text, usually JSON.
    pub payload: String,
}

/// Generate a fresh message identifier.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Envelope {
    /// Build a publish envelope with a freshly generated message id.
    pub fn new(
        topic: impl Into<String>,
        action: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            reply_to_id: None,
            topic: topic.into(),
            action: action.into(),
            payload: payload.into(),
        }
    }

    /// Build a reply to `request`, reusing its topic and action.
    pub fn reply_to(request: &Envelope, payload: impl Into<String>) -> Self {
        Self {
            message_id: new_message_id(),
            reply_to_id: Some(request.message_id.clone()),
            topic: request.topic.clone(),
            action: request.action.clone(),
            payload: payload.into(),
        }
    }

    /// Replace the generated message id.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Mark the envelope as a reply to `reply_to_id`.
    pub fn with_reply_to(mut self, reply_to_id: impl Into<String>) -> Self {
        self.reply_to_id = Some(reply_to_id.into());
        self
    }

    /// Whether the envelope answers another message.
    pub fn is_reply(&self) -> bool {
        self.reply_to_id.is_some()
    }

    /// Wire message type derived from the reply marker.
    pub fn message_type(&self) -> MessageType {
        if self.is_reply() {
            MessageType::Reply
        } else {
            MessageType::Publish
        }
    }

    /// Interpret the payload according to a topic/action specific schema.
    pub fn payload_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.payload)
    }

    /// Stream identifier carried inside the payload, if any.
    pub fn stream_id(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(&self.payload).ok()?;
        value
            .get(STREAM_ID_KEY)
            .and_then(|id| id.as_str())
            .map(str::to_owned)
    }

    /// Check the structural invariants every routable envelope satisfies.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.message_id.is_empty() {
            return Err(DecodeError::InvalidField {
                field: "header.id",
                reason: "must not be empty",
            });
        }
        if self.topic.is_empty() {
            return Err(DecodeError::InvalidField {
                field: "header.messageDescription.topic",
                reason: "must not be empty",
            });
        }
        if self.action.is_empty() {
            return Err(DecodeError::InvalidField {
                field: "header.messageDescription.action",
                reason: "must not be empty",
            });
        }
        if matches!(self.reply_to_id.as_deref(), Some("")) {
            return Err(DecodeError::InvalidField {
                field: "header.messageDescription.replyToId",
                reason: "must not be empty",
            });
        }
        Ok(())
    }

    /// Encode into wire bytes. See [`encode`].
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        encode(self)
    }

    /// Decode from wire bytes. See [`decode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }
}

/// Reasons an inbound message is rejected before dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Bytes are not a JSON object of the expected shape.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A required field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    /// A field is present but unusable.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Short description of the problem.
        reason: &'static str,
    },
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    header: OutboundHeader<'a>,
    payload: Box<RawValue>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundHeader<'a> {
    version: &'static str,
    message_type: MessageType,
    id: &'a str,
    message_description: OutboundDescription<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundDescription<'a> {
    topic: &'a str,
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct InboundMessage {
    header: Option<InboundHeader>,
    #[serde(default, deserialize_with = "present")]
    payload: Option<Option<Box<RawValue>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundHeader {
    message_type: Option<String>,
    id: Option<String>,
    message_description: Option<InboundDescription>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundDescription {
    topic: Option<String>,
    action: Option<String>,
    reply_to_id: Option<String>,
}

// Distinguishes `"payload": null` (Some(None)) from an absent key (None).
fn present<'de, D>(deserializer: D) -> Result<Option<Option<Box<RawValue>>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Box<RawValue>>::deserialize(deserializer).map(Some)
}

fn embeds_as_document(payload: &str) -> bool {
    if payload.is_empty() || payload.trim().len() != payload.len() {
        return false;
    }
    if payload.starts_with('"') || payload == "null" {
        return false;
    }
    serde_json::from_str::<&RawValue>(payload).is_ok()
}

fn payload_to_raw(payload: &str) -> serde_json::Result<Box<RawValue>> {
    if embeds_as_document(payload) {
        RawValue::from_string(payload.to_owned())
    } else {
        serde_json::value::to_raw_value(payload)
    }
}

fn payload_from_raw(raw: &RawValue) -> Result<String, DecodeError> {
    let text = raw.get();
    if text.starts_with('"') {
        Ok(serde_json::from_str::<String>(text)?)
    } else {
        Ok(text.to_owned())
    }
}

/// Encode an envelope into its JSON wire form.
pub fn encode(envelope: &Envelope) -> serde_json::Result<Vec<u8>> {
    let message = OutboundMessage {
        header: OutboundHeader {
            version: PROTOCOL_VERSION,
            message_type: envelope.message_type(),
            id: &envelope.message_id,
            message_description: OutboundDescription {
                topic: &envelope.topic,
                action: &envelope.action,
                reply_to_id: envelope.reply_to_id.as_deref(),
            },
        },
        payload: payload_to_raw(&envelope.payload)?,
    };
    serde_json::to_vec(&message)
}

/// Decode wire bytes into an envelope.
///
/// Fails closed: any structural problem yields a [`DecodeError`] and no
/// partially populated envelope is ever returned.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let inbound: InboundMessage = serde_json::from_slice(bytes)?;
    let header = inbound.header.ok_or(DecodeError::MissingField("header"))?;
    let message_id = header.id.ok_or(DecodeError::MissingField("header.id"))?;
    let description = header
        .message_description
        .ok_or(DecodeError::MissingField("header.messageDescription"))?;
    let topic = description
        .topic
        .ok_or(DecodeError::MissingField("header.messageDescription.topic"))?;
    let action = description
        .action
        .ok_or(DecodeError::MissingField("header.messageDescription.action"))?;
    let payload = match inbound.payload {
        None => return Err(DecodeError::MissingField("payload")),
        Some(None) => String::new(),
        Some(Some(raw)) => payload_from_raw(&raw)?,
    };

    let message_type = match header.message_type.as_deref() {
        None | Some("Publish") => MessageType::Publish,
        Some("Reply") => MessageType::Reply,
        Some(_) => {
            return Err(DecodeError::InvalidField {
                field: "header.messageType",
                reason: "expected `Publish` or `Reply`",
            })
        }
    };
    // Older senders emit an empty replyToId on plain publishes.
    let reply_to_id = description.reply_to_id.filter(|id| !id.is_empty());
    if message_type == MessageType::Reply && reply_to_id.is_none() {
        return Err(DecodeError::InvalidField {
            field: "header.messageDescription.replyToId",
            reason: "reply without a replyToId",
        });
    }

    let envelope = Envelope {
        message_id,
        reply_to_id,
        topic,
        action,
        payload,
    };
    envelope.validate()?;
    Ok(envelope)
}
