//! Generic message envelope
//!
//! The envelope carries request/response/broadcast/heartbeat traffic that is
//! not tied to one of the typed request pairs. Unknown `type` and `action`
//! strings decode successfully into the `Unknown` variants so that
//! [`Message::validate`] can report them as validation errors instead of
//! surfacing an opaque decode failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{generate_message_id, timestamp_now, Correlated, Payload, ValidationError};

/// Kind of envelope
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Asks the peer to perform an action
    Request,
    /// Answers a previous request
    Response,
    /// Fan-out notification without a reply
    Broadcast,
    /// Liveness report
    Heartbeat,
    /// Any other type string seen on the wire
    #[default]
    #[serde(other)]
    Unknown,
}

/// Operation requested by a `request` message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Server-side apply of a manifest
    ApplyResource,
    /// List resources of a kind
    ListResources,
    /// Fetch a single resource
    GetResource,
    /// Delete the resource described by a manifest
    DeleteResource,
    /// Merge-patch the resource described by a manifest
    PatchResource,
    /// Create a namespace if it does not exist
    CreateNamespace,
    /// Stream changes to resources of a kind
    WatchResources,
    /// Any other action string seen on the wire
    #[serde(other)]
    Unknown,
}

impl Action {
    /// Wire name of this action
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ApplyResource => "apply-resource",
            Action::ListResources => "list-resources",
            Action::GetResource => "get-resource",
            Action::DeleteResource => "delete-resource",
            Action::PatchResource => "patch-resource",
            Action::CreateNamespace => "create-namespace",
            Action::WatchResources => "watch-resources",
            Action::Unknown => "unknown",
        }
    }
}

/// Generic tunnel envelope.
///
/// Messages are built per send and never mutated afterwards. Empty optional
/// fields are omitted from the JSON form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    #[serde(default)]
    pub id: String,

    /// Envelope kind
    #[serde(rename = "type", default)]
    pub message_type: MessageType,

    /// Requested operation, required for `request`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    /// Open key/value body
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub payload: Payload,

    /// ID of the message this one answers, required for `response`
    #[serde(rename = "replyTo", default, skip_serializing_if = "String::is_empty")]
    pub reply_to: String,

    /// Sender identity
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,

    /// Outcome of a response
    #[serde(default, skip_serializing_if = "is_false")]
    pub success: bool,

    /// Error text of a failed response
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// RFC 3339 creation time
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Message {
    fn base(message_type: MessageType, from: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            message_type,
            action: None,
            payload: Payload::new(),
            reply_to: String::new(),
            from: from.into(),
            success: false,
            error: String::new(),
            timestamp: timestamp_now(),
        }
    }

    /// Build a request asking the peer to perform `action`.
    pub fn request(action: Action, payload: Payload, from: impl Into<String>) -> Self {
        Self {
            action: Some(action),
            payload,
            ..Self::base(MessageType::Request, from)
        }
    }

    /// Build a response to the message with ID `reply_to`.
    ///
    /// `error` is ignored when `success` is true.
    pub fn response(
        reply_to: impl Into<String>,
        success: bool,
        payload: Payload,
        error: Option<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            reply_to: reply_to.into(),
            success,
            payload,
            error: if success {
                String::new()
            } else {
                error.unwrap_or_default()
            },
            ..Self::base(MessageType::Response, from)
        }
    }

    /// Build a broadcast notification.
    pub fn broadcast(action: Option<Action>, payload: Payload, from: impl Into<String>) -> Self {
        Self {
            action,
            payload,
            ..Self::base(MessageType::Broadcast, from)
        }
    }

    /// Build a heartbeat carrying `sequence` and the send time.
    pub fn heartbeat(from: impl Into<String>, sequence: u64) -> Self {
        let mut msg = Self::base(MessageType::Heartbeat, from);
        msg.payload
            .insert("sequence".to_string(), Value::from(sequence));
        msg.payload
            .insert("timestamp".to_string(), Value::from(msg.timestamp.clone()));
        msg
    }

    /// Check the envelope invariants.
    ///
    /// Checks run in field order so the first violated invariant is the one
    /// reported.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::InvalidMessageId);
        }

        match self.message_type {
            MessageType::Unknown => Err(ValidationError::InvalidMessageType),
            MessageType::Request => match self.action {
                None | Some(Action::Unknown) => Err(ValidationError::InvalidAction),
                Some(_) => Ok(()),
            },
            MessageType::Response if self.reply_to.is_empty() => {
                Err(ValidationError::MissingReplyTo)
            }
            MessageType::Response | MessageType::Broadcast | MessageType::Heartbeat => Ok(()),
        }
    }

    /// Heartbeat sequence number, if this is a well-formed heartbeat
    pub fn heartbeat_sequence(&self) -> Option<u64> {
        if self.message_type != MessageType::Heartbeat {
            return None;
        }
        self.payload.get("sequence").and_then(Value::as_u64)
    }
}

impl Correlated for Message {
    fn correlation_id(&self) -> &str {
        match self.message_type {
            MessageType::Response => &self.reply_to,
            _ => &self.id,
        }
    }
}
