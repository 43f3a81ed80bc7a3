//! Validation errors for tunnel messages

use thiserror::Error;

/// Reasons a [`Message`](crate::Message) fails validation.
///
/// Each invariant violation maps to exactly one variant so callers can
/// distinguish which field was wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The message ID is empty
    #[error("invalid message ID")]
    InvalidMessageId,

    /// The message type is not one of the known variants
    #[error("invalid message type")]
    InvalidMessageType,

    /// A request message carries no action or an unknown one
    #[error("invalid action")]
    InvalidAction,

    /// A response message does not reference the message it answers
    #[error("missing replyTo for response message")]
    MissingReplyTo,
}
