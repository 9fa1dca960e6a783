//! # Client Errors
//!
//! Failure taxonomy surfaced by a protocol client. The harness treats every
//! variant as a transport fault it does not retry; retry policy belongs to
//! the calling scenario.

use crate::types::{ConversationId, InboxId};
use thiserror::Error;

/// Errors surfaced by a protocol client or its transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Transport is offline (simulated disconnect window or network down).
    #[error("transport offline")]
    Offline,

    /// Generic transport failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The conversation id is unknown to the network.
    #[error("unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    /// The caller is not a member of the conversation.
    #[error("not a member of conversation {0}")]
    NotAMember(ConversationId),

    /// The target inbox is not registered on the network.
    #[error("unknown inbox: {0}")]
    UnknownInbox(InboxId),

    /// Local database failure (unreadable snapshot, wrong storage key, io).
    #[error("local storage failure: {0}")]
    Storage(String),

    /// The signer's proof of account ownership was rejected.
    #[error("identity verification failed: {0}")]
    IdentityVerification(String),

    /// No builder is registered for the requested protocol version.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
}
