//! # Core Protocol Types
//!
//! Identifiers and message shapes shared by every client implementation.
//! All ids are opaque strings at the boundary; once obtained they are stable
//! for the lifetime of the entity they name.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Inbox identifier: hex-encoded Keccak-256 of the account's verifying key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InboxId(String);

impl InboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account address: `0x` + hex of the last 20 bytes of Keccak-256(verifying key).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountAddress(String);

impl AccountAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque conversation identifier (direct or group).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque message identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network environment a client is registered against.
///
/// The tag is part of the local database identifier, so the same identity
/// keeps separate state per environment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeshEnv {
    #[default]
    Local,
    Dev,
    Production,
}

impl MeshEnv {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshEnv::Local => "local",
            MeshEnv::Dev => "dev",
            MeshEnv::Production => "production",
        }
    }
}

impl fmt::Display for MeshEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Numeric protocol-version tag selecting a client builder.
///
/// Versions are not assumed API-compatible with each other; each tag maps to
/// its own explicitly registered builder adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const V1: ProtocolVersion = ProtocolVersion(1);
    pub const V2: ProtocolVersion = ProtocolVersion(2);

    #[must_use]
    pub fn tag(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload classification carried by every decoded message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    /// Plain text payload.
    Text,
    /// Group name or metadata change notice.
    GroupMetadata,
    /// Member added/removed notice.
    MembershipChange,
}

impl ContentType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::GroupMetadata => "group_metadata",
            ContentType::MembershipChange => "membership_change",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direct or group conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    Dm,
    Group,
}

/// A message after decryption and decoding, as observed by a member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: InboxId,
    pub content_type: ContentType,
    pub body: String,
    /// Milliseconds since the Unix epoch at send time.
    pub sent_at_ms: u64,
}

/// Fan-out envelope: one decoded message plus the membership snapshot taken
/// at send time. Streams filter on the recipient set, so later membership
/// changes never retroactively affect an already-published event.
#[derive(Clone, Debug)]
pub struct MessageEnvelope {
    pub message: DecodedMessage,
    pub recipients: Vec<InboxId>,
}

/// Registration summary for one inbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboxState {
    pub inbox_id: InboxId,
    pub address: AccountAddress,
    /// Distinct installations (device-equivalent local stores) registered.
    pub installations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ConversationId::generate(), ConversationId::generate());
        assert_ne!(MessageId::generate(), MessageId::generate());
    }

    #[test]
    fn test_env_tags() {
        assert_eq!(MeshEnv::Local.as_str(), "local");
        assert_eq!(MeshEnv::Dev.as_str(), "dev");
        assert_eq!(MeshEnv::Production.as_str(), "production");
        assert_eq!(MeshEnv::default(), MeshEnv::Local);
    }

    #[test]
    fn test_version_ordering() {
        assert!(ProtocolVersion::V1 < ProtocolVersion::V2);
        assert_eq!(ProtocolVersion::V2.to_string(), "2");
    }

    #[test]
    fn test_inbox_id_ordering_is_stable() {
        let a = InboxId::new("aa");
        let b = InboxId::new("bb");
        assert!(a < b);
    }
}
