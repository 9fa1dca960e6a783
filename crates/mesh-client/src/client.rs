//! # Protocol Client Boundary
//!
//! The narrow interface the harness consumes from the Meshwire client
//! library. Every method here is potentially slow and potentially failing;
//! callers treat the client as an opaque collaborator and never retry on its
//! behalf.
//!
//! ## Surface
//!
//! | Trait              | Role                                              |
//! |--------------------|---------------------------------------------------|
//! | [`MeshSigner`]     | Proves account ownership at client creation       |
//! | [`MeshClient`]     | One registered installation on the network        |
//! | [`MeshConversation`] | One direct or group channel                     |
//!
//! [`MessageStream`] is the live event subscription returned by
//! `stream_all_messages`; it delivers every message addressed to the client's
//! inbox, including the client's own sends.

use crate::error::ClientError;
use crate::netsim::{FaultDecision, FaultInjector};
use crate::types::{
    AccountAddress, ConversationId, DecodedMessage, InboxId, InboxState, MeshEnv, MessageEnvelope,
    MessageId, ProtocolVersion,
};
use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use sha3::{Digest, Keccak256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use zeroize::Zeroize;

/// Derive the account address from a verifying key: `0x` + hex of the last
/// 20 bytes of Keccak-256(key).
#[must_use]
pub fn derive_address(verifying_key: &[u8; 32]) -> AccountAddress {
    let digest = Keccak256::digest(verifying_key);
    AccountAddress::new(format!("0x{}", hex::encode(&digest[12..])))
}

/// Derive the inbox id from a verifying key: hex of Keccak-256(key).
#[must_use]
pub fn derive_inbox_id(verifying_key: &[u8; 32]) -> InboxId {
    InboxId::new(hex::encode(Keccak256::digest(verifying_key)))
}

/// Signer proving account ownership when a client is created.
pub trait MeshSigner: Send + Sync {
    /// Account address derived from the verifying key.
    fn address(&self) -> AccountAddress;

    /// Raw Ed25519 verifying key bytes.
    fn verifying_key(&self) -> [u8; 32];

    /// Sign an arbitrary payload.
    fn sign(&self, message: &[u8]) -> [u8; 64];
}

/// Ed25519-backed signer over a 32-byte seed.
pub struct KeypairSigner {
    signing_key: SigningKey,
}

impl KeypairSigner {
    /// Restore a signer from its secret seed.
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Generate a random signer.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::thread_rng()),
        }
    }

    /// Secret seed for persistence.
    #[must_use]
    pub fn to_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl MeshSigner for KeypairSigner {
    fn address(&self) -> AccountAddress {
        derive_address(&self.signing_key.verifying_key().to_bytes())
    }

    fn verifying_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl Drop for KeypairSigner {
    fn drop(&mut self) {
        // Zeroize secret key material
        let mut bytes = self.signing_key.to_bytes();
        bytes.zeroize();
    }
}

/// Symmetric key encrypting the client's local database (256-bit).
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct StorageKey([u8; 32]);

impl StorageKey {
    /// Create from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Get inner bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Options passed to a client builder.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Network environment to register against.
    pub env: MeshEnv,
    /// Location of the client's encrypted local database file.
    pub storage_path: PathBuf,
}

/// Live subscription to every message addressed to one inbox.
///
/// Mirrors the bus-subscription shape: `next` skips lagged gaps rather than
/// failing, and returns `None` only when the backing network is gone.
pub struct MessageStream {
    receiver: broadcast::Receiver<MessageEnvelope>,
    inbox_id: InboxId,
    injector: Option<Arc<FaultInjector>>,
}

impl MessageStream {
    pub(crate) fn new(receiver: broadcast::Receiver<MessageEnvelope>, inbox_id: InboxId) -> Self {
        Self {
            receiver,
            inbox_id,
            injector: None,
        }
    }

    /// Route inbound events through a fault injector (drops and delays apply
    /// before the caller observes the event).
    #[must_use]
    pub(crate) fn with_injector(mut self, injector: Arc<FaultInjector>) -> Self {
        self.injector = Some(injector);
        self
    }

    /// Receive the next message addressed to this inbox.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(message))` - the next delivered message
    /// - `Some(Err(_))` - a transport/decode fault on the stream
    /// - `None` - the backing network was dropped
    pub async fn next(&mut self) -> Option<Result<DecodedMessage, ClientError>> {
        loop {
            let envelope = match self.receiver.recv().await {
                Ok(e) => e,
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    debug!(lagged = count, "message stream lagged, events dropped");
                    continue;
                }
            };

            if !envelope.recipients.contains(&self.inbox_id) {
                continue;
            }

            if let Some(injector) = &self.injector {
                match injector.inbound(envelope.message.body.len()).await {
                    FaultDecision::Deliver => {}
                    FaultDecision::Drop => continue,
                }
            }

            return Some(Ok(envelope.message));
        }
    }
}

/// One registered installation of a Meshwire account.
#[async_trait]
pub trait MeshClient: Send + Sync {
    /// Inbox id this client receives under.
    fn inbox_id(&self) -> InboxId;

    /// Account address this client is registered to.
    fn address(&self) -> AccountAddress;

    /// Protocol version of the underlying library build.
    fn version(&self) -> ProtocolVersion;

    /// Pull the full conversation list from the network into local state.
    /// Returns the number of conversations known after the sync.
    async fn sync_conversations(&self) -> Result<usize, ClientError>;

    /// Open (or return the existing) direct conversation with a peer.
    async fn new_dm(&self, peer: &InboxId) -> Result<Arc<dyn MeshConversation>, ClientError>;

    /// Create a group conversation; the caller is implicitly a member.
    async fn new_group(
        &self,
        members: &[InboxId],
    ) -> Result<Arc<dyn MeshConversation>, ClientError>;

    /// Handle to a conversation this client is a member of.
    async fn conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Arc<dyn MeshConversation>, ClientError>;

    /// Subscribe to every message addressed to this inbox.
    async fn stream_all_messages(&self) -> Result<MessageStream, ClientError>;

    /// Registration summary for this client's inbox.
    async fn inbox_state(&self) -> Result<InboxState, ClientError>;

    /// Whether the peer inbox is reachable on this network.
    async fn can_message(&self, peer: &InboxId) -> Result<bool, ClientError>;
}

/// One direct or group conversation.
#[async_trait]
pub trait MeshConversation: Send + Sync {
    /// Stable conversation id.
    fn id(&self) -> ConversationId;

    /// Send a text payload; returns the assigned message id.
    async fn send(&self, body: &str) -> Result<MessageId, ClientError>;

    /// Full decoded message history, oldest first.
    async fn messages(&self) -> Result<Vec<DecodedMessage>, ClientError>;

    /// Current member inboxes.
    async fn members(&self) -> Result<Vec<InboxId>, ClientError>;

    /// Add members (group conversations only).
    async fn add_members(&self, members: &[InboxId]) -> Result<(), ClientError>;

    /// Remove members (group conversations only).
    async fn remove_members(&self, members: &[InboxId]) -> Result<(), ClientError>;

    /// Replace the conversation display name.
    async fn update_name(&self, name: &str) -> Result<(), ClientError>;

    /// Current display name (empty for unnamed conversations).
    async fn name(&self) -> Result<String, ClientError>;

    /// Refresh conversation state from the network.
    async fn sync(&self) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_derivation_is_deterministic() {
        let signer = KeypairSigner::from_seed([7u8; 32]);
        let again = KeypairSigner::from_seed([7u8; 32]);

        assert_eq!(signer.address(), again.address());
        assert_eq!(
            derive_inbox_id(&signer.verifying_key()),
            derive_inbox_id(&again.verifying_key())
        );
    }

    #[test]
    fn test_address_format() {
        let signer = KeypairSigner::generate();
        let address = signer.address();

        assert!(address.as_str().starts_with("0x"));
        assert_eq!(address.as_str().len(), 42);
    }

    #[test]
    fn test_inbox_id_is_full_digest() {
        let signer = KeypairSigner::generate();
        let inbox = derive_inbox_id(&signer.verifying_key());

        assert_eq!(inbox.as_str().len(), 64);
    }

    #[test]
    fn test_seed_roundtrip() {
        let signer = KeypairSigner::generate();
        let restored = KeypairSigner::from_seed(signer.to_seed());

        assert_eq!(signer.address(), restored.address());
    }

    #[test]
    fn test_distinct_seeds_distinct_addresses() {
        let a = KeypairSigner::from_seed([1u8; 32]);
        let b = KeypairSigner::from_seed([2u8; 32]);

        assert_ne!(a.address(), b.address());
    }
}
