//! # Local Mesh Network
//!
//! In-process federation backend. Conversation and inbox state live behind
//! locks on a shared core; every sent message is published once on a
//! broadcast feed as a [`MessageEnvelope`] carrying the membership snapshot
//! taken at send time. Client streams filter the feed by recipient set, so a
//! sender observes its own messages like any other member.

use crate::client::{derive_address, derive_inbox_id};
use crate::error::ClientError;
use crate::registry::ClientRegistry;
use crate::types::{
    AccountAddress, ContentType, ConversationId, ConversationKind, DecodedMessage, InboxId,
    InboxState, MessageEnvelope, MessageId,
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Feed fan-out capacity; slow subscribers lag rather than block senders.
const FEED_CAPACITY: usize = 1024;

/// Payload a signer must sign to register an installation.
pub(crate) fn registration_payload(address: &AccountAddress) -> Vec<u8> {
    format!("meshwire-registration:{address}").into_bytes()
}

pub(crate) struct InboxRecord {
    address: AccountAddress,
    verifying_key: [u8; 32],
    /// Distinct local stores registered for this inbox.
    installations: HashSet<PathBuf>,
}

pub(crate) struct ConversationRecord {
    kind: ConversationKind,
    members: Vec<InboxId>,
    name: String,
    messages: Vec<DecodedMessage>,
}

/// Shared network state. All methods are synchronous; locks are never held
/// across the feed publish.
pub(crate) struct NetworkCore {
    inboxes: RwLock<HashMap<InboxId, InboxRecord>>,
    conversations: RwLock<HashMap<ConversationId, ConversationRecord>>,
    dm_index: RwLock<HashMap<(InboxId, InboxId), ConversationId>>,
    feed: broadcast::Sender<MessageEnvelope>,
}

/// Unordered pair key for DM de-duplication.
fn dm_key(a: &InboxId, b: &InboxId) -> (InboxId, InboxId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl NetworkCore {
    pub(crate) fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inboxes: RwLock::new(HashMap::new()),
            conversations: RwLock::new(HashMap::new()),
            dm_index: RwLock::new(HashMap::new()),
            feed,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<MessageEnvelope> {
        self.feed.subscribe()
    }

    /// Register (or re-open) an installation after verifying the signer's
    /// proof of account ownership.
    pub(crate) fn register(
        &self,
        inbox_id: &InboxId,
        address: &AccountAddress,
        verifying_key: [u8; 32],
        signature: [u8; 64],
        storage_path: PathBuf,
    ) -> Result<(), ClientError> {
        if derive_inbox_id(&verifying_key) != *inbox_id
            || derive_address(&verifying_key) != *address
        {
            return Err(ClientError::IdentityVerification(
                "identifiers do not match the verifying key".into(),
            ));
        }

        let key = VerifyingKey::from_bytes(&verifying_key)
            .map_err(|e| ClientError::IdentityVerification(e.to_string()))?;
        key.verify(
            &registration_payload(address),
            &Signature::from_bytes(&signature),
        )
        .map_err(|e| ClientError::IdentityVerification(e.to_string()))?;

        let mut inboxes = self.inboxes.write();
        let record = inboxes.entry(inbox_id.clone()).or_insert_with(|| InboxRecord {
            address: address.clone(),
            verifying_key,
            installations: HashSet::new(),
        });
        if record.verifying_key != verifying_key {
            return Err(ClientError::IdentityVerification(
                "inbox already registered under a different key".into(),
            ));
        }
        if record.installations.insert(storage_path) {
            debug!(inbox = %inbox_id, installations = record.installations.len(),
                "installation registered");
        }
        Ok(())
    }

    pub(crate) fn is_registered(&self, inbox_id: &InboxId) -> bool {
        self.inboxes.read().contains_key(inbox_id)
    }

    pub(crate) fn inbox_state(&self, inbox_id: &InboxId) -> Result<InboxState, ClientError> {
        let inboxes = self.inboxes.read();
        let record = inboxes
            .get(inbox_id)
            .ok_or_else(|| ClientError::UnknownInbox(inbox_id.clone()))?;
        Ok(InboxState {
            inbox_id: inbox_id.clone(),
            address: record.address.clone(),
            installations: record.installations.len() as u32,
        })
    }

    fn require_registered(&self, inbox_id: &InboxId) -> Result<(), ClientError> {
        if self.is_registered(inbox_id) {
            Ok(())
        } else {
            Err(ClientError::UnknownInbox(inbox_id.clone()))
        }
    }

    /// Open (or return the existing) DM between two inboxes.
    pub(crate) fn create_dm(
        &self,
        creator: &InboxId,
        peer: &InboxId,
    ) -> Result<ConversationId, ClientError> {
        if creator == peer {
            return Err(ClientError::Transport(
                "cannot open a direct conversation with self".into(),
            ));
        }
        self.require_registered(creator)?;
        self.require_registered(peer)?;

        let mut dm_index = self.dm_index.write();
        if let Some(existing) = dm_index.get(&dm_key(creator, peer)) {
            return Ok(existing.clone());
        }

        let id = ConversationId::generate();
        self.conversations.write().insert(
            id.clone(),
            ConversationRecord {
                kind: ConversationKind::Dm,
                members: vec![creator.clone(), peer.clone()],
                name: String::new(),
                messages: Vec::new(),
            },
        );
        dm_index.insert(dm_key(creator, peer), id.clone());
        debug!(conversation = %id, "dm created");
        Ok(id)
    }

    /// Create a group; the creator is always a member.
    pub(crate) fn create_group(
        &self,
        creator: &InboxId,
        members: &[InboxId],
    ) -> Result<ConversationId, ClientError> {
        self.require_registered(creator)?;
        let mut unique = vec![creator.clone()];
        for member in members {
            self.require_registered(member)?;
            if !unique.contains(member) {
                unique.push(member.clone());
            }
        }

        let id = ConversationId::generate();
        let size = unique.len();
        self.conversations.write().insert(
            id.clone(),
            ConversationRecord {
                kind: ConversationKind::Group,
                members: unique,
                name: String::new(),
                messages: Vec::new(),
            },
        );
        debug!(conversation = %id, members = size, "group created");
        Ok(id)
    }

    pub(crate) fn conversation_exists(&self, id: &ConversationId) -> bool {
        self.conversations.read().contains_key(id)
    }

    pub(crate) fn conversations_for(&self, inbox_id: &InboxId) -> Vec<ConversationId> {
        self.conversations
            .read()
            .iter()
            .filter(|(_, record)| record.members.contains(inbox_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Append a message and publish its envelope to the feed.
    pub(crate) fn send_message(
        &self,
        sender: &InboxId,
        conversation_id: &ConversationId,
        content_type: ContentType,
        body: &str,
    ) -> Result<MessageId, ClientError> {
        let envelope = {
            let mut conversations = self.conversations.write();
            let record = conversations
                .get_mut(conversation_id)
                .ok_or_else(|| ClientError::UnknownConversation(conversation_id.clone()))?;
            if !record.members.contains(sender) {
                return Err(ClientError::NotAMember(conversation_id.clone()));
            }

            let message = DecodedMessage {
                id: MessageId::generate(),
                conversation_id: conversation_id.clone(),
                sender: sender.clone(),
                content_type,
                body: body.to_owned(),
                sent_at_ms: unix_millis(),
            };
            record.messages.push(message.clone());
            MessageEnvelope {
                message,
                recipients: record.members.clone(),
            }
        };

        let id = envelope.message.id.clone();
        // No subscribers is fine; history still records the message.
        let _ = self.feed.send(envelope);
        Ok(id)
    }

    pub(crate) fn messages(
        &self,
        requester: &InboxId,
        conversation_id: &ConversationId,
    ) -> Result<Vec<DecodedMessage>, ClientError> {
        let conversations = self.conversations.read();
        let record = conversations
            .get(conversation_id)
            .ok_or_else(|| ClientError::UnknownConversation(conversation_id.clone()))?;
        if !record.members.contains(requester) {
            return Err(ClientError::NotAMember(conversation_id.clone()));
        }
        Ok(record.messages.clone())
    }

    pub(crate) fn members(
        &self,
        requester: &InboxId,
        conversation_id: &ConversationId,
    ) -> Result<Vec<InboxId>, ClientError> {
        let conversations = self.conversations.read();
        let record = conversations
            .get(conversation_id)
            .ok_or_else(|| ClientError::UnknownConversation(conversation_id.clone()))?;
        if !record.members.contains(requester) {
            return Err(ClientError::NotAMember(conversation_id.clone()));
        }
        Ok(record.members.clone())
    }

    pub(crate) fn name(
        &self,
        requester: &InboxId,
        conversation_id: &ConversationId,
    ) -> Result<String, ClientError> {
        let conversations = self.conversations.read();
        let record = conversations
            .get(conversation_id)
            .ok_or_else(|| ClientError::UnknownConversation(conversation_id.clone()))?;
        if !record.members.contains(requester) {
            return Err(ClientError::NotAMember(conversation_id.clone()));
        }
        Ok(record.name.clone())
    }

    pub(crate) fn is_member(&self, inbox_id: &InboxId, conversation_id: &ConversationId) -> bool {
        self.conversations
            .read()
            .get(conversation_id)
            .is_some_and(|record| record.members.contains(inbox_id))
    }

    /// Add members to a group; publishes a membership-change notice to the
    /// updated member set.
    pub(crate) fn add_members(
        &self,
        actor: &InboxId,
        conversation_id: &ConversationId,
        new_members: &[InboxId],
    ) -> Result<(), ClientError> {
        for member in new_members {
            self.require_registered(member)?;
        }

        let envelope = {
            let mut conversations = self.conversations.write();
            let record = conversations
                .get_mut(conversation_id)
                .ok_or_else(|| ClientError::UnknownConversation(conversation_id.clone()))?;
            if record.kind != ConversationKind::Group {
                return Err(ClientError::Transport(
                    "direct conversations have fixed membership".into(),
                ));
            }
            if !record.members.contains(actor) {
                return Err(ClientError::NotAMember(conversation_id.clone()));
            }

            let mut added = Vec::new();
            for member in new_members {
                if !record.members.contains(member) {
                    record.members.push(member.clone());
                    added.push(member.as_str().to_owned());
                }
            }
            membership_notice(record, conversation_id, actor, "members_added", &added)
        };

        if let Some(envelope) = envelope {
            let _ = self.feed.send(envelope);
        }
        Ok(())
    }

    /// Remove members from a group; the notice still reaches the removed
    /// members (pre-removal snapshot) so their clients learn of the change.
    pub(crate) fn remove_members(
        &self,
        actor: &InboxId,
        conversation_id: &ConversationId,
        targets: &[InboxId],
    ) -> Result<(), ClientError> {
        let envelope = {
            let mut conversations = self.conversations.write();
            let record = conversations
                .get_mut(conversation_id)
                .ok_or_else(|| ClientError::UnknownConversation(conversation_id.clone()))?;
            if record.kind != ConversationKind::Group {
                return Err(ClientError::Transport(
                    "direct conversations have fixed membership".into(),
                ));
            }
            if !record.members.contains(actor) {
                return Err(ClientError::NotAMember(conversation_id.clone()));
            }

            let before = record.members.clone();
            let mut removed = Vec::new();
            record.members.retain(|member| {
                if targets.contains(member) {
                    removed.push(member.as_str().to_owned());
                    false
                } else {
                    true
                }
            });

            if removed.is_empty() {
                None
            } else {
                let message = DecodedMessage {
                    id: MessageId::generate(),
                    conversation_id: conversation_id.clone(),
                    sender: actor.clone(),
                    content_type: ContentType::MembershipChange,
                    body: format!("members_removed:{}", removed.join(",")),
                    sent_at_ms: unix_millis(),
                };
                record.messages.push(message.clone());
                Some(MessageEnvelope {
                    message,
                    recipients: before,
                })
            }
        };

        if let Some(envelope) = envelope {
            let _ = self.feed.send(envelope);
        }
        Ok(())
    }

    /// Rename a group; publishes a metadata notice carrying the new name.
    pub(crate) fn update_name(
        &self,
        actor: &InboxId,
        conversation_id: &ConversationId,
        name: &str,
    ) -> Result<(), ClientError> {
        let envelope = {
            let mut conversations = self.conversations.write();
            let record = conversations
                .get_mut(conversation_id)
                .ok_or_else(|| ClientError::UnknownConversation(conversation_id.clone()))?;
            if record.kind != ConversationKind::Group {
                return Err(ClientError::Transport(
                    "direct conversations cannot be renamed".into(),
                ));
            }
            if !record.members.contains(actor) {
                return Err(ClientError::NotAMember(conversation_id.clone()));
            }

            record.name = name.to_owned();
            let message = DecodedMessage {
                id: MessageId::generate(),
                conversation_id: conversation_id.clone(),
                sender: actor.clone(),
                content_type: ContentType::GroupMetadata,
                body: name.to_owned(),
                sent_at_ms: unix_millis(),
            };
            record.messages.push(message.clone());
            MessageEnvelope {
                message,
                recipients: record.members.clone(),
            }
        };

        let _ = self.feed.send(envelope);
        Ok(())
    }
}

/// Build the added-members notice while the record lock is held.
fn membership_notice(
    record: &mut ConversationRecord,
    conversation_id: &ConversationId,
    actor: &InboxId,
    verb: &str,
    affected: &[String],
) -> Option<MessageEnvelope> {
    if affected.is_empty() {
        return None;
    }
    let message = DecodedMessage {
        id: MessageId::generate(),
        conversation_id: conversation_id.clone(),
        sender: actor.clone(),
        content_type: ContentType::MembershipChange,
        body: format!("{verb}:{}", affected.join(",")),
        sent_at_ms: unix_millis(),
    };
    record.messages.push(message.clone());
    Some(MessageEnvelope {
        message,
        recipients: record.members.clone(),
    })
}

/// Public handle to an in-process Meshwire federation.
///
/// Cheap to clone state-wise: all clients built from one network share the
/// same core.
pub struct LocalMeshNetwork {
    core: Arc<NetworkCore>,
}

impl LocalMeshNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(NetworkCore::new()),
        }
    }

    pub(crate) fn core(&self) -> Arc<NetworkCore> {
        Arc::clone(&self.core)
    }

    /// Registry with every version adapter this backend supports.
    #[must_use]
    pub fn registry(&self) -> ClientRegistry {
        let mut registry = ClientRegistry::new();
        registry.register(Arc::new(super::builders::LocalBuilderV1::new(self.core())));
        registry.register(Arc::new(super::builders::LocalBuilderV2::new(self.core())));
        registry
    }

    /// Number of registered inboxes (test observability).
    #[must_use]
    pub fn registered_inboxes(&self) -> usize {
        self.core.inboxes.read().len()
    }

    /// Number of conversations on the network (test observability).
    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.core.conversations.read().len()
    }
}

impl Default for LocalMeshNetwork {
    fn default() -> Self {
        Self::new()
    }
}
