//! Client and conversation handles over the local network core.

use crate::client::{ClientOptions, MeshClient, MeshConversation, MessageStream, StorageKey};
use crate::error::ClientError;
use crate::local::network::NetworkCore;
use crate::local::snapshot::{self, SnapshotDoc};
use crate::types::{
    AccountAddress, ContentType, ConversationId, DecodedMessage, InboxId, InboxState, MessageId,
    ProtocolVersion,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct LocalMeshClient {
    core: Arc<NetworkCore>,
    inbox_id: InboxId,
    address: AccountAddress,
    version: ProtocolVersion,
    options: ClientOptions,
    storage_key: StorageKey,
    known_conversations: RwLock<HashSet<ConversationId>>,
}

impl LocalMeshClient {
    pub(crate) fn new(
        core: Arc<NetworkCore>,
        inbox_id: InboxId,
        address: AccountAddress,
        version: ProtocolVersion,
        options: ClientOptions,
        storage_key: StorageKey,
        known_conversations: HashSet<ConversationId>,
    ) -> Self {
        Self {
            core,
            inbox_id,
            address,
            version,
            options,
            storage_key,
            known_conversations: RwLock::new(known_conversations),
        }
    }

    fn handle(&self, id: ConversationId) -> Arc<dyn MeshConversation> {
        Arc::new(LocalConversation {
            core: Arc::clone(&self.core),
            id,
            inbox_id: self.inbox_id.clone(),
        })
    }

    /// Persist the current conversation set to the encrypted store.
    fn persist(&self, conversations: &HashSet<ConversationId>) -> Result<(), ClientError> {
        let mut ids: Vec<String> = conversations
            .iter()
            .map(|id| id.as_str().to_owned())
            .collect();
        ids.sort_unstable();
        let doc = SnapshotDoc {
            schema: self.version.tag(),
            inbox_id: self.inbox_id.as_str().to_owned(),
            env: self.options.env.as_str().to_owned(),
            conversations: ids,
            synced_at_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        };
        snapshot::write_snapshot(&self.options.storage_path, &self.storage_key, &doc)
    }
}

#[async_trait]
impl MeshClient for LocalMeshClient {
    fn inbox_id(&self) -> InboxId {
        self.inbox_id.clone()
    }

    fn address(&self) -> AccountAddress {
        self.address.clone()
    }

    fn version(&self) -> ProtocolVersion {
        self.version
    }

    async fn sync_conversations(&self) -> Result<usize, ClientError> {
        let current: HashSet<ConversationId> =
            self.core.conversations_for(&self.inbox_id).into_iter().collect();
        let count = current.len();
        self.persist(&current)?;
        *self.known_conversations.write() = current;
        debug!(inbox = %self.inbox_id, conversations = count, "conversations synced");
        Ok(count)
    }

    async fn new_dm(&self, peer: &InboxId) -> Result<Arc<dyn MeshConversation>, ClientError> {
        let id = self.core.create_dm(&self.inbox_id, peer)?;
        self.known_conversations.write().insert(id.clone());
        Ok(self.handle(id))
    }

    async fn new_group(
        &self,
        members: &[InboxId],
    ) -> Result<Arc<dyn MeshConversation>, ClientError> {
        let id = self.core.create_group(&self.inbox_id, members)?;
        self.known_conversations.write().insert(id.clone());
        Ok(self.handle(id))
    }

    async fn conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Arc<dyn MeshConversation>, ClientError> {
        if !self.core.conversation_exists(id) {
            return Err(ClientError::UnknownConversation(id.clone()));
        }
        if !self.core.is_member(&self.inbox_id, id) {
            return Err(ClientError::NotAMember(id.clone()));
        }
        Ok(self.handle(id.clone()))
    }

    async fn stream_all_messages(&self) -> Result<MessageStream, ClientError> {
        Ok(MessageStream::new(
            self.core.subscribe(),
            self.inbox_id.clone(),
        ))
    }

    async fn inbox_state(&self) -> Result<InboxState, ClientError> {
        self.core.inbox_state(&self.inbox_id)
    }

    async fn can_message(&self, peer: &InboxId) -> Result<bool, ClientError> {
        Ok(self.core.is_registered(peer))
    }
}

struct LocalConversation {
    core: Arc<NetworkCore>,
    id: ConversationId,
    inbox_id: InboxId,
}

#[async_trait]
impl MeshConversation for LocalConversation {
    fn id(&self) -> ConversationId {
        self.id.clone()
    }

    async fn send(&self, body: &str) -> Result<MessageId, ClientError> {
        self.core
            .send_message(&self.inbox_id, &self.id, ContentType::Text, body)
    }

    async fn messages(&self) -> Result<Vec<DecodedMessage>, ClientError> {
        self.core.messages(&self.inbox_id, &self.id)
    }

    async fn members(&self) -> Result<Vec<InboxId>, ClientError> {
        self.core.members(&self.inbox_id, &self.id)
    }

    async fn add_members(&self, members: &[InboxId]) -> Result<(), ClientError> {
        self.core.add_members(&self.inbox_id, &self.id, members)
    }

    async fn remove_members(&self, members: &[InboxId]) -> Result<(), ClientError> {
        self.core.remove_members(&self.inbox_id, &self.id, members)
    }

    async fn update_name(&self, name: &str) -> Result<(), ClientError> {
        self.core.update_name(&self.inbox_id, &self.id, name)
    }

    async fn name(&self) -> Result<String, ClientError> {
        self.core.name(&self.inbox_id, &self.id)
    }

    async fn sync(&self) -> Result<(), ClientError> {
        if !self.core.conversation_exists(&self.id) {
            return Err(ClientError::UnknownConversation(self.id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::KeypairSigner;
    use crate::local::LocalMeshNetwork;
    use crate::types::MeshEnv;
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn build_client(
        network: &LocalMeshNetwork,
        seed: u8,
        dir: &Path,
    ) -> Arc<dyn MeshClient> {
        build_client_with_key(network, seed, dir, StorageKey::from_bytes([seed; 32])).await
    }

    async fn build_client_with_key(
        network: &LocalMeshNetwork,
        seed: u8,
        dir: &Path,
        key: StorageKey,
    ) -> Arc<dyn MeshClient> {
        let registry = network.registry();
        let builder = registry.resolve(None).unwrap();
        builder
            .build(
                Arc::new(KeypairSigner::from_seed([seed; 32])),
                key,
                ClientOptions {
                    env: MeshEnv::Local,
                    storage_path: dir.join(format!("client-{seed}.db3")),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_dm_send_reaches_peer_stream() {
        let network = LocalMeshNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let alice = build_client(&network, 1, dir.path()).await;
        let bob = build_client(&network, 2, dir.path()).await;

        let mut stream = bob.stream_all_messages().await.unwrap();
        let dm = alice.new_dm(&bob.inbox_id()).await.unwrap();
        dm.send("hello bob").await.unwrap();

        let received = timeout(Duration::from_millis(200), stream.next())
            .await
            .expect("timeout")
            .expect("stream open")
            .expect("decoded");
        assert_eq!(received.body, "hello bob");
        assert_eq!(received.sender, alice.inbox_id());
    }

    #[tokio::test]
    async fn test_sender_observes_own_messages() {
        let network = LocalMeshNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let alice = build_client(&network, 1, dir.path()).await;
        let bob = build_client(&network, 2, dir.path()).await;

        let mut stream = alice.stream_all_messages().await.unwrap();
        let dm = alice.new_dm(&bob.inbox_id()).await.unwrap();
        dm.send("echo").await.unwrap();

        let received = timeout(Duration::from_millis(200), stream.next())
            .await
            .expect("timeout")
            .expect("stream open")
            .expect("decoded");
        assert_eq!(received.body, "echo");
    }

    #[tokio::test]
    async fn test_non_member_does_not_observe_group_traffic() {
        let network = LocalMeshNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let alice = build_client(&network, 1, dir.path()).await;
        let bob = build_client(&network, 2, dir.path()).await;
        let outsider = build_client(&network, 3, dir.path()).await;

        let mut stream = outsider.stream_all_messages().await.unwrap();
        let group = alice.new_group(&[bob.inbox_id()]).await.unwrap();
        group.send("members only").await.unwrap();

        let result = timeout(Duration::from_millis(100), stream.next()).await;
        assert!(result.is_err(), "outsider saw group traffic");
    }

    #[tokio::test]
    async fn test_sync_persists_and_reopen_restores() {
        let network = LocalMeshNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let key = StorageKey::from_bytes([9u8; 32]);

        let alice = build_client_with_key(&network, 1, dir.path(), key.clone()).await;
        let bob = build_client(&network, 2, dir.path()).await;
        alice.new_dm(&bob.inbox_id()).await.unwrap();
        let synced = alice.sync_conversations().await.unwrap();
        assert_eq!(synced, 1);
        assert!(dir.path().join("client-1.db3").exists());
        drop(alice);

        // Same seed + same path: the builder reopens the existing store.
        let reopened = build_client_with_key(&network, 1, dir.path(), key).await;
        assert_eq!(reopened.sync_conversations().await.unwrap(), 1);
        assert_eq!(reopened.inbox_state().await.unwrap().installations, 1);
    }

    #[tokio::test]
    async fn test_reopen_with_wrong_storage_key_fails() {
        let network = LocalMeshNetwork::new();
        let dir = tempfile::tempdir().unwrap();

        let alice =
            build_client_with_key(&network, 1, dir.path(), StorageKey::from_bytes([1u8; 32]))
                .await;
        alice.sync_conversations().await.unwrap();
        drop(alice);

        let registry = network.registry();
        let builder = registry.resolve(None).unwrap();
        let result = builder
            .build(
                Arc::new(KeypairSigner::from_seed([1u8; 32])),
                StorageKey::from_bytes([2u8; 32]),
                ClientOptions {
                    env: MeshEnv::Local,
                    storage_path: dir.path().join("client-1.db3"),
                },
            )
            .await;
        assert!(matches!(result, Err(ClientError::Storage(_))));
    }

    #[tokio::test]
    async fn test_two_paths_register_two_installations() {
        let network = LocalMeshNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let registry = network.registry();
        let builder = registry.resolve(None).unwrap();

        for suffix in ["a", "b"] {
            builder
                .build(
                    Arc::new(KeypairSigner::from_seed([5u8; 32])),
                    StorageKey::from_bytes([5u8; 32]),
                    ClientOptions {
                        env: MeshEnv::Local,
                        storage_path: dir.path().join(format!("inst-{suffix}.db3")),
                    },
                )
                .await
                .unwrap();
        }

        let state = network
            .registry()
            .resolve(None)
            .unwrap()
            .build(
                Arc::new(KeypairSigner::from_seed([5u8; 32])),
                StorageKey::from_bytes([5u8; 32]),
                ClientOptions {
                    env: MeshEnv::Local,
                    storage_path: dir.path().join("inst-a.db3"),
                },
            )
            .await
            .unwrap()
            .inbox_state()
            .await
            .unwrap();
        assert_eq!(state.installations, 2);
    }

    #[tokio::test]
    async fn test_unknown_conversation_lookup_fails() {
        let network = LocalMeshNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let alice = build_client(&network, 1, dir.path()).await;

        let missing = ConversationId::generate();
        assert!(matches!(
            alice.conversation(&missing).await,
            Err(ClientError::UnknownConversation(_))
        ));
    }

    #[tokio::test]
    async fn test_can_message_reflects_registration() {
        let network = LocalMeshNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let alice = build_client(&network, 1, dir.path()).await;
        let bob = build_client(&network, 2, dir.path()).await;

        assert!(alice.can_message(&bob.inbox_id()).await.unwrap());
        assert!(!alice
            .can_message(&InboxId::new("feedfacefeedface"))
            .await
            .unwrap());
    }
}
