//! Version builder adapters for the local backend.
//!
//! Client-library versions are registered as separate adapters even against
//! the local backend, so scenarios exercise the same selection path they
//! would with real library builds side by side.

use crate::client::{derive_inbox_id, ClientOptions, MeshClient, MeshSigner, StorageKey};
use crate::error::ClientError;
use crate::local::client::LocalMeshClient;
use crate::local::network::{registration_payload, NetworkCore};
use crate::local::snapshot;
use crate::registry::ClientBuilder;
use crate::types::{ConversationId, ProtocolVersion};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Version 1 client builds.
pub struct LocalBuilderV1 {
    core: Arc<NetworkCore>,
}

impl LocalBuilderV1 {
    pub(crate) fn new(core: Arc<NetworkCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ClientBuilder for LocalBuilderV1 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V1
    }

    async fn build(
        &self,
        signer: Arc<dyn MeshSigner>,
        storage_key: StorageKey,
        options: ClientOptions,
    ) -> Result<Arc<dyn MeshClient>, ClientError> {
        build_local(
            &self.core,
            ProtocolVersion::V1,
            signer,
            storage_key,
            options,
        )
    }
}

/// Version 2 client builds (current).
pub struct LocalBuilderV2 {
    core: Arc<NetworkCore>,
}

impl LocalBuilderV2 {
    pub(crate) fn new(core: Arc<NetworkCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ClientBuilder for LocalBuilderV2 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V2
    }

    async fn build(
        &self,
        signer: Arc<dyn MeshSigner>,
        storage_key: StorageKey,
        options: ClientOptions,
    ) -> Result<Arc<dyn MeshClient>, ClientError> {
        build_local(
            &self.core,
            ProtocolVersion::V2,
            signer,
            storage_key,
            options,
        )
    }
}

/// Shared construction path: verify the signer's ownership proof, register
/// the installation, and reopen any existing encrypted store (which
/// validates the storage key up front).
fn build_local(
    core: &Arc<NetworkCore>,
    version: ProtocolVersion,
    signer: Arc<dyn MeshSigner>,
    storage_key: StorageKey,
    options: ClientOptions,
) -> Result<Arc<dyn MeshClient>, ClientError> {
    let verifying_key = signer.verifying_key();
    let inbox_id = derive_inbox_id(&verifying_key);
    let address = signer.address();
    let signature = signer.sign(&registration_payload(&address));

    core.register(
        &inbox_id,
        &address,
        verifying_key,
        signature,
        options.storage_path.clone(),
    )?;

    let mut known = HashSet::new();
    if let Some(doc) = snapshot::read_snapshot(&options.storage_path, &storage_key)? {
        if doc.inbox_id != inbox_id.as_str() {
            return Err(ClientError::Storage(
                "existing store belongs to a different inbox".into(),
            ));
        }
        debug!(inbox = %inbox_id, version = %version, conversations = doc.conversations.len(),
            "reopened existing local store");
        known = doc
            .conversations
            .into_iter()
            .map(ConversationId::new)
            .collect();
    }

    Ok(Arc::new(LocalMeshClient::new(
        Arc::clone(core),
        inbox_id,
        address,
        version,
        options,
        storage_key,
        known,
    )))
}
