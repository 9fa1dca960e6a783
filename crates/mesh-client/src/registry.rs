//! # Versioned Client Builders
//!
//! Client-library versions are not API-compatible with each other, so every
//! supported version is registered as its own builder adapter. The registry
//! is the only place a version tag is turned into a construction strategy.

use crate::client::{ClientOptions, MeshClient, MeshSigner, StorageKey};
use crate::error::ClientError;
use crate::types::ProtocolVersion;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Construction strategy for one protocol version.
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    /// Version tag this builder produces.
    fn version(&self) -> ProtocolVersion;

    /// Register an installation and return a ready client.
    async fn build(
        &self,
        signer: Arc<dyn MeshSigner>,
        storage_key: StorageKey,
        options: ClientOptions,
    ) -> Result<Arc<dyn MeshClient>, ClientError>;
}

/// Version tag -> builder table.
#[derive(Default)]
pub struct ClientRegistry {
    builders: HashMap<u16, Arc<dyn ClientBuilder>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder; replaces any previous builder for the same tag.
    pub fn register(&mut self, builder: Arc<dyn ClientBuilder>) {
        self.builders.insert(builder.version().tag(), builder);
    }

    /// Builder for an exact version tag.
    #[must_use]
    pub fn get(&self, version: ProtocolVersion) -> Option<Arc<dyn ClientBuilder>> {
        self.builders.get(&version.tag()).cloned()
    }

    /// Highest registered version, if any.
    #[must_use]
    pub fn latest(&self) -> Option<ProtocolVersion> {
        self.builders.keys().max().copied().map(ProtocolVersion)
    }

    /// Resolve an optional version request: `None` means latest.
    pub fn resolve(
        &self,
        version: Option<ProtocolVersion>,
    ) -> Result<Arc<dyn ClientBuilder>, ClientError> {
        let target = match version.or_else(|| self.latest()) {
            Some(v) => v,
            None => return Err(ClientError::UnsupportedVersion(0)),
        };
        self.get(target)
            .ok_or(ClientError::UnsupportedVersion(target.tag()))
    }

    /// All registered versions, ascending.
    #[must_use]
    pub fn versions(&self) -> Vec<ProtocolVersion> {
        let mut tags: Vec<u16> = self.builders.keys().copied().collect();
        tags.sort_unstable();
        tags.into_iter().map(ProtocolVersion).collect()
    }
}
