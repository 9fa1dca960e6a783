//! Shared scenario fixtures.
//!
//! Every scenario runs against its own in-process mesh backend and its
//! own temporary storage root, so tests never share identities, key
//! stores or conversation state.

use std::path::Path;
use std::sync::Arc;

use mesh_client::{LocalMeshNetwork, MeshConversation};
use mesh_harness::{init_test_logging, HarnessConfig, Worker, WorkerPool};
use tempfile::TempDir;

/// One isolated harness run: backend, pool and scratch storage.
pub struct Scenario {
    pub network: Arc<LocalMeshNetwork>,
    pub pool: WorkerPool,
    dir: TempDir,
}

impl Scenario {
    /// Scenario with default configuration under `test_name`.
    pub fn new(test_name: &str) -> Self {
        Self::with_config(test_name, |config| config)
    }

    /// Scenario with a tweaked [`HarnessConfig`].
    pub fn with_config(
        test_name: &str,
        tweak: impl FnOnce(HarnessConfig) -> HarnessConfig,
    ) -> Self {
        init_test_logging();
        let dir = TempDir::new().unwrap();
        let config = tweak(HarnessConfig::new(test_name).with_base_dir(dir.path()));
        let network = Arc::new(LocalMeshNetwork::new());
        let pool = WorkerPool::new(config, network.registry()).unwrap();
        Self { network, pool, dir }
    }

    pub fn base_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Group created by `sender` containing all `receivers`.
    pub async fn group(
        &self,
        sender: &Arc<Worker>,
        receivers: &[Arc<Worker>],
    ) -> Arc<dyn MeshConversation> {
        let members: Vec<_> = receivers
            .iter()
            .map(|worker| worker.inbox_id().clone())
            .collect();
        sender.client().new_group(&members).await.unwrap()
    }

    /// Direct conversation from `sender` to `receiver`.
    pub async fn dm(
        &self,
        sender: &Arc<Worker>,
        receiver: &Arc<Worker>,
    ) -> Arc<dyn MeshConversation> {
        sender.client().new_dm(receiver.inbox_id()).await.unwrap()
    }
}
