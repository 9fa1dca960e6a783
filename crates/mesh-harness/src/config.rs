//! Run-level configuration shared by every harness component.
//!
//! A [`HarnessConfig`] is built once per test run and handed to the worker
//! pool, which threads it through provisioning, storage resolution and
//! worker initialization. Nothing in here is global: two runs with
//! different configs can coexist in one process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mesh_client::MeshEnv;
use serde::{Deserialize, Serialize};

use crate::storage;
use crate::thresholds::Region;

/// Default per-message wait used when collecting deliveries.
pub const DEFAULT_PER_MESSAGE_TIMEOUT: Duration = Duration::from_secs(3);

/// What each worker should stream in the background after initialization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMode {
    /// Subscribe to all inbound messages and fan them out as worker events.
    #[default]
    Messages,
    /// No background stream; only poll-based reads observe traffic.
    Disabled,
}

/// Configuration for a single harness run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Test namespace. Names starting with `bug_` are routed to an
    /// isolated storage subtree so repro data survives normal cleanup.
    pub test_name: String,
    /// Logical network environment baked into storage identifiers.
    pub env: MeshEnv,
    /// Root directory under which key stores and worker databases live.
    pub base_dir: PathBuf,
    /// Region used to scale latency thresholds when scoring.
    pub region: Region,
    /// Wait budget granted per expected message during collection.
    pub per_message_timeout: Duration,
    /// Background streaming behaviour for newly created workers.
    pub stream_mode: StreamMode,
}

impl HarnessConfig {
    /// Config with defaults for everything except the test namespace.
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            env: MeshEnv::default(),
            base_dir: PathBuf::from("."),
            region: Region::default(),
            per_message_timeout: DEFAULT_PER_MESSAGE_TIMEOUT,
            stream_mode: StreamMode::default(),
        }
    }

    #[must_use]
    pub fn with_env(mut self, env: MeshEnv) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    #[must_use]
    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    #[must_use]
    pub fn with_per_message_timeout(mut self, timeout: Duration) -> Self {
        self.per_message_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode = mode;
        self
    }

    /// Path of the key store backing this run's namespace.
    #[must_use]
    pub fn key_store_path(&self) -> PathBuf {
        storage::env_file_path(&self.base_dir, &self.test_name)
    }

    /// Root of the worker database tree for this run's namespace.
    #[must_use]
    pub fn data_root(&self) -> PathBuf {
        storage::data_root(&self.base_dir, &self.test_name)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
