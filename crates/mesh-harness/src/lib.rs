//! # Meshwire Load & Correctness Harness
//!
//! Orchestrates fleets of Meshwire protocol clients ("workers") for
//! load, correctness and fault-injection testing: provisioning durable
//! identities, isolating per-worker storage, simulating hostile network
//! conditions, verifying end-to-end message delivery and scoring
//! measured latencies against region-aware thresholds.
//!
//! ## Components
//!
//! - [`identity`] - durable worker identities over a dotenv-style store
//! - [`storage`] - deterministic per-installation database paths
//! - [`worker`] - one protocol client plus its stream consumer
//! - [`pool`] - batch worker creation, indexing and teardown
//! - [`verify`] - stream / poll / offline-recovery delivery checks
//! - [`thresholds`] - region-scaled latency budgets
//! - [`report`] - metrics accumulation and the run summary table
//! - [`telemetry`] - tracing bootstrap
//!
//! ## Example
//!
//! ```no_run
//! use mesh_client::LocalMeshNetwork;
//! use mesh_harness::{verify, HarnessConfig, VerifyOptions, WorkerPool};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let network = Arc::new(LocalMeshNetwork::new());
//! let config = HarnessConfig::new("smoke").with_base_dir("/tmp/meshwire");
//! let pool = WorkerPool::new(config, network.registry())?;
//!
//! let workers = pool.create_workers_named(&["henry", "nancy", "oscar"]).await?;
//! let members: Vec<_> = workers[1..].iter().map(|w| w.inbox_id().clone()).collect();
//! let convo = workers[0].client().new_group(&members).await?;
//!
//! let report = verify::verify_message_stream(
//!     convo.as_ref(),
//!     &workers[1..],
//!     &VerifyOptions::new(5),
//! )
//! .await?;
//! assert!(report.all_received());
//!
//! pool.terminate_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod pool;
pub mod report;
pub mod storage;
pub mod telemetry;
pub mod thresholds;
pub mod verify;
pub mod worker;

pub use config::{HarnessConfig, StreamMode, DEFAULT_PER_MESSAGE_TIMEOUT};
pub use error::{PoolError, ProvisioningError, StreamFault, VerifyError, WorkerInitError};
pub use identity::{IdentityProvisioner, WorkerIdentity};
pub use pool::{
    WorkerDescriptor, WorkerPool, WorkerRequest, DEFAULT_INSTALLATION_ID, WORKER_NAME_POOL,
};
pub use report::{summary_file_name, MetricsRecorder, MetricsSummary, SummaryRow};
pub use telemetry::{init_logging, init_test_logging, TelemetryError};
pub use thresholds::{
    threshold_for, OperationType, Region, DELIVERY_RATE_FLOOR, ORDER_RATE_FLOOR,
};
pub use verify::{
    compute_message_stats, DeliveryReport, MessageStats, ReceiverReport, VerifyOptions,
};
pub use worker::{InitTimings, Worker, WorkerEvent};
