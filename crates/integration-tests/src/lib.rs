//! # Integration Tests Crate
//!
//! Scenario suites that drive the harness end to end against the
//! in-process mesh backend: real workers, real storage layout, real
//! fault injection, with nothing mocked below the client trait.
//!
//! ## Structure
//!
//! ```text
//! integration-tests/
//! └── src/
//!     ├── lib.rs          # This file
//!     ├── common.rs       # Scenario fixture: backend + pool + scratch dir
//!     ├── delivery.rs     # Stream / poll / offline-recovery delivery
//!     ├── chaos.rs        # Network impairment scenarios
//!     ├── lifecycle.rs    # Pool creation, reuse, teardown, storage layout
//!     └── performance.rs  # Latency scoring against regional thresholds
//! ```
//!
//! ## Delivery (delivery.rs)
//!
//! A sender pushes a numbered batch into a conversation and every
//! receiver must observe the full batch, in order, through the read
//! path under test: live streams, history polls, or history recovered
//! after a worker was terminated and rebuilt.
//!
//! ## Chaos (chaos.rs)
//!
//! One worker's transport is impaired (loss, latency, disconnection,
//! bandwidth) and the damage must land exactly where expected: streams
//! starve, polls survive, offline windows refuse operations, profile
//! swaps take effect immediately and heal cleanly.
//!
//! ## Lifecycle (lifecycle.rs)
//!
//! Batch atomicity, worker reuse across overlapping requests,
//! terminate-and-recreate with stable account identity, and the
//! installation/storage isolation guarantees.
//!
//! ## Performance (performance.rs)
//!
//! Measured operation latencies are folded through the metrics
//! recorder and scored against region-scaled thresholds; the rendered
//! summary artifact is checked for content and location.

pub mod common;

pub mod chaos;
pub mod delivery;
pub mod lifecycle;
pub mod performance;
