//! # Local Backend
//!
//! In-process implementation of the client boundary: one
//! [`LocalMeshNetwork`] plays the federation, and every client built from its
//! registry shares that network's state. Used by the harness test suites in
//! place of a deployed network.
//!
//! ```text
//!   LocalMeshNetwork ──registry()──▶ ClientRegistry (v1, v2 builders)
//!          │                               │ build(signer, key, options)
//!          ▼                               ▼
//!     NetworkCore  ◀───────────── LocalMeshClient (per installation)
//!      inboxes/conversations          encrypted snapshot on disk
//!      broadcast feed ───────────▶ MessageStream per subscriber
//! ```

mod builders;
mod client;
mod network;
mod snapshot;

pub use builders::{LocalBuilderV1, LocalBuilderV2};
pub use network::LocalMeshNetwork;
