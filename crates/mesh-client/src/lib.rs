//! # Mesh Client
//!
//! Protocol-client boundary for the Meshwire QA harness.
//!
//! The orchestration engine consumes Meshwire through the narrow trait
//! surface in [`client`]; everything behind it is an opaque collaborator.
//! This crate carries three layers:
//!
//! | Layer      | Contents                                                  |
//! |------------|-----------------------------------------------------------|
//! | Boundary   | [`MeshClient`] / [`MeshConversation`] / [`MeshSigner`] traits, ids and message types |
//! | Versioning | [`ClientRegistry`] mapping protocol-version tags to builder adapters |
//! | Simulation | [`LocalMeshNetwork`] in-process backend and the [`netsim`] fault-injection decorators |
//!
//! Fault injection wraps a built client from the outside
//! ([`netsim::FaultedClient`]), so impairment profiles apply identically to
//! any backend.

pub mod client;
pub mod error;
pub mod local;
pub mod netsim;
pub mod registry;
pub mod types;

pub use client::{
    derive_address, derive_inbox_id, ClientOptions, KeypairSigner, MeshClient, MeshConversation,
    MeshSigner, MessageStream, StorageKey,
};
pub use error::ClientError;
pub use local::LocalMeshNetwork;
pub use netsim::{FaultDecision, FaultInjector, FaultedClient, NetworkProfile, ProfileError};
pub use registry::{ClientBuilder, ClientRegistry};
pub use types::{
    AccountAddress, ContentType, ConversationId, ConversationKind, DecodedMessage, InboxId,
    InboxState, MeshEnv, MessageEnvelope, MessageId, ProtocolVersion,
};
