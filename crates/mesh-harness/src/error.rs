//! Error taxonomy for the harness.
//!
//! Every failure names the worker it belongs to. A batch of twenty
//! concurrent initializations is useless to debug if the error only says
//! "sync failed", so attribution is carried in the variants themselves
//! rather than recovered from log context.

use mesh_client::{ClientError, ProfileError};
use thiserror::Error;

/// Failure while ensuring or restoring a worker identity.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("failed to read key store {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to persist key material for {name}: {source}")]
    Persist {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid stored key material for {name}: {detail}")]
    InvalidMaterial { name: String, detail: String },
}

/// Failure during one of the timed worker initialization steps.
///
/// The `worker` field is the `name-installation` label so that a partial
/// batch failure points at the exact member that broke.
#[derive(Debug, Error)]
pub enum WorkerInitError {
    #[error("worker {worker}: key material unusable: {source}")]
    Identity {
        worker: String,
        #[source]
        source: ProvisioningError,
    },
    #[error("worker {worker}: no registered builder for protocol version {version}")]
    UnsupportedVersion { worker: String, version: u16 },
    #[error("worker {worker}: storage path resolution failed: {source}")]
    Storage {
        worker: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker {worker}: client build failed: {source}")]
    ClientBuild {
        worker: String,
        #[source]
        source: ClientError,
    },
    #[error("worker {worker}: message stream start failed: {source}")]
    StreamStart {
        worker: String,
        #[source]
        source: ClientError,
    },
    #[error("worker {worker}: initial sync failed: {source}")]
    Sync {
        worker: String,
        #[source]
        source: ClientError,
    },
}

impl WorkerInitError {
    /// Label of the worker the failure belongs to.
    pub fn worker(&self) -> &str {
        match self {
            Self::Identity { worker, .. }
            | Self::UnsupportedVersion { worker, .. }
            | Self::Storage { worker, .. }
            | Self::ClientBuild { worker, .. }
            | Self::StreamStart { worker, .. }
            | Self::Sync { worker, .. } => worker,
        }
    }
}

/// Fault surfaced on a worker's live message stream while collecting.
#[derive(Debug, Error)]
#[error("worker {worker}: stream fault during collection: {detail}")]
pub struct StreamFault {
    pub worker: String,
    pub detail: String,
}

/// Failure at the pool level.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid worker descriptor {0:?}")]
    InvalidDescriptor(String),
    #[error("worker name pool exhausted: requested {requested}, pool holds {available}")]
    NamePoolExhausted { requested: usize, available: usize },
    #[error("worker {name}-{installation} is already being provisioned")]
    ProvisioningInProgress { name: String, installation: String },
    #[error("worker {name}-{installation} is not ready")]
    NotReady { name: String, installation: String },
    #[error("provisioning task for {0} panicked")]
    ProvisioningPanic(String),
    #[error(transparent)]
    InvalidProfile(#[from] ProfileError),
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error(transparent)]
    Init(#[from] WorkerInitError),
}

/// Failure while verifying delivery of a message batch.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("send failed: {0}")]
    Send(#[source] ClientError),
    #[error("receiver {worker}: {source}")]
    Receiver {
        worker: String,
        #[source]
        source: ClientError,
    },
    #[error(transparent)]
    Stream(#[from] StreamFault),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_error_attributes_worker() {
        let err = WorkerInitError::Sync {
            worker: "henry-a".into(),
            source: ClientError::Offline,
        };
        assert_eq!(err.worker(), "henry-a");
        assert!(err.to_string().contains("henry-a"));
        assert!(err.to_string().contains("initial sync"));
    }

    #[test]
    fn pool_error_wraps_init_error_transparently() {
        let err = PoolError::from(WorkerInitError::UnsupportedVersion {
            worker: "nancy-b".into(),
            version: 9,
        });
        assert!(err.to_string().contains("protocol version 9"));
    }

    #[test]
    fn stream_fault_message_names_worker_and_detail() {
        let fault = StreamFault {
            worker: "oscar-a".into(),
            detail: "stream closed".into(),
        };
        let rendered = fault.to_string();
        assert!(rendered.contains("oscar-a"));
        assert!(rendered.contains("stream closed"));
    }
}
