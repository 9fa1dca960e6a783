//! Encrypted local state snapshots.
//!
//! File layout: 24-byte random nonce followed by the XChaCha20-Poly1305
//! ciphertext of a JSON document. Authentication failure on re-open is how a
//! wrong storage key surfaces.

use crate::client::StorageKey;
use crate::error::ClientError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use std::path::Path;

const NONCE_LEN: usize = 24;

/// Decrypted snapshot contents.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SnapshotDoc {
    /// Builder version that wrote the snapshot.
    pub schema: u16,
    pub inbox_id: String,
    pub env: String,
    pub conversations: Vec<String>,
    pub synced_at_ms: u64,
}

pub(crate) fn write_snapshot(
    path: &Path,
    key: &StorageKey,
    doc: &SnapshotDoc,
) -> Result<(), ClientError> {
    let plaintext = serde_json::to_vec(doc).map_err(|e| ClientError::Storage(e.to_string()))?;

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let mut nonce = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|e| ClientError::Storage(format!("snapshot encryption failed: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ClientError::Storage(e.to_string()))?;
    }
    let mut contents = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    contents.extend_from_slice(&nonce);
    contents.extend_from_slice(&ciphertext);
    std::fs::write(path, contents).map_err(|e| ClientError::Storage(e.to_string()))
}

/// Read a snapshot; `None` when no file exists yet.
pub(crate) fn read_snapshot(
    path: &Path,
    key: &StorageKey,
) -> Result<Option<SnapshotDoc>, ClientError> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ClientError::Storage(e.to_string())),
    };
    if contents.len() < NONCE_LEN {
        return Err(ClientError::Storage("snapshot file truncated".into()));
    }

    let (nonce, ciphertext) = contents.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| {
            ClientError::Storage("snapshot authentication failed: wrong storage key or corrupt file".into())
        })?;

    let doc = serde_json::from_slice(&plaintext).map_err(|e| ClientError::Storage(e.to_string()))?;
    Ok(Some(doc))
}
