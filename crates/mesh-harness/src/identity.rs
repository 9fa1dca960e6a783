//! Identity provisioning backed by a dotenv-style key store.
//!
//! Each logical worker name owns one signing seed and one storage
//! encryption key for the lifetime of a namespace. Keys are persisted as
//! `WALLET_KEY_<NAME>` / `ENCRYPTION_KEY_<NAME>` pairs in a plain-text
//! store so a crashed run can be resumed, and restored material always
//! wins over fresh generation. Names containing `random` are treated as
//! throwaway and never written to disk.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mesh_client::{derive_address, AccountAddress, KeypairSigner, MeshSigner, StorageKey};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::ProvisioningError;

const WALLET_KEY_PREFIX: &str = "WALLET_KEY_";
const ENCRYPTION_KEY_PREFIX: &str = "ENCRYPTION_KEY_";

/// Key material for one logical worker name.
///
/// Holds the hex encodings exactly as stored; typed objects are derived
/// on demand so a corrupt store entry fails at use, with attribution.
#[derive(Clone, Debug)]
pub struct WorkerIdentity {
    name: String,
    wallet_key: String,
    encryption_key: String,
}

impl WorkerIdentity {
    fn new(name: String, wallet_key: String, encryption_key: String) -> Self {
        Self {
            name,
            wallet_key,
            encryption_key,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hex-encoded signing seed, `0x`-prefixed.
    pub fn wallet_key(&self) -> &str {
        &self.wallet_key
    }

    /// Hex-encoded storage encryption key.
    pub fn encryption_key(&self) -> &str {
        &self.encryption_key
    }

    /// Signer rebuilt from the stored seed.
    pub fn signer(&self) -> Result<KeypairSigner, ProvisioningError> {
        let seed = decode_key32(&self.name, "wallet key", &self.wallet_key)?;
        Ok(KeypairSigner::from_seed(seed))
    }

    /// Storage encryption key rebuilt from the stored hex.
    pub fn storage_key(&self) -> Result<StorageKey, ProvisioningError> {
        let bytes = decode_key32(&self.name, "encryption key", &self.encryption_key)?;
        Ok(StorageKey::from_bytes(bytes))
    }

    /// Account address derived from the signing seed.
    pub fn address(&self) -> Result<AccountAddress, ProvisioningError> {
        let signer = self.signer()?;
        Ok(derive_address(&signer.verifying_key()))
    }
}

fn decode_key32(name: &str, field: &str, value: &str) -> Result<[u8; 32], ProvisioningError> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    let bytes = hex::decode(stripped).map_err(|e| ProvisioningError::InvalidMaterial {
        name: name.to_owned(),
        detail: format!("{field} is not valid hex: {e}"),
    })?;
    bytes
        .try_into()
        .map_err(|_| ProvisioningError::InvalidMaterial {
            name: name.to_owned(),
            detail: format!("{field} must be 32 bytes"),
        })
}

/// Append-only dotenv-style store of `KEY=VALUE` lines.
///
/// Comment lines record the owning name and derived address next to each
/// block, which keeps the file greppable during a debugging session.
struct EnvKeyStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl EnvKeyStore {
    fn open(path: PathBuf) -> Result<Self, ProvisioningError> {
        let mut entries = HashMap::new();
        match fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((key, value)) = line.split_once('=') {
                        entries.insert(key.trim().to_owned(), value.trim().to_owned());
                    }
                }
                debug!(path = %path.display(), entries = entries.len(), "loaded key store");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "key store not present yet");
            }
            Err(e) => {
                return Err(ProvisioningError::Store {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    /// Append one identity block and mirror it into the in-memory map.
    fn append_identity(
        &self,
        name: &str,
        wallet_key: &str,
        encryption_key: &str,
        address: &AccountAddress,
    ) -> Result<(), ProvisioningError> {
        let upper = name.to_uppercase();
        let block = format!(
            "\n# {name}\n{WALLET_KEY_PREFIX}{upper}={wallet_key}\n{ENCRYPTION_KEY_PREFIX}{upper}={encryption_key}\n# address {address}\n",
        );
        let persist = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            file.write_all(block.as_bytes())
        };
        persist().map_err(|source| ProvisioningError::Persist {
            name: name.to_owned(),
            source,
        })?;
        let mut entries = self.entries.lock();
        entries.insert(format!("{WALLET_KEY_PREFIX}{upper}"), wallet_key.to_owned());
        entries.insert(
            format!("{ENCRYPTION_KEY_PREFIX}{upper}"),
            encryption_key.to_owned(),
        );
        Ok(())
    }
}

/// Ensures key material for worker names, with restore-over-generate
/// semantics and single-flight generation per name.
pub struct IdentityProvisioner {
    store: EnvKeyStore,
    cache: Mutex<HashMap<String, Arc<WorkerIdentity>>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdentityProvisioner {
    /// Open the provisioner for a run, loading any existing key store.
    pub fn open(config: &HarnessConfig) -> Result<Self, ProvisioningError> {
        Self::open_at(config.key_store_path())
    }

    /// Open against an explicit store path.
    pub fn open_at(path: PathBuf) -> Result<Self, ProvisioningError> {
        Ok(Self {
            store: EnvKeyStore::open(path)?,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Return the identity for `name`, restoring it from the store when
    /// present and generating (then persisting) it otherwise.
    ///
    /// Concurrent calls for the same name serialize on a per-name lock,
    /// so exactly one generates and the rest observe the cached result.
    pub async fn ensure_identity(
        &self,
        name: &str,
    ) -> Result<Arc<WorkerIdentity>, ProvisioningError> {
        let name = name.to_lowercase();
        if let Some(identity) = self.cache.lock().get(&name) {
            return Ok(Arc::clone(identity));
        }

        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(name.clone()).or_default())
        };
        let _guard = lock.lock().await;

        // A racing call may have finished while we waited for the lock.
        if let Some(identity) = self.cache.lock().get(&name) {
            return Ok(Arc::clone(identity));
        }

        let upper = name.to_uppercase();
        let stored_wallet = self.store.get(&format!("{WALLET_KEY_PREFIX}{upper}"));
        let stored_encryption = self.store.get(&format!("{ENCRYPTION_KEY_PREFIX}{upper}"));
        if let (Some(wallet_key), Some(encryption_key)) = (stored_wallet, stored_encryption) {
            let identity = Arc::new(WorkerIdentity::new(name.clone(), wallet_key, encryption_key));
            // Fail now, not at worker init, if the stored hex is corrupt.
            identity.signer()?;
            identity.storage_key()?;
            debug!(name = %name, "restored identity from key store");
            self.cache.lock().insert(name, Arc::clone(&identity));
            return Ok(identity);
        }

        let signer = KeypairSigner::generate();
        let wallet_key = format!("0x{}", hex::encode(signer.to_seed()));
        let encryption_key = hex::encode(StorageKey::generate().as_bytes());
        let address = signer.address();
        let identity = Arc::new(WorkerIdentity::new(
            name.clone(),
            wallet_key.clone(),
            encryption_key.clone(),
        ));

        if name.contains("random") {
            debug!(name = %name, "ephemeral identity, skipping persistence");
        } else if let Err(e) =
            self.store
                .append_identity(&name, &wallet_key, &encryption_key, &address)
        {
            // The identity still works for this process; the next run
            // will not be able to restore it.
            warn!(name = %name, error = %e, "failed to persist generated identity");
            self.cache.lock().insert(name, Arc::clone(&identity));
            return Err(e);
        } else {
            info!(name = %name, address = %address, "generated and persisted identity");
        }

        self.cache.lock().insert(name, Arc::clone(&identity));
        Ok(identity)
    }

    /// Path of the backing store, for diagnostics.
    pub fn store_path(&self) -> &Path {
        &self.store.path
    }
}
