//! Deterministic storage path resolution for worker databases.
//!
//! Layout: `<base>/.data/<namespace>/<name>/<installation>/<identifier>.db3`
//! where the identifier encodes account address, protocol version and
//! environment. Namespaces starting with `bug_` are redirected under
//! `<base>/bugs/<namespace>/.data/...` so reproduction data sits outside
//! the tree that routine cleanup wipes.
//!
//! Resolution is a pure function of its inputs plus a `create_dir_all`;
//! calling it twice with the same inputs yields the same path and leaves
//! existing contents untouched. Two workers sharing a name but not an
//! installation id never collide, and the same worker under two protocol
//! versions keeps two separate databases.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use mesh_client::{AccountAddress, MeshEnv, ProtocolVersion};

/// Directory holding all worker databases for a namespace.
pub const DATA_DIR: &str = ".data";
/// Parent directory for redirected bug-report namespaces.
pub const BUGS_DIR: &str = "bugs";

const BUG_PREFIX: &str = "bug_";

/// Version used when the caller does not pin one explicitly.
const DEFAULT_VERSION: ProtocolVersion = ProtocolVersion::V2;

/// Lowercased worker name with any installation suffix stripped.
///
/// `Henry-b` and `henry` both resolve to `henry`, so every installation
/// of a logical worker shares one identity and one storage subtree.
#[must_use]
pub fn base_name(name: &str) -> String {
    let trimmed = name.split('-').next().unwrap_or(name);
    trimmed.to_lowercase()
}

/// Root of the database tree for a namespace, honouring the `bug_` redirect.
#[must_use]
pub fn data_root(base_dir: &Path, namespace: &str) -> PathBuf {
    if namespace.starts_with(BUG_PREFIX) {
        base_dir.join(BUGS_DIR).join(namespace).join(DATA_DIR)
    } else {
        base_dir.join(DATA_DIR).join(namespace)
    }
}

/// Path of the key store for a namespace, honouring the `bug_` redirect.
#[must_use]
pub fn env_file_path(base_dir: &Path, namespace: &str) -> PathBuf {
    if namespace.starts_with(BUG_PREFIX) {
        base_dir.join(BUGS_DIR).join(namespace).join(".env")
    } else {
        base_dir.join(".env")
    }
}

/// Resolve the database path for one worker installation, creating the
/// parent directories if they do not exist yet.
pub fn resolve_path(
    base_dir: &Path,
    namespace: &str,
    name: &str,
    installation_id: &str,
    address: &AccountAddress,
    env: MeshEnv,
    version: Option<ProtocolVersion>,
) -> io::Result<PathBuf> {
    let dir = data_root(base_dir, namespace)
        .join(base_name(name))
        .join(installation_id);
    fs::create_dir_all(&dir)?;
    let version = version.unwrap_or(DEFAULT_VERSION);
    Ok(dir.join(format!("{address}-{version}-{env}.db3")))
}

/// Number of installations a worker name has on disk in a namespace.
///
/// Counts the installation directories under the worker's subtree;
/// returns 0 when the worker has never been provisioned there.
pub fn installation_count(base_dir: &Path, namespace: &str, name: &str) -> io::Result<usize> {
    let dir = data_root(base_dir, namespace).join(base_name(name));
    match fs::read_dir(&dir) {
        Ok(entries) => {
            let mut count = 0;
            for entry in entries {
                if entry?.file_type()?.is_dir() {
                    count += 1;
                }
            }
            Ok(count)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}
