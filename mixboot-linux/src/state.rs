//! Persisted session state: a passphrase-sealed directory of records, created once and never overwritten.
//!
//! Layout under the state path:
//! - `meta`: format version, scrypt cost, salt, sealed passphrase check
//! - `records/<hex key>`: one sealed record per key (network definition, reception identities)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use mixboot_core::ndf::NdfError;
use mixboot_core::NetworkDefinition;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::ndf_resolver::ResolveError;

const STATE_VERSION: u8 = 1;
const META_FILE: &str = "meta";
const RECORDS_DIR: &str = "records";
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const CHECK_PLAINTEXT: &[u8] = b"mixboot-state-check";
const CHECK_KEY: &str = "__check";
/// Record holding the network definition the state was initialized from.
pub const DEFINITION_KEY: &str = "network_definition";

/// Where initialization gets its network definition from.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn resolve(&self) -> Result<Vec<u8>, ResolveError>;
}

/// Outcome of [`ensure_initialized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initialized {
    /// State already existed; nothing was touched.
    AlreadyPresent,
    /// State was created from a freshly resolved definition.
    Created,
}

#[derive(Serialize, Deserialize)]
struct StateMeta {
    version: u8,
    kdf_log_n: u8,
    salt: [u8; SALT_LEN],
    check: Vec<u8>,
}

/// True if a state object exists at `path`.
pub fn state_exists(path: &Path) -> bool {
    path.exists()
}

/// Make sure state exists at `path`. If it does, return immediately without consulting `source`.
/// Otherwise resolve a definition and create the state, sealed under `passphrase`.
pub async fn ensure_initialized(
    path: &Path,
    passphrase: &[u8],
    kdf_log_n: u8,
    source: &dyn DefinitionSource,
) -> Result<Initialized, StateError> {
    if state_exists(path) {
        debug!(path = %path.display(), "state present, skipping initialization");
        return Ok(Initialized::AlreadyPresent);
    }
    info!(path = %path.display(), "no state found, initializing");
    let definition = source.resolve().await?;
    NetworkDefinition::from_json(&definition)?;
    create_state(path, passphrase, kdf_log_n, &definition)?;
    info!(path = %path.display(), "state initialized");
    Ok(Initialized::Created)
}

/// Build the state in a sibling directory, then move it into place in one rename.
/// The staging directory never outlives a failed attempt.
fn create_state(
    path: &Path,
    passphrase: &[u8],
    kdf_log_n: u8,
    definition: &[u8],
) -> Result<(), StateError> {
    let staging = staging_path(path);
    let built = write_staging(&staging, passphrase, kdf_log_n, definition).and_then(|()| {
        if state_exists(path) {
            return Err(StateError::AlreadyExists(path.to_path_buf()));
        }
        Ok(fs::rename(&staging, path)?)
    });
    if built.is_err() {
        let _ = fs::remove_dir_all(&staging);
    }
    built
}

fn write_staging(
    staging: &Path,
    passphrase: &[u8],
    kdf_log_n: u8,
    definition: &[u8],
) -> Result<(), StateError> {
    fs::create_dir_all(staging.join(RECORDS_DIR))?;

    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = derive_key(passphrase, &salt, kdf_log_n)?;
    let meta = StateMeta {
        version: STATE_VERSION,
        kdf_log_n,
        salt,
        check: seal(&key, CHECK_KEY, CHECK_PLAINTEXT)?,
    };
    let meta_bytes = bincode::serialize(&meta).map_err(|_| StateError::Corrupt("meta"))?;
    fs::write(staging.join(META_FILE), meta_bytes)?;
    fs::write(
        staging.join(RECORDS_DIR).join(record_name(DEFINITION_KEY)),
        seal(&key, DEFINITION_KEY, definition)?,
    )?;
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!(".{}.init-{}", name, uuid::Uuid::new_v4()))
}

/// Opened state. Records are decrypted on read and sealed on write.
pub struct PersistedState {
    path: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl PersistedState {
    /// Open existing state. A wrong passphrase fails here, before any record is read.
    pub fn load(path: &Path, passphrase: &[u8]) -> Result<Self, StateError> {
        let meta_bytes = match fs::read(path.join(META_FILE)) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StateError::Missing(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let meta: StateMeta =
            bincode::deserialize(&meta_bytes).map_err(|_| StateError::Corrupt("meta"))?;
        if meta.version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion(meta.version));
        }
        let key = derive_key(passphrase, &meta.salt, meta.kdf_log_n)?;
        match open(&key, CHECK_KEY, &meta.check) {
            Ok(plain) if plain == CHECK_PLAINTEXT => {}
            _ => return Err(StateError::WrongPassphrase),
        }
        Ok(Self {
            path: path.to_path_buf(),
            key,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decrypt a record.
    pub fn get(&self, key: &str) -> Result<Vec<u8>, StateError> {
        let bytes = match fs::read(self.record_path(key)) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        open(&self.key, key, &bytes)
    }

    /// Seal and write a record. The write lands via rename so a crash never leaves half a record.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), StateError> {
        let target = self.record_path(key);
        let tmp = target.with_extension("tmp");
        fs::write(&tmp, seal(&self.key, key, value)?)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Network definition the state was initialized with.
    pub fn definition(&self) -> Result<NetworkDefinition, StateError> {
        let bytes = self.get(DEFINITION_KEY)?;
        Ok(NetworkDefinition::from_json(&bytes)?)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.path.join(RECORDS_DIR).join(record_name(key))
    }
}

impl std::fmt::Debug for PersistedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedState")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn record_name(key: &str) -> String {
    hex::encode(key.as_bytes())
}

fn derive_key(passphrase: &[u8], salt: &[u8], log_n: u8) -> Result<Zeroizing<[u8; 32]>, StateError> {
    let params = scrypt::Params::new(log_n, 8, 1, 32).map_err(|_| StateError::Kdf)?;
    let mut key = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(passphrase, salt, &params, &mut *key).map_err(|_| StateError::Kdf)?;
    Ok(key)
}

/// nonce || ciphertext. The record key is bound in as associated data.
fn seal(key: &[u8; 32], record: &str, plaintext: &[u8]) -> Result<Vec<u8>, StateError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| StateError::Crypto)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: record.as_bytes(),
            },
        )
        .map_err(|_| StateError::Crypto)?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open(key: &[u8; 32], record: &str, bytes: &[u8]) -> Result<Vec<u8>, StateError> {
    if bytes.len() < NONCE_LEN {
        return Err(StateError::Corrupt("record"));
    }
    let (nonce, sealed) = bytes.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| StateError::Crypto)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: record.as_bytes(),
            },
        )
        .map_err(|_| StateError::Corrupt("record"))
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state i/o: {0}")]
    Io(#[from] io::Error),
    #[error("could not obtain network definition: {0}")]
    Resolve(#[from] ResolveError),
    #[error("network definition rejected: {0}")]
    Definition(#[from] NdfError),
    #[error("no state at {0}")]
    Missing(PathBuf),
    #[error("state appeared at {0} during initialization")]
    AlreadyExists(PathBuf),
    #[error("unsupported state version {0}")]
    UnsupportedVersion(u8),
    #[error("wrong state passphrase")]
    WrongPassphrase,
    #[error("corrupt state {0}")]
    Corrupt(&'static str),
    #[error("no record {0:?}")]
    NotFound(String),
    #[error("key derivation failed")]
    Kdf,
    #[error("record encryption failed")]
    Crypto,
}
