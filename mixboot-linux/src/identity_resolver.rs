//! Reception identity: load by storage key, or generate and persist on first run.

use mixboot_core::ReceptionIdentity;
use tracing::{info, warn};

use crate::state::{PersistedState, StateError};

/// Identity records live under their own prefix so no storage key can name an internal record.
const IDENTITY_PREFIX: &str = "identity/";

fn record_key(storage_key: &str) -> String {
    format!("{}{}", IDENTITY_PREFIX, storage_key)
}

/// Load the identity stored under `storage_key`. If none loads, generate one and store it
/// before returning it; an identity that could not be stored is never handed out.
pub fn load_or_create(
    storage_key: &str,
    state: &PersistedState,
) -> Result<ReceptionIdentity, IdentityError> {
    match load(storage_key, state) {
        Ok(identity) => {
            info!(id = %identity.id, "loaded reception identity");
            return Ok(identity);
        }
        Err(StateError::NotFound(_)) => {
            info!(key = storage_key, "no reception identity stored, generating one");
        }
        Err(e) => {
            warn!(key = storage_key, error = %e, "stored reception identity unusable, replacing it");
        }
    }

    let identity = ReceptionIdentity::generate();
    let bytes = identity.to_bytes().map_err(IdentityError::Encode)?;
    state
        .set(&record_key(storage_key), &bytes)
        .map_err(IdentityError::Store)?;
    info!(id = %identity.id, "stored new reception identity");
    Ok(identity)
}

fn load(storage_key: &str, state: &PersistedState) -> Result<ReceptionIdentity, StateError> {
    let bytes = state.get(&record_key(storage_key))?;
    let identity =
        ReceptionIdentity::from_bytes(&bytes).map_err(|_| StateError::Corrupt("identity"))?;
    if !identity.is_consistent() {
        return Err(StateError::Corrupt("identity"));
    }
    Ok(identity)
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to encode reception identity: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to store reception identity: {0}")]
    Store(#[source] StateError),
}
