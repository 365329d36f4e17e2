//! Contact descriptors: what a peer needs to address a reception identity, and the file format they travel in.

use serde::{Deserialize, Serialize};

use crate::identity::{PublicKey, ReceptionId};

/// Leading bytes of every marshalled contact.
const CONTACT_MAGIC: &[u8; 4] = b"MXC1";
/// Contact format version.
pub const CONTACT_VERSION: u8 = 1;

/// Identity-derived descriptor exchanged out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ReceptionId,
    pub public_key: PublicKey,
}

#[derive(Serialize, Deserialize)]
struct ContactFile {
    version: u8,
    contact: Contact,
}

impl Contact {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            id: ReceptionId::from_public_key(&public_key),
            public_key,
        }
    }

    /// Serialize for export: magic + bincode(version, contact).
    pub fn marshal(&self) -> Result<Vec<u8>, ContactError> {
        let body = bincode::serialize(&ContactFile {
            version: CONTACT_VERSION,
            contact: self.clone(),
        })?;
        let mut out = Vec::with_capacity(CONTACT_MAGIC.len() + body.len());
        out.extend_from_slice(CONTACT_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse a marshalled contact. The ID must derive from the public key.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, ContactError> {
        let body = bytes
            .strip_prefix(CONTACT_MAGIC.as_slice())
            .ok_or(ContactError::BadMagic)?;
        let file: ContactFile = bincode::deserialize(body)?;
        if file.version != CONTACT_VERSION {
            return Err(ContactError::UnsupportedVersion(file.version));
        }
        if ReceptionId::from_public_key(&file.contact.public_key) != file.contact.id {
            return Err(ContactError::IdMismatch);
        }
        Ok(file.contact)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContactError {
    #[error("not a contact file")]
    BadMagic,
    #[error("unsupported contact version {0}")]
    UnsupportedVersion(u8),
    #[error("contact id does not match its public key")]
    IdMismatch,
    #[error("contact encoding: {0}")]
    Encoding(#[from] bincode::Error),
}
