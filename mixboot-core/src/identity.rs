//! Reception identity and crypto: keypairs, reception IDs, derived keys, wire encryption.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::contact::Contact;

/// Label mixed into the gateway link key.
pub const LINK_KEY_LABEL: &[u8] = b"mixboot-link-v1";
/// Label mixed into direct-channel (end-to-end) keys.
pub const E2E_KEY_LABEL: &[u8] = b"mixboot-e2e-v1";
/// Label mixed into single-use request keys.
pub const SINGLE_USE_KEY_LABEL: &[u8] = b"mixboot-single-use-v1";

/// Reception public key (32 bytes, X25519). This is the addressable key material peers encrypt to.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] pub [u8; 32]);

pub(crate) mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Reception ID: hash of the reception public key. Messages are addressed to it.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReceptionId(#[serde(with = "bytes_32")] pub [u8; 32]);

impl ReceptionId {
    pub fn from_public_key(public: &PublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"mixboot-reception-id-v1");
        hasher.update(public.as_bytes());
        ReceptionId(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ReceptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for ReceptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReceptionId({})", self)
    }
}

/// X25519 keypair. Keep secret key private; expose only public key and reception ID.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    id: ReceptionId,
}

impl Keypair {
    /// Generate a new random keypair and derive the reception ID from its public key.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a keypair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let id = ReceptionId::from_public_key(&public);
        Self { secret, public, id }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn reception_id(&self) -> ReceptionId {
        self.id
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Shared secret with another party's public key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Identity a process receives messages under. Persisted by storage key; never regenerated once stored.
#[derive(Clone, Serialize, Deserialize)]
pub struct ReceptionIdentity {
    pub id: ReceptionId,
    pub public_key: PublicKey,
    #[serde(with = "bytes_32")]
    private_key: [u8; 32],
}

impl ReceptionIdentity {
    pub fn generate() -> Self {
        Self::from_keypair(&Keypair::generate())
    }

    pub fn from_keypair(keypair: &Keypair) -> Self {
        Self {
            id: keypair.reception_id(),
            public_key: keypair.public_key().clone(),
            private_key: keypair.secret_bytes(),
        }
    }

    pub fn keypair(&self) -> Keypair {
        Keypair::from_secret_bytes(self.private_key)
    }

    /// Contact descriptor other peers use to address this identity.
    pub fn contact(&self) -> Contact {
        Contact::new(self.public_key.clone())
    }

    /// True if the public key matches the private key and the ID matches the public key.
    pub fn is_consistent(&self) -> bool {
        let kp = self.keypair();
        *kp.public_key() == self.public_key && kp.reception_id() == self.id
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl fmt::Debug for ReceptionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceptionIdentity")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Derive a 32-byte key from a shared secret under a domain label.
pub fn derive_session_key(label: &[u8], shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Bytes the Poly1305 tag adds to every ciphertext.
pub const WIRE_TAG_LEN: usize = 16;

/// Wire encryption: ChaCha20-Poly1305. Nonce: 96-bit counter per direction; never reuse.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

fn nonce_bytes(nonce: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..12].copy_from_slice(&nonce.to_le_bytes());
    out
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
