//! Network definitions: the signed document listing the gateways a new client trusts for bootstrap.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::identity::PublicKey;

/// One gateway a client may link to. Its key is pinned during the link handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: String,
    /// `host:port` of the gateway's link listener.
    pub address: String,
    #[serde(with = "hex_key")]
    pub public_key: PublicKey,
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::identity::PublicKey;

    pub fn serialize<S: Serializer>(v: &PublicKey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(v.as_bytes()))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PublicKey, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s.trim()).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32-byte key"))?;
        Ok(PublicKey::from_bytes(arr))
    }
}

/// Parsed network definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub gateways: Vec<Gateway>,
}

impl NetworkDefinition {
    /// Parse definition bytes (JSON). An empty gateway list is accepted here; login rejects it.
    pub fn from_json(bytes: &[u8]) -> Result<Self, NdfError> {
        serde_json::from_slice(bytes).map_err(NdfError::Malformed)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, NdfError> {
        serde_json::to_vec_pretty(self).map_err(NdfError::Malformed)
    }
}

/// Envelope served by the remote: definition text plus Ed25519 signature over its bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedDefinition {
    pub definition: String,
    /// Hex-encoded 64-byte signature.
    pub signature: String,
}

/// Certificate holding the key that signs network definitions.
#[derive(Debug, Clone)]
pub struct Certificate {
    key: VerifyingKey,
}

impl Certificate {
    /// Parse certificate text: a hex key, optionally between `-----BEGIN`/`-----END` lines.
    pub fn parse(text: &str) -> Result<Self, NdfError> {
        let body: String = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("-----"))
            .collect();
        let bytes = hex::decode(&body).map_err(|_| NdfError::BadCertificate)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| NdfError::BadCertificate)?;
        let key = VerifyingKey::from_bytes(&arr).map_err(|_| NdfError::BadCertificate)?;
        Ok(Self { key })
    }

    pub fn from_key(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Render in the format `parse` accepts.
    pub fn to_pem(&self) -> String {
        format!(
            "-----BEGIN MIXBOOT CERTIFICATE-----\n{}\n-----END MIXBOOT CERTIFICATE-----\n",
            hex::encode(self.key.as_bytes())
        )
    }
}

/// Verify a downloaded signed definition. Returns the definition bytes only if the signature
/// checks out against `cert` and the definition parses.
pub fn verify_signed(envelope: &[u8], cert: &Certificate) -> Result<Vec<u8>, NdfError> {
    let signed: SignedDefinition =
        serde_json::from_slice(envelope).map_err(NdfError::Malformed)?;
    let sig_bytes = hex::decode(signed.signature.trim()).map_err(|_| NdfError::BadSignature)?;
    let sig_arr: [u8; 64] = sig_bytes.try_into().map_err(|_| NdfError::BadSignature)?;
    let signature = Signature::from_bytes(&sig_arr);
    let definition = signed.definition.into_bytes();
    cert.key
        .verify(&definition, &signature)
        .map_err(|_| NdfError::BadSignature)?;
    NetworkDefinition::from_json(&definition)?;
    Ok(definition)
}

#[derive(Debug, thiserror::Error)]
pub enum NdfError {
    #[error("malformed network definition: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("certificate does not hold a valid signing key")]
    BadCertificate,
    #[error("network definition signature does not verify")]
    BadSignature,
}
