//! Single-use requests: one-shot request/response exchanges addressed to a reception identity.
//!
//! The requester encrypts to the server's reception public key with a fresh ephemeral key.
//! The server derives the same key from its reception private key and answers under it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::{
    decrypt_wire, derive_session_key, encrypt_wire, Keypair, PublicKey, WireCryptoError,
    SINGLE_USE_KEY_LABEL,
};

const REQUEST_NONCE: u64 = 0;
const RESPONSE_NONCE: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            body: b"no endpoint".to_vec(),
        }
    }
}

type Handler = Box<dyn Fn(&Request) -> Response + Send + Sync>;

/// Endpoint table keyed by (method, uri).
#[derive(Default)]
pub struct Endpoints {
    handlers: HashMap<(Method, String), Handler>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, method: Method, uri: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.handlers
            .insert((method, uri.to_string()), Box::new(handler));
    }

    pub fn dispatch(&self, request: &Request) -> Response {
        match self.handlers.get(&(request.method, request.uri.clone())) {
            Some(h) => h(request),
            None => Response::not_found(),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Requester side: seal `request` to `server`. Returns the ephemeral public key, ciphertext, and reply key.
pub fn seal_request(
    server: &PublicKey,
    request: &Request,
) -> Result<(PublicKey, Vec<u8>, [u8; 32]), SingleUseError> {
    let ephemeral = Keypair::generate();
    let key = derive_session_key(SINGLE_USE_KEY_LABEL, &ephemeral.shared_secret(server));
    let plain = bincode::serialize(request)?;
    let cipher = encrypt_wire(&key, REQUEST_NONCE, &plain)?;
    Ok((ephemeral.public_key().clone(), cipher, key))
}

/// Server side: open a request with the reception keypair. Returns the request and the reply key.
pub fn open_request(
    reception: &Keypair,
    ephemeral: &PublicKey,
    ciphertext: &[u8],
) -> Result<(Request, [u8; 32]), SingleUseError> {
    let key = derive_session_key(SINGLE_USE_KEY_LABEL, &reception.shared_secret(ephemeral));
    let plain = decrypt_wire(&key, REQUEST_NONCE, ciphertext)?;
    Ok((bincode::deserialize(&plain)?, key))
}

pub fn seal_response(key: &[u8; 32], response: &Response) -> Result<Vec<u8>, SingleUseError> {
    let plain = bincode::serialize(response)?;
    Ok(encrypt_wire(key, RESPONSE_NONCE, &plain)?)
}

pub fn open_response(key: &[u8; 32], ciphertext: &[u8]) -> Result<Response, SingleUseError> {
    let plain = decrypt_wire(key, RESPONSE_NONCE, ciphertext)?;
    Ok(bincode::deserialize(&plain)?)
}

#[derive(Debug, thiserror::Error)]
pub enum SingleUseError {
    #[error("single-use crypto: {0}")]
    Crypto(#[from] WireCryptoError),
    #[error("single-use encoding: {0}")]
    Encoding(#[from] bincode::Error),
}
