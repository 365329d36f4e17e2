//! Test doubles and fixtures shared by the daemon's unit tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use mixboot_core::ndf::SignedDefinition;
use mixboot_core::{
    Certificate, CmixParams, Envelope, Gateway, Keypair, NetworkDefinition, ReceptionId,
    ReceptionIdentity, RoundId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::ndf_resolver::ResolveError;
use crate::session::{HealthCallback, Network, NetworkError, NetworkFactory, Receiver};
use crate::state::{ensure_initialized, DefinitionSource};

/// Cheap scrypt cost so tests do not spend seconds deriving keys.
pub const TEST_KDF_LOG_N: u8 = 4;

pub fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mixboot-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn definition() -> NetworkDefinition {
    NetworkDefinition {
        gateways: vec![Gateway {
            id: "gw-test".into(),
            address: "127.0.0.1:1".into(),
            public_key: Keypair::from_secret_bytes([1u8; 32]).public_key().clone(),
        }],
    }
}

pub fn definition_json() -> Vec<u8> {
    definition().to_json().unwrap()
}

pub fn test_signing_key() -> SigningKey {
    SigningKey::from_bytes(&[0x42; 32])
}

pub fn test_certificate() -> String {
    Certificate::from_key(test_signing_key().verifying_key()).to_pem()
}

pub fn signed_definition(key: &SigningKey, definition: &[u8]) -> Vec<u8> {
    serde_json::to_vec(&SignedDefinition {
        definition: String::from_utf8(definition.to_vec()).unwrap(),
        signature: hex::encode(key.sign(definition).to_bytes()),
    })
    .unwrap()
}

/// Fresh state directory initialized with the test definition and passphrase `pw`.
pub async fn initialized_state() -> (PathBuf, PathBuf) {
    let dir = temp_dir();
    let path = dir.join("state");
    ensure_initialized(&path, b"pw", TEST_KDF_LOG_N, &CountingSource::new(definition_json()))
        .await
        .unwrap();
    (dir, path)
}

/// Definition source that counts how often it is asked.
pub struct CountingSource {
    bytes: Vec<u8>,
    calls: AtomicUsize,
}

impl CountingSource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DefinitionSource for CountingSource {
    async fn resolve(&self) -> Result<Vec<u8>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.bytes.clone())
    }
}

/// Serve `body` to exactly one HTTP request. Returns the URL and a hit counter.
pub async fn serve_once(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_task = hits.clone();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut req = httparse::Request::new(&mut headers);
            if let Ok(httparse::Status::Complete(_)) = req.parse(&buf) {
                break;
            }
        }
        hits_task.fetch_add(1, Ordering::SeqCst);
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        stream.flush().await.unwrap();
    });
    (format!("http://{}/ndf.json", addr), hits)
}

/// In-process network: records sends, replays a scripted health sequence once the follower starts.
#[derive(Default)]
pub struct LoopbackNetwork {
    callbacks: Arc<Mutex<HashMap<u64, HealthCallback>>>,
    next_callback: AtomicU64,
    receiver: Mutex<Option<Arc<dyn Receiver>>>,
    sent: Mutex<Vec<(ReceptionId, Envelope)>>,
    round: AtomicU64,
    started: AtomicBool,
    fail_start: bool,
    fail_after: Mutex<Option<usize>>,
    health_script: Vec<(Duration, bool)>,
}

impl LoopbackNetwork {
    /// After start, emit each value once its offset (from start) elapses.
    pub fn with_health(script: Vec<(Duration, bool)>) -> Self {
        Self {
            health_script: script,
            ..Self::default()
        }
    }

    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn fail_sends(&self) {
        self.fail_sends_after(0);
    }

    /// Accept `n` more sends, then fail every one after.
    pub fn fail_sends_after(&self, n: usize) {
        let already = self.sent.lock().unwrap().len();
        *self.fail_after.lock().unwrap() = Some(already + n);
    }

    pub fn emit_health(&self, healthy: bool) {
        emit(&self.callbacks, healthy);
    }

    pub fn sent(&self) -> Vec<(ReceptionId, Envelope)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn has_receiver(&self) -> bool {
        self.receiver.lock().unwrap().is_some()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Hand an envelope to the session as if the gateway delivered it.
    pub fn deliver(&self, envelope: Envelope) {
        let receiver = self.receiver.lock().unwrap().clone();
        if let Some(r) = receiver {
            r.receive(envelope);
        }
    }
}

fn emit(callbacks: &Mutex<HashMap<u64, HealthCallback>>, healthy: bool) {
    for cb in callbacks.lock().unwrap().values() {
        cb(healthy);
    }
}

#[async_trait]
impl Network for LoopbackNetwork {
    async fn start_follower(&self, timeout: Duration) -> Result<(), NetworkError> {
        if self.fail_start {
            return Err(NetworkError::FollowerStartTimeout(timeout));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::FollowerRunning);
        }
        let script = self.health_script.clone();
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            for (at, healthy) in script {
                tokio::time::sleep_until(start + at).await;
                emit(&callbacks, healthy);
            }
        });
        Ok(())
    }

    fn add_health_callback(&self, callback: HealthCallback) -> u64 {
        let id = self.next_callback.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().unwrap().insert(id, callback);
        id
    }

    fn remove_health_callback(&self, id: u64) {
        self.callbacks.lock().unwrap().remove(&id);
    }

    async fn send(&self, to: ReceptionId, envelope: Envelope) -> Result<RoundId, NetworkError> {
        let limit = *self.fail_after.lock().unwrap();
        let mut sent = self.sent.lock().unwrap();
        if limit.is_some_and(|n| sent.len() >= n) {
            return Err(NetworkError::NotConnected);
        }
        sent.push((to, envelope));
        drop(sent);
        Ok(self.round.fetch_add(1, Ordering::SeqCst) + 100)
    }

    fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
        *self.receiver.lock().unwrap() = Some(receiver);
    }
}

/// Factory handing out one shared loopback network.
pub struct LoopbackFactory {
    network: Option<Arc<LoopbackNetwork>>,
}

impl LoopbackFactory {
    pub fn new(network: LoopbackNetwork) -> Self {
        Self {
            network: Some(Arc::new(network)),
        }
    }

    pub fn refusing() -> Self {
        Self { network: None }
    }

    pub fn network(&self) -> Arc<LoopbackNetwork> {
        self.network.clone().expect("refusing factory has no network")
    }
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new(LoopbackNetwork::default())
    }
}

impl NetworkFactory for LoopbackFactory {
    fn open(
        &self,
        _definition: &NetworkDefinition,
        _identity: &ReceptionIdentity,
        _params: &CmixParams,
    ) -> Result<Arc<dyn Network>, NetworkError> {
        match &self.network {
            Some(n) => {
                let network: Arc<dyn Network> = n.clone();
                Ok(network)
            }
            None => Err(NetworkError::NoGateways),
        }
    }
}
