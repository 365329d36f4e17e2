//! Gateway network engine: one encrypted TCP link to a gateway from the network definition.
//!
//! Handshake: both sides send version + reception id + X25519 public key + a fresh ephemeral
//! X25519 key. The gateway's static key must match the one pinned in the definition. Link keys mix
//! the static and ephemeral secrets, so counters restarting at 0 on a new link never repeat a
//! key/nonce pair. Frames are length-prefixed ChaCha20-Poly1305 ciphertext with a per-direction
//! counter nonce.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mixboot_core::identity::{decrypt_wire, derive_session_key, encrypt_wire, LINK_KEY_LABEL, WIRE_TAG_LEN};
use mixboot_core::wire::{
    decode_message, frame_bytes, frame_len, FrameDecodeError, FrameEncodeError, LEN_SIZE, MAX_FRAME_LEN,
};
use mixboot_core::{
    CmixParams, Envelope, Gateway, HealthTracker, Keypair, LinkMessage, NetworkDefinition, PublicKey,
    ReceptionId, ReceptionIdentity, RoundId, PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::session::{HealthCallback, Network, NetworkError, NetworkFactory, Receiver};

const HANDSHAKE_SIZE: usize = 1 + 32 + 32 + 32; // version + reception id + public key + ephemeral key
/// Bound on TCP connect plus handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a [`GatewayNetwork`] over the definition's gateways.
pub struct GatewayFactory;

impl NetworkFactory for GatewayFactory {
    fn open(
        &self,
        definition: &NetworkDefinition,
        identity: &ReceptionIdentity,
        params: &CmixParams,
    ) -> Result<Arc<dyn Network>, NetworkError> {
        if definition.gateways.is_empty() {
            return Err(NetworkError::NoGateways);
        }
        for gw in &definition.gateways {
            let port_ok = gw
                .address
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !port_ok {
                return Err(NetworkError::BadGatewayAddress(gw.address.clone()));
            }
        }
        let network: Arc<dyn Network> = Arc::new(GatewayNetwork::new(
            definition.gateways.clone(),
            identity.keypair(),
            params.clone(),
        ));
        Ok(network)
    }
}

pub struct GatewayNetwork {
    gateways: Vec<Gateway>,
    keypair: Keypair,
    params: CmixParams,
    shared: Arc<Shared>,
    started: AtomicBool,
}

/// State the follower task shares with the session-facing handle.
#[derive(Default)]
struct Shared {
    callbacks: Mutex<HashMap<u64, HealthCallback>>,
    next_callback: AtomicU64,
    receiver: Mutex<Option<Arc<dyn Receiver>>>,
    link: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    round: AtomicU64,
}

impl Shared {
    fn emit(&self, healthy: bool) {
        info!(healthy, "network health changed");
        for cb in lock(&self.callbacks).values() {
            cb(healthy);
        }
    }

    fn deliver(&self, envelope: Envelope) {
        let receiver = lock(&self.receiver).clone();
        match receiver {
            Some(r) => r.receive(envelope),
            None => debug!("no receiver, dropping delivered envelope"),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GatewayNetwork {
    pub fn new(gateways: Vec<Gateway>, keypair: Keypair, params: CmixParams) -> Self {
        Self {
            gateways,
            keypair,
            params,
            shared: Arc::new(Shared::default()),
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Network for GatewayNetwork {
    /// Returns once the first link attempt has finished, connected or not. A follower that
    /// misses `timeout` is stopped and may be started again.
    async fn start_follower(&self, timeout: Duration) -> Result<(), NetworkError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::FollowerRunning);
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(follow(
            self.shared.clone(),
            self.gateways.clone(),
            self.keypair.clone(),
            self.params.clone(),
            ready_tx,
        ));
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                task.abort();
                self.started.store(false, Ordering::SeqCst);
                Err(NetworkError::FollowerStartTimeout(timeout))
            }
        }
    }

    fn add_health_callback(&self, callback: HealthCallback) -> u64 {
        let id = self.shared.next_callback.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.callbacks).insert(id, callback);
        id
    }

    fn remove_health_callback(&self, id: u64) {
        lock(&self.shared.callbacks).remove(&id);
    }

    async fn send(&self, to: ReceptionId, envelope: Envelope) -> Result<RoundId, NetworkError> {
        let plain = bincode::serialize(&LinkMessage::Forward { to, envelope })
            .map_err(FrameEncodeError::Encode)?;
        if plain.len() + WIRE_TAG_LEN > MAX_FRAME_LEN as usize {
            return Err(FrameEncodeError::TooLarge.into());
        }
        let link = lock(&self.shared.link).clone();
        match link {
            Some(tx) if tx.send(plain).is_ok() => Ok(self.shared.round.load(Ordering::SeqCst)),
            _ => Err(NetworkError::NotConnected),
        }
    }

    fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
        *lock(&self.shared.receiver) = Some(receiver);
    }
}

/// Follower: keep a link to some gateway up, track health from round updates, relink on drop.
async fn follow(
    shared: Arc<Shared>,
    gateways: Vec<Gateway>,
    keypair: Keypair,
    params: CmixParams,
    ready: oneshot::Sender<()>,
) {
    if gateways.is_empty() {
        warn!("no gateways to follow");
        return;
    }
    let mut ready = Some(ready);
    let mut tracker = HealthTracker::new(Duration::from_millis(params.health_timeout_ms));
    let mut next = 0usize;
    loop {
        let gateway = &gateways[next % gateways.len()];
        next = next.wrapping_add(1);
        let attempt = connect_link(gateway, &keypair).await;
        if let Some(ready) = ready.take() {
            let _ = ready.send(());
        }
        match attempt {
            Ok(link) => {
                info!(gateway = %gateway.id, address = %gateway.address, "gateway link up");
                run_link(link, &shared, &mut tracker, &params).await;
                info!(gateway = %gateway.id, "gateway link down");
            }
            Err(e) => warn!(gateway = %gateway.id, error = %e, "gateway link failed"),
        }
        *lock(&shared.link) = None;
        if let Some(healthy) = tracker.on_disconnect() {
            shared.emit(healthy);
        }
        tokio::time::sleep(Duration::from_millis(params.reconnect_delay_ms)).await;
    }
}

struct Link {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    keys: LinkKeys,
}

/// Per-direction link keys, so the two counters never share a nonce space.
#[derive(Clone, Copy)]
pub(crate) struct LinkKeys {
    pub(crate) up: [u8; 32],
    pub(crate) down: [u8; 32],
}

/// One side's handshake: static identity plus the ephemeral key for this link only.
pub(crate) struct Hello {
    pub(crate) id: ReceptionId,
    pub(crate) public_key: PublicKey,
    pub(crate) ephemeral: PublicKey,
}

/// Static-static binds the link to the pinned keys; ephemeral-ephemeral makes it fresh.
pub(crate) fn link_keys(
    local: &Keypair,
    local_ephemeral: &Keypair,
    remote: &PublicKey,
    remote_ephemeral: &PublicKey,
) -> LinkKeys {
    let static_secret = local.shared_secret(remote);
    let ephemeral_secret = local_ephemeral.shared_secret(remote_ephemeral);
    let link_secret = derive_session_key(&ephemeral_secret, &static_secret);
    let derive = |dir: &[u8]| {
        let mut label = LINK_KEY_LABEL.to_vec();
        label.extend_from_slice(dir);
        derive_session_key(&label, &link_secret)
    };
    LinkKeys {
        up: derive(b"/up"),
        down: derive(b"/down"),
    }
}

pub(crate) fn handshake_bytes(keypair: &Keypair, ephemeral: &Keypair) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..33].copy_from_slice(keypair.reception_id().as_bytes());
    out[33..65].copy_from_slice(keypair.public_key().as_bytes());
    out[65..97].copy_from_slice(ephemeral.public_key().as_bytes());
    out
}

pub(crate) fn parse_handshake(buf: &[u8; HANDSHAKE_SIZE]) -> Result<Hello, LinkError> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(LinkError::Version(buf[0]));
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&buf[1..33]);
    let mut key = [0u8; 32];
    key.copy_from_slice(&buf[33..65]);
    let public_key = PublicKey::from_bytes(key);
    if ReceptionId::from_public_key(&public_key).0 != id {
        return Err(LinkError::IdMismatch);
    }
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&buf[65..97]);
    Ok(Hello {
        id: ReceptionId(id),
        public_key,
        ephemeral: PublicKey::from_bytes(ephemeral),
    })
}

async fn connect_link(gateway: &Gateway, keypair: &Keypair) -> Result<Link, LinkError> {
    tokio::time::timeout(CONNECT_TIMEOUT, handshake(gateway, keypair))
        .await
        .map_err(|_| LinkError::ConnectTimeout)?
}

async fn handshake(gateway: &Gateway, keypair: &Keypair) -> Result<Link, LinkError> {
    let mut stream = TcpStream::connect(gateway.address.as_str()).await?;
    let ephemeral = Keypair::generate();
    stream.write_all(&handshake_bytes(keypair, &ephemeral)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    let hello = parse_handshake(&buf)?;
    if hello.public_key != gateway.public_key {
        return Err(LinkError::UnpinnedKey(gateway.id.clone()));
    }
    debug!(gateway = %gateway.id, reception_id = %hello.id, "gateway handshake complete");
    let keys = link_keys(keypair, &ephemeral, &hello.public_key, &hello.ephemeral);
    let (reader, writer) = stream.into_split();
    Ok(Link { reader, writer, keys })
}

async fn run_link(link: Link, shared: &Arc<Shared>, tracker: &mut HealthTracker, params: &CmixParams) {
    let Link { reader, writer, keys } = link;
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    *lock(&shared.link) = Some(out_tx);
    let writer_task = tokio::spawn(write_frames(writer, keys.up, out_rx));
    // Reads happen on their own task; read_exact is not safe to cancel inside select.
    let (in_tx, mut in_rx) = mpsc::channel::<LinkMessage>(64);
    let reader_task = tokio::spawn(read_frames(reader, keys.down, in_tx));

    let mut ticker = tokio::time::interval(Duration::from_millis(params.health_check_interval_ms.max(1)));
    loop {
        tokio::select! {
            msg = in_rx.recv() => match msg {
                Some(LinkMessage::RoundUpdate { round }) => {
                    shared.round.store(round, Ordering::SeqCst);
                    if let Some(healthy) = tracker.on_round(tokio::time::Instant::now().into_std()) {
                        shared.emit(healthy);
                    }
                }
                Some(LinkMessage::Deliver { envelope }) => shared.deliver(envelope),
                Some(LinkMessage::Forward { .. }) => debug!("ignoring forward sent by gateway"),
                None => break,
            },
            _ = ticker.tick() => {
                if let Some(healthy) = tracker.check(tokio::time::Instant::now().into_std()) {
                    shared.emit(healthy);
                }
            }
        }
    }
    writer_task.abort();
    reader_task.abort();
}

async fn write_frames(mut writer: OwnedWriteHalf, key: [u8; 32], mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut nonce: u64 = 0;
    while let Some(plain) = rx.recv().await {
        let frame = match encrypt_wire(&key, nonce, &plain) {
            Ok(cipher) => frame_bytes(&cipher),
            Err(e) => {
                warn!(error = %e, "link encryption failed");
                break;
            }
        };
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "dropping oversized frame");
                continue;
            }
        };
        nonce = nonce.saturating_add(1);
        if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
}

async fn read_frames(mut reader: OwnedReadHalf, key: [u8; 32], tx: mpsc::Sender<LinkMessage>) {
    let mut nonce: u64 = 0;
    loop {
        let msg = match read_frame(&mut reader, &key, nonce).await {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "link read ended");
                return;
            }
        };
        nonce = nonce.saturating_add(1);
        if tx.send(msg).await.is_err() {
            return;
        }
    }
}

pub(crate) async fn read_frame(
    reader: &mut (impl AsyncReadExt + Unpin),
    key: &[u8; 32],
    nonce: u64,
) -> Result<LinkMessage, LinkError> {
    let mut prefix = [0u8; LEN_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = frame_len(prefix)?;
    let mut cipher = vec![0u8; len];
    reader.read_exact(&mut cipher).await?;
    let plain = decrypt_wire(key, nonce, &cipher).map_err(|_| LinkError::Decrypt)?;
    Ok(decode_message(&plain)?)
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect or handshake timed out")]
    ConnectTimeout,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("handshake id does not match its public key")]
    IdMismatch,
    #[error("gateway {0} presented a key not in the network definition")]
    UnpinnedKey(String),
    #[error("frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("link decryption failed")]
    Decrypt,
}
