//! Logged-in session: one reception identity bound to one network engine, plus inbound routing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use mixboot_core::identity::{decrypt_wire, derive_session_key, E2E_KEY_LABEL};
use mixboot_core::partition::Reassembler;
use mixboot_core::wire::FrameEncodeError;
use mixboot_core::{
    CmixParams, Contact, E2eParams, Envelope, EnvelopeKind, Keypair, MessageId, MessageType,
    NetworkDefinition, PublicKey, ReceptionId, ReceptionIdentity, RoundId,
};
use tracing::{debug, info, warn};

use crate::state::{PersistedState, StateError};

/// Health notification hook. Must not block: it runs on the network's follower task.
pub type HealthCallback = Box<dyn Fn(bool) + Send + Sync>;

/// The opaque network engine a session drives.
#[async_trait]
pub trait Network: Send + Sync {
    /// Start background participation. Returns once the follower runs, or fails within `timeout`.
    async fn start_follower(&self, timeout: Duration) -> Result<(), NetworkError>;
    fn add_health_callback(&self, callback: HealthCallback) -> u64;
    fn remove_health_callback(&self, id: u64);
    /// Place an envelope for `to` in the current round.
    async fn send(&self, to: ReceptionId, envelope: Envelope) -> Result<RoundId, NetworkError>;
    /// Handler for envelopes addressed to this client.
    fn set_receiver(&self, receiver: Arc<dyn Receiver>);
}

/// Builds the network engine for a session at login.
pub trait NetworkFactory {
    fn open(
        &self,
        definition: &NetworkDefinition,
        identity: &ReceptionIdentity,
        params: &CmixParams,
    ) -> Result<Arc<dyn Network>, NetworkError>;
}

pub trait Receiver: Send + Sync {
    fn receive(&self, envelope: Envelope);
}

/// Handles single-use requests delivered to the session.
pub trait SingleUseHandler: Send + Sync {
    fn handle(&self, envelope: Envelope);
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_type: MessageType,
    pub message_id: MessageId,
    pub sender: ReceptionId,
    pub payload: Vec<u8>,
    pub received_at: SystemTime,
}

pub trait Listener: Send + Sync {
    fn hear(&self, message: ReceivedMessage);
    fn name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("network definition lists no gateways")]
    NoGateways,
    #[error("bad gateway address {0:?}")]
    BadGatewayAddress(String),
    #[error("network follower already running")]
    FollowerRunning,
    #[error("network follower did not start within {0:?}")]
    FollowerStartTimeout(Duration),
    #[error("not connected to a gateway")]
    NotConnected,
    #[error("link encoding: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("link encryption failed")]
    Crypto,
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("reception identity keys do not match")]
    BadIdentity,
    #[error("state: {0}")]
    State(#[from] StateError),
    #[error("network: {0}")]
    Network(#[from] NetworkError),
}

/// Directional E2E key: each sender has its own key towards each recipient, so nonces never collide.
pub fn e2e_key(local: &Keypair, peer_key: &PublicKey, from: &ReceptionId, to: &ReceptionId) -> [u8; 32] {
    let mut label = Vec::with_capacity(E2E_KEY_LABEL.len() + 64);
    label.extend_from_slice(E2E_KEY_LABEL);
    label.extend_from_slice(from.as_bytes());
    label.extend_from_slice(to.as_bytes());
    derive_session_key(&label, &local.shared_secret(peer_key))
}

struct ListenerEntry {
    partner: Option<ReceptionId>,
    message_type: MessageType,
    listener: Arc<dyn Listener>,
}

/// Routes inbound envelopes: channel requests, E2E parts to listeners, single-use requests to the server.
pub struct Switchboard {
    keypair: Keypair,
    partners: Mutex<HashSet<ReceptionId>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener: Mutex<u64>,
    reassembler: Mutex<Reassembler>,
    single_use: Mutex<Option<Arc<dyn SingleUseHandler>>>,
}

impl Switchboard {
    fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            partners: Mutex::new(HashSet::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: Mutex::new(0),
            reassembler: Mutex::new(Reassembler::new()),
            single_use: Mutex::new(None),
        }
    }

    pub fn add_partner(&self, id: ReceptionId) {
        lock(&self.partners).insert(id);
    }

    pub fn is_partner(&self, id: &ReceptionId) -> bool {
        lock(&self.partners).contains(id)
    }

    /// Register a listener for messages from `partner` (or anyone, if `None`) of `message_type`.
    /// Returns `None` if a listener with the same name already covers that partner and type.
    pub fn register(
        &self,
        partner: Option<ReceptionId>,
        message_type: MessageType,
        listener: Arc<dyn Listener>,
    ) -> Option<u64> {
        let mut listeners = lock(&self.listeners);
        if listeners.iter().any(|e| {
            e.partner == partner
                && e.message_type == message_type
                && e.listener.name() == listener.name()
        }) {
            return None;
        }
        let id = {
            let mut next = lock(&self.next_listener);
            *next += 1;
            *next
        };
        listeners.push(ListenerEntry {
            partner,
            message_type,
            listener,
        });
        Some(id)
    }

    pub fn set_single_use_handler(&self, handler: Arc<dyn SingleUseHandler>) {
        *lock(&self.single_use) = Some(handler);
    }

    fn on_channel_request(&self, envelope: &Envelope) {
        let key = e2e_key(
            &self.keypair,
            &envelope.sender_key,
            &envelope.from,
            &self.keypair.reception_id(),
        );
        let contact = decrypt_wire(&key, envelope.nonce, &envelope.ciphertext)
            .ok()
            .and_then(|plain| Contact::unmarshal(&plain).ok());
        match contact {
            Some(c) if c.id == envelope.from => {
                info!(peer = %c.id, "peer opened a direct channel");
                self.add_partner(c.id);
            }
            _ => warn!(from = %envelope.from, "dropping malformed channel request"),
        }
    }

    fn on_e2e(&self, envelope: &Envelope, message_type: MessageType, message_id: MessageId, part: u16, parts: u16) {
        if !self.is_partner(&envelope.from) {
            debug!(from = %envelope.from, "dropping message from unknown sender");
            return;
        }
        let key = e2e_key(
            &self.keypair,
            &envelope.sender_key,
            &envelope.from,
            &self.keypair.reception_id(),
        );
        let plain = match decrypt_wire(&key, envelope.nonce, &envelope.ciphertext) {
            Ok(p) => p,
            Err(_) => {
                warn!(from = %envelope.from, "dropping undecryptable message part");
                return;
            }
        };
        let complete = lock(&self.reassembler).on_part(message_id, part, parts, plain);
        let payload = match complete {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                warn!(from = %envelope.from, error = %e, "dropping bad message part");
                return;
            }
        };
        let message = ReceivedMessage {
            message_type,
            message_id,
            sender: envelope.from,
            payload,
            received_at: SystemTime::now(),
        };
        let targets: Vec<Arc<dyn Listener>> = lock(&self.listeners)
            .iter()
            .filter(|e| e.partner.map_or(true, |p| p == envelope.from))
            .filter(|e| e.message_type.matches(message_type))
            .map(|e| e.listener.clone())
            .collect();
        if targets.is_empty() {
            debug!(id = %message_id, "no listener for message");
        }
        for listener in targets {
            listener.hear(message.clone());
        }
    }
}

impl Receiver for Switchboard {
    fn receive(&self, envelope: Envelope) {
        if ReceptionId::from_public_key(&envelope.sender_key) != envelope.from {
            warn!(from = %envelope.from, "dropping envelope whose sender key does not match its id");
            return;
        }
        match envelope.kind.clone() {
            EnvelopeKind::ChannelRequest => self.on_channel_request(&envelope),
            EnvelopeKind::E2e {
                message_type,
                message_id,
                part,
                parts,
            } => self.on_e2e(&envelope, message_type, message_id, part, parts),
            EnvelopeKind::SingleUseRequest { .. } => {
                let handler = lock(&self.single_use).clone();
                match handler {
                    Some(h) => h.handle(envelope),
                    None => debug!("no single-use server, dropping request"),
                }
            }
            EnvelopeKind::SingleUseResponse { .. } => {
                debug!("dropping unsolicited single-use response");
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A logged-in session. Exactly one per process; outlives every channel and request.
pub struct Session {
    identity: ReceptionIdentity,
    params: E2eParams,
    network: Arc<dyn Network>,
    switchboard: Arc<Switchboard>,
    state: PersistedState,
}

/// Bind `identity` to the initialized `state` and open its network engine.
pub fn login(
    state: PersistedState,
    identity: ReceptionIdentity,
    params: E2eParams,
    factory: &dyn NetworkFactory,
) -> Result<Session, LoginError> {
    if !identity.is_consistent() {
        return Err(LoginError::BadIdentity);
    }
    let definition = state.definition()?;
    info!("Using E2E parameters: {:?}", params);
    let network = factory.open(&definition, &identity, &params.base)?;
    let switchboard = Arc::new(Switchboard::new(identity.keypair()));
    network.set_receiver(switchboard.clone());
    info!(id = %identity.id, gateways = definition.gateways.len(), "logged in");
    Ok(Session {
        identity,
        params,
        network,
        switchboard,
        state,
    })
}

impl Session {
    pub fn identity(&self) -> &ReceptionIdentity {
        &self.identity
    }

    pub fn params(&self) -> &E2eParams {
        &self.params
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    pub fn switchboard(&self) -> &Arc<Switchboard> {
        &self.switchboard
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }
}
