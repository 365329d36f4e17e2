//! Direct channels: an authenticated E2E link to one known peer, its listeners, and sends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use mixboot_core::identity::encrypt_wire;
use mixboot_core::partition::split_into_parts;
use mixboot_core::{
    CmixParams, Contact, ContactError, Envelope, EnvelopeKind, Keypair, MessageId, MessageType,
    ReceptionIdentity, RoundId,
};
use tracing::info;

use crate::session::{e2e_key, Listener, Network, NetworkError, ReceivedMessage, Session, Switchboard};

/// What a successful send produced: one round per part.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub rounds: Vec<RoundId>,
    pub message_id: MessageId,
    pub sent_at: SystemTime,
}

pub struct Connection {
    partner: Contact,
    local: ReceptionIdentity,
    keypair: Keypair,
    send_key: [u8; 32],
    nonce: AtomicU64,
    network: Arc<dyn Network>,
    switchboard: Arc<Switchboard>,
}

/// Open a direct channel to `peer`: announce ourselves to it and accept its messages from now on.
pub async fn connect(peer: &Contact, session: &Session) -> Result<Connection, ChannelError> {
    let local = session.identity().clone();
    if peer.id == local.id {
        return Err(ChannelError::SelfContact);
    }
    let keypair = local.keypair();
    let send_key = e2e_key(&keypair, &peer.public_key, &local.id, &peer.id);
    let start_nonce: u64 = rand::random::<u64>() >> 1;

    let hello = local.contact().marshal()?;
    let envelope = Envelope {
        from: local.id,
        sender_key: local.public_key.clone(),
        nonce: start_nonce,
        kind: EnvelopeKind::ChannelRequest,
        ciphertext: encrypt_wire(&send_key, start_nonce, &hello).map_err(|_| ChannelError::Crypto)?,
    };
    let round = session
        .network()
        .send(peer.id, envelope)
        .await
        .map_err(ChannelError::Request)?;
    session.switchboard().add_partner(peer.id);
    info!(peer = %peer.id, round, "Connect with {} successfully established", peer.id);

    Ok(Connection {
        partner: peer.clone(),
        local,
        keypair,
        send_key,
        nonce: AtomicU64::new(start_nonce + 1),
        network: session.network().clone(),
        switchboard: session.switchboard().clone(),
    })
}

impl Connection {
    pub fn partner(&self) -> &Contact {
        &self.partner
    }

    /// Listen for messages of `message_type` from the partner. `MessageType::ANY` hears everything.
    pub fn register_listener(
        &self,
        message_type: MessageType,
        listener: Arc<dyn Listener>,
    ) -> Result<u64, ChannelError> {
        let name = listener.name().to_string();
        self.switchboard
            .register(Some(self.partner.id), message_type, listener)
            .ok_or(ChannelError::DuplicateListener(name))
    }

    /// Send one message, split across as many rounds as its size needs.
    pub async fn send_e2e(
        &self,
        message_type: MessageType,
        payload: &[u8],
        params: &CmixParams,
    ) -> Result<SendReport, SendError> {
        let parts = split_into_parts(payload, params.max_part_len);
        let count = u16::try_from(parts.len()).map_err(|_| SendError::TooLarge(payload.len()))?;
        let first_nonce = self.nonce.fetch_add(u64::from(count), Ordering::SeqCst);
        let message_id = MessageId::compute(&self.local.id, &self.partner.id, first_nonce, payload);
        let sent_at = SystemTime::now();

        let mut rounds = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let nonce = first_nonce + i as u64;
            let envelope = Envelope {
                from: self.local.id,
                sender_key: self.keypair.public_key().clone(),
                nonce,
                kind: EnvelopeKind::E2e {
                    message_type,
                    message_id,
                    part: i as u16,
                    parts: count,
                },
                ciphertext: encrypt_wire(&self.send_key, nonce, part).map_err(|_| SendError::Crypto)?,
            };
            rounds.push(self.network.send(self.partner.id, envelope).await?);
        }
        Ok(SendReport {
            rounds,
            message_id,
            sent_at,
        })
    }
}

/// Catch-all listener that logs what it hears.
pub struct LoggingListener {
    name: String,
}

impl LoggingListener {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Listener for LoggingListener {
    fn hear(&self, message: ReceivedMessage) {
        info!(
            listener = %self.name,
            from = %message.sender,
            id = %message.message_id,
            kind = message.message_type.0,
            "Message received: {}",
            String::from_utf8_lossy(&message.payload)
        );
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot open a channel to our own identity")]
    SelfContact,
    #[error("contact: {0}")]
    Contact(#[from] ContactError),
    #[error("channel encryption failed")]
    Crypto,
    #[error("channel request not sent: {0}")]
    Request(#[source] NetworkError),
    #[error("listener {0:?} already registered")]
    DuplicateListener(String),
}

/// Send failures do not end the process.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("network: {0}")]
    Network(#[from] NetworkError),
    #[error("message encryption failed")]
    Crypto,
    #[error("message of {0} bytes needs too many parts")]
    TooLarge(usize),
}
