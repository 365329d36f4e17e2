//! Mixnet client bootstrap: identities, contacts, signed network definitions, link protocol.
//! Host-driven: no sockets or files; the daemon does the I/O.

pub mod contact;
pub mod health;
pub mod identity;
pub mod ndf;
pub mod params;
pub mod partition;
pub mod protocol;
pub mod single_use;
pub mod wire;

pub use contact::{Contact, ContactError};
pub use health::HealthTracker;
pub use identity::{Keypair, PublicKey, ReceptionId, ReceptionIdentity};
pub use ndf::{Certificate, Gateway, NdfError, NetworkDefinition};
pub use params::{CmixParams, E2eParams, ParamsError};
pub use protocol::{Envelope, EnvelopeKind, LinkMessage, MessageId, MessageType, RoundId, PROTOCOL_VERSION};
