//! The two bootstrap flows. Each stage runs only after the one before it succeeded; the first
//! failure ends the flow with the stage it happened in. A failed send is the one exception.

use std::path::Path;
use std::sync::Arc;

use mixboot_core::single_use::Endpoints;
use mixboot_core::{Contact, ContactError, MessageType, ReceptionIdentity};
use tracing::{info, warn};

use crate::channel::{connect, Connection, LoggingListener, SendReport};
use crate::config::Config;
use crate::error::{at, BootstrapError, Stage};
use crate::gate::{await_connectivity, GateError};
use crate::identity_resolver::load_or_create;
use crate::ndf_resolver::NdfResolver;
use crate::server::{start_server, SingleUseServer};
use crate::session::{login, NetworkFactory, Session};
use crate::state::{ensure_initialized, DefinitionSource, PersistedState, StateError};

pub const LISTENER_NAME: &str = "e2e Message Listener";

/// A running single-use server and the session it answers on.
pub struct ServerRun {
    pub session: Session,
    pub server: Arc<SingleUseServer>,
}

/// An open direct channel and what the one send produced, if it went out.
pub struct SenderRun {
    pub session: Session,
    pub connection: Connection,
    pub report: Option<SendReport>,
}

/// The network-definition source configured for cold starts.
pub fn definition_source(config: &Config) -> Result<NdfResolver, BootstrapError> {
    NdfResolver::new(&config.ndf_path, &config.certificate_path, &config.ndf_url)
        .map_err(at(Stage::NetworkDefinition))
}

/// State, identity and login: the stages both flows share.
pub async fn establish(
    config: &Config,
    source: &dyn DefinitionSource,
    factory: &dyn NetworkFactory,
) -> Result<Session, BootstrapError> {
    let passphrase = config.state_passphrase.as_bytes();
    ensure_initialized(&config.state_path, passphrase, config.state_kdf_log_n, source)
        .await
        .map_err(|e| match e {
            StateError::Resolve(_) | StateError::Definition(_) => {
                BootstrapError::fatal(Stage::NetworkDefinition, e)
            }
            e => BootstrapError::fatal(Stage::State, e),
        })?;
    let state = PersistedState::load(&config.state_path, passphrase).map_err(at(Stage::State))?;
    let identity =
        load_or_create(&config.identity_storage_key, &state).map_err(at(Stage::Identity))?;
    login(state, identity, config.network.clone(), factory).map_err(at(Stage::Login))
}

async fn gate(config: &Config, session: &Session) -> Result<(), BootstrapError> {
    await_connectivity(session, config.follower_timeout(), config.connect_timeout())
        .await
        .map_err(|e| match e {
            GateError::Timeout(waited) => BootstrapError::Timeout(waited),
            e @ GateError::FollowerStart(_) => BootstrapError::fatal(Stage::Follower, e),
        })
}

/// Server flow: log in, export our contact, serve single-use requests, wait for the network.
pub async fn run_server(
    config: &Config,
    source: &dyn DefinitionSource,
    factory: &dyn NetworkFactory,
    endpoints: Endpoints,
) -> Result<ServerRun, BootstrapError> {
    let session = establish(config, source, factory).await?;
    let identity = session.identity().clone();
    export_contact(&identity, &config.contact_path).map_err(at(Stage::Contact))?;
    info!(path = %config.contact_path.display(), id = %identity.id, "contact exported");
    let server = start_server(&identity, &session, endpoints);
    gate(config, &session).await?;
    info!(state = %session.state().path().display(), "single-use server ready");
    Ok(ServerRun { session, server })
}

/// Sender flow: log in, wait for the network, open a channel to the peer, send one message.
pub async fn run_sender(
    config: &Config,
    source: &dyn DefinitionSource,
    factory: &dyn NetworkFactory,
) -> Result<SenderRun, BootstrapError> {
    let session = establish(config, source, factory).await?;
    gate(config, &session).await?;

    let peer = import_contact(&config.peer_contact_path).map_err(at(Stage::Contact))?;
    info!("Recipient contact: {}", peer.id);
    let connection = connect(&peer, &session).await.map_err(at(Stage::Channel))?;
    connection
        .register_listener(MessageType::ANY, Arc::new(LoggingListener::new(LISTENER_NAME)))
        .map_err(at(Stage::Listener))?;

    let report = match connection
        .send_e2e(MessageType::TEXT, config.message.as_bytes(), &session.params().base)
        .await
    {
        Ok(report) => {
            info!(
                to = %connection.partner().id,
                "Message {} sent in RoundIDs: {:?} at {:?}",
                report.message_id, report.rounds, report.sent_at
            );
            Some(report)
        }
        Err(e) => {
            warn!(error = %e, "Failed to send message");
            None
        }
    };
    Ok(SenderRun {
        session,
        connection,
        report,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ContactFileError {
    #[error("contact file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("contact file {path}: {source}")]
    Format {
        path: String,
        #[source]
        source: ContactError,
    },
}

pub fn export_contact(identity: &ReceptionIdentity, path: &Path) -> Result<(), ContactFileError> {
    let bytes = identity
        .contact()
        .marshal()
        .map_err(|source| ContactFileError::Format {
            path: path.display().to_string(),
            source,
        })?;
    std::fs::write(path, bytes).map_err(|source| ContactFileError::Io {
        path: path.display().to_string(),
        source,
    })
}

pub fn import_contact(path: &Path) -> Result<Contact, ContactFileError> {
    let bytes = std::fs::read(path).map_err(|source| ContactFileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Contact::unmarshal(&bytes).map_err(|source| ContactFileError::Format {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        definition_json, initialized_state, serve_once, signed_definition, temp_dir,
        test_certificate, test_signing_key, CountingSource, LoopbackFactory, LoopbackNetwork,
        TEST_KDF_LOG_N,
    };
    use mixboot_core::EnvelopeKind;
    use std::time::Duration;

    fn test_config(dir: &Path) -> Config {
        Config {
            state_path: dir.join("state"),
            state_passphrase: "pw".into(),
            state_kdf_log_n: TEST_KDF_LOG_N,
            ndf_path: dir.join("ndf.json"),
            certificate_path: dir.join("mainnet.crt"),
            contact_path: dir.join("server.xxc"),
            peer_contact_path: dir.join("peer.xxc"),
            ..Config::default()
        }
    }

    fn healthy_soon() -> LoopbackFactory {
        LoopbackFactory::new(LoopbackNetwork::with_health(vec![
            (Duration::from_millis(10), false),
            (Duration::from_millis(30), true),
        ]))
    }

    #[tokio::test]
    async fn fresh_environment_serves() {
        let dir = temp_dir();
        let (url, hits) = serve_once(signed_definition(&test_signing_key(), &definition_json())).await;
        let mut config = test_config(&dir);
        config.ndf_url = url;
        std::fs::write(&config.certificate_path, test_certificate()).unwrap();
        let factory = healthy_soon();

        let source = definition_source(&config).unwrap();
        let run = run_server(&config, &source, &factory, Endpoints::new()).await.unwrap();

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(config.state_path.exists());
        let exported = import_contact(&config.contact_path).unwrap();
        assert_eq!(exported.id, run.session.identity().id);
        assert!(factory.network().is_started());
        assert_eq!(factory.network().callback_count(), 0);
    }

    #[tokio::test]
    async fn existing_state_sends_to_peer() {
        let (dir, path) = initialized_state().await;
        let config = test_config(&dir);
        assert_eq!(config.state_path, path);
        let stored = {
            let state = PersistedState::load(&path, b"pw").unwrap();
            load_or_create(&config.identity_storage_key, &state).unwrap()
        };
        let peer = ReceptionIdentity::generate();
        export_contact(&peer, &config.peer_contact_path).unwrap();
        let source = CountingSource::new(Vec::new());
        let factory = healthy_soon();

        let run = run_sender(&config, &source, &factory).await.unwrap();

        assert_eq!(source.calls(), 0);
        assert_eq!(run.session.identity().id, stored.id);
        let report = run.report.expect("send succeeded");
        assert!(!report.rounds.is_empty());
        let sent = factory.network().sent();
        assert_eq!(sent[0].1.kind, EnvelopeKind::ChannelRequest);
        assert!(sent[1..].iter().all(|(to, e)| *to == peer.id
            && matches!(e.kind, EnvelopeKind::E2e { message_id, .. } if message_id == report.message_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn never_healthy_times_out_without_sending() {
        let (dir, _path) = initialized_state().await;
        let config = test_config(&dir);
        export_contact(&ReceptionIdentity::generate(), &config.peer_contact_path).unwrap();
        let factory = LoopbackFactory::new(LoopbackNetwork::with_health(vec![
            (Duration::from_secs(1), false),
            (Duration::from_secs(45), true),
        ]));

        let start = tokio::time::Instant::now();
        let r = run_sender(&config, &CountingSource::new(Vec::new()), &factory).await;

        assert!(matches!(r, Err(BootstrapError::Timeout(d)) if d == Duration::from_secs(30)));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(45));
        assert!(factory.network().sent().is_empty());
    }

    #[tokio::test]
    async fn failed_send_is_not_fatal() {
        let (dir, _path) = initialized_state().await;
        let config = test_config(&dir);
        export_contact(&ReceptionIdentity::generate(), &config.peer_contact_path).unwrap();
        let factory = healthy_soon();
        // The channel request goes out; the message does not.
        factory.network().fail_sends_after(1);

        let run = run_sender(&config, &CountingSource::new(Vec::new()), &factory).await.unwrap();
        assert!(run.report.is_none());
        assert_eq!(factory.network().sent().len(), 1);
    }

    #[tokio::test]
    async fn missing_certificate_fails_before_state() {
        let dir = temp_dir();
        let config = test_config(&dir);
        let source = definition_source(&config).unwrap();
        let r = run_server(&config, &source, &healthy_soon(), Endpoints::new()).await;
        assert!(matches!(&r, Err(e) if e.stage() == Stage::NetworkDefinition));
        assert!(!config.state_path.exists());
    }

    #[tokio::test]
    async fn missing_peer_contact_is_fatal() {
        let (dir, _path) = initialized_state().await;
        let config = test_config(&dir);
        let factory = healthy_soon();
        let r = run_sender(&config, &CountingSource::new(Vec::new()), &factory).await;
        assert!(matches!(&r, Err(e) if e.stage() == Stage::Contact));
        assert!(factory.network().sent().is_empty());
    }

    #[tokio::test]
    async fn follower_start_failure_is_fatal() {
        let (dir, _path) = initialized_state().await;
        let config = test_config(&dir);
        let factory = LoopbackFactory::new(LoopbackNetwork::failing_start());
        let r = run_sender(&config, &CountingSource::new(Vec::new()), &factory).await;
        assert!(matches!(&r, Err(e) if e.stage() == Stage::Follower));
    }

    #[tokio::test]
    async fn wrong_passphrase_is_state_failure() {
        let (dir, _path) = initialized_state().await;
        let mut config = test_config(&dir);
        config.state_passphrase = "not-pw".into();
        let r = run_server(&config, &CountingSource::new(Vec::new()), &healthy_soon(), Endpoints::new()).await;
        assert!(matches!(&r, Err(e) if e.stage() == Stage::State));
    }
}
