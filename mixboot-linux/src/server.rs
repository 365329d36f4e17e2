//! Single-use request server: answers one-shot requests addressed to our reception identity.

use std::sync::Arc;

use mixboot_core::single_use::{open_request, seal_response, Endpoints, Method, Response};
use mixboot_core::{Envelope, EnvelopeKind, Keypair, ReceptionIdentity};
use tracing::{debug, info, warn};

use crate::session::{Network, Session, SingleUseHandler};

pub const VERSION_URI: &str = "/version";

/// A running single-use server. Lives as long as the session it is attached to.
pub struct SingleUseServer {
    keypair: Keypair,
    endpoints: Endpoints,
    network: Arc<dyn Network>,
}

/// Start serving `endpoints` (plus `GET /version`) for `identity` on `session`.
/// The reception identity's own private key opens incoming requests.
pub fn start_server(
    identity: &ReceptionIdentity,
    session: &Session,
    mut endpoints: Endpoints,
) -> Arc<SingleUseServer> {
    endpoints.add(Method::Get, VERSION_URI, |_| {
        Response::ok(env!("CARGO_PKG_VERSION"))
    });
    let server = Arc::new(SingleUseServer {
        keypair: identity.keypair(),
        endpoints,
        network: session.network().clone(),
    });
    session.switchboard().set_single_use_handler(server.clone());
    info!(id = %identity.id, endpoints = server.endpoints.len(), "single-use server started");
    server
}

impl SingleUseServer {
    /// Decrypt, dispatch and seal the reply. `None` if the request cannot be opened.
    fn answer(&self, envelope: &Envelope) -> Option<Envelope> {
        let request_id = match envelope.kind {
            EnvelopeKind::SingleUseRequest { request_id } => request_id,
            _ => return None,
        };
        let (request, key) = match open_request(&self.keypair, &envelope.sender_key, &envelope.ciphertext) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(from = %envelope.from, error = %e, "dropping unreadable single-use request");
                return None;
            }
        };
        let response = self.endpoints.dispatch(&request);
        debug!(method = ?request.method, uri = %request.uri, status = response.status, "single-use request");
        let ciphertext = match seal_response(&key, &response) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to seal single-use response");
                return None;
            }
        };
        Some(Envelope {
            from: self.keypair.reception_id(),
            sender_key: self.keypair.public_key().clone(),
            nonce: 0,
            kind: EnvelopeKind::SingleUseResponse { request_id },
            ciphertext,
        })
    }
}

impl SingleUseHandler for SingleUseServer {
    fn handle(&self, envelope: Envelope) {
        let to = envelope.from;
        let Some(reply) = self.answer(&envelope) else {
            return;
        };
        let network = self.network.clone();
        tokio::spawn(async move {
            if let Err(e) = network.send(to, reply).await {
                warn!(to = %to, error = %e, "single-use response not sent");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::login;
    use crate::state::PersistedState;
    use crate::testing::{initialized_state, LoopbackFactory};
    use mixboot_core::single_use::{open_response, seal_request, Request};
    use mixboot_core::{E2eParams, ReceptionId};

    fn request_envelope(server: &ReceptionIdentity, request: &Request) -> (Envelope, [u8; 32]) {
        let (ephemeral, ciphertext, key) = seal_request(&server.public_key, request).unwrap();
        let envelope = Envelope {
            from: ReceptionId::from_public_key(&ephemeral),
            sender_key: ephemeral,
            nonce: 0,
            kind: EnvelopeKind::SingleUseRequest { request_id: [7; 16] },
            ciphertext,
        };
        (envelope, key)
    }

    async fn served() -> (LoopbackFactory, Session) {
        let (_dir, path) = initialized_state().await;
        let state = PersistedState::load(&path, b"pw").unwrap();
        let factory = LoopbackFactory::default();
        let session = login(state, ReceptionIdentity::generate(), E2eParams::default(), &factory).unwrap();
        let mut endpoints = Endpoints::new();
        endpoints.add(Method::Post, "/echo", |r| Response::ok(r.body.clone()));
        start_server(&session.identity().clone(), &session, endpoints);
        (factory, session)
    }

    async fn sent_after_yield(factory: &LoopbackFactory, n: usize) -> Vec<(ReceptionId, Envelope)> {
        for _ in 0..100 {
            let sent = factory.network().sent();
            if sent.len() >= n {
                return sent;
            }
            tokio::task::yield_now().await;
        }
        factory.network().sent()
    }

    #[tokio::test]
    async fn version_endpoint_answers() {
        let (factory, session) = served().await;
        let (env, key) = request_envelope(
            session.identity(),
            &Request {
                method: Method::Get,
                uri: VERSION_URI.into(),
                body: Vec::new(),
            },
        );
        let requester = env.from;
        factory.network().deliver(env);

        let sent = sent_after_yield(&factory, 1).await;
        assert_eq!(sent.len(), 1);
        let (to, reply) = &sent[0];
        assert_eq!(*to, requester);
        assert_eq!(reply.kind, EnvelopeKind::SingleUseResponse { request_id: [7; 16] });
        let response = open_response(&key, &reply.ciphertext).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, env!("CARGO_PKG_VERSION").as_bytes());
    }

    #[tokio::test]
    async fn registered_endpoint_and_unknown_uri() {
        let (factory, session) = served().await;
        let (echo, echo_key) = request_envelope(
            session.identity(),
            &Request {
                method: Method::Post,
                uri: "/echo".into(),
                body: b"ping".to_vec(),
            },
        );
        let (missing, missing_key) = request_envelope(
            session.identity(),
            &Request {
                method: Method::Get,
                uri: "/nope".into(),
                body: Vec::new(),
            },
        );
        factory.network().deliver(echo);
        factory.network().deliver(missing);

        let sent = sent_after_yield(&factory, 2).await;
        assert_eq!(sent.len(), 2);
        let statuses: Vec<Response> = sent
            .iter()
            .filter_map(|(_, e)| {
                open_response(&echo_key, &e.ciphertext)
                    .or_else(|_| open_response(&missing_key, &e.ciphertext))
                    .ok()
            })
            .collect();
        assert!(statuses.contains(&Response::ok(b"ping".to_vec())));
        assert!(statuses.iter().any(|r| r.status == 404));
    }

    #[tokio::test]
    async fn request_for_other_identity_is_dropped() {
        let (factory, _session) = served().await;
        let stranger = ReceptionIdentity::generate();
        let (env, _) = request_envelope(
            &stranger,
            &Request {
                method: Method::Get,
                uri: VERSION_URI.into(),
                body: Vec::new(),
            },
        );
        factory.network().deliver(env);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(factory.network().sent().is_empty());
    }
}
