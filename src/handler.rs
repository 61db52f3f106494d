// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Runs the per-connection state machine:
//! `Connecting → AwaitingAuth → Authenticated → Closed`.
//!
//! On accept the handler generates a connection-scoped RSA key pair,
//! opens the handshake with `auth-required`, and holds the connection to
//! a short authentication deadline. After authentication every inbound
//! text frame is AES-wrapped; accepted `update-pos` frames are fanned out
//! through the session registry, re-encrypted per recipient. The account
//! sub-protocol is served in any state and never changes auth state.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::account::{AccountExchange, AccountOp};
use crate::crypto;
use crate::metrics::RelayMetrics;
use crate::protocol::{self, code, AuthPayload, ClientCommand, PositionUpdate};
use crate::session_registry::{OutboundFrame, SessionRegistry};
use crate::users::UserStore;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Shared dependencies for handling one connection.
pub struct ConnectionDeps {
    pub users: Arc<dyn UserStore>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: RelayMetrics,
    /// How long a connection may stay unauthenticated.
    pub auth_timeout: Duration,
    /// Idle timeout for authenticated connections.
    pub idle_timeout: Duration,
    /// Maximum inbound text frame size in bytes.
    pub max_message_size: usize,
}

/// Outcome of the unauthenticated phase.
enum AuthOutcome {
    Authenticated {
        id: String,
        symmetric_key: [u8; 32],
        rx: mpsc::Receiver<OutboundFrame>,
        generation: u64,
    },
    Closed,
}

/// Handles a WebSocket connection from accept to teardown.
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, deps: ConnectionDeps) {
    // Short random label for log correlation; credentials are never logged.
    let session = uuid::Uuid::new_v4().to_string()[..8].to_string();

    let (mut write, mut read) = ws_stream.split();

    // Account exchange state survives across the auth boundary: the
    // sub-protocol is accepted in any connection state.
    let mut account_exchange: Option<AccountExchange> = None;

    let outcome = await_authentication(
        &session,
        &mut write,
        &mut read,
        &mut account_exchange,
        &deps,
    )
    .await;

    let (id, symmetric_key, mut rx, generation) = match outcome {
        AuthOutcome::Authenticated {
            id,
            symmetric_key,
            rx,
            generation,
        } => (id, symmetric_key, rx, generation),
        AuthOutcome::Closed => return,
    };

    debug!("[{}] authenticated as {}", session, id);

    // Authenticated relay loop: multiplex inbound frames against updates
    // queued for this session by other handlers.
    loop {
        let msg = tokio::select! {
            ws_msg = timeout(deps.idle_timeout, read.next()) => {
                match ws_msg {
                    Ok(Some(Ok(msg))) => msg,
                    Ok(Some(Err(e))) => {
                        debug!("[{}] socket error: {}", session, e);
                        break;
                    }
                    Ok(None) => {
                        debug!("[{}] disconnected", session);
                        break;
                    }
                    Err(_) => {
                        warn!("[{}] idle timeout", session);
                        break;
                    }
                }
            }
            Some(frame) = rx.recv() => {
                if write.send(Message::Text(frame.data)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        match msg {
            Message::Text(text) => {
                if text.len() > deps.max_message_size {
                    warn!("[{}] oversized frame dropped: {} bytes", session, text.len());
                    deps.metrics.messages_dropped.inc();
                    continue;
                }

                // Account commands travel in plaintext in any state.
                if ClientCommand::is_account_command(&text) {
                    if handle_account_command(
                        &session,
                        &text,
                        &mut account_exchange,
                        &mut write,
                        &deps,
                    )
                    .await
                    .is_err()
                    {
                        break;
                    }
                    continue;
                }

                // Everything else is AES-wrapped under this session's key.
                let plaintext = match crypto::aes_decrypt(&symmetric_key, &text) {
                    Some(plaintext) => plaintext,
                    None => {
                        // Transient corruption is not fatal on its own.
                        debug!("[{}] undecryptable frame dropped", session);
                        deps.metrics.messages_dropped.inc();
                        continue;
                    }
                };

                let update = match PositionUpdate::parse(&plaintext) {
                    Some(update) if update.id == id => update,
                    // Wrong tag, empty fields, or an id that is not this
                    // session's — an authenticated client must not report
                    // under another identity.
                    _ => {
                        warn!("[{}] protocol violation from {}", session, id);
                        break;
                    }
                };

                let delivered = deps.registry.broadcast(&id, &update.to_wire());
                deps.metrics.updates_relayed.inc();
                debug!("[{}] update-pos relayed to {} sessions", session, delivered);
            }
            Message::Ping(_) => {
                // tungstenite queues the pong; this mirrors the keepalive
                // logging of the original relay.
                debug!("[{}] ping", session);
            }
            Message::Pong(_) | Message::Frame(_) => {}
            Message::Binary(_) => {
                warn!("[{}] unexpected binary frame", session);
                break;
            }
            Message::Close(_) => {
                debug!("[{}] close frame", session);
                break;
            }
        }
    }

    deps.registry.unregister(&id, generation);
    debug!("[{}] session {} removed", session, id);
}

/// Runs the `AwaitingAuth` phase: sends the challenge and drives the
/// connection until it authenticates, fails, or hits the deadline.
async fn await_authentication(
    session: &str,
    write: &mut WsSink,
    read: &mut WsSource,
    account_exchange: &mut Option<AccountExchange>,
    deps: &ConnectionDeps,
) -> AuthOutcome {
    // Connection-scoped RSA pair; keygen runs off the async threads so it
    // cannot stall other connections.
    let private_key = match tokio::task::spawn_blocking(crypto::generate_rsa_keypair).await {
        Ok(Ok(key)) => key,
        _ => {
            warn!("[{}] RSA key generation failed", session);
            return AuthOutcome::Closed;
        }
    };
    let public_pem = match crypto::public_key_pem(&private_key) {
        Ok(pem) => pem,
        Err(e) => {
            warn!("[{}] public key export failed: {}", session, e);
            return AuthOutcome::Closed;
        }
    };

    if write
        .send(Message::Text(protocol::auth_required(&public_pem)))
        .await
        .is_err()
    {
        return AuthOutcome::Closed;
    }

    // Bounds resource consumption by half-open clients. Account traffic
    // pushes the deadline out: it is legitimate activity that never
    // transitions auth state.
    let mut deadline = Instant::now() + deps.auth_timeout;

    loop {
        let msg = match timeout_at(deadline, read.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!("[{}] socket error before auth: {}", session, e);
                return AuthOutcome::Closed;
            }
            Ok(None) => {
                debug!("[{}] closed before auth", session);
                return AuthOutcome::Closed;
            }
            Err(_) => {
                warn!("[{}] authentication timeout", session);
                deps.metrics.auth_failure.inc();
                return AuthOutcome::Closed;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Ping(_) => {
                debug!("[{}] ping", session);
                continue;
            }
            Message::Pong(_) | Message::Frame(_) => continue,
            Message::Close(_) => {
                debug!("[{}] close frame before auth", session);
                return AuthOutcome::Closed;
            }
            Message::Binary(_) => {
                warn!("[{}] unexpected binary frame before auth", session);
                return AuthOutcome::Closed;
            }
        };

        if text.len() > deps.max_message_size {
            warn!("[{}] oversized frame before auth", session);
            return AuthOutcome::Closed;
        }

        match ClientCommand::parse(&text) {
            Some(ClientCommand::AuthRequest { ciphertext }) => {
                return finish_authentication(session, write, &private_key, &ciphertext, deps)
                    .await;
            }
            Some(_) => {
                if handle_account_command(session, &text, account_exchange, write, deps)
                    .await
                    .is_err()
                {
                    return AuthOutcome::Closed;
                }
                deadline = Instant::now() + deps.auth_timeout;
            }
            None => {
                warn!("[{}] invalid frame before auth", session);
                return AuthOutcome::Closed;
            }
        }
    }
}

/// Verifies an `auth-request` and registers the session on success.
///
/// Every failure path sends an explicit `auth-result` code and closes.
async fn finish_authentication(
    session: &str,
    write: &mut WsSink,
    private_key: &rsa::RsaPrivateKey,
    ciphertext: &str,
    deps: &ConnectionDeps,
) -> AuthOutcome {
    let payload = crypto::rsa_decrypt(private_key, ciphertext)
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|text| AuthPayload::parse(&text));

    let payload = match payload {
        Some(payload) => payload,
        None => {
            warn!("[{}] undecryptable auth-request", session);
            return reject_auth(session, write, code::BAD_REQUEST, deps).await;
        }
    };

    let record = match deps.users.lookup(&payload.id) {
        Some(record) => record,
        None => {
            warn!("[{}] auth failed: unknown id", session);
            return reject_auth(session, write, code::NOT_FOUND, deps).await;
        }
    };
    if record.password_hash != payload.password_hash {
        warn!("[{}] auth failed: password mismatch for {}", session, payload.id);
        return reject_auth(session, write, code::FORBIDDEN, deps).await;
    }

    // Both sides derive the session key independently; it never crosses
    // the wire. scrypt runs off the async threads.
    let (key_password, key_salt) = (payload.key_password.clone(), payload.key_salt.clone());
    let symmetric_key =
        match tokio::task::spawn_blocking(move || crypto::derive_key(&key_password, &key_salt))
            .await
        {
            Ok(key) => key,
            Err(_) => {
                warn!("[{}] key derivation failed", session);
                return reject_auth(session, write, code::BAD_REQUEST, deps).await;
            }
        };

    let (rx, generation) = deps.registry.register(&payload.id, symmetric_key);
    if write
        .send(Message::Text(protocol::auth_result(code::OK)))
        .await
        .is_err()
    {
        deps.registry.unregister(&payload.id, generation);
        return AuthOutcome::Closed;
    }
    deps.metrics.auth_success.inc();

    AuthOutcome::Authenticated {
        id: payload.id,
        symmetric_key,
        rx,
        generation,
    }
}

/// Sends a failure `auth-result` and closes the handshake.
async fn reject_auth(
    _session: &str,
    write: &mut WsSink,
    result: u16,
    deps: &ConnectionDeps,
) -> AuthOutcome {
    deps.metrics.auth_failure.inc();
    let _ = write
        .send(Message::Text(protocol::auth_result(result)))
        .await;
    let _ = write.send(Message::Close(None)).await;
    AuthOutcome::Closed
}

/// Serves one account sub-protocol frame.
///
/// `Err` means the socket write failed and the connection should close;
/// protocol-level rejections are answered with result codes instead.
async fn handle_account_command(
    session: &str,
    text: &str,
    account_exchange: &mut Option<AccountExchange>,
    write: &mut WsSink,
    deps: &ConnectionDeps,
) -> Result<(), ()> {
    let command = match ClientCommand::parse(text) {
        Some(command) => command,
        None => {
            let _ = write
                .send(Message::Text(protocol::account_result(code::BAD_REQUEST)))
                .await;
            return Ok(());
        }
    };

    let (op, ciphertext) = match command {
        ClientCommand::AccountGetKey { client_nonce } => {
            let private_key = match tokio::task::spawn_blocking(crypto::generate_rsa_keypair).await
            {
                Ok(Ok(key)) => key,
                _ => {
                    warn!("[{}] ephemeral key generation failed", session);
                    return Err(());
                }
            };
            return match AccountExchange::begin(private_key, &client_nonce) {
                Ok((exchange, reply)) => {
                    // A new getkey discards any exchange still in flight.
                    *account_exchange = Some(exchange);
                    write.send(Message::Text(reply)).await.map_err(|_| ())
                }
                Err(e) => {
                    warn!("[{}] account exchange setup failed: {}", session, e);
                    Err(())
                }
            };
        }
        ClientCommand::AccountCreate { ciphertext } => (AccountOp::Create, ciphertext),
        ClientCommand::AccountDelete { ciphertext } => (AccountOp::Delete, ciphertext),
        // Not an account command; callers route auth-request separately.
        ClientCommand::AuthRequest { .. } => return Ok(()),
    };

    // Single-use: the exchange is consumed whatever the outcome.
    let result = match account_exchange.take() {
        Some(exchange) => exchange.complete(op, &ciphertext, deps.users.as_ref()),
        None => code::BAD_REQUEST,
    };
    deps.metrics.account_operations.inc();
    debug!("[{}] account {:?}: {}", session, op, result);
    write
        .send(Message::Text(protocol::account_result(result)))
        .await
        .map_err(|_| ())
}
