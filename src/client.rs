// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client Connection Manager
//!
//! Client side of the relay protocol: opens the WebSocket, answers the
//! RSA handshake, derives the session key, encrypts outbound position
//! lines, decrypts inbound updates for the position sink, keeps the
//! connection alive with pings, and recovers from unexpected disconnects
//! with a bounded retry policy.
//!
//! The lifecycle is one explicit state machine,
//! `Idle → Connecting → Open → Reconnecting → Idle | Failed`, driven by a
//! single task. Collaborators are channels: a position source feeding
//! outbound lines, a position sink receiving decrypted peer records, and
//! a UI notifier receiving lifecycle events.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::ClientSettings;
use crate::crypto;
use crate::protocol::{self, code, AuthPayload, PositionUpdate};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Failed,
}

/// Lifecycle events delivered to the UI notifier. Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The WebSocket is open; the handshake is about to run.
    Connected,
    /// `auth-required` received, answering the challenge.
    AuthInProgress,
    /// `auth-result` code from the relay.
    AuthResult(u16),
    /// The connection ended (clean stop or definitive rejection).
    Disconnected,
    /// An unexpected disconnect; retrying after the backoff.
    Reconnecting { attempt: u32 },
    /// A non-fatal transport error, with a human-readable reason.
    Error(String),
    /// Terminal failure; no further automatic action.
    Failed(String),
}

/// Client connection policy.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay.
    pub server: String,
    /// User id sent during authentication and in `update-pos` frames.
    pub id: String,
    /// Plaintext password; only its SHA-256 hex leaves the process.
    pub password: String,
    /// Interval between keepalive pings while authenticated.
    pub keepalive_interval: Duration,
    /// Fixed delay before a reconnect attempt.
    pub reconnect_backoff: Duration,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Transport errors tolerated before forcing a disconnect.
    pub error_threshold: u32,
}

impl ClientConfig {
    /// Builds a config from the GUI settings document with default policy.
    pub fn from_settings(settings: &ClientSettings) -> Self {
        ClientConfig {
            server: settings.server.clone(),
            id: settings.id.clone(),
            password: settings.pass.clone(),
            keepalive_interval: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            error_threshold: 10,
        }
    }
}

/// Handle for a user-initiated stop. Stopping suppresses the automatic
/// reconnect path and performs a clean close.
#[derive(Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Why one connection attempt ended.
enum SessionEnd {
    /// User-initiated stop; no reconnect.
    UserStop,
    /// Definitive rejection from the relay; no reconnect.
    AuthRejected(u16),
    /// Transient transport failure; eligible for reconnect.
    Transport(String),
}

/// Owns the connection lifecycle. Consumed by [`ConnectionManager::run`].
pub struct ConnectionManager {
    config: ClientConfig,
    positions: mpsc::Receiver<String>,
    sink: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<ClientEvent>,
    stop: watch::Receiver<bool>,
    state: ClientState,
    retry_count: u32,
    error_count: u32,
}

impl ConnectionManager {
    /// Creates a manager wired to its collaborators.
    ///
    /// `positions` supplies outbound position lines, `sink` receives
    /// decrypted peer records, `events` receives lifecycle notifications.
    pub fn new(
        config: ClientConfig,
        positions: mpsc::Receiver<String>,
        sink: mpsc::UnboundedSender<String>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> (Self, StopHandle) {
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            ConnectionManager {
                config,
                positions,
                sink,
                events,
                stop: stop_rx,
                state: ClientState::Idle,
                retry_count: 0,
                error_count: 0,
            },
            StopHandle { tx: stop_tx },
        )
    }

    fn notify(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Tallies a transport error and surfaces it to the notifier.
    ///
    /// Returns true once the tally exceeds the configured threshold and
    /// the connection must be cut even if the socket still looks alive.
    fn record_transport_error(&mut self, reason: String) -> bool {
        self.error_count += 1;
        self.notify(ClientEvent::Error(reason));
        self.error_count > self.config.error_threshold
    }

    /// Runs the connection until a clean stop, a definitive rejection, or
    /// retry exhaustion. Returns the terminal state.
    pub async fn run(mut self) -> ClientState {
        loop {
            self.state = ClientState::Connecting;

            let end = self.run_session().await;
            match end {
                SessionEnd::UserStop => {
                    debug!("user stop; closing cleanly");
                    self.state = ClientState::Idle;
                    self.notify(ClientEvent::Disconnected);
                    return self.state;
                }
                SessionEnd::AuthRejected(result) => {
                    // Credentials will not become correct by retrying.
                    warn!("authentication rejected: {}", result);
                    self.state = ClientState::Idle;
                    self.notify(ClientEvent::Disconnected);
                    return self.state;
                }
                SessionEnd::Transport(reason) => {
                    self.notify(ClientEvent::Error(reason.clone()));
                    if self.stopping() {
                        self.state = ClientState::Idle;
                        self.notify(ClientEvent::Disconnected);
                        return self.state;
                    }
                    if self.retry_count >= self.config.max_reconnect_attempts {
                        warn!("reconnect limit reached: {}", reason);
                        self.state = ClientState::Failed;
                        self.notify(ClientEvent::Failed(format!(
                            "connection lost after {} reconnect attempts: {reason}",
                            self.retry_count
                        )));
                        return self.state;
                    }

                    self.retry_count += 1;
                    self.state = ClientState::Reconnecting;
                    self.notify(ClientEvent::Reconnecting {
                        attempt: self.retry_count,
                    });
                    debug!("reconnecting (attempt {})", self.retry_count);

                    // Backoff, abortable by a user stop.
                    let backoff = tokio::time::sleep(self.config.reconnect_backoff);
                    tokio::pin!(backoff);
                    loop {
                        tokio::select! {
                            _ = &mut backoff => break,
                            changed = self.stop.changed() => {
                                if changed.is_err() || self.stopping() {
                                    self.state = ClientState::Idle;
                                    self.notify(ClientEvent::Disconnected);
                                    return self.state;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drives one connection: dial, handshake, authenticated traffic.
    async fn run_session(&mut self) -> SessionEnd {
        if self.stopping() {
            return SessionEnd::UserStop;
        }

        let ws_stream = match connect_async(&self.config.server).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => return SessionEnd::Transport(format!("connect failed: {e}")),
        };
        self.state = ClientState::Open;
        self.notify(ClientEvent::Connected);

        let (mut write, mut read) = ws_stream.split();

        // Set during the handshake, used for all session traffic.
        let mut symmetric_key: Option<[u8; 32]> = None;
        let mut established = false;

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_ping: Option<Instant> = None;

        loop {
            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() || self.stopping() {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::UserStop;
                    }
                }

                _ = keepalive.tick(), if established => {
                    last_ping = Some(Instant::now());
                    // A failed ping is not fatal on its own; if the socket
                    // is really gone the read side ends the session.
                    if write.send(Message::Ping(Vec::new())).await.is_err()
                        && self.record_transport_error("keepalive send failed".to_string())
                    {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Transport("error threshold exceeded".to_string());
                    }
                }

                line = self.positions.recv() => {
                    let Some(line) = line else {
                        // Position source gone; nothing left to send.
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::UserStop;
                    };
                    // Sends before the session is established are dropped.
                    let Some(key) = symmetric_key.filter(|_| established) else {
                        debug!("dropping position line: session not established");
                        continue;
                    };
                    let update = PositionUpdate {
                        id: self.config.id.clone(),
                        posdata: line,
                    };
                    let frame = crypto::aes_encrypt(&key, &update.to_wire());
                    if write.send(Message::Text(frame)).await.is_err() {
                        return SessionEnd::Transport("send failed".to_string());
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match self.handle_text(&text, &mut symmetric_key, &mut established, &mut write).await {
                                Ok(()) => {}
                                Err(end) => return end,
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            if let Some(sent) = last_ping.take() {
                                debug!("keepalive rtt={}ms", sent.elapsed().as_millis());
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            return SessionEnd::Transport("closed by server".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            if self.record_transport_error(format!("connection error: {e}")) {
                                let _ = write.send(Message::Close(None)).await;
                                return SessionEnd::Transport(
                                    "error threshold exceeded".to_string(),
                                );
                            }
                        }
                        None => {
                            return SessionEnd::Transport("connection closed".to_string());
                        }
                    }
                }
            }
        }
    }

    /// Handles one inbound text frame. `Err` carries the session end.
    async fn handle_text(
        &mut self,
        text: &str,
        symmetric_key: &mut Option<[u8; 32]>,
        established: &mut bool,
        write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> Result<(), SessionEnd> {
        if let Some(server_pem) = text.strip_prefix("auth-required;") {
            self.notify(ClientEvent::AuthInProgress);

            // Key material for this session only; the derived key never
            // crosses the wire.
            let key_password = crypto::random_token();
            let key_salt = crypto::random_token();
            *symmetric_key = Some(crypto::derive_key(&key_password, &key_salt));

            let payload = AuthPayload {
                id: self.config.id.clone(),
                password_hash: crypto::sha256_hex(self.config.password.as_bytes()),
                key_password,
                key_salt,
            };
            let ciphertext = match crypto::rsa_encrypt(server_pem, payload.to_wire().as_bytes()) {
                Ok(ciphertext) => ciphertext,
                Err(e) => {
                    return Err(SessionEnd::Transport(format!("bad server key: {e}")));
                }
            };
            if write
                .send(Message::Text(protocol::auth_request(&ciphertext)))
                .await
                .is_err()
            {
                return Err(SessionEnd::Transport("send failed".to_string()));
            }
            return Ok(());
        }

        if let Some(result) = text.strip_prefix("auth-result;") {
            let result: u16 = result.parse().unwrap_or(0);
            self.notify(ClientEvent::AuthResult(result));
            if result == code::OK {
                *established = true;
                // A full handshake resets the retry budget.
                self.retry_count = 0;
                debug!("session established");
                return Ok(());
            }
            return Err(SessionEnd::AuthRejected(result));
        }

        // Everything else is an AES-wrapped peer update.
        let Some(key) = *symmetric_key else {
            return Ok(());
        };
        let Some(plaintext) = crypto::aes_decrypt(&key, text) else {
            // Single corrupt packets are dropped without a UI error.
            debug!("undecryptable frame dropped");
            return Ok(());
        };
        match PositionUpdate::parse(&plaintext) {
            Some(update) => {
                let _ = self.sink.send(update.posdata);
            }
            None => {
                debug!("invalid update frame dropped");
            }
        }
        Ok(())
    }
}
