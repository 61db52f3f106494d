// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.
//!
//! Tests spin up a real TCP listener on port 0 and drive the handler over
//! an actual WebSocket, from the external (client) perspective.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, MaybeTlsStream, WebSocketStream};

use skyrelay::crypto;
use skyrelay::handler::{self, ConnectionDeps};
use skyrelay::metrics::RelayMetrics;
use skyrelay::protocol;
use skyrelay::session_registry::SessionRegistry;
use skyrelay::users::{MemoryUserStore, UserRecord, UserStore};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builds an in-memory user store seeded with (id, plaintext password) pairs.
#[allow(dead_code)]
pub fn seeded_users(entries: &[(&str, &str)]) -> Arc<dyn UserStore> {
    Arc::new(MemoryUserStore::with_users(entries.iter().map(
        |(id, password)| UserRecord {
            id: id.to_string(),
            password_hash: crypto::sha256_hex(password.as_bytes()),
        },
    )))
}

/// Starts a relay server that accepts connections until the test ends.
/// Returns the WebSocket URL to connect to.
#[allow(dead_code)]
pub async fn start_relay_server(users: Arc<dyn UserStore>) -> String {
    start_relay_server_with_timeout(users, Duration::from_secs(5)).await
}

/// Same as [`start_relay_server`] with an explicit authentication deadline.
#[allow(dead_code)]
pub async fn start_relay_server_with_timeout(
    users: Arc<dyn UserStore>,
    auth_timeout: Duration,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://127.0.0.1:{}", addr.port());

    let registry = Arc::new(SessionRegistry::new());
    let metrics = RelayMetrics::new();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let deps = ConnectionDeps {
                users: users.clone(),
                registry: registry.clone(),
                metrics: metrics.clone(),
                auth_timeout,
                idle_timeout: Duration::from_secs(5),
                max_message_size: 4096,
            };
            tokio::spawn(async move {
                if let Ok(ws) = accept_async(stream).await {
                    handler::handle_connection(ws, deps).await;
                }
            });
        }
    });

    url
}

/// Receives the next text message, failing the test after 10 seconds.
/// The generous deadline covers per-connection RSA key generation.
#[allow(dead_code)]
pub async fn recv_text(ws: &mut WsClient) -> String {
    let msg = timeout(Duration::from_secs(10), ws.next())
        .await
        .expect("Timeout waiting for message")
        .expect("Stream ended")
        .expect("WebSocket error");

    match msg {
        Message::Text(text) => text,
        other => panic!("Expected Text message, got {:?}", other),
    }
}

/// Tries to receive a text message with a short timeout. `None` when
/// nothing arrives.
#[allow(dead_code)]
pub async fn try_recv_text(ws: &mut WsClient) -> Option<String> {
    match timeout(Duration::from_millis(300), ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(text),
        _ => None,
    }
}

/// Waits for the connection to end (close frame or stream end), failing
/// the test if it stays open.
#[allow(dead_code)]
pub async fn expect_closed(ws: &mut WsClient) {
    let deadline = Duration::from_secs(3);
    let result = timeout(deadline, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return,
                _ => {}
            }
        }
    })
    .await;
    result.expect("Connection stayed open");
}

/// Runs the client half of the authentication handshake.
///
/// Consumes the `auth-required` challenge, answers it for `(id, password)`,
/// and returns the result code plus the locally derived session key.
#[allow(dead_code)]
pub async fn authenticate(ws: &mut WsClient, id: &str, password: &str) -> (u16, [u8; 32]) {
    let challenge = recv_text(ws).await;
    let pem = challenge
        .strip_prefix("auth-required;")
        .expect("Expected auth-required challenge");

    let key_password = crypto::random_token();
    let key_salt = crypto::random_token();
    let symmetric_key = crypto::derive_key(&key_password, &key_salt);

    let payload = format!(
        "{id};{};{key_password};{key_salt}",
        crypto::sha256_hex(password.as_bytes())
    );
    let ciphertext = crypto::rsa_encrypt(pem, payload.as_bytes()).unwrap();
    ws.send(Message::Text(protocol::auth_request(&ciphertext)))
        .await
        .unwrap();

    let reply = recv_text(ws).await;
    let result: u16 = reply
        .strip_prefix("auth-result;")
        .expect("Expected auth-result")
        .parse()
        .unwrap();
    (result, symmetric_key)
}

/// Runs one full account exchange: getkey, then create or delete.
/// Returns the `account-result` code.
#[allow(dead_code)]
pub async fn account_exchange(
    ws: &mut WsClient,
    op_tag: &str,
    id: &str,
    password: &str,
) -> u16 {
    let client_nonce = crypto::random_token();
    ws.send(Message::Text(format!("account-getkey;{client_nonce}")))
        .await
        .unwrap();

    let reply = recv_text(ws).await;
    let mut fields = reply.split(';');
    assert_eq!(fields.next(), Some("account-key"));
    let pem = fields.next().expect("Missing public key");
    let server_nonce = fields.next().expect("Missing server nonce");

    let check = crypto::sha256_hex(format!("{server_nonce}{client_nonce}").as_bytes());
    let payload = format!(
        "{id};{};{check}",
        crypto::sha256_hex(password.as_bytes())
    );
    let ciphertext = crypto::rsa_encrypt(pem, payload.as_bytes()).unwrap();
    ws.send(Message::Text(format!("{op_tag};{ciphertext}")))
        .await
        .unwrap();

    let result = recv_text(ws).await;
    result
        .strip_prefix("account-result;")
        .expect("Expected account-result")
        .parse()
        .unwrap()
}
