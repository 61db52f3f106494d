// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Integration tests for the client connection manager.
//!
//! Covers the client half of the handshake against a real relay, the
//! position channels, and the bounded reconnect policy.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use skyrelay::client::{ClientConfig, ClientEvent, ClientState, ConnectionManager};
use skyrelay::crypto;
use skyrelay::protocol::{self, code};

use common::*;

fn test_client_config(url: &str, id: &str, password: &str) -> ClientConfig {
    ClientConfig {
        server: url.to_string(),
        id: id.to_string(),
        password: password.to_string(),
        keepalive_interval: Duration::from_secs(10),
        reconnect_backoff: Duration::from_millis(20),
        max_reconnect_attempts: 5,
        error_threshold: 10,
    }
}

/// Waits for an event matching the predicate, ignoring others.
async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("Event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("Timeout waiting for event")
}

/// Starts a server that completes the WebSocket upgrade and immediately
/// drops every connection.
async fn start_closing_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://127.0.0.1:{}", addr.port());

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = accept_async(stream).await;
                // Dropped here; the client sees an unexpected close.
            });
        }
    });

    url
}

/// Starts a server that accepts any `auth-request` with 200, then drops
/// the connection. Every dial reaches a full handshake before the
/// unexpected close.
async fn start_auth_then_drop_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://127.0.0.1:{}", addr.port());

    // One keypair for every connection; the request is never decrypted.
    let key = crypto::generate_rsa_keypair().unwrap();
    let pem = crypto::public_key_pem(&key).unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let pem = pem.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                if ws
                    .send(Message::Text(protocol::auth_required(&pem)))
                    .await
                    .is_err()
                {
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if matches!(&msg, Message::Text(t) if t.starts_with("auth-request;")) {
                        let _ = ws
                            .send(Message::Text(protocol::auth_result(code::OK)))
                            .await;
                        // Dropped right after the handshake completes.
                        return;
                    }
                }
            });
        }
    });

    url
}

/// Starts a server that reports every inbound ping on `pings`, flagged
/// with whether the handshake had completed when it arrived. The reply
/// to `auth-request` is delayed so a premature keepalive would show up.
async fn start_ping_observing_server(pings: mpsc::UnboundedSender<bool>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://127.0.0.1:{}", addr.port());

    let key = crypto::generate_rsa_keypair().unwrap();
    let pem = crypto::public_key_pem(&key).unwrap();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = accept_async(stream).await else {
            return;
        };
        if ws
            .send(Message::Text(protocol::auth_required(&pem)))
            .await
            .is_err()
        {
            return;
        }

        let mut established = false;
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Ping(_) => {
                    let _ = pings.send(established);
                }
                Message::Text(text) if text.starts_with("auth-request;") => {
                    // Hold the handshake open long enough for a premature
                    // keepalive to surface.
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    if ws
                        .send(Message::Text(protocol::auth_result(code::OK)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    established = true;
                }
                Message::Close(_) => return,
                _ => {}
            }
        }
    });

    url
}

#[tokio::test]
async fn test_manager_authenticates_and_relays_positions() {
    let users = seeded_users(&[("RYR1", "pw1"), ("RYR2", "pw2")]);
    let url = start_relay_server(users).await;

    let (positions_a, positions_rx_a) = mpsc::channel(8);
    let (sink_a, _sink_rx_a) = mpsc::unbounded_channel();
    let (events_a, mut events_rx_a) = mpsc::unbounded_channel();
    let (manager_a, _stop_a) = ConnectionManager::new(
        test_client_config(&url, "RYR1", "pw1"),
        positions_rx_a,
        sink_a,
        events_a,
    );
    tokio::spawn(manager_a.run());

    let (_positions_b, positions_rx_b) = mpsc::channel(8);
    let (sink_b, mut sink_rx_b) = mpsc::unbounded_channel();
    let (events_b, mut events_rx_b) = mpsc::unbounded_channel();
    let (manager_b, _stop_b) = ConnectionManager::new(
        test_client_config(&url, "RYR2", "pw2"),
        positions_rx_b,
        sink_b,
        events_b,
    );
    tokio::spawn(manager_b.run());

    // Both sessions must be established before positions flow.
    let event = wait_for_event(&mut events_rx_a, |e| matches!(e, ClientEvent::AuthResult(_))).await;
    assert_eq!(event, ClientEvent::AuthResult(code::OK));
    let event = wait_for_event(&mut events_rx_b, |e| matches!(e, ClientEvent::AuthResult(_))).await;
    assert_eq!(event, ClientEvent::AuthResult(code::OK));

    let record = "R1,51.47,-0.45,3000,0,1,90,250,RYR1,B737,G-ABCD,,,1700000000";
    positions_a.send(record.to_string()).await.unwrap();

    let received = timeout(Duration::from_secs(10), sink_rx_b.recv())
        .await
        .expect("Timeout waiting for position")
        .expect("Sink closed");
    assert_eq!(received, record);
}

#[tokio::test]
async fn test_rejected_credentials_do_not_retry() {
    let users = seeded_users(&[("RYR1", "pw1")]);
    let url = start_relay_server(users).await;

    let (_positions, positions_rx) = mpsc::channel(8);
    let (sink, _sink_rx) = mpsc::unbounded_channel();
    let (events, mut events_rx) = mpsc::unbounded_channel();
    let (manager, _stop) = ConnectionManager::new(
        test_client_config(&url, "RYR1", "wrong"),
        positions_rx,
        sink,
        events,
    );
    let task = tokio::spawn(manager.run());

    let event = wait_for_event(&mut events_rx, |e| matches!(e, ClientEvent::AuthResult(_))).await;
    assert_eq!(event, ClientEvent::AuthResult(code::FORBIDDEN));

    // Definitive rejection ends the manager without reconnect attempts.
    let state = timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    assert_eq!(state, ClientState::Idle);

    let mut reconnects = 0;
    while let Ok(event) = events_rx.try_recv() {
        if matches!(event, ClientEvent::Reconnecting { .. }) {
            reconnects += 1;
        }
    }
    assert_eq!(reconnects, 0);
}

#[tokio::test]
async fn test_reconnect_budget_is_exhausted_then_fails() {
    let url = start_closing_server().await;

    let (_positions, positions_rx) = mpsc::channel(8);
    let (sink, _sink_rx) = mpsc::unbounded_channel();
    let (events, mut events_rx) = mpsc::unbounded_channel();
    let (manager, _stop) = ConnectionManager::new(
        test_client_config(&url, "RYR1", "pw1"),
        positions_rx,
        sink,
        events,
    );
    let task = tokio::spawn(manager.run());

    let state = timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    assert_eq!(state, ClientState::Failed);

    // Exactly the configured number of reconnect attempts, then Failed.
    let mut reconnects = Vec::new();
    let mut failed = false;
    while let Ok(event) = events_rx.try_recv() {
        match event {
            ClientEvent::Reconnecting { attempt } => reconnects.push(attempt),
            ClientEvent::Failed(_) => failed = true,
            _ => {}
        }
    }
    assert_eq!(reconnects, vec![1, 2, 3, 4, 5]);
    assert!(failed);
}

#[tokio::test]
async fn test_retry_budget_resets_after_successful_handshake() {
    let url = start_auth_then_drop_server().await;

    let (_positions, positions_rx) = mpsc::channel(8);
    let (sink, _sink_rx) = mpsc::unbounded_channel();
    let (events, mut events_rx) = mpsc::unbounded_channel();
    let (manager, stop) = ConnectionManager::new(
        test_client_config(&url, "RYR1", "pw1"),
        positions_rx,
        sink,
        events,
    );
    let task = tokio::spawn(manager.run());

    // Seven full handshakes with a drop after each. Without the reset the
    // budget (5) would be exhausted after the fifth reconnect and the
    // manager would go terminal instead of completing them all.
    let mut handshakes = 0;
    let mut attempts = Vec::new();
    while handshakes < 7 {
        let event = timeout(Duration::from_secs(30), events_rx.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Event channel closed");
        match event {
            ClientEvent::AuthResult(result) => {
                assert_eq!(result, code::OK);
                handshakes += 1;
            }
            ClientEvent::Reconnecting { attempt } => attempts.push(attempt),
            ClientEvent::Failed(reason) => {
                panic!("retry budget was not reset: {reason}");
            }
            _ => {}
        }
    }

    // Each drop came after a completed handshake, so every reconnect is a
    // first attempt against a fresh budget.
    assert!(attempts.len() >= 6);
    assert!(attempts.iter().all(|&attempt| attempt == 1));

    stop.stop();
    let state = timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    assert_eq!(state, ClientState::Idle);
}

#[tokio::test]
async fn test_keepalive_pings_start_after_session_established() {
    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
    let url = start_ping_observing_server(ping_tx).await;

    let (_positions, positions_rx) = mpsc::channel(8);
    let (sink, _sink_rx) = mpsc::unbounded_channel();
    let (events, mut events_rx) = mpsc::unbounded_channel();

    let mut config = test_client_config(&url, "RYR1", "pw1");
    config.keepalive_interval = Duration::from_millis(50);
    let (manager, stop) = ConnectionManager::new(config, positions_rx, sink, events);
    tokio::spawn(manager.run());

    let event = wait_for_event(&mut events_rx, |e| matches!(e, ClientEvent::AuthResult(_))).await;
    assert_eq!(event, ClientEvent::AuthResult(code::OK));

    // Pings arrive at the keepalive interval, and only ever after the
    // handshake completed.
    for _ in 0..3 {
        let after_handshake = timeout(Duration::from_secs(10), ping_rx.recv())
            .await
            .expect("Timeout waiting for ping")
            .expect("Server gone");
        assert!(after_handshake, "keepalive ping before the session was established");
    }

    stop.stop();
}

#[tokio::test]
async fn test_stop_suppresses_reconnect() {
    let url = start_closing_server().await;

    let (_positions, positions_rx) = mpsc::channel(8);
    let (sink, _sink_rx) = mpsc::unbounded_channel();
    let (events, mut events_rx) = mpsc::unbounded_channel();

    let mut config = test_client_config(&url, "RYR1", "pw1");
    // Long backoff so the stop lands during the wait.
    config.reconnect_backoff = Duration::from_secs(30);
    let (manager, stop) = ConnectionManager::new(config, positions_rx, sink, events);
    let task = tokio::spawn(manager.run());

    wait_for_event(&mut events_rx, |e| {
        matches!(e, ClientEvent::Reconnecting { .. })
    })
    .await;
    stop.stop();

    let state = timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    assert_eq!(state, ClientState::Idle);

    let event = wait_for_event(&mut events_rx, |e| {
        matches!(e, ClientEvent::Disconnected)
    })
    .await;
    assert_eq!(event, ClientEvent::Disconnected);
}
