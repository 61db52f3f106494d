// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Registry
//!
//! Tracks authenticated sessions so the relay can fan position updates
//! out to every connected client except the sender. Each session has its
//! own symmetric key, so broadcast re-encrypts the plaintext once per
//! recipient; there is no shared group key.
//!
//! The registry maps authenticated ids to (session key, outbound channel)
//! pairs. Broadcast takes a snapshot under the lock and iterates outside
//! it, so a session removed mid-broadcast is never half-delivered and a
//! slow recipient never blocks the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::crypto;

/// An already-encrypted text frame queued for one session's socket.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub data: String,
}

struct SessionHandle {
    generation: u64,
    symmetric_key: [u8; 32],
    tx: mpsc::Sender<OutboundFrame>,
}

/// Thread-safe registry of authenticated sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Registers an authenticated session. Returns the receiving end of
    /// its outbound channel and a generation tag for [`Self::unregister`].
    ///
    /// If the id was already registered (reconnection), the old channel
    /// is replaced and the stale receiver sees the channel close.
    pub fn register(
        &self,
        id: &str,
        symmetric_key: [u8; 32],
    ) -> (mpsc::Receiver<OutboundFrame>, u64) {
        let (tx, rx) = mpsc::channel(64);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(
            id.to_string(),
            SessionHandle {
                generation,
                symmetric_key,
                tx,
            },
        );
        (rx, generation)
    }

    /// Removes a session on close or error.
    ///
    /// The generation tag guards against a reconnection race: teardown of
    /// a replaced connection must not remove the session that replaced it.
    pub fn unregister(&self, id: &str, generation: u64) {
        let mut sessions = self.sessions.write().unwrap();
        if sessions
            .get(id)
            .is_some_and(|handle| handle.generation == generation)
        {
            sessions.remove(id);
        }
    }

    /// Fans a plaintext update out to every session except the sender,
    /// re-encrypted under each recipient's own key.
    ///
    /// Returns the number of recipients the frame was queued for. A
    /// closed or full recipient channel is skipped without affecting the
    /// rest.
    pub fn broadcast(&self, sender_id: &str, plaintext: &str) -> usize {
        // Snapshot under the read lock; encrypt and send outside it.
        let recipients: Vec<([u8; 32], mpsc::Sender<OutboundFrame>)> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .filter(|(id, _)| id.as_str() != sender_id)
                .map(|(_, handle)| (handle.symmetric_key, handle.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (key, tx) in recipients {
            let frame = OutboundFrame {
                data: crypto::aes_encrypt(&key, plaintext),
            };
            if tx.try_send(frame).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Returns the number of authenticated sessions.
    pub fn session_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap();
        sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
