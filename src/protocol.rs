// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! Semicolon-delimited UTF-8 text frames over a persistent WebSocket.
//! The first field is a command tag; the position payload (`posdata`) is
//! an opaque 14-field comma-separated record that must round-trip
//! byte-for-byte through the relay.

/// Authentication and account result codes, HTTP-flavored.
pub mod code {
    /// Request accepted.
    pub const OK: u16 = 200;
    /// Malformed or undecryptable request.
    pub const BAD_REQUEST: u16 = 400;
    /// Check value does not bind to this exchange round (replay).
    pub const STALE_EXCHANGE: u16 = 401;
    /// Password hash mismatch.
    pub const FORBIDDEN: u16 = 403;
    /// Unknown user id.
    pub const NOT_FOUND: u16 = 404;
    /// Account id already exists.
    pub const CONFLICT: u16 = 409;
    /// The user registry could not be persisted.
    pub const INTERNAL: u16 = 500;
}

/// A parsed inbound message.
///
/// Only the commands a peer may legitimately send are represented;
/// anything else parses to `None` and is a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `auth-request;<base64 RSA ciphertext>`
    AuthRequest { ciphertext: String },
    /// `account-getkey;<client nonce hex>`
    AccountGetKey { client_nonce: String },
    /// `account-create;<base64 RSA ciphertext>`
    AccountCreate { ciphertext: String },
    /// `account-delete;<base64 RSA ciphertext>`
    AccountDelete { ciphertext: String },
}

impl ClientCommand {
    /// Parses a plaintext command frame. `None` for unknown tags or
    /// missing arguments.
    pub fn parse(msg: &str) -> Option<Self> {
        let (tag, rest) = msg.split_once(';')?;
        if rest.is_empty() {
            return None;
        }
        match tag {
            "auth-request" => Some(ClientCommand::AuthRequest {
                ciphertext: rest.to_string(),
            }),
            "account-getkey" => Some(ClientCommand::AccountGetKey {
                client_nonce: rest.to_string(),
            }),
            "account-create" => Some(ClientCommand::AccountCreate {
                ciphertext: rest.to_string(),
            }),
            "account-delete" => Some(ClientCommand::AccountDelete {
                ciphertext: rest.to_string(),
            }),
            _ => None,
        }
    }

    /// True for the account sub-protocol commands, which are accepted in
    /// any connection state.
    pub fn is_account_command(msg: &str) -> bool {
        msg.starts_with("account-getkey;")
            || msg.starts_with("account-create;")
            || msg.starts_with("account-delete;")
    }
}

/// A decrypted position update: `update-pos;<id>;<posdata>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionUpdate {
    /// Authenticated sender id claimed in the message.
    pub id: String,
    /// Opaque 14-field comma-separated aircraft state record.
    pub posdata: String,
}

impl PositionUpdate {
    /// Parses a decrypted `update-pos` frame. `None` for a wrong tag or
    /// an empty id/posdata.
    pub fn parse(plaintext: &str) -> Option<Self> {
        let mut fields = plaintext.splitn(3, ';');
        if fields.next()? != "update-pos" {
            return None;
        }
        let id = fields.next()?;
        let posdata = fields.next()?;
        if id.is_empty() || posdata.is_empty() {
            return None;
        }
        Some(PositionUpdate {
            id: id.to_string(),
            posdata: posdata.to_string(),
        })
    }

    /// Formats the frame for encryption, preserving posdata verbatim.
    pub fn to_wire(&self) -> String {
        format!("update-pos;{};{}", self.id, self.posdata)
    }
}

/// `auth-required;<public key PEM>` — server opens the handshake.
pub fn auth_required(public_key_pem: &str) -> String {
    format!("auth-required;{public_key_pem}")
}

/// `auth-request;<base64 ciphertext>` — client answers the handshake.
pub fn auth_request(ciphertext: &str) -> String {
    format!("auth-request;{ciphertext}")
}

/// `auth-result;<code>`
pub fn auth_result(code: u16) -> String {
    format!("auth-result;{code}")
}

/// `account-key;<public key PEM>;<server nonce hex>`
pub fn account_key(public_key_pem: &str, server_nonce: &str) -> String {
    format!("account-key;{public_key_pem};{server_nonce}")
}

/// `account-result;<code>`
pub fn account_result(code: u16) -> String {
    format!("account-result;{code}")
}

/// The four-field plaintext of an `auth-request`:
/// `id;passwordHash;keyPassword;keySalt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    pub id: String,
    pub password_hash: String,
    pub key_password: String,
    pub key_salt: String,
}

impl AuthPayload {
    pub fn parse(plaintext: &str) -> Option<Self> {
        let mut fields = plaintext.split(';');
        let payload = AuthPayload {
            id: fields.next()?.to_string(),
            password_hash: fields.next()?.to_string(),
            key_password: fields.next()?.to_string(),
            key_salt: fields.next()?.to_string(),
        };
        if fields.next().is_some()
            || payload.id.is_empty()
            || payload.password_hash.is_empty()
            || payload.key_password.is_empty()
            || payload.key_salt.is_empty()
        {
            return None;
        }
        Some(payload)
    }

    pub fn to_wire(&self) -> String {
        format!(
            "{};{};{};{}",
            self.id, self.password_hash, self.key_password, self.key_salt
        )
    }
}
