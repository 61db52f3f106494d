// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Account Subsystem
//!
//! Challenge/response + RSA exchange for creating and deleting user
//! accounts, independent of the authentication handshake. One exchange:
//!
//! 1. Client sends `account-getkey;<clientNonce>`.
//! 2. Server replies `account-key;<publicKey>;<serverNonce>` and retains
//!    an ephemeral private key plus the expected check value.
//! 3. Client recomputes the check value, RSA-encrypts
//!    `id;passwordHash;checkValue`, and sends `account-create` or
//!    `account-delete`.
//! 4. Server decrypts with the ephemeral key and rejects a stale or
//!    replayed request whose check value does not bind to this round.
//!
//! The exchange state is single-use: it is consumed by one create/delete
//! reply regardless of outcome.

use rsa::RsaPrivateKey;

use crate::crypto;
use crate::protocol::code;
use crate::users::{UserRecord, UserStore, UserStoreError};

/// Which mutation the client requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountOp {
    Create,
    Delete,
}

/// Transient state for one account exchange, scoped to a single
/// connection and discarded after one create/delete reply.
pub struct AccountExchange {
    private_key: RsaPrivateKey,
    expected_check_value: String,
}

impl AccountExchange {
    /// Starts an exchange from an `account-getkey` request.
    ///
    /// `private_key` is the ephemeral pair generated for this round.
    /// Returns the exchange state and the `account-key` reply to send.
    pub fn begin(private_key: RsaPrivateKey, client_nonce: &str) -> Result<(Self, String), String> {
        let public_pem = crypto::public_key_pem(&private_key)?;
        let server_nonce = crypto::random_token();
        let expected_check_value = check_value(&server_nonce, client_nonce);

        let reply = crate::protocol::account_key(&public_pem, &server_nonce);
        Ok((
            AccountExchange {
                private_key,
                expected_check_value,
            },
            reply,
        ))
    }

    /// Completes the exchange with an `account-create` or `account-delete`
    /// ciphertext, consuming the ephemeral state.
    ///
    /// Returns the result code for the `account-result` reply.
    pub fn complete(self, op: AccountOp, ciphertext: &str, users: &dyn UserStore) -> u16 {
        let plaintext = match crypto::rsa_decrypt(&self.private_key, ciphertext) {
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => return code::BAD_REQUEST,
            },
            None => return code::BAD_REQUEST,
        };

        let mut fields = plaintext.split(';');
        let (id, password_hash, check) = match (fields.next(), fields.next(), fields.next()) {
            (Some(id), Some(hash), Some(check))
                if !id.is_empty() && !hash.is_empty() && fields.next().is_none() =>
            {
                (id, hash, check)
            }
            _ => return code::BAD_REQUEST,
        };

        // Binds the request to this exchange round; a replay against a
        // stale key pair carries the wrong check value.
        if check != self.expected_check_value {
            return code::STALE_EXCHANGE;
        }

        let result = match op {
            AccountOp::Create => users.create(UserRecord {
                id: id.to_string(),
                password_hash: password_hash.to_string(),
            }),
            AccountOp::Delete => users.delete(id, password_hash),
        };

        match result {
            Ok(()) => code::OK,
            Err(UserStoreError::AlreadyExists) => code::CONFLICT,
            Err(UserStoreError::NotFound) => code::NOT_FOUND,
            Err(UserStoreError::WrongPassword) => code::FORBIDDEN,
            Err(UserStoreError::Persist(_)) => code::INTERNAL,
        }
    }
}

/// Derives the check value binding a request to one nonce pair.
///
/// Both sides compute `sha256_hex(serverNonce ‖ clientNonce)` from the
/// nonces they exchanged.
pub fn check_value(server_nonce: &str, client_nonce: &str) -> String {
    crypto::sha256_hex(format!("{server_nonce}{client_nonce}").as_bytes())
}
