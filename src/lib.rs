// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Skyrelay
//!
//! Encrypted position-sharing relay for flight-simulator multiplayer.
//! The relay authenticates clients with a hybrid RSA/AES handshake and
//! fans live aircraft-position updates out to every other authenticated
//! client, re-encrypted under each recipient's own session key. An
//! out-of-band challenge/response flow manages user accounts.

pub mod account;
pub mod client;
pub mod config;
pub mod crypto;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod session_registry;
pub mod users;
