// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Crypto Primitives
//!
//! Hashing, key derivation, RSA-OAEP, and AES-256-CBC wire encryption.
//! All functions here are stateless; per-connection key material lives in
//! the handler and session registry.
//!
//! Decryption never panics across this boundary: a bad key, corrupt
//! base64, or invalid padding yields `None` and the caller drops the
//! message.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-CBC initialization vector length, prepended to every ciphertext.
const IV_LEN: usize = 16;

/// RSA modulus size for per-connection and account-exchange key pairs.
pub const RSA_BITS: usize = 2048;

/// Computes the SHA-256 digest of the input.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes the SHA-256 digest of the input as a lowercase hex string.
///
/// The wire protocol exchanges all hashes (password hashes, nonces,
/// check values) in this form.
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&sha256(data))
}

/// Generates a random token: the hex SHA-256 digest of 32 random bytes.
///
/// Used for nonces, session-key passwords, and salts.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    sha256_hex(&bytes)
}

/// Derives a 32-byte symmetric key from a password and salt via scrypt.
///
/// Cost parameters are fixed (N=2^14, r=8, p=1) — both ends must derive
/// the identical key from the values exchanged during the handshake.
pub fn derive_key(password: &str, salt: &str) -> [u8; 32] {
    let params = scrypt::Params::new(14, 8, 1, 32).expect("fixed scrypt params are valid");
    let mut key = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), salt.as_bytes(), &params, &mut key)
        .expect("32-byte output length is valid");
    key
}

/// Generates a fresh RSA key pair for one connection or account exchange.
pub fn generate_rsa_keypair() -> Result<RsaPrivateKey, rsa::Error> {
    RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
}

/// Exports the public half of a key pair as SPKI PEM for the wire.
pub fn public_key_pem(private_key: &RsaPrivateKey) -> Result<String, String> {
    RsaPublicKey::from(private_key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| e.to_string())
}

/// RSA-OAEP(SHA-256) encrypts a plaintext under a PEM-encoded public key,
/// returning base64 for the wire.
pub fn rsa_encrypt(public_key_pem: &str, plaintext: &[u8]) -> Result<String, String> {
    let public_key =
        RsaPublicKey::from_public_key_pem(public_key_pem).map_err(|e| e.to_string())?;
    let ciphertext = public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| e.to_string())?;
    Ok(BASE64.encode(ciphertext))
}

/// RSA-OAEP(SHA-256) decrypts a base64 wire value with a private key.
///
/// `None` on malformed base64 or decryption failure — the caller rejects
/// the message.
pub fn rsa_decrypt(private_key: &RsaPrivateKey, wire: &str) -> Option<Vec<u8>> {
    let ciphertext = BASE64.decode(wire).ok()?;
    private_key.decrypt(Oaep::new::<Sha256>(), &ciphertext).ok()
}

/// AES-256-CBC encrypts a message under a session key.
///
/// A fresh random 16-byte IV is generated per call and prepended to the
/// ciphertext; the whole value is base64-encoded for the text frame.
pub fn aes_encrypt(key: &[u8; 32], plaintext: &str) -> String {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    BASE64.encode(out)
}

/// AES-256-CBC decrypts an IV-prefixed base64 wire value.
///
/// `None` on bad base64, short input, wrong key, bad padding, or
/// non-UTF-8 plaintext.
pub fn aes_decrypt(key: &[u8; 32], wire: &str) -> Option<String> {
    let data = BASE64.decode(wire).ok()?;
    if data.len() <= IV_LEN {
        return None;
    }
    let (iv, ciphertext) = data.split_at(IV_LEN);
    let iv: [u8; IV_LEN] = iv.try_into().ok()?;

    let plaintext = Aes256CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .ok()?;
    String::from_utf8(plaintext).ok()
}

/// Encodes bytes as lowercase hex.
pub fn to_hex(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        hex.push(HEX_CHARS[(byte >> 4) as usize] as char);
        hex.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    hex
}
