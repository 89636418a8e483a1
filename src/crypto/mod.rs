// src/crypto/mod.rs

//! Per-session key derivation and authenticated chunk encryption.
//!
//! - Keys: PBKDF2-HMAC-SHA256 over the server secret, salted with the session
//!   id, [`PBKDF2_ITERATIONS`] rounds, 32 bytes.
//! - Cipher: AES-256-GCM, fresh random 96-bit IV per payload, 128-bit tag
//!   carried separately from the ciphertext.
//!
//! Every decryption failure collapses into [`RelayError::DecryptionError`];
//! callers never see partial plaintext.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::errors::{RelayError, Result};

pub const PBKDF2_ITERATIONS: u32 = 100_000;

const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const SALT_PREFIX: &str = "tracerelay-session:";

/// Symmetric key bound to one session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derives session keys from the server-held secret.
#[derive(Clone)]
pub struct CryptoHelper {
    secret: Vec<u8>,
}

impl std::fmt::Debug for CryptoHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoHelper").finish_non_exhaustive()
    }
}

impl CryptoHelper {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Read the secret from the named environment variable.
    pub fn from_env(var: &str) -> Result<Self> {
        let secret = std::env::var(var).map_err(|_| {
            RelayError::ConfigError(format!(
                "chunk encryption is enabled but ${var} is not set"
            ))
        })?;
        if secret.is_empty() {
            return Err(RelayError::ConfigError(format!("${var} is empty")));
        }
        Ok(Self::new(secret))
    }

    pub fn derive_key(&self, session_id: &str) -> SessionKey {
        let salt = format!("{SALT_PREFIX}{session_id}");
        let mut key = [0u8; KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(&self.secret, salt.as_bytes(), PBKDF2_ITERATIONS, &mut key);
        SessionKey(key)
    }
}

/// Wire form of an encrypted payload; all fields base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub iv: String,
    pub encrypted_data: String,
    pub auth_tag: String,
}

/// Encrypt `plaintext`; `aad` is authenticated but not encrypted.
pub fn encrypt(plaintext: &[u8], aad: &[u8], key: &SessionKey) -> Result<EncryptedPayload> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| RelayError::Other(anyhow::anyhow!("invalid key length: {e}")))?;

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad })
        .map_err(|e| RelayError::Other(anyhow::anyhow!("encryption failed: {e}")))?;

    // aes-gcm appends the tag to the ciphertext.
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(EncryptedPayload {
        iv: STANDARD.encode(iv),
        encrypted_data: STANDARD.encode(&sealed),
        auth_tag: STANDARD.encode(tag),
    })
}

/// Decrypt and authenticate a payload produced by [`encrypt`].
pub fn decrypt(payload: &EncryptedPayload, aad: &[u8], key: &SessionKey) -> Result<Vec<u8>> {
    let iv = STANDARD
        .decode(&payload.iv)
        .map_err(|_| RelayError::DecryptionError)?;
    let tag = STANDARD
        .decode(&payload.auth_tag)
        .map_err(|_| RelayError::DecryptionError)?;
    let mut sealed = STANDARD
        .decode(&payload.encrypted_data)
        .map_err(|_| RelayError::DecryptionError)?;

    if iv.len() != IV_SIZE || tag.len() != TAG_SIZE {
        return Err(RelayError::DecryptionError);
    }
    sealed.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| RelayError::DecryptionError)?;
    cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .map_err(|_| RelayError::DecryptionError)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helper() -> CryptoHelper {
        CryptoHelper::new("unit-test-secret")
    }

    #[test]
    fn roundtrip_with_same_session_key() {
        let key = helper().derive_key("session-a");
        let sealed = encrypt(b"{\"steps\":[]}", b"chunk:0", &key).unwrap();
        let opened = decrypt(&sealed, b"chunk:0", &key).unwrap();
        assert_eq!(opened, b"{\"steps\":[]}");
    }

    #[test]
    fn key_for_other_session_fails() {
        let h = helper();
        let key_a = h.derive_key("session-a");
        let key_b = h.derive_key("session-b");
        assert_ne!(key_a, key_b);

        let sealed = encrypt(b"payload", b"chunk:0", &key_a).unwrap();
        assert!(matches!(
            decrypt(&sealed, b"chunk:0", &key_b),
            Err(RelayError::DecryptionError)
        ));
    }

    #[test]
    fn fresh_iv_per_payload() {
        let key = helper().derive_key("s");
        let a = encrypt(b"same", b"", &key).unwrap();
        let b = encrypt(b"same", b"", &key).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.encrypted_data, b.encrypted_data);
    }

    #[test]
    fn tampering_is_detected() {
        let key = helper().derive_key("s");
        let sealed = encrypt(b"hello world", b"chunk:3", &key).unwrap();

        let mut bad_tag = sealed.clone();
        let mut tag = STANDARD.decode(&bad_tag.auth_tag).unwrap();
        tag[0] ^= 0xff;
        bad_tag.auth_tag = STANDARD.encode(tag);
        assert!(matches!(
            decrypt(&bad_tag, b"chunk:3", &key),
            Err(RelayError::DecryptionError)
        ));

        let mut truncated = sealed.clone();
        let data = STANDARD.decode(&truncated.encrypted_data).unwrap();
        truncated.encrypted_data = STANDARD.encode(&data[..data.len() - 1]);
        assert!(matches!(
            decrypt(&truncated, b"chunk:3", &key),
            Err(RelayError::DecryptionError)
        ));

        assert!(matches!(
            decrypt(&sealed, b"chunk:4", &key),
            Err(RelayError::DecryptionError)
        ));

        let mut garbage = sealed;
        garbage.iv = "%%%".to_string();
        assert!(matches!(
            decrypt(&garbage, b"chunk:3", &key),
            Err(RelayError::DecryptionError)
        ));
    }
}
