// SPDX-License-Identifier: MIT OR Apache-2.0
//! Field encryption for configuration files.
//!
//! Sensitive scalars are stored wrapped in a sentinel-delimited envelope:
//! `<ID_STRING>base64(salt || nonce || ciphertext)<ID_STRING>`. Encryption is
//! AES-256-GCM with a PBKDF2-SHA256 derived key and fresh salt/nonce per
//! value, so the same plaintext never encrypts to the same blob twice.
//!
//! The key comes from a built-in default unless overridden through
//! `BACKHAUL_KEY_LOCATION` (file contents) or `BACKHAUL_KEY_COMMAND`
//! (command stdout). An optional earlier key allows transparent key rotation:
//! values that fail to decrypt under the current key are retried with the
//! earlier one and re-encrypted on the next save.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

/// Sentinel delimiting encrypted scalars at rest.
pub const ID_STRING: &str = "__BACKHAUL__";

/// Environment variable pointing at a file whose contents replace the
/// built-in key.
pub const ENV_KEY_LOCATION: &str = "BACKHAUL_KEY_LOCATION";

/// Environment variable naming a command whose stdout replaces the built-in
/// key.
pub const ENV_KEY_COMMAND: &str = "BACKHAUL_KEY_COMMAND";

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_SIZE: usize = 32;

/// Errors from field encryption and key loading.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("value is not a sentinel-wrapped blob")]
    NotWrapped,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("encrypted payload too short")]
    TooShort,
    #[error("decryption failed - wrong key or corrupted data")]
    Decrypt,
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decrypted data is not valid UTF-8")]
    Utf8,
    #[error("cannot load key: {0}")]
    KeyLoad(String),
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}

/// Whether a scalar is already wrapped.
pub fn is_wrapped(value: &str) -> bool {
    value.len() > 2 * ID_STRING.len() && value.starts_with(ID_STRING) && value.ends_with(ID_STRING)
}

/// Encrypt a scalar into its sentinel-wrapped at-rest form.
///
/// Already-wrapped values are returned unchanged so repeated saves never
/// double-encrypt.
pub fn wrap(value: &str, key: &str) -> Result<String, CryptoError> {
    if is_wrapped(value) {
        return Ok(value.to_string());
    }

    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let derived = derive_key(key, &salt);
    let cipher = Aes256Gcm::new_from_slice(&derived)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, value.as_bytes())
        .map_err(|e| CryptoError::Encrypt(format!("{e:?}")))?;

    let mut payload = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);

    Ok(format!("{ID_STRING}{}{ID_STRING}", BASE64.encode(payload)))
}

/// Decrypt a sentinel-wrapped scalar.
pub fn unwrap(value: &str, key: &str) -> Result<String, CryptoError> {
    if !is_wrapped(value) {
        return Err(CryptoError::NotWrapped);
    }
    let inner = &value[ID_STRING.len()..value.len() - ID_STRING.len()];
    let payload = BASE64.decode(inner)?;
    if payload.len() < SALT_SIZE + NONCE_SIZE + 16 {
        return Err(CryptoError::TooShort);
    }

    let salt = &payload[..SALT_SIZE];
    let nonce_bytes = &payload[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let ciphertext = &payload[SALT_SIZE + NONCE_SIZE..];

    let derived = derive_key(key, salt);
    let cipher = Aes256Gcm::new_from_slice(&derived)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}

/// Key material for the configuration store.
#[derive(Debug, Clone)]
pub struct KeyRing {
    current: String,
    earlier: Option<String>,
    /// Whether a private (non-default) key was loaded, stamped into the
    /// config `audience`.
    pub is_private: bool,
}

impl KeyRing {
    /// Build a key ring from an explicit key pair.
    pub fn new(current: impl Into<String>, earlier: Option<String>) -> Self {
        Self {
            current: current.into(),
            earlier,
            is_private: false,
        }
    }

    /// Resolve the active key, honoring the environment overrides.
    ///
    /// `default_key` is the built-in public key; a key loaded from the
    /// environment marks the ring private.
    pub fn resolve(default_key: &str, earlier: Option<String>) -> Result<Self, CryptoError> {
        if let Ok(location) = std::env::var(ENV_KEY_LOCATION) {
            let key = std::fs::read_to_string(&location)
                .map_err(|e| CryptoError::KeyLoad(format!("cannot read {location}: {e}")))?;
            let key = key.trim().to_string();
            if key.is_empty() {
                return Err(CryptoError::KeyLoad(format!("key file {location} is empty")));
            }
            debug!("loaded encryption key from {location}");
            return Ok(Self {
                current: key,
                earlier,
                is_private: true,
            });
        }
        if let Ok(command) = std::env::var(ENV_KEY_COMMAND) {
            let output = std::process::Command::new(if cfg!(windows) { "cmd" } else { "sh" })
                .args(if cfg!(windows) { ["/C", &command] } else { ["-c", &command] })
                .output()
                .map_err(|e| CryptoError::KeyLoad(format!("cannot run key command: {e}")))?;
            if !output.status.success() {
                return Err(CryptoError::KeyLoad(format!(
                    "key command exited with {:?}",
                    output.status.code()
                )));
            }
            let key = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if key.is_empty() {
                return Err(CryptoError::KeyLoad("key command produced no output".into()));
            }
            debug!("loaded encryption key from command");
            return Ok(Self {
                current: key,
                earlier,
                is_private: true,
            });
        }
        Ok(Self {
            current: default_key.to_string(),
            earlier,
            is_private: false,
        })
    }

    /// Encrypt under the current key.
    pub fn wrap(&self, value: &str) -> Result<String, CryptoError> {
        wrap(value, &self.current)
    }

    /// Decrypt, retrying with the earlier key when the current one fails.
    ///
    /// Returns the plaintext and whether the earlier key was needed (meaning
    /// the config must be re-saved under the current key).
    pub fn unwrap(&self, value: &str) -> Result<(String, bool), CryptoError> {
        match unwrap(value, &self.current) {
            Ok(plain) => Ok((plain, false)),
            Err(CryptoError::Decrypt) => match &self.earlier {
                Some(earlier) => {
                    warn!("current key failed, retrying with earlier key");
                    unwrap(value, earlier).map(|plain| (plain, true))
                }
                None => Err(CryptoError::Decrypt),
            },
            Err(other) => Err(other),
        }
    }
}
