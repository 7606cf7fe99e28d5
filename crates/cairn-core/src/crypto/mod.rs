use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use cairn_types::{CairnError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Encryption {
    #[default]
    None,
    Aes,
}

impl Encryption {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Encryption::None),
            "aes" => Ok(Encryption::Aes),
            other => Err(CairnError::Config(format!(
                "unknown encryption algorithm: {other}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Encryption::None => "none",
            Encryption::Aes => "aes",
        }
    }
}

/// Trait for encrypting and decrypting chunk payloads and repository objects.
pub trait CryptoEngine: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt`. Authentication failure surfaces
    /// as `CairnError::Crypto`; a wrong password is indistinguishable from
    /// corrupted ciphertext.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Whether this engine actually encrypts data.
    fn is_encrypting(&self) -> bool;
}

/// No-encryption engine, used when the encryption tag is `none`.
pub struct PlaintextEngine;

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_encrypting(&self) -> bool {
        false
    }
}

/// AES-256-GCM authenticated encryption engine.
///
/// The key is BLAKE2b-256 of the password; the nonce is derived
/// deterministically from the key so identical plaintext encrypts to
/// identical ciphertext, which keeps deduplication stable across runs.
/// Callers must not reuse a password across semantically different keys.
pub struct Aes256GcmEngine {
    cipher: Aes256Gcm,
    nonce: [u8; 12],
}

impl Aes256GcmEngine {
    pub fn from_password(password: &str) -> Result<Self> {
        if password.is_empty() {
            return Err(CairnError::EmptyPassword);
        }
        let key = Zeroizing::new(derive_key(password));
        let nonce = derive_nonce(&key);
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|_| CairnError::Crypto)?;
        Ok(Self { cipher, nonce })
    }
}

impl CryptoEngine for Aes256GcmEngine {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(&self.nonce);
        self.cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CairnError::Crypto)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 16 {
            return Err(CairnError::Crypto);
        }
        let nonce = Nonce::from_slice(&self.nonce);
        self.cipher.decrypt(nonce, data).map_err(|_| CairnError::Crypto)
    }

    fn is_encrypting(&self) -> bool {
        true
    }
}

/// Build the engine for an encryption tag. `Aes` requires a non-empty
/// password; `None` ignores it.
pub fn engine_for(encryption: Encryption, password: &str) -> Result<Box<dyn CryptoEngine>> {
    match encryption {
        Encryption::None => Ok(Box::new(PlaintextEngine)),
        Encryption::Aes => Ok(Box::new(Aes256GcmEngine::from_password(password)?)),
    }
}

fn derive_key(password: &str) -> [u8; 32] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn derive_nonce(key: &[u8; 32]) -> [u8; 12] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(key);
    let digest: [u8; 32] = hasher.finalize().into();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}
