//! Cryptographic primitives for subject key material
//!
//! This module provides the zeroizing key wrapper, AES-256-GCM
//! encryption/decryption, and the pluggable material generation strategy.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KeyMaterialError, Result};
use crate::material::Subject;

/// AES-256 key size in bytes (256 bits)
pub const AES_256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Algorithm label recorded on material produced by [`Aes256GcmGenerator`]
pub const AES_256_GCM: &str = "AES256_GCM";

/// A secure key wrapper that zeroizes memory on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: Vec<u8>,
}

impl SecureKey {
    /// Create a new SecureKey from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Generate a new random AES-256 key
    pub fn generate() -> Self {
        let mut key = vec![0u8; AES_256_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { bytes: key }
    }

    /// Decode a key from standard base64
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeyMaterialError::Crypto(format!("Base64 decode error: {}", e)))?;
        Ok(Self { bytes })
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

// Key bytes travel through the commit log as base64.
impl Serialize for SecureKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.bytes))
    }
}

impl<'de> Deserialize<'de> for SecureKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(SecureKey::new)
            .map_err(serde::de::Error::custom)
    }
}

/// Encrypted data container with nonce and ciphertext
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedData {
    /// The nonce used for encryption (12 bytes for AES-GCM)
    pub nonce: Vec<u8>,
    /// The ciphertext including authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    pub fn new(nonce: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self { nonce, ciphertext }
    }

    /// Encode as `base64(nonce || ciphertext)`
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// Decode from `base64(nonce || ciphertext)`
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| KeyMaterialError::Crypto(format!("Base64 decode error: {}", e)))?;
        Self::from_bytes(&decoded)
    }

    /// Concatenate nonce and ciphertext
    pub fn to_bytes(&self) -> Vec<u8> {
        [self.nonce.as_slice(), self.ciphertext.as_slice()].concat()
    }

    /// Split `nonce || ciphertext`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(KeyMaterialError::Crypto("Invalid encrypted data length".into()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        Ok(Self {
            nonce: nonce.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// AES-256-GCM cipher wrapper
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Encrypt plaintext using AES-256-GCM
    ///
    /// # Arguments
    /// * `key` - The 256-bit encryption key
    /// * `plaintext` - The data to encrypt
    /// * `aad` - Additional authenticated data (optional context)
    pub fn encrypt(key: &SecureKey, plaintext: &[u8], aad: Option<&[u8]>) -> Result<EncryptedData> {
        let cipher = Self::cipher(key)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: aad.unwrap_or_default(),
                },
            )
            .map_err(|e| KeyMaterialError::Crypto(format!("Encryption error: {}", e)))?;

        Ok(EncryptedData::new(nonce_bytes.to_vec(), ciphertext))
    }

    /// Decrypt ciphertext using AES-256-GCM
    ///
    /// `aad` must match the value used at encryption time.
    pub fn decrypt(
        key: &SecureKey,
        encrypted: &EncryptedData,
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        if encrypted.nonce.len() != NONCE_SIZE {
            return Err(KeyMaterialError::Crypto(format!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                encrypted.nonce.len()
            )));
        }

        let cipher = Self::cipher(key)?;
        let nonce = Nonce::from_slice(&encrypted.nonce);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &encrypted.ciphertext,
                    aad: aad.unwrap_or_default(),
                },
            )
            .map_err(|_| KeyMaterialError::Crypto("Decryption failed: authentication error".into()))
    }

    fn cipher(key: &SecureKey) -> Result<Aes256Gcm> {
        if key.len() != AES_256_KEY_SIZE {
            return Err(KeyMaterialError::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                AES_256_KEY_SIZE,
                key.len()
            )));
        }
        Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| KeyMaterialError::Crypto(format!("Cipher init error: {}", e)))
    }
}

/// Freshly generated key bytes plus the algorithm they are meant for
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub algorithm: String,
    pub key: SecureKey,
}

/// Strategy producing new key material on demand.
///
/// Injected into the service so it can be swapped or mocked.
pub trait MaterialGenerator: Send + Sync {
    fn generate(&self, subject: &Subject) -> Result<GeneratedKey>;
}

/// Default generator: random 256-bit AES-GCM keys from the OS RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes256GcmGenerator;

impl MaterialGenerator for Aes256GcmGenerator {
    fn generate(&self, _subject: &Subject) -> Result<GeneratedKey> {
        Ok(GeneratedKey {
            algorithm: AES_256_GCM.to_string(),
            key: SecureKey::generate(),
        })
    }
}
