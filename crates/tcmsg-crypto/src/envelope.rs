//! Per-message AES-256-GCM encryption/decryption
//!
//! Envelope format (stored as text):
//! ```text
//! nonce      = base64(12 random bytes)
//! ciphertext = base64(AES-256-GCM output: [N bytes: ciphertext][16 bytes: GCM tag])
//! metadata   = {algorithm: "AES-256-GCM", key_length: 256, tag_length: 128}
//! ```
//!
//! The metadata travels with every record so a later cipher suite can be
//! introduced without guessing how old records were written.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{DecryptionError, EncryptionError};
use crate::kdf::ConversationKey;
use crate::{ALGORITHM, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Cipher suite description stored next to the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub algorithm: String,
    pub key_length: u16,
    pub tag_length: u16,
}

impl Default for EnvelopeMetadata {
    fn default() -> Self {
        Self {
            algorithm: ALGORITHM.to_string(),
            key_length: (KEY_SIZE * 8) as u16,
            tag_length: (TAG_SIZE * 8) as u16,
        }
    }
}

impl EnvelopeMetadata {
    fn is_supported(&self) -> bool {
        self.algorithm.eq_ignore_ascii_case(ALGORITHM)
            && usize::from(self.key_length) == KEY_SIZE * 8
            && usize::from(self.tag_length) == TAG_SIZE * 8
    }
}

/// One encrypted message, self-contained apart from the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub ciphertext: String,
    pub nonce: String,
    pub metadata: EnvelopeMetadata,
}

/// Encrypt a message under the conversation key.
///
/// A fresh random nonce is drawn for every call.
pub fn encrypt(plaintext: &str, key: &ConversationKey) -> Result<Envelope, EncryptionError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| EncryptionError::Aead)?;

    Ok(Envelope {
        ciphertext: STANDARD.encode(ciphertext),
        nonce: STANDARD.encode(nonce_bytes),
        metadata: EnvelopeMetadata::default(),
    })
}

/// Decrypt an envelope, returning the plaintext only if the tag verifies.
pub fn decrypt(envelope: &Envelope, key: &ConversationKey) -> Result<String, DecryptionError> {
    if !envelope.metadata.is_supported() {
        return Err(DecryptionError::UnsupportedAlgorithm {
            algorithm: envelope.metadata.algorithm.clone(),
            key_length: envelope.metadata.key_length,
            tag_length: envelope.metadata.tag_length,
        });
    }

    let nonce_bytes = decode_field("nonce", &envelope.nonce)?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(DecryptionError::InvalidNonceLength(nonce_bytes.len()));
    }
    let ciphertext = decode_field("ciphertext", &envelope.ciphertext)?;
    if ciphertext.len() < TAG_SIZE {
        return Err(DecryptionError::Truncated(ciphertext.len()));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| DecryptionError::Authentication)?;

    String::from_utf8(plaintext).map_err(|_| DecryptionError::NotUtf8)
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, DecryptionError> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| DecryptionError::Encoding {
            field,
            reason: e.to_string(),
        })
}
