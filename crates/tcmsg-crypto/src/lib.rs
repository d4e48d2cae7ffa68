//! tcmsg-crypto: message encryption for tcmsg conversations
//!
//! Architecture: deterministic conversation key + AES-256-GCM per message
//!
//! ```text
//! secret = "tcmsg-v1|" + sorted(participant_a, participant_b).join("|") [+ "|" + scope]
//! salt   = SHA-256("tcmsg-salt|" + secret)[..16]
//! key    = PBKDF2-HMAC-SHA256(secret, salt, iterations >= 100_000) -> 256 bits
//!
//! Envelope (per message):
//!   nonce      = 96 random bits (fresh per call)
//!   ciphertext = AES-256-GCM(key, nonce, plaintext) || 128-bit tag
//!   stored as base64 text + {algorithm, key_length, tag_length}
//! ```
//!
//! # Threat model
//!
//! Both participants reach the same key without a handshake because the key
//! is a pure function of their identifiers and the scope. That also means
//! anyone who learns both identifiers can derive it. The salt is derived from
//! the same secret and adds nothing against such a party. This keeps
//! plaintext away from a passive backend; it is not a key exchange and offers
//! no forward secrecy. Replacing it means providing another `KeyDeriver`.

pub mod envelope;
pub mod error;
pub mod kdf;

pub use envelope::{decrypt, encrypt, Envelope, EnvelopeMetadata};
pub use error::{DecryptionError, EncryptionError, KeyDerivationError};
pub use kdf::{derive_conversation_key, ConversationKey, DeterministicKdf, KdfParams, KeyDeriver};

/// Size of a conversation key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the derived PBKDF2 salt
pub const SALT_SIZE: usize = 16;

/// Algorithm name recorded in every envelope
pub const ALGORITHM: &str = "AES-256-GCM";
