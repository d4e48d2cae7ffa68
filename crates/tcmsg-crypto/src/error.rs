use thiserror::Error;

/// Invalid input to conversation key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyDerivationError {
    #[error("{0} participant identifier is empty")]
    EmptyParticipant(&'static str),

    #[error("invalid KDF parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptionError {
    #[error("AES-256-GCM encryption failed")]
    Aead,
}

/// Why an envelope could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptionError {
    #[error("unsupported cipher suite: {algorithm} ({key_length}-bit key, {tag_length}-bit tag)")]
    UnsupportedAlgorithm {
        algorithm: String,
        key_length: u16,
        tag_length: u16,
    },

    #[error("{field} is not valid base64: {reason}")]
    Encoding { field: &'static str, reason: String },

    #[error("nonce has {0} bytes, expected 12")]
    InvalidNonceLength(usize),

    #[error("ciphertext too short: {0} bytes")]
    Truncated(usize),

    #[error("authentication failed: wrong key, corrupted or tampered data")]
    Authentication,

    #[error("decrypted message is not valid UTF-8")]
    NotUtf8,
}
