//! Key derivation: participant pair (+ scope) → conversation key

use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroize;

use crate::error::KeyDerivationError;
use crate::{KEY_SIZE, SALT_SIZE};

const SECRET_PREFIX: &str = "tcmsg-v1";
const SALT_PREFIX: &[u8] = b"tcmsg-salt|";
const FINGERPRINT_CONTEXT: &[u8] = b"tcmsg-key-fingerprint|";

/// A 256-bit key shared by the two participants of a conversation.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct ConversationKey {
    bytes: [u8; KEY_SIZE],
}

impl ConversationKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Short, non-reversible identifier for logs and diagnostics.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_CONTEXT);
        hasher.update(&self.bytes);
        hasher.finalize().to_hex().as_str()[..16].to_string()
    }
}

impl PartialEq for ConversationKey {
    fn eq(&self, other: &Self) -> bool {
        // not constant-time; keys are only compared in tests and diagnostics
        self.bytes == other.bytes
    }
}

impl Eq for ConversationKey {}

impl Drop for ConversationKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2 parameters for conversation keys
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// PBKDF2-HMAC-SHA256 iterations (default: 100000)
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: 100_000,
        }
    }
}

/// Source of conversation keys.
///
/// The sync engine only depends on this trait, so the deterministic scheme
/// can be swapped for a real key agreement without touching the cipher or
/// the engine.
pub trait KeyDeriver: Send + Sync {
    fn derive(
        &self,
        participant_a: &str,
        participant_b: &str,
        scope: Option<&str>,
    ) -> Result<ConversationKey, KeyDerivationError>;
}

/// `KeyDeriver` backed by [`derive_conversation_key`].
#[derive(Debug, Clone, Default)]
pub struct DeterministicKdf {
    params: KdfParams,
}

impl DeterministicKdf {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }
}

impl KeyDeriver for DeterministicKdf {
    fn derive(
        &self,
        participant_a: &str,
        participant_b: &str,
        scope: Option<&str>,
    ) -> Result<ConversationKey, KeyDerivationError> {
        derive_conversation_key(participant_a, participant_b, scope, &self.params)
    }
}

/// Derive the key for the conversation between two participants.
///
/// Symmetric in the participants and fully deterministic: both sides compute
/// the same key from the identifiers alone. An empty scope is the same as no
/// scope.
pub fn derive_conversation_key(
    participant_a: &str,
    participant_b: &str,
    scope: Option<&str>,
    params: &KdfParams,
) -> Result<ConversationKey, KeyDerivationError> {
    if participant_a.trim().is_empty() {
        debug!("key derivation rejected: first participant is empty");
        return Err(KeyDerivationError::EmptyParticipant("first"));
    }
    if participant_b.trim().is_empty() {
        debug!("key derivation rejected: second participant is empty");
        return Err(KeyDerivationError::EmptyParticipant("second"));
    }
    if params.iterations == 0 {
        debug!(iterations = params.iterations, "key derivation rejected");
        return Err(KeyDerivationError::InvalidParams(
            "iteration count must be greater than 0".into(),
        ));
    }

    let secret = canonical_secret(participant_a, participant_b, scope);
    let salt = derive_salt(&secret);

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        secret.expose_secret().as_bytes(),
        &salt,
        params.iterations,
        &mut key,
    );

    Ok(ConversationKey::from_bytes(key))
}

/// Canonical secret string: sorted participants, then the scope if any.
fn canonical_secret(participant_a: &str, participant_b: &str, scope: Option<&str>) -> SecretString {
    let (lo, hi) = if participant_a <= participant_b {
        (participant_a, participant_b)
    } else {
        (participant_b, participant_a)
    };
    let mut secret = format!("{SECRET_PREFIX}|{lo}|{hi}");
    if let Some(scope) = scope.filter(|s| !s.is_empty()) {
        secret.push('|');
        secret.push_str(scope);
    }
    SecretString::from(secret)
}

/// Salt as a pure function of the secret, so no exchange is needed.
fn derive_salt(secret: &SecretString) -> [u8; SALT_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(SALT_PREFIX);
    hasher.update(secret.expose_secret().as_bytes());
    let digest = hasher.finalize();

    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&digest[..SALT_SIZE]);
    salt
}
