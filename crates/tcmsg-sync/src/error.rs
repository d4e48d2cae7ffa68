use tcmsg_core::{MessageId, StoreError};
use tcmsg_crypto::EncryptionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// No usable conversation key; nothing can be sent or shown.
    #[error("encryption unavailable: {reason}")]
    EncryptionUnavailable { reason: String },

    #[error("encryption failed: {0}")]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("'{identity}' is not a participant of conversation {conversation}")]
    NotParticipant {
        identity: String,
        conversation: String,
    },

    /// Both participants are the same identity.
    #[error("conversation {conversation} needs two distinct participants")]
    SelfConversation { conversation: String },

    #[error("message {0} was not received by this participant")]
    NotRecipient(MessageId),

    #[error("message {0} is not in the open conversation")]
    UnknownMessage(MessageId),

    #[error("message is empty")]
    EmptyMessage,

    #[error("message has {chars} characters, limit is {max}")]
    MessageTooLong { chars: usize, max: usize },

    #[error("no conversation is open")]
    NotOpen,

    #[error("background task failed: {0}")]
    Worker(String),
}

impl SyncError {
    /// Whether the conversation cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::EncryptionUnavailable { .. }
                | SyncError::NotParticipant { .. }
                | SyncError::SelfConversation { .. }
        )
    }
}
