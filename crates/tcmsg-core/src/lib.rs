//! tcmsg-core: shared types, config schema, and error types for tcmsg

pub mod config;
pub mod error;
pub mod record;
pub mod types;

pub use error::{StoreError, TcmsgError, TcmsgResult};
pub use record::RawMessageRecord;
pub use types::{
    now_millis, Conversation, ConversationId, EncryptedMessage, MessageId, MessageStatus,
    NewMessage,
};
