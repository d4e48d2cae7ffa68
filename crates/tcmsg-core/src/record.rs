//! Boundary validation for message rows handed back by a store backend.
//!
//! Backends return loosely shaped payloads (missing columns, free-text
//! status, legacy rows without cipher metadata). `RawMessageRecord` accepts
//! any of those; converting it into an `EncryptedMessage` is the only way a
//! row reaches the sync engine.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::types::{
    normalize_scope, ConversationId, EncryptedMessage, MessageId, MessageStatus,
    ALGORITHM_AES_256_GCM, KEY_LENGTH_BITS, TAG_LENGTH_BITS,
};

/// A message row as it arrives from the store, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMessageRecord {
    pub id: Option<String>,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub conversation_id: Option<String>,
    pub scope: Option<String>,
    pub ciphertext: Option<String>,
    pub nonce: Option<String>,
    pub algorithm: Option<String>,
    pub key_length: Option<u16>,
    pub tag_length: Option<u16>,
    pub status: Option<String>,
    pub created_at: Option<u64>,
    pub read_at: Option<u64>,
}

impl RawMessageRecord {
    pub fn from_json(data: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(data)
            .map_err(|e| StoreError::InvalidRecord(format!("malformed JSON: {e}")))
    }
}

impl From<&EncryptedMessage> for RawMessageRecord {
    fn from(msg: &EncryptedMessage) -> Self {
        Self {
            id: Some(msg.id.as_str().to_string()),
            sender: Some(msg.sender.clone()),
            recipient: Some(msg.recipient.clone()),
            conversation_id: Some(msg.conversation_id.as_str().to_string()),
            scope: msg.scope.clone(),
            ciphertext: Some(msg.ciphertext.clone()),
            nonce: Some(msg.nonce.clone()),
            algorithm: Some(msg.algorithm.clone()),
            key_length: Some(msg.key_length),
            tag_length: Some(msg.tag_length),
            status: Some(msg.status.as_str().to_string()),
            created_at: Some(msg.created_at),
            read_at: msg.read_at,
        }
    }
}

impl TryFrom<RawMessageRecord> for EncryptedMessage {
    type Error = StoreError;

    fn try_from(raw: RawMessageRecord) -> Result<Self, Self::Error> {
        let id = required("id", raw.id)?;
        let sender = required("sender", raw.sender)?;
        let recipient = required("recipient", raw.recipient)?;
        let conversation_id = required("conversation_id", raw.conversation_id)?;
        let ciphertext = required("ciphertext", raw.ciphertext)?;
        let nonce = required("nonce", raw.nonce)?;
        let created_at = raw
            .created_at
            .ok_or_else(|| invalid(&id, "missing created_at"))?;

        if sender == recipient {
            return Err(invalid(&id, "sender and recipient are the same participant"));
        }

        let scope = normalize_scope(raw.scope.as_deref()).map(str::to_string);
        let expected = ConversationId::derive(&sender, &recipient, scope.as_deref());
        if expected.as_str() != conversation_id {
            return Err(invalid(
                &id,
                &format!("conversation id '{conversation_id}' does not match participants ({expected})"),
            ));
        }

        let status = match raw.status.as_deref() {
            None => MessageStatus::Sent,
            Some(s) => s.parse::<MessageStatus>()?,
        };

        // read_at only means something once the message is read
        let read_at = if status.is_read() {
            raw.read_at
        } else {
            if raw.read_at.is_some() {
                debug!(message_id = %id, %status, "dropping read_at on unread message");
            }
            None
        };

        // Rows written before cipher metadata was recorded use the current suite
        let algorithm = raw
            .algorithm
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| ALGORITHM_AES_256_GCM.to_string());

        Ok(EncryptedMessage {
            id: MessageId::new(id),
            sender,
            recipient,
            conversation_id: expected,
            scope,
            ciphertext,
            nonce,
            algorithm,
            key_length: raw.key_length.unwrap_or(KEY_LENGTH_BITS),
            tag_length: raw.tag_length.unwrap_or(TAG_LENGTH_BITS),
            status,
            created_at,
            read_at,
        })
    }
}

fn required(field: &str, value: Option<String>) -> Result<String, StoreError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(StoreError::InvalidRecord(format!("missing {field}"))),
    }
}

fn invalid(id: &str, reason: &str) -> StoreError {
    StoreError::InvalidRecord(format!("record {id}: {reason}"))
}
