use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Separator between the parts of a conversation identifier.
pub const ID_SEPARATOR: char = ':';

/// Cipher suite recorded alongside every persisted message.
pub const ALGORITHM_AES_256_GCM: &str = "AES-256-GCM";
pub const KEY_LENGTH_BITS: u16 = 256;
pub const TAG_LENGTH_BITS: u16 = 128;

/// Identifier of a two-party, optionally scoped, conversation.
///
/// Built from the sorted participant pair so both sides compute the same
/// value: `alice:bob` or `alice:bob:request-42`. Each part is escaped
/// (`%` as `%25`, `:` as `%3A`) so distinct pairs never share an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn derive(participant_a: &str, participant_b: &str, scope: Option<&str>) -> Self {
        let (lo, hi) = if participant_a <= participant_b {
            (participant_a, participant_b)
        } else {
            (participant_b, participant_a)
        };
        let mut id = escape_part(lo);
        id.push(ID_SEPARATOR);
        id.push_str(&escape_part(hi));
        if let Some(scope) = normalize_scope(scope) {
            id.push(ID_SEPARATOR);
            id.push_str(&escape_part(scope));
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape_part(part: &str) -> String {
    part.replace('%', "%25").replace(ID_SEPARATOR, "%3A")
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery state of a persisted message.
///
/// Only `Sent` and `Read` are produced today. `Delivered` is reserved for
/// delivery receipts and is accepted on ingestion but never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, MessageStatus::Read)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            other => Err(StoreError::InvalidRecord(format!(
                "unknown message status '{other}'"
            ))),
        }
    }
}

/// The two participants of a conversation plus its optional scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: [String; 2],
    pub scope: Option<String>,
}

impl Conversation {
    /// Describe the conversation between two participants, deriving its id.
    pub fn between(participant_a: &str, participant_b: &str, scope: Option<&str>) -> Self {
        Self {
            id: ConversationId::derive(participant_a, participant_b, scope),
            participants: [participant_a.to_string(), participant_b.to_string()],
            scope: normalize_scope(scope).map(str::to_string),
        }
    }

    pub fn includes(&self, identity: &str) -> bool {
        self.participants.iter().any(|p| p == identity)
    }

    /// Whether `sender` and `recipient` are exactly this conversation's pair.
    pub fn has_pair(&self, sender: &str, recipient: &str) -> bool {
        let [a, b] = &self.participants;
        (a == sender && b == recipient) || (a == recipient && b == sender)
    }

    /// Both participants are the same identity.
    pub fn is_self_conversation(&self) -> bool {
        self.participants[0] == self.participants[1]
    }

    /// The other participant, if `identity` takes part in this conversation.
    pub fn peer_of(&self, identity: &str) -> Option<&str> {
        match &self.participants {
            [a, b] if a == identity => Some(b),
            [a, b] if b == identity => Some(a),
            _ => None,
        }
    }
}

/// A persisted, encrypted message as held by the conversation store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub id: MessageId,
    pub sender: String,
    pub recipient: String,
    pub conversation_id: ConversationId,
    pub scope: Option<String>,
    /// Base64 AEAD output (ciphertext with the tag appended)
    pub ciphertext: String,
    /// Base64 nonce
    pub nonce: String,
    pub algorithm: String,
    pub key_length: u16,
    pub tag_length: u16,
    pub status: MessageStatus,
    /// Unix timestamp in milliseconds
    pub created_at: u64,
    /// Unix timestamp in milliseconds
    pub read_at: Option<u64>,
}

impl EncryptedMessage {
    pub fn is_addressed_to(&self, identity: &str) -> bool {
        self.recipient == identity
    }

    /// Whether `identity` should still mark this message as read.
    pub fn awaits_read_by(&self, identity: &str) -> bool {
        self.is_addressed_to(identity) && !self.status.is_read()
    }
}

/// Input to `ConversationStore::create`; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender: String,
    pub recipient: String,
    pub conversation_id: ConversationId,
    pub scope: Option<String>,
    pub ciphertext: String,
    pub nonce: String,
    pub algorithm: String,
    pub key_length: u16,
    pub tag_length: u16,
    pub status: MessageStatus,
}

/// Treat an empty scope the same as no scope.
pub fn normalize_scope(scope: Option<&str>) -> Option<&str> {
    scope.filter(|s| !s.is_empty())
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_id_symmetric() {
        assert_eq!(
            ConversationId::derive("u1", "u2", None),
            ConversationId::derive("u2", "u1", None)
        );
        assert_eq!(ConversationId::derive("u2", "u1", None).as_str(), "u1:u2");
    }

    #[test]
    fn test_conversation_id_scope() {
        let scoped = ConversationId::derive("bob", "alice", Some("req-9"));
        assert_eq!(scoped.as_str(), "alice:bob:req-9");
        assert_ne!(scoped, ConversationId::derive("alice", "bob", None));
        // An empty scope is no scope
        assert_eq!(
            ConversationId::derive("alice", "bob", Some("")),
            ConversationId::derive("alice", "bob", None)
        );
    }

    #[test]
    fn test_conversation_id_separator_in_participant() {
        let scoped = ConversationId::derive("a", "b", Some("c"));
        let colon_pair = ConversationId::derive("a:b", "c", None);
        assert_ne!(scoped, colon_pair);
        assert_eq!(colon_pair.as_str(), "a%3Ab:c");
        assert_ne!(ConversationId::derive("a%3Ab", "c", None), colon_pair);
    }

    #[test]
    fn test_has_pair() {
        let conv = Conversation::between("alice", "bob", None);
        assert!(conv.has_pair("alice", "bob"));
        assert!(conv.has_pair("bob", "alice"));
        assert!(!conv.has_pair("alice", "mallory"));
        assert!(!conv.has_pair("alice", "alice"));
        assert!(Conversation::between("u1", "u1", None).is_self_conversation());
        assert!(!conv.is_self_conversation());
    }

    #[test]
    fn test_peer_of() {
        let conv = Conversation::between("alice", "bob", None);
        assert_eq!(conv.peer_of("alice"), Some("bob"));
        assert_eq!(conv.peer_of("bob"), Some("alice"));
        assert_eq!(conv.peer_of("mallory"), None);
        assert!(!conv.includes("mallory"));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("READ".parse::<MessageStatus>().unwrap(), MessageStatus::Read);
        assert_eq!(
            " delivered ".parse::<MessageStatus>().unwrap(),
            MessageStatus::Delivered
        );
        assert!("seen".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&MessageStatus::Sent).unwrap();
        assert_eq!(json, "\"sent\"");
    }
}
