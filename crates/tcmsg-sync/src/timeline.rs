//! Decrypted, in-memory conversation timeline.
//!
//! Invariants after every mutation: ids are unique, and entries are sorted
//! by `created_at` ascending (ties broken by id, so the order is total).

use serde::Serialize;
use std::collections::HashSet;
use tcmsg_core::{ConversationId, EncryptedMessage, MessageId, MessageStatus};

/// Plaintext of a message, or the marker for one that failed to decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MessageContent {
    Plaintext(String),
    Unavailable,
}

/// How a message entered the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageOrigin {
    History,
    Live,
    /// Sent from this client; content is the locally known plaintext
    LocalEcho,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecryptedMessage {
    pub record: EncryptedMessage,
    pub content: MessageContent,
    pub origin: MessageOrigin,
}

impl DecryptedMessage {
    pub fn id(&self) -> &MessageId {
        &self.record.id
    }

    pub fn plaintext(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Plaintext(text) => Some(text),
            MessageContent::Unavailable => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self.content, MessageContent::Unavailable)
    }

    fn sort_key(&self) -> (u64, &MessageId) {
        (self.record.created_at, &self.record.id)
    }
}

/// Lifecycle of a `ConversationSync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    Uninitialized,
    Loading,
    Live,
    Closed,
}

#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<DecryptedMessage>,
    ids: HashSet<MessageId>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&DecryptedMessage> {
        self.entries.iter().find(|m| m.id() == id)
    }

    pub fn messages(&self) -> &[DecryptedMessage] {
        &self.entries
    }

    /// Insert one message and restore ordering.
    ///
    /// Returns `false` (and leaves the timeline untouched apart from a status
    /// refresh) if a message with the same id is already present.
    pub fn insert(&mut self, message: DecryptedMessage) -> bool {
        if !self.push_unique(message) {
            return false;
        }
        self.sort();
        true
    }

    /// Insert many messages, sorting once. Returns (inserted, duplicates).
    pub fn merge(&mut self, messages: impl IntoIterator<Item = DecryptedMessage>) -> (usize, usize) {
        let mut inserted = 0;
        let mut duplicates = 0;
        for message in messages {
            if self.push_unique(message) {
                inserted += 1;
            } else {
                duplicates += 1;
            }
        }
        if inserted > 0 {
            self.sort();
        }
        (inserted, duplicates)
    }

    /// Adopt a newer status for an existing entry; never moves backwards.
    pub fn refresh_status(&mut self, record: &EncryptedMessage) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|m| m.record.id == record.id) else {
            return false;
        };
        if status_rank(record.status) > status_rank(entry.record.status) {
            entry.record.status = record.status;
            entry.record.read_at = record.read_at;
            return true;
        }
        false
    }

    pub fn mark_read(&mut self, id: &MessageId, read_at: u64) -> bool {
        match self.entries.iter_mut().find(|m| m.id() == id) {
            Some(entry) => {
                entry.record.status = MessageStatus::Read;
                entry.record.read_at = Some(read_at);
                true
            }
            None => false,
        }
    }

    fn push_unique(&mut self, message: DecryptedMessage) -> bool {
        if self.ids.contains(message.id()) {
            self.refresh_status(&message.record);
            return false;
        }
        self.ids.insert(message.id().clone());
        self.entries.push(message);
        true
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }
}

fn status_rank(status: MessageStatus) -> u8 {
    match status {
        MessageStatus::Sent => 0,
        MessageStatus::Delivered => 1,
        MessageStatus::Read => 2,
    }
}

/// Read-only snapshot published to observers after every change.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineView {
    pub conversation_id: Option<ConversationId>,
    pub phase: SyncPhase,
    pub messages: Vec<DecryptedMessage>,
    /// A send is waiting for the store
    pub sending: bool,
    /// Latest advisory notice (failed load/send, live feed down)
    pub notice: Option<String>,
    pub placeholder_text: String,
}

impl TimelineView {
    pub fn empty(phase: SyncPhase, placeholder_text: &str) -> Self {
        Self {
            conversation_id: None,
            phase,
            messages: Vec::new(),
            sending: false,
            notice: None,
            placeholder_text: placeholder_text.to_string(),
        }
    }

    /// Text to show for a message: its plaintext or the placeholder.
    pub fn display_text<'a>(&'a self, message: &'a DecryptedMessage) -> &'a str {
        message.plaintext().unwrap_or(&self.placeholder_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn message(id: &str, created_at: u64, text: &str) -> DecryptedMessage {
        DecryptedMessage {
            record: EncryptedMessage {
                id: MessageId::new(id),
                sender: "u1".into(),
                recipient: "u2".into(),
                conversation_id: ConversationId::derive("u1", "u2", None),
                scope: None,
                ciphertext: String::new(),
                nonce: String::new(),
                algorithm: "AES-256-GCM".into(),
                key_length: 256,
                tag_length: 128,
                status: MessageStatus::Sent,
                created_at,
                read_at: None,
            },
            content: MessageContent::Plaintext(text.into()),
            origin: MessageOrigin::History,
        }
    }

    fn assert_invariants(timeline: &Timeline) {
        let msgs = timeline.messages();
        for pair in msgs.windows(2) {
            assert!(pair[0].sort_key() < pair[1].sort_key(), "timeline out of order");
        }
        let unique: HashSet<_> = msgs.iter().map(|m| m.id().clone()).collect();
        assert_eq!(unique.len(), msgs.len(), "duplicate ids");
    }

    #[test]
    fn test_insert_sorts_out_of_order_arrival() {
        let mut timeline = Timeline::new();
        assert!(timeline.insert(message("b", 20, "second")));
        assert!(timeline.insert(message("a", 10, "first")));
        assert!(timeline.insert(message("c", 30, "third")));

        let texts: Vec<_> = timeline.messages().iter().filter_map(|m| m.plaintext()).collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut timeline = Timeline::new();
        assert!(timeline.insert(message("a", 10, "original")));
        assert!(!timeline.insert(message("a", 10, "replayed")));

        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.messages()[0].plaintext(), Some("original"), "first writer wins");
    }

    #[test]
    fn test_duplicate_refreshes_status_forward_only() {
        let mut timeline = Timeline::new();
        timeline.insert(message("a", 10, "hi"));

        let mut read = message("a", 10, "hi");
        read.record.status = MessageStatus::Read;
        read.record.read_at = Some(50);
        assert!(!timeline.insert(read));
        assert_eq!(timeline.get(&MessageId::new("a")).unwrap().record.status, MessageStatus::Read);

        // an older snapshot must not move it back
        assert!(!timeline.refresh_status(&message("a", 10, "hi").record));
        let entry = timeline.get(&MessageId::new("a")).unwrap();
        assert_eq!(entry.record.status, MessageStatus::Read);
        assert_eq!(entry.record.read_at, Some(50));
    }

    #[test]
    fn test_equal_timestamps_ordered_by_id() {
        let mut timeline = Timeline::new();
        timeline.insert(message("z", 10, "z"));
        timeline.insert(message("m", 10, "m"));
        let ids: Vec<_> = timeline.messages().iter().map(|m| m.id().as_str()).collect();
        assert_eq!(ids, ["m", "z"]);
    }

    #[test]
    fn test_merge_counts() {
        let mut timeline = Timeline::new();
        timeline.insert(message("a", 10, "a"));
        let (inserted, duplicates) = timeline.merge(vec![
            message("a", 10, "a"),
            message("b", 5, "b"),
            message("c", 15, "c"),
        ]);
        assert_eq!((inserted, duplicates), (2, 1));
        assert_eq!(timeline.messages()[0].id().as_str(), "b");
        assert_invariants(&timeline);
    }

    #[test]
    fn test_mark_read() {
        let mut timeline = Timeline::new();
        timeline.insert(message("a", 10, "a"));
        assert!(timeline.mark_read(&MessageId::new("a"), 77));
        assert!(!timeline.mark_read(&MessageId::new("missing"), 77));
        assert_eq!(timeline.messages()[0].record.read_at, Some(77));
        assert_eq!(timeline.messages()[0].record.status, MessageStatus::Read);
    }

    #[test]
    fn test_view_display_text() {
        let view = TimelineView::empty(SyncPhase::Live, "message unavailable");
        let mut msg = message("a", 1, "hello");
        assert_eq!(view.display_text(&msg), "hello");
        msg.content = MessageContent::Unavailable;
        assert_eq!(view.display_text(&msg), "message unavailable");
    }

    proptest! {
        /// Any interleaving of single inserts and batch merges, with
        /// repeated ids, leaves a sorted timeline without duplicates.
        #[test]
        fn prop_order_and_uniqueness(
            ops in proptest::collection::vec(
                (any::<bool>(), proptest::collection::vec((0u8..24, 0u64..50), 1..6)),
                1..30,
            )
        ) {
            let mut timeline = Timeline::new();
            let mut seen = HashSet::new();
            for (single, batch) in ops {
                // the same id always carries the same created_at, as in the store
                let batch: Vec<_> = batch
                    .into_iter()
                    .map(|(id, _)| message(&format!("m{id}"), u64::from(id) * 3, "x"))
                    .collect();
                if single {
                    for m in batch {
                        seen.insert(m.id().clone());
                        timeline.insert(m);
                    }
                } else {
                    for m in &batch {
                        seen.insert(m.id().clone());
                    }
                    timeline.merge(batch);
                }
                assert_invariants(&timeline);
            }
            prop_assert_eq!(timeline.len(), seen.len());
        }

        #[test]
        fn prop_reinsert_is_idempotent(ids in proptest::collection::vec(0u8..40, 1..20)) {
            let mut timeline = Timeline::new();
            for id in &ids {
                timeline.insert(message(&format!("m{id}"), u64::from(*id), "x"));
            }
            let before: Vec<_> = timeline.messages().to_vec();
            for id in &ids {
                let inserted = timeline.insert(message(&format!("m{id}"), u64::from(*id), "y"));
                prop_assert!(!inserted);
            }
            prop_assert_eq!(timeline.messages(), before.as_slice());
        }
    }
}
