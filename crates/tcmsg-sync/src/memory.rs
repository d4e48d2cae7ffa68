//! In-process `ConversationStore`.
//!
//! Behaves like the hosted backend as far as the sync engine can observe:
//! store-assigned ids, strictly increasing creation timestamps, per-caller
//! visibility on queries, recipient-only status updates, and a fan-out feed
//! of newly created records. Fault injection hooks let tests exercise the
//! engine's failure paths.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tcmsg_core::{
    now_millis, ConversationId, EncryptedMessage, MessageId, MessageStatus, NewMessage, StoreError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::{ConversationStore, StoreOp, Subscription};

struct Subscriber {
    tx: mpsc::UnboundedSender<EncryptedMessage>,
    token: CancellationToken,
}

impl Subscriber {
    fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.tx.is_closed()
    }
}

#[derive(Default)]
struct Inner {
    records: Vec<EncryptedMessage>,
    subscribers: HashMap<ConversationId, Vec<Subscriber>>,
    failures: HashMap<StoreOp, VecDeque<StoreError>>,
    delays: HashMap<StoreOp, Duration>,
    last_created_at: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Delay every call of `op` by `delay` (simulates a slow backend).
    pub fn set_delay(&self, op: StoreOp, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    pub fn clear_delay(&self, op: StoreOp) {
        self.lock().delays.remove(&op);
    }

    /// Store a record as-is, bypassing `create`. Subscribers are not notified.
    pub fn insert_raw(&self, record: EncryptedMessage) {
        let mut inner = self.lock();
        inner.last_created_at = inner.last_created_at.max(record.created_at);
        inner.records.push(record);
    }

    /// Push a record to the live feed of its conversation without storing it.
    pub fn publish(&self, record: &EncryptedMessage) -> usize {
        let mut inner = self.lock();
        fan_out(&mut inner, record)
    }

    /// Replace a stored record's ciphertext, e.g. to simulate corruption.
    pub fn corrupt_ciphertext(&self, message_id: &MessageId, ciphertext: &str) -> bool {
        let mut inner = self.lock();
        match inner.records.iter_mut().find(|r| &r.id == message_id) {
            Some(record) => {
                record.ciphertext = ciphertext.to_string();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, message_id: &MessageId) -> Option<EncryptedMessage> {
        self.lock().records.iter().find(|r| &r.id == message_id).cloned()
    }

    pub fn records(&self) -> Vec<EncryptedMessage> {
        self.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Active live-feed subscribers of a conversation.
    pub fn subscriber_count(&self, conversation_id: &ConversationId) -> usize {
        let mut inner = self.lock();
        prune_subscribers(&mut inner);
        inner.subscribers.get(conversation_id).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave `Inner` half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply injected latency and failures for `op`.
    async fn before(&self, op: StoreOp) -> Result<(), StoreError> {
        let (delay, failure) = {
            let mut inner = self.lock();
            let delay = inner.delays.get(&op).copied();
            let failure = inner.failures.get_mut(&op).and_then(VecDeque::pop_front);
            (delay, failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => {
                debug!(op = op.as_str(), error = %err, "injected store failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

fn fan_out(inner: &mut Inner, record: &EncryptedMessage) -> usize {
    let Some(subs) = inner.subscribers.get_mut(&record.conversation_id) else {
        return 0;
    };
    subs.retain(|s| s.is_active() && s.tx.send(record.clone()).is_ok());
    let delivered = subs.len();
    if delivered == 0 {
        inner.subscribers.remove(&record.conversation_id);
    }
    delivered
}

/// Drop cancelled subscribers, and conversations left with none.
fn prune_subscribers(inner: &mut Inner) {
    inner.subscribers.retain(|_, subs| {
        subs.retain(Subscriber::is_active);
        !subs.is_empty()
    });
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create(&self, input: NewMessage) -> Result<EncryptedMessage, StoreError> {
        self.before(StoreOp::Create).await?;

        if input.sender.trim().is_empty() || input.recipient.trim().is_empty() {
            return Err(StoreError::InvalidRecord("missing sender or recipient".into()));
        }
        if input.sender == input.recipient {
            return Err(StoreError::InvalidRecord(
                "sender and recipient are the same participant".into(),
            ));
        }
        let expected =
            ConversationId::derive(&input.sender, &input.recipient, input.scope.as_deref());
        if expected != input.conversation_id {
            return Err(StoreError::InvalidRecord(format!(
                "conversation id {} does not match participants ({expected})",
                input.conversation_id
            )));
        }

        let mut inner = self.lock();
        let created_at = now_millis().max(inner.last_created_at + 1);
        inner.last_created_at = created_at;

        let record = EncryptedMessage {
            id: MessageId::new(uuid::Uuid::new_v4().to_string()),
            sender: input.sender,
            recipient: input.recipient,
            conversation_id: input.conversation_id,
            scope: input.scope,
            ciphertext: input.ciphertext,
            nonce: input.nonce,
            algorithm: input.algorithm,
            key_length: input.key_length,
            tag_length: input.tag_length,
            status: input.status,
            created_at,
            read_at: None,
        };
        inner.records.push(record.clone());
        let delivered = fan_out(&mut inner, &record);

        debug!(
            message_id = %record.id,
            conversation = %record.conversation_id,
            subscribers = delivered,
            "record created"
        );
        Ok(record)
    }

    async fn query_by_conversation(
        &self,
        conversation_id: &ConversationId,
        caller: &str,
    ) -> Result<Vec<EncryptedMessage>, StoreError> {
        self.before(StoreOp::Query).await?;

        let inner = self.lock();
        let mut records: Vec<EncryptedMessage> = inner
            .records
            .iter()
            .filter(|r| &r.conversation_id == conversation_id)
            .filter(|r| r.sender == caller || r.recipient == caller)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn update_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
        read_at: Option<u64>,
        acting: &str,
    ) -> Result<(), StoreError> {
        self.before(StoreOp::UpdateStatus).await?;

        let mut inner = self.lock();
        let record = inner
            .records
            .iter_mut()
            .find(|r| &r.id == message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;

        if record.recipient != acting {
            return Err(StoreError::Forbidden {
                message_id: message_id.to_string(),
                acting: acting.to_string(),
            });
        }

        record.status = status;
        record.read_at = if status.is_read() {
            Some(read_at.unwrap_or_else(now_millis))
        } else {
            None
        };
        Ok(())
    }

    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<Subscription, StoreError> {
        self.before(StoreOp::Subscribe).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let mut inner = self.lock();
        prune_subscribers(&mut inner);
        inner
            .subscribers
            .entry(conversation_id.clone())
            .or_default()
            .push(Subscriber {
                tx,
                token: token.clone(),
            });
        Ok(Subscription::new(rx, token))
    }
}
