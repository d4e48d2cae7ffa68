//! Conversation store abstraction and live-feed subscription handle.

use async_trait::async_trait;
use tcmsg_core::{ConversationId, EncryptedMessage, MessageId, MessageStatus, NewMessage, StoreError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Durable, append-only record of conversation messages.
///
/// Implementations own persistence and access rules; in particular
/// `update_status` must refuse anyone but the message's recipient.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist a new message; the store assigns id and `created_at`.
    async fn create(&self, input: NewMessage) -> Result<EncryptedMessage, StoreError>;

    /// Messages of a conversation where `caller` is sender or recipient,
    /// ascending by creation time.
    async fn query_by_conversation(
        &self,
        conversation_id: &ConversationId,
        caller: &str,
    ) -> Result<Vec<EncryptedMessage>, StoreError>;

    async fn update_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
        read_at: Option<u64>,
        acting: &str,
    ) -> Result<(), StoreError>;

    /// Feed of records created in `conversation_id` from now on.
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<Subscription, StoreError>;
}

/// Store operations, for fault injection and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Query,
    UpdateStatus,
    Subscribe,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Create => "create",
            StoreOp::Query => "query_by_conversation",
            StoreOp::UpdateStatus => "update_status",
            StoreOp::Subscribe => "subscribe",
        }
    }
}

/// Receiving end of a live feed.
///
/// Cancelling (or dropping) the subscription stops delivery: no record is
/// handed out after `cancel` returns, even if the store already queued it.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<EncryptedMessage>,
    token: CancellationToken,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<EncryptedMessage>, token: CancellationToken) -> Self {
        Self { rx, token }
    }

    /// Wait for the next record. `None` once cancelled or the feed ended.
    pub async fn recv(&mut self) -> Option<EncryptedMessage> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }

    /// Next already-queued record, without waiting.
    pub fn try_recv(&mut self) -> Option<EncryptedMessage> {
        if self.token.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn cancel(&mut self) {
        self.token.cancel();
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
