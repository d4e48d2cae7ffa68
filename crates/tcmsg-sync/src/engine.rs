//! Conversation sync engine.
//!
//! One `ConversationSync` serves one caller identity and at most one open
//! conversation at a time. It owns the conversation key and the decrypted
//! timeline; observers get read-only `TimelineView` snapshots through a
//! `watch` channel, republished after every change.
//!
//! Operations take `&mut self`: the owner drives the engine cooperatively
//! (open, load history, pump the live feed, send, mark read, close) and no
//! two operations ever mutate the timeline concurrently. The store itself
//! may change at any time, since the peer writes to it independently.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcmsg_core::config::{SyncConfig, TcmsgConfig};
use tcmsg_core::{
    now_millis, Conversation, EncryptedMessage, MessageId, MessageStatus, NewMessage, StoreError,
};
use tcmsg_crypto::{
    decrypt, encrypt, ConversationKey, DeterministicKdf, Envelope, EnvelopeMetadata, KdfParams,
    KeyDeriver,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::sanitize::prepare_outgoing;
use crate::store::{ConversationStore, StoreOp, Subscription};
use crate::timeline::{
    DecryptedMessage, MessageContent, MessageOrigin, SyncPhase, Timeline, TimelineView,
};

/// Result of applying one live-feed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    Inserted,
    /// Already in the timeline; at most its status was refreshed
    Duplicate,
    /// Closed engine or a record from another conversation
    Ignored,
}

/// Summary of a history load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Records returned by the store
    pub fetched: usize,
    /// Records new to the timeline
    pub inserted: usize,
    /// Records already present (typically delivered live during the fetch)
    pub duplicates: usize,
    /// Records shown with the placeholder
    pub undecryptable: usize,
    pub marked_read: usize,
    pub mark_read_failures: usize,
}

/// State that exists only while a conversation is open.
struct Session {
    conversation: Conversation,
    key: ConversationKey,
    timeline: Timeline,
    subscription: Option<Subscription>,
    notice: Option<String>,
}

/// Raises the `sending` flag for one store write and lowers it when
/// dropped, including when the `send` future itself is dropped mid-write.
struct SendingGuard {
    flag: Arc<AtomicBool>,
    view_tx: Arc<watch::Sender<TimelineView>>,
}

impl SendingGuard {
    fn raise(flag: &Arc<AtomicBool>, view_tx: &Arc<watch::Sender<TimelineView>>) -> Self {
        flag.store(true, Ordering::SeqCst);
        view_tx.send_modify(|view| view.sending = true);
        Self {
            flag: Arc::clone(flag),
            view_tx: Arc::clone(view_tx),
        }
    }
}

impl Drop for SendingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        self.view_tx.send_if_modified(|view| std::mem::replace(&mut view.sending, false));
    }
}

pub struct ConversationSync {
    store: Arc<dyn ConversationStore>,
    deriver: Arc<dyn KeyDeriver>,
    identity: String,
    config: SyncConfig,
    session: Option<Session>,
    phase: SyncPhase,
    sending: Arc<AtomicBool>,
    view_tx: Arc<watch::Sender<TimelineView>>,
}

impl ConversationSync {
    /// Create an engine acting as `identity`, deriving keys with the
    /// configured PBKDF2 iteration count.
    pub fn new(
        store: Arc<dyn ConversationStore>,
        identity: impl Into<String>,
        config: &TcmsgConfig,
    ) -> Self {
        let deriver = DeterministicKdf::new(KdfParams {
            iterations: config.crypto.kdf_iterations,
        });
        let (view_tx, _) = watch::channel(TimelineView::empty(
            SyncPhase::Uninitialized,
            &config.sync.placeholder_text,
        ));
        Self {
            store,
            deriver: Arc::new(deriver),
            identity: identity.into(),
            config: config.sync.clone(),
            session: None,
            phase: SyncPhase::Uninitialized,
            sending: Arc::new(AtomicBool::new(false)),
            view_tx: Arc::new(view_tx),
        }
    }

    /// Replace the key source.
    pub fn with_deriver(mut self, deriver: Arc<dyn KeyDeriver>) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.session.as_ref().map(|s| &s.conversation)
    }

    /// Whether the live feed is currently attached.
    pub fn is_live_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.subscription.is_some())
    }

    /// Current snapshot of the timeline.
    pub fn view(&self) -> TimelineView {
        self.view_tx.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<TimelineView> {
        self.view_tx.subscribe()
    }

    /// Open a conversation: derive its key and attach the live feed.
    ///
    /// The caller must be one of two distinct participants. Any previously
    /// open conversation is closed first. The live feed is
    /// attached before history is fetched so nothing created in between is
    /// missed; if it cannot be attached the conversation still opens, with a
    /// notice on the view.
    pub async fn open(
        &mut self,
        conversation: Conversation,
    ) -> Result<watch::Receiver<TimelineView>, SyncError> {
        if self.session.is_some() {
            self.close();
        }
        if !conversation.includes(&self.identity) {
            return Err(SyncError::NotParticipant {
                identity: self.identity.clone(),
                conversation: conversation.id.to_string(),
            });
        }
        if conversation.is_self_conversation() {
            return Err(SyncError::SelfConversation {
                conversation: conversation.id.to_string(),
            });
        }

        let key = self.derive_key(&conversation).await?;
        self.phase = SyncPhase::Loading;

        let mut session = Session {
            conversation,
            key,
            timeline: Timeline::new(),
            subscription: None,
            notice: None,
        };

        let subscribed = bounded(
            StoreOp::Subscribe,
            self.config.subscribe_timeout(),
            self.store.subscribe(&session.conversation.id),
        )
        .await;
        match subscribed {
            Ok(subscription) => session.subscription = Some(subscription),
            Err(e) => {
                warn!(
                    conversation = %session.conversation.id,
                    "live updates unavailable: {e}"
                );
                session.notice = Some(format!("live updates unavailable: {e}"));
            }
        }

        info!(
            conversation = %session.conversation.id,
            identity = %self.identity,
            key = %session.key.fingerprint(),
            live = session.subscription.is_some(),
            "conversation opened"
        );

        self.session = Some(session);
        self.publish();
        Ok(self.view_tx.subscribe())
    }

    /// Fetch the conversation history and merge it into the timeline.
    ///
    /// Records already present (e.g. delivered live while the fetch was in
    /// flight) are kept as they are. Afterwards every message addressed to
    /// this identity that is not yet read is marked read; failures there are
    /// counted in the report, not returned.
    pub async fn load_history(&mut self) -> Result<LoadReport, SyncError> {
        let conversation = self.session()?.conversation.clone();
        let conversation_id = conversation.id.clone();

        let fetched = bounded(
            StoreOp::Query,
            self.config.fetch_timeout(),
            self.store
                .query_by_conversation(&conversation_id, &self.identity),
        )
        .await;
        let records = match fetched {
            Ok(records) => records,
            Err(e) => {
                warn!(conversation = %conversation_id, "history fetch failed: {e}");
                self.set_notice(format!("failed to load messages: {e}"));
                return Err(e.into());
            }
        };

        let mut report = LoadReport {
            fetched: records.len(),
            ..LoadReport::default()
        };
        let records: Vec<EncryptedMessage> = records
            .into_iter()
            .filter(|r| {
                let matches = r.conversation_id == conversation_id
                    && conversation.has_pair(&r.sender, &r.recipient);
                if !matches {
                    debug!(
                        message_id = %r.id,
                        conversation = %r.conversation_id,
                        sender = %r.sender,
                        recipient = %r.recipient,
                        "skipping foreign record"
                    );
                }
                matches
            })
            .collect();

        let key = self.session()?.key.clone();
        let decrypted = tokio::task::spawn_blocking(move || {
            records
                .into_iter()
                .map(|record| decrypt_record(record, &key, MessageOrigin::History))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| SyncError::Worker(e.to_string()))?;
        report.undecryptable = decrypted.iter().filter(|m| m.is_unavailable()).count();

        let session = self.session.as_mut().ok_or(SyncError::NotOpen)?;
        let (inserted, duplicates) = session.timeline.merge(decrypted);
        report.inserted = inserted;
        report.duplicates = duplicates;

        let unread: Vec<MessageId> = session
            .timeline
            .messages()
            .iter()
            .filter(|m| m.record.awaits_read_by(&self.identity))
            .map(|m| m.id().clone())
            .collect();

        self.phase = SyncPhase::Live;
        self.publish();

        for id in unread {
            match self.persist_read(&id).await {
                Ok(()) => report.marked_read += 1,
                Err(e) => {
                    report.mark_read_failures += 1;
                    warn!(message_id = %id, "failed to mark message read: {e}");
                }
            }
        }
        if report.marked_read > 0 {
            self.publish();
        }

        info!(
            conversation = %conversation_id,
            fetched = report.fetched,
            inserted = report.inserted,
            duplicates = report.duplicates,
            undecryptable = report.undecryptable,
            marked_read = report.marked_read,
            "history loaded"
        );
        Ok(report)
    }

    /// Apply one record from the live feed.
    pub async fn on_live_message(&mut self, record: EncryptedMessage) -> LiveOutcome {
        let Some(session) = self.session.as_mut() else {
            debug!(message_id = %record.id, "live record ignored: no open conversation");
            return LiveOutcome::Ignored;
        };
        if record.conversation_id != session.conversation.id {
            debug!(
                message_id = %record.id,
                conversation = %record.conversation_id,
                "live record ignored: other conversation"
            );
            return LiveOutcome::Ignored;
        }
        if !session.conversation.has_pair(&record.sender, &record.recipient) {
            debug!(
                message_id = %record.id,
                sender = %record.sender,
                recipient = %record.recipient,
                "live record ignored: participants do not match"
            );
            return LiveOutcome::Ignored;
        }

        if session.timeline.contains(&record.id) {
            debug!(message_id = %record.id, "live record already present");
            if session.timeline.refresh_status(&record) {
                self.publish();
            }
            return LiveOutcome::Duplicate;
        }

        let message = decrypt_record(record, &session.key, MessageOrigin::Live);
        let id = message.id().clone();
        let awaits_read = message.record.awaits_read_by(&self.identity);
        session.timeline.insert(message);
        debug!(message_id = %id, "live record inserted");
        self.publish();

        if awaits_read {
            match self.persist_read(&id).await {
                Ok(()) => self.publish(),
                Err(e) => warn!(message_id = %id, "failed to mark message read: {e}"),
            }
        }
        LiveOutcome::Inserted
    }

    /// Wait for the next live record and apply it.
    ///
    /// Returns `None` when no feed is attached or the feed has ended.
    pub async fn next_live(&mut self) -> Option<LiveOutcome> {
        let subscription = self.session.as_mut()?.subscription.as_mut()?;
        let next = subscription.recv().await;
        match next {
            Some(record) => Some(self.on_live_message(record).await),
            None => {
                if let Some(session) = self.session.as_mut() {
                    warn!(conversation = %session.conversation.id, "live feed ended");
                    session.subscription = None;
                    session.notice = Some("live updates ended".into());
                }
                self.publish();
                None
            }
        }
    }

    /// Apply every live record already queued, without waiting.
    pub async fn drain_live(&mut self) -> Vec<LiveOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let next = self
                .session
                .as_mut()
                .and_then(|s| s.subscription.as_mut())
                .and_then(Subscription::try_recv);
            let Some(record) = next else {
                break;
            };
            outcomes.push(self.on_live_message(record).await);
        }
        outcomes
    }

    /// Encrypt and persist a message to the peer.
    ///
    /// On success the message appears in the timeline with its local
    /// plaintext, under the id assigned by the store; the later live echo
    /// of the same record is then a duplicate. Nothing is retried.
    pub async fn send(&mut self, plaintext: &str) -> Result<MessageId, SyncError> {
        let Some(session) = self.session.as_ref() else {
            return Err(SyncError::EncryptionUnavailable {
                reason: "no conversation key: conversation is not open".into(),
            });
        };
        let text = prepare_outgoing(plaintext, self.config.max_message_chars)?;
        let recipient = session
            .conversation
            .peer_of(&self.identity)
            .ok_or_else(|| SyncError::NotParticipant {
                identity: self.identity.clone(),
                conversation: session.conversation.id.to_string(),
            })?
            .to_string();

        let envelope = encrypt(&text, &session.key)?;
        let input = NewMessage {
            sender: self.identity.clone(),
            recipient,
            conversation_id: session.conversation.id.clone(),
            scope: session.conversation.scope.clone(),
            ciphertext: envelope.ciphertext,
            nonce: envelope.nonce,
            algorithm: envelope.metadata.algorithm,
            key_length: envelope.metadata.key_length,
            tag_length: envelope.metadata.tag_length,
            status: MessageStatus::Sent,
        };

        let guard = SendingGuard::raise(&self.sending, &self.view_tx);
        let created = bounded(
            StoreOp::Create,
            self.config.send_timeout(),
            self.store.create(input),
        )
        .await;
        drop(guard);

        let session = self.session.as_mut().ok_or(SyncError::NotOpen)?;
        match created {
            Ok(record) => {
                let id = record.id.clone();
                info!(conversation = %record.conversation_id, message_id = %id, "message sent");
                session.timeline.insert(DecryptedMessage {
                    record,
                    content: MessageContent::Plaintext(text),
                    origin: MessageOrigin::LocalEcho,
                });
                self.publish();
                Ok(id)
            }
            Err(e) => {
                warn!(conversation = %session.conversation.id, "send failed: {e}");
                session.notice = Some(format!("failed to send message: {e}"));
                self.publish();
                Err(e.into())
            }
        }
    }

    /// Mark a received message as read, in the store and locally.
    pub async fn mark_read(&mut self, message_id: &MessageId) -> Result<(), SyncError> {
        let entry = self
            .session()?
            .timeline
            .get(message_id)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))?;
        if !entry.record.is_addressed_to(&self.identity) {
            return Err(SyncError::NotRecipient(message_id.clone()));
        }
        if entry.record.status.is_read() {
            return Ok(());
        }

        self.persist_read(message_id).await?;
        self.publish();
        Ok(())
    }

    /// Stop the live feed and discard the timeline and key.
    pub fn close(&mut self) {
        if self.session.is_none() && self.phase == SyncPhase::Closed {
            return;
        }
        if let Some(mut session) = self.session.take() {
            // cancel before anything else so no queued record can be applied
            if let Some(mut subscription) = session.subscription.take() {
                subscription.cancel();
            }
            info!(
                conversation = %session.conversation.id,
                messages = session.timeline.len(),
                "conversation closed"
            );
        }
        self.phase = SyncPhase::Closed;
        self.publish();
    }

    fn session(&self) -> Result<&Session, SyncError> {
        self.session.as_ref().ok_or(SyncError::NotOpen)
    }

    async fn derive_key(&self, conversation: &Conversation) -> Result<ConversationKey, SyncError> {
        let deriver = Arc::clone(&self.deriver);
        let [participant_a, participant_b] = conversation.participants.clone();
        let scope = conversation.scope.clone();

        let derived = tokio::task::spawn_blocking(move || {
            deriver.derive(&participant_a, &participant_b, scope.as_deref())
        })
        .await
        .map_err(|e| SyncError::Worker(e.to_string()))?;

        derived.map_err(|e| {
            warn!(conversation = %conversation.id, "key derivation failed: {e}");
            SyncError::EncryptionUnavailable {
                reason: e.to_string(),
            }
        })
    }

    /// Write read state to the store, then mirror it locally.
    async fn persist_read(&mut self, message_id: &MessageId) -> Result<(), StoreError> {
        let read_at = now_millis();
        bounded(
            StoreOp::UpdateStatus,
            self.config.status_timeout(),
            self.store
                .update_status(message_id, MessageStatus::Read, Some(read_at), &self.identity),
        )
        .await?;
        if let Some(session) = self.session.as_mut() {
            session.timeline.mark_read(message_id, read_at);
        }
        debug!(message_id = %message_id, "marked read");
        Ok(())
    }

    fn set_notice(&mut self, notice: String) {
        if let Some(session) = self.session.as_mut() {
            session.notice = Some(notice);
        }
        self.publish();
    }

    fn publish(&self) {
        let placeholder = &self.config.placeholder_text;
        let view = match &self.session {
            Some(session) => TimelineView {
                conversation_id: Some(session.conversation.id.clone()),
                phase: self.phase,
                messages: session.timeline.messages().to_vec(),
                sending: self.sending.load(Ordering::SeqCst),
                notice: session.notice.clone(),
                placeholder_text: placeholder.clone(),
            },
            None => TimelineView::empty(self.phase, placeholder),
        };
        self.view_tx.send_replace(view);
    }
}

/// Run a store call with an upper bound on its duration.
async fn bounded<T>(
    op: StoreOp,
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            op: op.as_str(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

/// Decrypt one record; any failure yields `MessageContent::Unavailable`.
fn decrypt_record(
    record: EncryptedMessage,
    key: &ConversationKey,
    origin: MessageOrigin,
) -> DecryptedMessage {
    let envelope = Envelope {
        ciphertext: record.ciphertext.clone(),
        nonce: record.nonce.clone(),
        metadata: EnvelopeMetadata {
            algorithm: record.algorithm.clone(),
            key_length: record.key_length,
            tag_length: record.tag_length,
        },
    };
    let content = match decrypt(&envelope, key) {
        Ok(plaintext) => MessageContent::Plaintext(plaintext),
        Err(e) => {
            warn!(
                message_id = %record.id,
                conversation = %record.conversation_id,
                "message undecryptable: {e}"
            );
            MessageContent::Unavailable
        }
    };
    DecryptedMessage {
        record,
        content,
        origin,
    }
}
