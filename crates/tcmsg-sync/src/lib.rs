//! tcmsg-sync: conversation sync engine
//!
//! `ConversationSync` keeps one decrypted timeline per open conversation,
//! reconciled against two sources that can race and duplicate each other:
//!
//! ```text
//! open ──► derive key ──► subscribe (live feed) ──► load_history (query)
//!                                   │                      │
//!                                   ▼                      ▼
//!                            on_live_message ──► Timeline (unique by id,
//!                                                sorted by created_at)
//! ```
//!
//! The store is an external collaborator behind `ConversationStore`;
//! `MemoryStore` is the in-process implementation used by the CLI and tests.

pub mod engine;
pub mod error;
pub mod memory;
pub mod sanitize;
pub mod store;
pub mod timeline;

pub use engine::{ConversationSync, LiveOutcome, LoadReport};
pub use error::SyncError;
pub use memory::MemoryStore;
pub use store::{ConversationStore, StoreOp, Subscription};
pub use timeline::{
    DecryptedMessage, MessageContent, MessageOrigin, SyncPhase, Timeline, TimelineView,
};
