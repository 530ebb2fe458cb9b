//! Conversation store: sessions, messages, patients, and constraints.
//!
//! The [`store::ConversationStore`] trait is the seam the pipeline talks to;
//! [`store::SqliteStore`] is the bundled implementation. Session lookups go
//! through a short-TTL process-local cache with in-flight deduplication to
//! bound database load under concurrent first contact.

pub mod cache;
pub mod db;
pub mod error;
pub mod state;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use state::{ControlMode, ConversationState, FlowState, TurnStatus};
pub use store::{ConversationStore, SqliteStore};
pub use types::{Role, Session, SessionHandle, SessionPatch, StoredMessage};
