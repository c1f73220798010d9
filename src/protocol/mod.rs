//! Messages exchanged with cache servers
//!
//! This module provides:
//! - Request verbs and their retry/timeout policy
//! - Reply and notification models
//! - Event ids used for duplicate suppression
//! - A RESP-based frame codec

pub mod codec;
pub mod event_id;
pub mod message;

pub use codec::{ChannelKind, Handshake};
pub use event_id::{EventId, EventSource};
pub use message::{
    Notification, NotificationKind, Reply, ReplyKind, Request, ServerQueueStatus, Verb,
};
