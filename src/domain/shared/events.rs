//! Event plumbing shared by the call context
//!
//! Call events fan out over a broadcast channel, where a slow subscriber can
//! miss some. Every event carries a process-wide sequence number so a
//! receiver can order what it saw and notice gaps.

use crate::domain::shared::value_objects::ChannelId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub trait DomainEvent: Send + Sync {
    /// Dotted name, e.g. `call.auto_left`
    fn event_type(&self) -> &'static str;

    fn occurred_at(&self) -> DateTime<Utc>;

    /// Channel the event concerns; `None` for events raised while idle
    fn channel_id(&self) -> Option<&ChannelId>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    /// Strictly increasing within one process
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
}

impl EventMetadata {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            occurred_at: Utc::now(),
            event_type: event_type.to_string(),
        }
    }
}
