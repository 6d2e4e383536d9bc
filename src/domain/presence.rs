//! Channel presence tracking
//!
//! Keeps the set of remote participants in the currently joined channel.
//! Membership only changes through transport callbacks. The local uid is
//! never counted.

use crate::domain::shared::value_objects::{ChannelId, Uid};
use crate::domain::transport::OfflineReason;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Notable presence transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// The last remote participant departed
    ChannelBecameEmpty { channel_id: ChannelId },
}

#[derive(Debug, Default)]
struct ParticipantSet {
    channel_id: Option<ChannelId>,
    local_uid: Option<Uid>,
    remote: HashSet<Uid>,
}

/// Tracks who else is in the channel right now
pub struct PresenceTracker {
    inner: Mutex<ParticipantSet>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ParticipantSet::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ParticipantSet> {
        // The set holds plain data; a poisoned lock is still consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A fresh channel session started
    pub fn on_join_success(&self, channel_id: &ChannelId, local_uid: Uid) {
        let mut set = self.lock();
        set.remote.clear();
        set.channel_id = Some(channel_id.clone());
        set.local_uid = Some(local_uid);
        drop(set);

        debug!(channel = %channel_id, uid = %local_uid, "presence reset on join");
    }

    /// Record a remote participant. Duplicate joins are no-ops.
    pub fn on_user_joined(&self, uid: Uid) -> bool {
        let mut set = self.lock();
        if set.channel_id.is_none() {
            debug!(uid = %uid, "user joined while not in a channel, ignoring");
            return false;
        }
        if set.local_uid == Some(uid) {
            return false;
        }
        let inserted = set.remote.insert(uid);
        let count = set.remote.len();
        drop(set);

        if inserted {
            debug!(uid = %uid, count, "remote user joined");
        }
        inserted
    }

    /// Drop a remote participant
    ///
    /// Returns [`PresenceEvent::ChannelBecameEmpty`] when this removal took the
    /// set from non-empty to empty.
    pub fn on_user_left(&self, uid: Uid, reason: OfflineReason) -> Option<PresenceEvent> {
        let mut set = self.lock();
        if !set.remote.remove(&uid) {
            return None;
        }
        let count = set.remote.len();
        let channel_id = set.channel_id.clone();
        drop(set);

        debug!(uid = %uid, ?reason, count, "remote user left");

        match channel_id {
            Some(channel_id) if count == 0 => Some(PresenceEvent::ChannelBecameEmpty { channel_id }),
            _ => None,
        }
    }

    /// Local side left the channel
    pub fn on_leave(&self) {
        *self.lock() = ParticipantSet::default();
    }

    pub fn count(&self) -> usize {
        self.lock().remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().remote.is_empty()
    }

    pub fn is_joined_to(&self, channel_id: &ChannelId) -> bool {
        self.lock().channel_id.as_ref() == Some(channel_id)
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
