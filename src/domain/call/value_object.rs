//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted lifecycle state of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Call signal received, not yet accepted
    Incoming,
    /// Join requested from the transport
    Joining,
    /// Transport confirmed the join
    Active,
    /// Leave requested
    Ending,
    /// Terminal
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Incoming => "incoming",
            SessionState::Joining => "joining",
            SessionState::Active => "active",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
        }
    }

    /// Decode a stored value. Unknown or corrupt values map to `Ended`.
    pub fn from_stored(value: &str) -> Self {
        match value {
            "incoming" => SessionState::Incoming,
            "joining" => SessionState::Joining,
            "active" => SessionState::Active,
            "ending" => SessionState::Ending,
            _ => SessionState::Ended,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SessionState::Incoming => 0,
            SessionState::Joining => 1,
            SessionState::Active => 2,
            SessionState::Ending => 3,
            SessionState::Ended => 4,
        }
    }

    /// States only move forward; any state may end
    pub fn can_transition_to(&self, new_state: SessionState) -> bool {
        match (self, new_state) {
            (SessionState::Ended, _) => false,
            (_, SessionState::Ended) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// Whether a restored process should treat the channel as possibly live
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Joining | SessionState::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory state of the lifecycle coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    Idle,
    Incoming,
    Joining,
    Active,
    Ending,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Incoming => "incoming",
            CoordinatorState::Joining => "joining",
            CoordinatorState::Active => "active",
            CoordinatorState::Ending => "ending",
        }
    }

    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: CoordinatorState) -> bool {
        use CoordinatorState::*;

        match (self, new_state) {
            (Idle, Incoming) => true,
            // Direct join and resume recovery
            (Idle, Joining) => true,

            (Incoming, Joining) => true,
            (Incoming, Idle) => true,

            (Joining, Active) => true,
            (Joining, Ending) => true,
            (Joining, Idle) => true,

            (Active, Ending) => true,
            // Forced reset when leave cannot be requested
            (Active, Idle) => true,

            (Ending, Idle) => true,

            _ => false,
        }
    }

    pub fn in_channel(&self) -> bool {
        matches!(self, CoordinatorState::Joining | CoordinatorState::Active)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the coordinator left a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Local user hung up
    LocalHangUp,
    /// Nobody was present after the discovery window
    EmptyAfterDiscovery,
    /// The last remote participant departed
    LastPeerLeft,
    /// Transport reported an error
    TransportError,
    /// Coordinator shutting down
    Shutdown,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::LocalHangUp => "local_hang_up",
            LeaveReason::EmptyAfterDiscovery => "empty_after_discovery",
            LeaveReason::LastPeerLeft => "last_peer_left",
            LeaveReason::TransportError => "transport_error",
            LeaveReason::Shutdown => "shutdown",
        }
    }

    /// Leaves the coordinator initiates on its own
    pub fn is_automatic(&self) -> bool {
        matches!(
            self,
            LeaveReason::EmptyAfterDiscovery | LeaveReason::LastPeerLeft | LeaveReason::TransportError
        )
    }
}
