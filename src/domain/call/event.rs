//! Call lifecycle events

use crate::domain::call::value_object::{CoordinatorState, LeaveReason};
use crate::domain::occupancy::OccupancyOutcome;
use crate::domain::shared::events::{DomainEvent, EventMetadata};
use crate::domain::shared::value_objects::ChannelId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a resume-from-background recovery resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// No usable persisted call
    NothingToRecover,
    /// Coordinator was not idle
    Busy,
    /// Call UI surfaced and the channel rejoined
    Resumed,
    /// Persisted call was stale and has been cleared
    Discarded,
}

/// Coordinator state changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChanged {
    pub metadata: EventMetadata,
    pub channel_id: Option<ChannelId>,
    pub from: CoordinatorState,
    pub to: CoordinatorState,
}

/// Discovery window resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancyDecided {
    pub metadata: EventMetadata,
    pub channel_id: ChannelId,
    pub outcome: OccupancyOutcome,
}

/// Coordinator left a channel without a local hang-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoLeft {
    pub metadata: EventMetadata,
    pub channel_id: ChannelId,
    pub reason: LeaveReason,
}

/// Resume recovery finished
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResolved {
    pub metadata: EventMetadata,
    pub channel_id: Option<ChannelId>,
    pub outcome: RecoveryOutcome,
}

/// Union of all call events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    StateChanged(StateChanged),
    OccupancyDecided(OccupancyDecided),
    AutoLeft(AutoLeft),
    RecoveryResolved(RecoveryResolved),
}

impl CallEvent {
    pub fn state_changed(
        channel_id: Option<ChannelId>,
        from: CoordinatorState,
        to: CoordinatorState,
    ) -> Self {
        CallEvent::StateChanged(StateChanged {
            metadata: EventMetadata::new("call.state_changed"),
            channel_id,
            from,
            to,
        })
    }

    pub fn occupancy_decided(channel_id: ChannelId, outcome: OccupancyOutcome) -> Self {
        CallEvent::OccupancyDecided(OccupancyDecided {
            metadata: EventMetadata::new("call.occupancy_decided"),
            channel_id,
            outcome,
        })
    }

    pub fn auto_left(channel_id: ChannelId, reason: LeaveReason) -> Self {
        CallEvent::AutoLeft(AutoLeft {
            metadata: EventMetadata::new("call.auto_left"),
            channel_id,
            reason,
        })
    }

    pub fn recovery_resolved(channel_id: Option<ChannelId>, outcome: RecoveryOutcome) -> Self {
        CallEvent::RecoveryResolved(RecoveryResolved {
            metadata: EventMetadata::new("call.recovery_resolved"),
            channel_id,
            outcome,
        })
    }

    pub fn metadata(&self) -> &EventMetadata {
        match self {
            CallEvent::StateChanged(e) => &e.metadata,
            CallEvent::OccupancyDecided(e) => &e.metadata,
            CallEvent::AutoLeft(e) => &e.metadata,
            CallEvent::RecoveryResolved(e) => &e.metadata,
        }
    }
}

impl DomainEvent for CallEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CallEvent::StateChanged(_) => "call.state_changed",
            CallEvent::OccupancyDecided(_) => "call.occupancy_decided",
            CallEvent::AutoLeft(_) => "call.auto_left",
            CallEvent::RecoveryResolved(_) => "call.recovery_resolved",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata().occurred_at
    }

    fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            CallEvent::StateChanged(e) => e.channel_id.as_ref(),
            CallEvent::OccupancyDecided(e) => Some(&e.channel_id),
            CallEvent::AutoLeft(e) => Some(&e.channel_id),
            CallEvent::RecoveryResolved(e) => e.channel_id.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_matches_metadata() {
        let channel_id = ChannelId::parse("room-1").unwrap();
        let events = [
            CallEvent::state_changed(None, CoordinatorState::Idle, CoordinatorState::Incoming),
            CallEvent::occupancy_decided(channel_id.clone(), OccupancyOutcome::Empty),
            CallEvent::auto_left(channel_id, LeaveReason::LastPeerLeft),
            CallEvent::recovery_resolved(None, RecoveryOutcome::NothingToRecover),
        ];
        for event in events {
            assert_eq!(event.event_type(), event.metadata().event_type);
        }
    }

    #[test]
    fn test_channel_scope() {
        let channel_id = ChannelId::parse("room-1").unwrap();
        let left = CallEvent::auto_left(channel_id.clone(), LeaveReason::EmptyAfterDiscovery);
        assert_eq!(left.channel_id(), Some(&channel_id));

        let idle = CallEvent::recovery_resolved(None, RecoveryOutcome::NothingToRecover);
        assert_eq!(idle.channel_id(), None);
        assert!(idle.metadata().sequence > left.metadata().sequence);
    }
}
