//! Call session record

use crate::domain::call::value_object::SessionState;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{ChannelId, Uid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single call attempt this device knows about
///
/// Created when an incoming call signal arrives and cleared when the call
/// fully ends. At most one exists at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    channel_id: ChannelId,
    /// Opaque transport auth token
    token: String,
    local_uid: Uid,
    caller_display_name: String,
    caller_photo_url: Option<String>,
    join_timestamp: DateTime<Utc>,
    state: SessionState,
}

impl CallSession {
    /// Session for a freshly received call signal
    pub fn incoming(
        channel_id: ChannelId,
        token: String,
        local_uid: Uid,
        caller_display_name: String,
        caller_photo_url: Option<String>,
    ) -> Self {
        Self {
            channel_id,
            token,
            local_uid,
            caller_display_name,
            caller_photo_url,
            join_timestamp: Utc::now(),
            state: SessionState::Incoming,
        }
    }

    /// Rebuild a session from stored fields
    pub fn restore(
        channel_id: ChannelId,
        token: String,
        local_uid: Uid,
        caller_display_name: String,
        caller_photo_url: Option<String>,
        join_timestamp: DateTime<Utc>,
        state: SessionState,
    ) -> Self {
        Self {
            channel_id,
            token,
            local_uid,
            caller_display_name,
            caller_photo_url,
            join_timestamp,
            state,
        }
    }

    /// Move to a new state
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<()> {
        if !self.state.can_transition_to(new_state) {
            return Err(DomainError::InvalidStateTransition(format!(
                "Cannot transition session from {} to {}",
                self.state, new_state
            )));
        }
        self.state = new_state;
        Ok(())
    }

    /// Transport confirmed the join
    pub fn activate(&mut self, assigned_uid: Uid) -> Result<()> {
        self.transition_to(SessionState::Active)?;
        self.join_timestamp = Utc::now();
        if !assigned_uid.is_auto() {
            self.local_uid = assigned_uid;
        }
        Ok(())
    }

    /// Time spent in the channel, zero unless active
    pub fn duration_at(&self, now: DateTime<Utc>) -> std::time::Duration {
        if self.state != SessionState::Active {
            return std::time::Duration::ZERO;
        }
        (now - self.join_timestamp)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }

    // Getters
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn local_uid(&self) -> Uid {
        self.local_uid
    }

    pub fn caller_display_name(&self) -> &str {
        &self.caller_display_name
    }

    pub fn caller_photo_url(&self) -> Option<&str> {
        self.caller_photo_url.as_deref()
    }

    pub fn join_timestamp(&self) -> DateTime<Utc> {
        self.join_timestamp
    }

    pub fn state(&self) -> SessionState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_session() -> CallSession {
        CallSession::incoming(
            ChannelId::parse("room-1").unwrap(),
            "tok".to_string(),
            Uid::AUTO,
            "Alice".to_string(),
            None,
        )
    }

    #[test]
    fn test_session_lifecycle() {
        let mut session = create_test_session();
        assert_eq!(session.state(), SessionState::Incoming);

        session.transition_to(SessionState::Joining).unwrap();
        session.activate(Uid::new(77)).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.local_uid(), Uid::new(77));

        session.transition_to(SessionState::Ending).unwrap();
        assert!(session.transition_to(SessionState::Active).is_err());
    }

    #[test]
    fn test_activate_keeps_uid_when_auto() {
        let mut session = create_test_session();
        session.activate(Uid::AUTO).unwrap();
        assert!(session.local_uid().is_auto());
    }

    #[test]
    fn test_duration_only_when_active() {
        let mut session = create_test_session();
        let later = session.join_timestamp() + chrono::Duration::seconds(30);
        assert_eq!(session.duration_at(later), std::time::Duration::ZERO);

        session.activate(Uid::new(3)).unwrap();
        let later = session.join_timestamp() + chrono::Duration::seconds(30);
        assert_eq!(session.duration_at(later), std::time::Duration::from_secs(30));
    }
}
