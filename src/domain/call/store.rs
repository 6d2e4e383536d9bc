//! Durable record of the single active call session
//!
//! Writes are synchronous. State updates never fail past the caller: call
//! handling proceeds whether or not persistence succeeded.

use crate::domain::call::aggregate::CallSession;
use crate::domain::call::repository::{KeyValueStore, KeyValueStoreExt, StoredValue};
use crate::domain::call::value_object::SessionState;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{ChannelId, Uid};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const KEY_CHANNEL_ID: &str = "call.channel_id";
const KEY_TOKEN: &str = "call.token";
const KEY_LOCAL_UID: &str = "call.local_uid";
const KEY_CALLER_NAME: &str = "call.caller_display_name";
const KEY_CALLER_PHOTO: &str = "call.caller_photo_url";
const KEY_JOIN_TIMESTAMP: &str = "call.join_timestamp_ms";
const KEY_STATE: &str = "call.state";

const ALL_KEYS: [&str; 7] = [
    KEY_CHANNEL_ID,
    KEY_TOKEN,
    KEY_LOCAL_UID,
    KEY_CALLER_NAME,
    KEY_CALLER_PHOTO,
    KEY_JOIN_TIMESTAMP,
    KEY_STATE,
];

pub struct CallStateStore {
    kv: Arc<dyn KeyValueStore>,
}

impl CallStateStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Persist a newly signalled call, replacing any previous record
    pub fn save_incoming(&self, session: &CallSession) -> Result<()> {
        let kv = self.kv.as_ref();
        kv.put(
            KEY_CHANNEL_ID,
            StoredValue::String(session.channel_id().to_string()),
        )?;
        kv.put(KEY_TOKEN, StoredValue::String(session.token().to_string()))?;
        kv.put(
            KEY_LOCAL_UID,
            StoredValue::Long(session.local_uid().value() as i64),
        )?;
        kv.put(
            KEY_CALLER_NAME,
            StoredValue::String(session.caller_display_name().to_string()),
        )?;
        match session.caller_photo_url() {
            Some(url) => kv.put(KEY_CALLER_PHOTO, StoredValue::String(url.to_string()))?,
            None => kv.remove(KEY_CALLER_PHOTO)?,
        }
        kv.put(
            KEY_JOIN_TIMESTAMP,
            StoredValue::Long(Utc::now().timestamp_millis()),
        )?;
        kv.put(
            KEY_STATE,
            StoredValue::String(SessionState::Incoming.as_str().to_string()),
        )?;
        kv.apply()?;

        debug!(channel = %session.channel_id(), "incoming call persisted");
        Ok(())
    }

    pub fn mark_joining(&self) {
        self.write_state(SessionState::Joining, None, None);
    }

    /// Record the actual join time and the uid the transport assigned
    pub fn mark_active(&self, assigned_uid: Uid) {
        let uid = (!assigned_uid.is_auto()).then_some(assigned_uid);
        self.write_state(SessionState::Active, Some(Utc::now()), uid);
    }

    pub fn mark_ending(&self) {
        self.write_state(SessionState::Ending, None, None);
    }

    fn write_state(&self, state: SessionState, stamp: Option<DateTime<Utc>>, uid: Option<Uid>) {
        let result = (|| -> Result<()> {
            if let Some(stamp) = stamp {
                self.kv
                    .put(KEY_JOIN_TIMESTAMP, StoredValue::Long(stamp.timestamp_millis()))?;
            }
            if let Some(uid) = uid {
                self.kv
                    .put(KEY_LOCAL_UID, StoredValue::Long(uid.value() as i64))?;
            }
            self.kv
                .put(KEY_STATE, StoredValue::String(state.as_str().to_string()))?;
            self.kv.apply()
        })();

        if let Err(e) = result {
            warn!(state = %state, error = %e, "failed to persist call state");
        }
    }

    /// Delete the record entirely
    pub fn clear(&self) {
        let result = (|| -> Result<()> {
            for key in ALL_KEYS {
                self.kv.remove(key)?;
            }
            self.kv.apply()
        })();

        if let Err(e) = result {
            warn!(error = %e, "failed to clear persisted call");
        }
    }

    /// The persisted session, if every required field is present
    pub fn current(&self) -> Option<CallSession> {
        match self.read_session() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "failed to read persisted call");
                None
            }
        }
    }

    fn read_session(&self) -> Result<Option<CallSession>> {
        let kv = self.kv.as_ref();

        let Some(channel_id) = kv
            .get_string(KEY_CHANNEL_ID)?
            .and_then(|raw| ChannelId::parse(&raw).ok())
        else {
            return Ok(None);
        };
        let Some(token) = kv.get_string(KEY_TOKEN)? else {
            return Ok(None);
        };
        let Some(local_uid) = kv
            .get_long(KEY_LOCAL_UID)?
            .and_then(|raw| u32::try_from(raw).ok())
            .filter(|uid| *uid != 0)
        else {
            return Ok(None);
        };
        let Some(caller_name) = kv.get_string(KEY_CALLER_NAME)? else {
            return Ok(None);
        };

        let photo = kv.get_string(KEY_CALLER_PHOTO)?;
        let join_timestamp = kv
            .get_long(KEY_JOIN_TIMESTAMP)?
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        let state = kv
            .get_string(KEY_STATE)?
            .map(|raw| SessionState::from_stored(&raw))
            .unwrap_or(SessionState::Ended);

        Ok(Some(CallSession::restore(
            channel_id,
            token,
            Uid::new(local_uid),
            caller_name,
            photo,
            join_timestamp,
            state,
        )))
    }

    /// Time since the recorded join, zero unless the call is active
    pub fn duration(&self) -> Duration {
        self.current()
            .map(|session| session.duration_at(Utc::now()))
            .unwrap_or(Duration::ZERO)
    }
}
