//! In-process real-time transport
//!
//! Scriptable stand-in for the vendor voice engine. Callbacks are delivered
//! synchronously from inside the request that caused them, or from
//! whichever task calls the injection methods.

use crate::domain::shared::value_objects::{ChannelId, Uid};
use crate::domain::transport::{
    ListenerRef, OfflineReason, RealtimeChannelTransport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const FIRST_AUTO_UID: u32 = 1000;

#[derive(Default)]
struct SimState {
    initialized: bool,
    listener: Option<ListenerRef>,
    listener_swaps: usize,
    joined: Option<(ChannelId, Uid)>,
    /// Join requested, callbacks held back
    pending_join: Option<(ChannelId, Uid)>,
    muted: bool,
    rooms: HashMap<ChannelId, BTreeSet<Uid>>,
    reject_join_code: Option<i32>,
    fail_leave: bool,
    hold_join_callbacks: bool,
    suppress_leave_callbacks: bool,
    next_auto_uid: u32,
    join_count: usize,
    leave_count: usize,
}

pub struct SimulatedTransport {
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                initialized: true,
                next_auto_uid: FIRST_AUTO_UID,
                ..Default::default()
            }),
        }
    }

    /// Engine that rejects every request until initialized
    pub fn uninitialized() -> Self {
        let transport = Self::new();
        transport.set_initialized(false);
        transport
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(listener: Option<ListenerRef>, events: Vec<TransportEvent>) {
        let Some(listener) = listener else {
            debug!(dropped = events.len(), "no listener registered, dropping callbacks");
            return;
        };
        for event in events {
            listener.on_event(event);
        }
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.state().initialized = initialized;
    }

    /// Refuse subsequent joins with `code`, or accept them again with `None`
    pub fn reject_joins(&self, code: Option<i32>) {
        self.state().reject_join_code = code;
    }

    pub fn fail_leaves(&self, fail: bool) {
        self.state().fail_leave = fail;
    }

    /// Accept joins without delivering join-success until [`Self::complete_join`]
    pub fn hold_join_callbacks(&self, hold: bool) {
        self.state().hold_join_callbacks = hold;
    }

    /// Accept leaves without ever delivering the leave callback
    pub fn suppress_leave_callbacks(&self, suppress: bool) {
        self.state().suppress_leave_callbacks = suppress;
    }

    /// Deliver the held join-success for the pending join
    pub fn complete_join(&self) -> bool {
        let (listener, events) = {
            let mut state = self.state();
            let Some((channel_id, uid)) = state.pending_join.take() else {
                return false;
            };
            let events = Self::join_events(&state, &channel_id, uid);
            state.joined = Some((channel_id, uid));
            (state.listener.clone(), events)
        };
        Self::dispatch(listener, events);
        true
    }

    fn join_events(state: &SimState, channel_id: &ChannelId, uid: Uid) -> Vec<TransportEvent> {
        let mut events = vec![TransportEvent::JoinSuccess {
            channel_id: channel_id.clone(),
            uid,
            elapsed_ms: 0,
        }];
        if let Some(peers) = state.rooms.get(channel_id) {
            events.extend(peers.iter().filter(|p| **p != uid).map(|peer| {
                TransportEvent::UserJoined {
                    uid: *peer,
                    elapsed_ms: 0,
                }
            }));
        }
        events
    }

    /// A remote peer enters `channel_id`
    pub fn add_peer(&self, channel_id: &ChannelId, uid: Uid) {
        let (listener, events) = {
            let mut state = self.state();
            let inserted = state.rooms.entry(channel_id.clone()).or_default().insert(uid);
            let visible = matches!(&state.joined, Some((joined, _)) if joined == channel_id);
            if inserted && visible {
                (
                    state.listener.clone(),
                    vec![TransportEvent::UserJoined { uid, elapsed_ms: 0 }],
                )
            } else {
                (None, Vec::new())
            }
        };
        if !events.is_empty() {
            Self::dispatch(listener, events);
        }
    }

    /// A remote peer leaves `channel_id`
    pub fn remove_peer(&self, channel_id: &ChannelId, uid: Uid, reason: OfflineReason) {
        let (listener, events) = {
            let mut state = self.state();
            let removed = state
                .rooms
                .get_mut(channel_id)
                .map(|peers| peers.remove(&uid))
                .unwrap_or(false);
            let visible = matches!(&state.joined, Some((joined, _)) if joined == channel_id);
            if removed && visible {
                (
                    state.listener.clone(),
                    vec![TransportEvent::UserOffline { uid, reason }],
                )
            } else {
                (None, Vec::new())
            }
        };
        if !events.is_empty() {
            Self::dispatch(listener, events);
        }
    }

    /// Deliver an arbitrary callback to the current listener
    pub fn emit(&self, event: TransportEvent) {
        let listener = self.state().listener.clone();
        Self::dispatch(listener, vec![event]);
    }

    pub fn current_channel(&self) -> Option<ChannelId> {
        self.state().joined.as_ref().map(|(channel_id, _)| channel_id.clone())
    }

    pub fn is_muted(&self) -> bool {
        self.state().muted
    }

    pub fn join_count(&self) -> usize {
        self.state().join_count
    }

    pub fn leave_count(&self) -> usize {
        self.state().leave_count
    }

    /// Number of `set_listener` calls so far
    pub fn listener_swaps(&self) -> usize {
        self.state().listener_swaps
    }

    pub fn listener(&self) -> Option<ListenerRef> {
        self.state().listener.clone()
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeChannelTransport for SimulatedTransport {
    fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    async fn join(
        &self,
        channel_id: &ChannelId,
        _token: &str,
        uid: Uid,
    ) -> Result<(), TransportError> {
        let (listener, events) = {
            let mut state = self.state();
            if !state.initialized {
                return Err(TransportError::NotInitialized);
            }
            if let Some(code) = state.reject_join_code {
                return Err(TransportError::Rejected { code });
            }
            if state.joined.is_some() || state.pending_join.is_some() {
                // Mirrors the vendor "already in channel" refusal
                return Err(TransportError::Rejected { code: -17 });
            }

            let uid = if uid.is_auto() {
                let assigned = Uid::new(state.next_auto_uid);
                state.next_auto_uid += 1;
                assigned
            } else {
                uid
            };
            state.join_count += 1;

            if state.hold_join_callbacks {
                state.pending_join = Some((channel_id.clone(), uid));
                return Ok(());
            }

            let events = Self::join_events(&state, channel_id, uid);
            state.joined = Some((channel_id.clone(), uid));
            (state.listener.clone(), events)
        };

        debug!(channel = %channel_id, "simulated join accepted");
        Self::dispatch(listener, events);
        Ok(())
    }

    async fn leave(&self) -> Result<(), TransportError> {
        let listener = {
            let mut state = self.state();
            if !state.initialized {
                return Err(TransportError::NotInitialized);
            }
            if state.fail_leave {
                return Err(TransportError::Failed("leave refused".to_string()));
            }
            state.leave_count += 1;
            state.pending_join = None;
            state.joined = None;
            if state.suppress_leave_callbacks {
                return Ok(());
            }
            state.listener.clone()
        };

        Self::dispatch(listener, vec![TransportEvent::Leave]);
        Ok(())
    }

    async fn mute_local(&self, muted: bool) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.initialized {
            return Err(TransportError::NotInitialized);
        }
        state.muted = muted;
        Ok(())
    }

    fn set_listener(&self, listener: Option<ListenerRef>) -> Option<ListenerRef> {
        let mut state = self.state();
        state.listener_swaps += 1;
        std::mem::replace(&mut state.listener, listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transport::MailboxListener;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn listen(transport: &SimulatedTransport) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.set_listener(Some(Arc::new(MailboxListener::new(tx, |e| e))));
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_join_reports_existing_peers() {
        let transport = SimulatedTransport::new();
        let room = ChannelId::parse("room-1").unwrap();
        transport.add_peer(&room, Uid::new(42));
        let mut rx = listen(&transport);

        transport.join(&room, "tok", Uid::AUTO).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                TransportEvent::JoinSuccess {
                    channel_id: room.clone(),
                    uid: Uid::new(FIRST_AUTO_UID),
                    elapsed_ms: 0
                },
                TransportEvent::UserJoined {
                    uid: Uid::new(42),
                    elapsed_ms: 0
                },
            ]
        );
        assert_eq!(transport.current_channel(), Some(room));
    }

    #[tokio::test]
    async fn test_second_join_rejected() {
        let transport = SimulatedTransport::new();
        let room = ChannelId::parse("room-1").unwrap();
        transport.join(&room, "tok", Uid::new(5)).await.unwrap();
        assert_eq!(
            transport.join(&room, "tok", Uid::new(5)).await,
            Err(TransportError::Rejected { code: -17 })
        );
    }

    #[tokio::test]
    async fn test_uninitialized_rejects_requests() {
        let transport = SimulatedTransport::uninitialized();
        let room = ChannelId::parse("room-1").unwrap();
        assert_eq!(
            transport.join(&room, "tok", Uid::new(5)).await,
            Err(TransportError::NotInitialized)
        );
        assert_eq!(transport.leave().await, Err(TransportError::NotInitialized));
    }

    #[tokio::test]
    async fn test_held_join_completes_later() {
        let transport = SimulatedTransport::new();
        transport.hold_join_callbacks(true);
        let room = ChannelId::parse("room-1").unwrap();
        let mut rx = listen(&transport);

        transport.join(&room, "tok", Uid::new(5)).await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert!(transport.complete_join());
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(!transport.complete_join());
    }

    #[tokio::test]
    async fn test_peer_churn_only_visible_when_joined() {
        let transport = SimulatedTransport::new();
        let room = ChannelId::parse("room-1").unwrap();
        let mut rx = listen(&transport);

        transport.add_peer(&room, Uid::new(1));
        assert!(drain(&mut rx).is_empty());

        transport.join(&room, "tok", Uid::new(5)).await.unwrap();
        drain(&mut rx);
        transport.remove_peer(&room, Uid::new(1), OfflineReason::Quit);
        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::UserOffline {
                uid: Uid::new(1),
                reason: OfflineReason::Quit
            }]
        );
    }

    #[tokio::test]
    async fn test_set_listener_returns_previous() {
        let transport = SimulatedTransport::new();
        let _rx = listen(&transport);
        let previous = transport.set_listener(None);
        assert!(previous.is_some());
        assert!(transport.listener().is_none());
        assert_eq!(transport.listener_swaps(), 2);
    }
}
