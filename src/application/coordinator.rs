//! Call lifecycle coordinator
//!
//! A single actor owns the transport connection, the persisted session and
//! the presence tracker. Commands from the UI, transport callbacks and timer
//! expiries all arrive as messages on one mailbox and are handled one at a
//! time against the current state, so callbacks racing across threads never
//! interleave.
//!
//! States: `Idle -> Incoming -> Joining -> Active -> Ending -> Idle`.

use crate::application::callbacks::CallUiCallbacks;
use crate::application::metrics;
use crate::config::PresenceConfig;
use crate::domain::call::aggregate::CallSession;
use crate::domain::call::event::{CallEvent, RecoveryOutcome};
use crate::domain::call::store::CallStateStore;
use crate::domain::call::value_object::{CoordinatorState, LeaveReason, SessionState};
use crate::domain::occupancy::{OccupancyDecisionEngine, OccupancyOutcome};
use crate::domain::presence::{PresenceEvent, PresenceTracker};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{ChannelId, Uid};
use crate::domain::transport::{
    same_listener, ListenerRef, MailboxListener, OfflineReason, RealtimeChannelTransport,
    TransportEvent,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Out-of-band call signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub channel_id: ChannelId,
    pub token: String,
    pub local_uid: Uid,
    pub caller_display_name: String,
    pub caller_photo_url: Option<String>,
}

impl IncomingCall {
    fn into_session(self) -> CallSession {
        CallSession::incoming(
            self.channel_id,
            self.token,
            self.local_uid,
            self.caller_display_name,
            self.caller_photo_url,
        )
    }
}

/// Result of a hang-up request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Nothing to hang up
    NotInCall,
    /// An unanswered incoming call was dropped
    Declined,
    /// Leave requested; `Idle` follows on the transport's leave callback
    Leaving,
    /// Leave could not be requested; local state was reset anyway
    ForcedIdle,
}

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub state: CoordinatorState,
    pub channel_id: Option<ChannelId>,
    pub participants: usize,
    pub muted: bool,
    /// Call UI has been surfaced for this session
    pub call_visible: bool,
    pub duration: Duration,
}

enum Command {
    Incoming(IncomingCall, oneshot::Sender<bool>),
    Accept(oneshot::Sender<bool>),
    JoinChannel(IncomingCall, oneshot::Sender<bool>),
    Decline(oneshot::Sender<bool>),
    HangUp(oneshot::Sender<LeaveOutcome>),
    SetMuted(bool, oneshot::Sender<bool>),
    Resume {
        corroborated: bool,
        reply: oneshot::Sender<RecoveryOutcome>,
    },
    Snapshot(oneshot::Sender<Option<CallSnapshot>>),
    Shutdown(oneshot::Sender<()>),
}

enum Message {
    Command(Command),
    Transport(TransportEvent),
    DiscoveryElapsed { timer: u64 },
    LeaveTimedOut { timer: u64 },
}

/// Handle to the coordinator actor
///
/// Cheap to clone. No method returns an error: every failure is absorbed,
/// logged, and resolved to a safe state.
#[derive(Clone)]
pub struct CallLifecycleCoordinator {
    tx: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<CallEvent>,
}

impl CallLifecycleCoordinator {
    /// Start the actor and register it as the transport's listener
    pub fn spawn(
        transport: Arc<dyn RealtimeChannelTransport>,
        store: CallStateStore,
        callbacks: Arc<dyn CallUiCallbacks>,
        config: &PresenceConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let listener: ListenerRef = Arc::new(MailboxListener::new(tx.clone(), Message::Transport));
        if transport.set_listener(Some(listener.clone())).is_some() {
            warn!("replaced an existing transport listener");
        }

        let engine = Arc::new(OccupancyDecisionEngine::new(
            transport.clone(),
            config.into(),
        ));

        let actor = CoordinatorActor {
            transport,
            store,
            tracker: PresenceTracker::new(),
            engine,
            callbacks,
            events: events.clone(),
            mailbox: tx.clone(),
            listener,
            leave_timeout: config.leave_timeout(),
            state: CoordinatorState::Idle,
            session: None,
            muted: false,
            call_visible: false,
            join_started: None,
            next_timer: 0,
            discovery_timer: None,
            leave_timer: None,
        };
        tokio::spawn(actor.run(rx));

        Self { tx, events }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command, fallback: T) -> T {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::Command(build(reply))).is_err() {
            warn!("coordinator is not running");
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }

    /// Record a call signal. Refused unless idle.
    pub async fn incoming_call(&self, call: IncomingCall) -> bool {
        self.request(|reply| Command::Incoming(call, reply), false).await
    }

    /// Accept the pending incoming call and join its channel
    pub async fn accept(&self) -> bool {
        self.request(Command::Accept, false).await
    }

    /// Join a channel directly from idle
    pub async fn join_channel(&self, call: IncomingCall) -> bool {
        self.request(|reply| Command::JoinChannel(call, reply), false)
            .await
    }

    /// Drop the pending incoming call
    pub async fn decline(&self) -> bool {
        self.request(Command::Decline, false).await
    }

    /// Leave the current call. Idempotent when idle.
    pub async fn hang_up(&self) -> LeaveOutcome {
        self.request(Command::HangUp, LeaveOutcome::NotInCall).await
    }

    pub async fn set_muted(&self, muted: bool) -> bool {
        self.request(|reply| Command::SetMuted(muted, reply), false)
            .await
    }

    /// Recover a call that was live when the process died
    ///
    /// `corroborated` tells whether some other live signal confirms the
    /// call is still running.
    pub async fn resume_from_background(&self, corroborated: bool) -> RecoveryOutcome {
        self.request(
            |reply| Command::Resume {
                corroborated,
                reply,
            },
            RecoveryOutcome::NothingToRecover,
        )
        .await
    }

    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        self.request(Command::Snapshot, None).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Leave any live channel, detach from the transport and stop the actor
    pub async fn shutdown(&self) {
        self.request(Command::Shutdown, ()).await
    }
}

struct Timer {
    id: u64,
    cancel: CancellationToken,
}

struct CoordinatorActor {
    transport: Arc<dyn RealtimeChannelTransport>,
    store: CallStateStore,
    tracker: PresenceTracker,
    engine: Arc<OccupancyDecisionEngine>,
    callbacks: Arc<dyn CallUiCallbacks>,
    events: broadcast::Sender<CallEvent>,
    mailbox: mpsc::UnboundedSender<Message>,
    listener: ListenerRef,
    leave_timeout: Duration,

    state: CoordinatorState,
    session: Option<CallSession>,
    muted: bool,
    call_visible: bool,
    join_started: Option<Instant>,
    next_timer: u64,
    discovery_timer: Option<Timer>,
    leave_timer: Option<Timer>,
}

impl CoordinatorActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        info!("call lifecycle coordinator started");

        while let Some(message) = rx.recv().await {
            match message {
                Message::Command(Command::Shutdown(reply)) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Message::Command(command) => self.handle_command(command).await,
                Message::Transport(event) => self.handle_transport(event).await,
                Message::DiscoveryElapsed { timer } => self.on_discovery_elapsed(timer).await,
                Message::LeaveTimedOut { timer } => self.on_leave_timed_out(timer),
            }
        }

        info!("call lifecycle coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Incoming(call, reply) => {
                let _ = reply.send(self.on_incoming(call));
            }
            Command::Accept(reply) => {
                let accepted = if self.state == CoordinatorState::Incoming {
                    self.start_join().await
                } else {
                    warn!(state = %self.state, "accept ignored, no incoming call");
                    false
                };
                let _ = reply.send(accepted);
            }
            Command::JoinChannel(call, reply) => {
                let joined = self.on_incoming(call) && self.start_join().await;
                let _ = reply.send(joined);
            }
            Command::Decline(reply) => {
                let declined = self.state == CoordinatorState::Incoming;
                if declined {
                    info!("incoming call declined");
                    self.reset_to_idle();
                }
                let _ = reply.send(declined);
            }
            Command::HangUp(reply) => {
                let outcome = self.hang_up().await;
                let _ = reply.send(outcome);
            }
            Command::SetMuted(muted, reply) => {
                let _ = reply.send(self.set_muted(muted).await);
            }
            Command::Resume {
                corroborated,
                reply,
            } => {
                let outcome = self.resume(corroborated).await;
                let _ = reply.send(outcome);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Some(self.snapshot()));
            }
            Command::Shutdown(reply) => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        debug!(event = event.name(), state = %self.state, "transport callback");
        match event {
            TransportEvent::JoinSuccess { channel_id, uid, elapsed_ms } => {
                self.on_join_success(channel_id, uid, elapsed_ms)
            }
            TransportEvent::Leave => self.on_leave(),
            TransportEvent::UserJoined { uid, .. } => self.on_user_joined(uid),
            TransportEvent::UserOffline { uid, reason } => self.on_user_offline(uid, reason).await,
            TransportEvent::Error { code } => self.on_transport_error(code).await,
        }
    }

    fn channel_id(&self) -> Option<ChannelId> {
        self.session.as_ref().map(|s| s.channel_id().clone())
    }

    fn transition(&mut self, to: CoordinatorState) {
        let from = self.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(%from, %to, "unexpected coordinator transition");
        }
        self.state = to;
        info!(%from, %to, channel = ?self.channel_id(), "coordinator state changed");
        let _ = self
            .events
            .send(CallEvent::state_changed(self.channel_id(), from, to));
    }

    fn next_timer_id(&mut self) -> u64 {
        self.next_timer += 1;
        self.next_timer
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.discovery_timer.take() {
            timer.cancel.cancel();
        }
        if let Some(timer) = self.leave_timer.take() {
            timer.cancel.cancel();
        }
    }

    fn arm_discovery(&mut self, join_started: Instant) {
        if let Some(previous) = self.discovery_timer.take() {
            previous.cancel.cancel();
        }
        let id = self.next_timer_id();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = self.engine.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            if engine.wait_for_discovery(join_started, &token).await {
                let _ = mailbox.send(Message::DiscoveryElapsed { timer: id });
            }
        });
        self.discovery_timer = Some(Timer { id, cancel });
    }

    fn arm_leave_timeout(&mut self) {
        if let Some(previous) = self.leave_timer.take() {
            previous.cancel.cancel();
        }
        let id = self.next_timer_id();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let deadline = Instant::now() + self.leave_timeout;
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep_until(deadline) => {
                    let _ = mailbox.send(Message::LeaveTimedOut { timer: id });
                }
            }
        });
        self.leave_timer = Some(Timer { id, cancel });
    }

    /// Drop everything about the current call and return to `Idle`
    fn reset_to_idle(&mut self) {
        self.cancel_timers();
        self.tracker.on_leave();
        metrics::set_participants(0);
        self.store.clear();
        self.transition(CoordinatorState::Idle);
        self.session = None;
        self.call_visible = false;
        self.join_started = None;
    }

    fn on_incoming(&mut self, call: IncomingCall) -> bool {
        if self.state != CoordinatorState::Idle {
            warn!(state = %self.state, channel = %call.channel_id, "call signal refused, coordinator busy");
            return false;
        }

        let session = call.into_session();
        if let Err(e) = self.store.save_incoming(&session) {
            warn!(channel = %session.channel_id(), error = %e, "failed to persist incoming call");
        }
        self.session = Some(session);
        self.call_visible = false;
        self.transition(CoordinatorState::Incoming);
        true
    }

    async fn start_join(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            warn!("join requested without a session");
            return false;
        };
        if let Err(e) = session.transition_to(SessionState::Joining) {
            warn!(error = %e, "session not joinable");
            return false;
        }
        let channel_id = session.channel_id().clone();
        let token = session.token().to_string();
        let uid = session.local_uid();

        self.store.mark_joining();
        self.transition(CoordinatorState::Joining);
        self.join_started = Some(Instant::now());

        match self.transport.join(&channel_id, &token, uid).await {
            Ok(()) => {
                info!(channel = %channel_id, uid = %uid, "join requested");
                true
            }
            Err(e) => {
                let error = DomainError::from(e);
                warn!(channel = %channel_id, %error, "join rejected");
                metrics::record_transport_failure("join");
                self.reset_to_idle();
                false
            }
        }
    }

    async fn hang_up(&mut self) -> LeaveOutcome {
        match self.state {
            CoordinatorState::Idle => {
                debug!("hang up while idle");
                LeaveOutcome::NotInCall
            }
            CoordinatorState::Incoming => {
                self.reset_to_idle();
                LeaveOutcome::Declined
            }
            CoordinatorState::Ending => LeaveOutcome::Leaving,
            CoordinatorState::Joining | CoordinatorState::Active => {
                self.leave(LeaveReason::LocalHangUp).await
            }
        }
    }

    /// Move to `Ending` and ask the transport to leave
    async fn leave(&mut self, reason: LeaveReason) -> LeaveOutcome {
        if let Some(timer) = self.discovery_timer.take() {
            timer.cancel.cancel();
        }
        if let Some(session) = self.session.as_mut() {
            let _ = session.transition_to(SessionState::Ending);
        }
        self.store.mark_ending();
        self.transition(CoordinatorState::Ending);

        if reason.is_automatic() {
            metrics::record_auto_leave(reason);
            if let Some(channel_id) = self.channel_id() {
                info!(channel = %channel_id, reason = reason.as_str(), "leaving channel automatically");
                let _ = self.events.send(CallEvent::auto_left(channel_id, reason));
            }
        }

        match self.transport.leave().await {
            Ok(()) => {
                self.arm_leave_timeout();
                LeaveOutcome::Leaving
            }
            Err(e) => {
                let error = DomainError::from(e);
                warn!(%error, reason = reason.as_str(), "leave failed, forcing idle");
                metrics::record_transport_failure("leave");
                self.reset_to_idle();
                LeaveOutcome::ForcedIdle
            }
        }
    }

    async fn set_muted(&mut self, muted: bool) -> bool {
        match self.transport.mute_local(muted).await {
            Ok(()) => {
                self.muted = muted;
                true
            }
            Err(e) => {
                let error = DomainError::from(e);
                warn!(muted, %error, "mute request failed");
                metrics::record_transport_failure("mute");
                false
            }
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            channel_id: self.channel_id(),
            participants: self.tracker.count(),
            muted: self.muted,
            call_visible: self.call_visible,
            duration: self
                .session
                .as_ref()
                .map(|s| s.duration_at(Utc::now()))
                .unwrap_or(Duration::ZERO),
        }
    }

    fn on_join_success(&mut self, channel_id: ChannelId, uid: Uid, elapsed_ms: u64) {
        match self.state {
            CoordinatorState::Joining => {}
            CoordinatorState::Active => {
                warn!(channel = %channel_id, "duplicate join success ignored");
                return;
            }
            other => {
                warn!(state = %other, channel = %channel_id, "join success outside of joining ignored");
                return;
            }
        }
        if self.channel_id().as_ref() != Some(&channel_id) {
            warn!(channel = %channel_id, expected = ?self.channel_id(), "join success for another channel ignored");
            return;
        }

        self.tracker.on_join_success(&channel_id, uid);
        metrics::set_participants(0);
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.activate(uid) {
                warn!(error = %e, "session activation out of order");
            }
        }
        self.store.mark_active(uid);
        info!(channel = %channel_id, uid = %uid, elapsed_ms, "joined channel");
        self.transition(CoordinatorState::Active);

        let join_started = self.join_started.unwrap_or_else(Instant::now);
        self.arm_discovery(join_started);
    }

    async fn on_discovery_elapsed(&mut self, timer: u64) {
        if self.discovery_timer.as_ref().map(|t| t.id) != Some(timer) {
            debug!(timer, "stale discovery check dropped");
            return;
        }
        self.discovery_timer = None;
        if self.state != CoordinatorState::Active {
            return;
        }
        let Some(channel_id) = self.channel_id() else {
            return;
        };

        let outcome = self.engine.evaluate(&channel_id, &self.tracker);
        metrics::record_occupancy(&outcome);
        info!(channel = %channel_id, ?outcome, "occupancy decided");
        let _ = self
            .events
            .send(CallEvent::occupancy_decided(channel_id, outcome));

        match outcome {
            OccupancyOutcome::Empty => {
                self.callbacks.on_channel_empty();
                self.leave(LeaveReason::EmptyAfterDiscovery).await;
            }
            OccupancyOutcome::Occupied(count) => {
                if !self.call_visible {
                    self.call_visible = true;
                    if let Some(session) = self.session.as_ref() {
                        self.callbacks.on_call_found(
                            session.caller_display_name(),
                            session.caller_photo_url(),
                            self.muted,
                        );
                    }
                }
                self.callbacks.on_channel_occupied(count);
            }
        }
    }

    fn on_leave(&mut self) {
        match self.state {
            CoordinatorState::Idle => {
                debug!("leave callback while idle ignored");
            }
            CoordinatorState::Ending => {
                info!(channel = ?self.channel_id(), "left channel");
                self.reset_to_idle();
            }
            other => {
                warn!(state = %other, channel = ?self.channel_id(), "transport left the channel unexpectedly");
                if self.call_visible {
                    self.callbacks.on_channel_empty();
                }
                self.reset_to_idle();
            }
        }
    }

    fn on_user_joined(&mut self, uid: Uid) {
        if !self.state.in_channel() {
            debug!(uid = %uid, state = %self.state, "user joined outside a call ignored");
            return;
        }
        if self.tracker.on_user_joined(uid) {
            let count = self.tracker.count();
            metrics::set_participants(count);
            if self.call_visible {
                self.callbacks.on_channel_occupied(count);
            }
        }
    }

    async fn on_user_offline(&mut self, uid: Uid, reason: OfflineReason) {
        let event = self.tracker.on_user_left(uid, reason);
        let count = self.tracker.count();
        metrics::set_participants(count);

        match event {
            Some(PresenceEvent::ChannelBecameEmpty { channel_id }) => {
                if self.state != CoordinatorState::Active {
                    return;
                }
                // First empty signal wins; a pending discovery check is dropped
                info!(channel = %channel_id, "last participant left");
                self.callbacks.on_channel_empty();
                self.leave(LeaveReason::LastPeerLeft).await;
            }
            None => {
                if self.call_visible && count > 0 {
                    self.callbacks.on_channel_occupied(count);
                }
            }
        }
    }

    async fn on_transport_error(&mut self, code: i32) {
        metrics::record_transport_failure("callback");
        match self.state {
            CoordinatorState::Joining => {
                warn!(code, channel = ?self.channel_id(), "join failed");
                if let Err(e) = self.transport.leave().await {
                    let error = DomainError::from(e);
                    debug!(%error, "leave after failed join");
                }
                self.reset_to_idle();
            }
            CoordinatorState::Active => {
                warn!(code, channel = ?self.channel_id(), "transport error during call");
                if self.call_visible {
                    self.callbacks.on_channel_empty();
                }
                self.leave(LeaveReason::TransportError).await;
            }
            other => {
                warn!(code, state = %other, "transport error ignored");
            }
        }
    }

    fn on_leave_timed_out(&mut self, timer: u64) {
        if self.leave_timer.as_ref().map(|t| t.id) != Some(timer) {
            return;
        }
        self.leave_timer = None;
        if self.state == CoordinatorState::Ending {
            warn!(channel = ?self.channel_id(), "leave callback never arrived, forcing idle");
            self.reset_to_idle();
        }
    }

    async fn resume(&mut self, corroborated: bool) -> RecoveryOutcome {
        if self.state != CoordinatorState::Idle {
            debug!(state = %self.state, "resume while busy");
            return RecoveryOutcome::Busy;
        }

        let Some(persisted) = self.store.current() else {
            // Drop any fields left behind by a partial write
            self.store.clear();
            return self.resolve_recovery(None, RecoveryOutcome::NothingToRecover);
        };
        let channel_id = persisted.channel_id().clone();

        if !persisted.state().is_live() {
            info!(channel = %channel_id, state = %persisted.state(), "discarding persisted call that was not live");
            self.store.clear();
            return self.resolve_recovery(Some(channel_id), RecoveryOutcome::NothingToRecover);
        }

        // Fresh session for the rejoin, carrying the persisted details
        let session = CallSession::incoming(
            channel_id.clone(),
            persisted.token().to_string(),
            persisted.local_uid(),
            persisted.caller_display_name().to_string(),
            persisted.caller_photo_url().map(str::to_string),
        );

        if corroborated {
            info!(channel = %channel_id, "resuming corroborated call");
            self.persist_rejoin(&session);
            self.call_visible = true;
            self.callbacks.on_call_found(
                session.caller_display_name(),
                session.caller_photo_url(),
                self.muted,
            );
            self.session = Some(session);
            let outcome = if self.start_join().await {
                RecoveryOutcome::Resumed
            } else {
                self.callbacks.on_channel_empty();
                RecoveryOutcome::Discarded
            };
            return self.resolve_recovery(Some(channel_id), outcome);
        }

        info!(channel = %channel_id, "probing persisted channel");
        let (outcome, exit) = self
            .engine
            .check_occupancy_with_quick_join(&channel_id, session.token(), session.local_uid())
            .await;
        metrics::record_probe(&outcome, exit);

        let recovery = match outcome {
            OccupancyOutcome::Occupied(count) => {
                info!(channel = %channel_id, count, "probe found participants, rejoining");
                self.persist_rejoin(&session);
                self.session = Some(session);
                if self.start_join().await {
                    RecoveryOutcome::Resumed
                } else {
                    self.callbacks.on_channel_empty();
                    RecoveryOutcome::Discarded
                }
            }
            OccupancyOutcome::Empty => {
                let error = DomainError::StaleChannelData(format!(
                    "no participants confirmed in {} ({:?})",
                    channel_id, exit
                ));
                warn!(channel = %channel_id, %error, "persisted call discarded");
                self.store.clear();
                self.callbacks.on_channel_empty();
                RecoveryOutcome::Discarded
            }
        };
        self.resolve_recovery(Some(channel_id), recovery)
    }

    /// Restart the persisted record at `Incoming` so the rejoin only moves it forward
    fn persist_rejoin(&self, session: &CallSession) {
        if let Err(error) = self.store.save_incoming(session) {
            warn!(channel = %session.channel_id(), %error, "failed to persist rejoin");
        }
    }

    fn resolve_recovery(
        &self,
        channel_id: Option<ChannelId>,
        outcome: RecoveryOutcome,
    ) -> RecoveryOutcome {
        let _ = self
            .events
            .send(CallEvent::recovery_resolved(channel_id, outcome));
        outcome
    }

    async fn shutdown(&mut self) {
        if matches!(
            self.state,
            CoordinatorState::Joining | CoordinatorState::Active | CoordinatorState::Ending
        ) {
            info!(channel = ?self.channel_id(), reason = LeaveReason::Shutdown.as_str(), "leaving on shutdown");
            if let Err(e) = self.transport.leave().await {
                let error = DomainError::from(e);
                warn!(%error, "leave on shutdown failed");
            }
        }
        if self.state != CoordinatorState::Idle {
            self.reset_to_idle();
        }

        let current = self.transport.set_listener(None);
        if let Some(other) = current.filter(|l| !same_listener(l, &self.listener)) {
            // Someone else owns the transport now; leave them registered
            self.transport.set_listener(Some(other));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::callbacks::LoggingCallbacks;
    use crate::domain::call::repository::{KeyValueStore, StoredValue};
    use crate::domain::shared::result::Result;
    use crate::infrastructure::persistence::MemoryKeyValueStore;
    use crate::infrastructure::transport::SimulatedTransport;
    use std::sync::Mutex;

    /// Memory store that remembers every state written
    #[derive(Default)]
    struct StateLog {
        inner: MemoryKeyValueStore,
        states: Mutex<Vec<String>>,
    }

    impl StateLog {
        fn states(&self) -> Vec<String> {
            self.states.lock().unwrap().clone()
        }
    }

    impl KeyValueStore for StateLog {
        fn get(&self, key: &str) -> Result<Option<StoredValue>> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: StoredValue) -> Result<()> {
            if let (StoredValue::String(state), "call.state") = (&value, key) {
                self.states.lock().unwrap().push(state.clone());
            }
            self.inner.put(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }

        fn apply(&self) -> Result<()> {
            self.inner.apply()
        }
    }

    fn spawn(transport: Arc<SimulatedTransport>) -> CallLifecycleCoordinator {
        CallLifecycleCoordinator::spawn(
            transport,
            CallStateStore::new(Arc::new(MemoryKeyValueStore::new())),
            Arc::new(LoggingCallbacks),
            &PresenceConfig::default(),
        )
    }

    fn call(channel: &str, uid: u32) -> IncomingCall {
        IncomingCall {
            channel_id: ChannelId::parse(channel).unwrap(),
            token: "tok".to_string(),
            local_uid: Uid::new(uid),
            caller_display_name: "Alice".to_string(),
            caller_photo_url: None,
        }
    }

    #[tokio::test]
    async fn test_spawn_registers_listener() {
        let transport = Arc::new(SimulatedTransport::new());
        let _coordinator = spawn(transport.clone());
        assert!(transport.listener().is_some());
    }

    #[tokio::test]
    async fn test_second_signal_refused_while_busy() {
        let transport = Arc::new(SimulatedTransport::new());
        let coordinator = spawn(transport);
        assert!(coordinator.incoming_call(call("room-1", 5)).await);
        assert!(!coordinator.incoming_call(call("room-2", 5)).await);

        let snapshot = coordinator.snapshot().await.unwrap();
        assert_eq!(snapshot.state, CoordinatorState::Incoming);
        assert_eq!(snapshot.channel_id, Some(ChannelId::parse("room-1").unwrap()));
    }

    #[tokio::test]
    async fn test_accept_without_incoming_fails() {
        let transport = Arc::new(SimulatedTransport::new());
        let coordinator = spawn(transport.clone());
        assert!(!coordinator.accept().await);
        assert_eq!(transport.join_count(), 0);
    }

    #[tokio::test]
    async fn test_decline_returns_to_idle() {
        let transport = Arc::new(SimulatedTransport::new());
        let coordinator = spawn(transport);
        coordinator.incoming_call(call("room-1", 5)).await;
        assert!(coordinator.decline().await);
        assert!(!coordinator.decline().await);
        assert_eq!(
            coordinator.snapshot().await.unwrap().state,
            CoordinatorState::Idle
        );
    }

    #[tokio::test]
    async fn test_hang_up_idle_is_stable() {
        let transport = Arc::new(SimulatedTransport::new());
        let coordinator = spawn(transport.clone());
        assert_eq!(coordinator.hang_up().await, LeaveOutcome::NotInCall);
        assert_eq!(coordinator.hang_up().await, LeaveOutcome::NotInCall);
        assert_eq!(transport.leave_count(), 0);
    }

    #[tokio::test]
    async fn test_mute_tracks_transport() {
        let transport = Arc::new(SimulatedTransport::new());
        let coordinator = spawn(transport.clone());
        assert!(coordinator.set_muted(true).await);
        assert!(transport.is_muted());
        assert!(coordinator.snapshot().await.unwrap().muted);

        transport.set_initialized(false);
        assert!(!coordinator.set_muted(false).await);
        assert!(coordinator.snapshot().await.unwrap().muted);
    }

    #[tokio::test]
    async fn test_shutdown_detaches_and_stops() {
        let transport = Arc::new(SimulatedTransport::new());
        let coordinator = spawn(transport.clone());
        coordinator.shutdown().await;

        assert!(transport.listener().is_none());
        assert_eq!(coordinator.hang_up().await, LeaveOutcome::NotInCall);
        assert!(coordinator.snapshot().await.is_none());
    }
    #[tokio::test]
    async fn test_rejoin_moves_persisted_state_forward() {
        let kv = Arc::new(StateLog::default());
        let store = CallStateStore::new(kv.clone());
        store
            .save_incoming(&CallSession::incoming(
                ChannelId::parse("room-5").unwrap(),
                "tok".to_string(),
                Uid::new(6),
                "Alice".to_string(),
                None,
            ))
            .unwrap();
        store.mark_joining();
        store.mark_active(Uid::new(6));
        let before = kv.states().len();

        let transport = Arc::new(SimulatedTransport::new());
        let coordinator = CallLifecycleCoordinator::spawn(
            transport,
            CallStateStore::new(kv.clone()),
            Arc::new(LoggingCallbacks),
            &PresenceConfig::default(),
        );
        assert_eq!(
            coordinator.resume_from_background(true).await,
            RecoveryOutcome::Resumed
        );
        // Queued behind the join-success callback
        coordinator.snapshot().await;

        assert_eq!(
            kv.states()[before..].to_vec(),
            vec!["incoming", "joining", "active"]
        );
    }

    #[tokio::test]
    async fn test_resume_clears_partial_record() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let store = CallStateStore::new(kv.clone());
        // Auto uid never confirmed by a join leaves the record incomplete
        store
            .save_incoming(&CallSession::incoming(
                ChannelId::parse("room-6").unwrap(),
                "tok".to_string(),
                Uid::AUTO,
                "Alice".to_string(),
                None,
            ))
            .unwrap();
        assert!(store.current().is_none());
        assert!(!kv.is_empty());

        let transport = Arc::new(SimulatedTransport::new());
        let coordinator = CallLifecycleCoordinator::spawn(
            transport.clone(),
            CallStateStore::new(kv.clone()),
            Arc::new(LoggingCallbacks),
            &PresenceConfig::default(),
        );
        assert_eq!(
            coordinator.resume_from_background(false).await,
            RecoveryOutcome::NothingToRecover
        );
        assert!(kv.is_empty());
        assert_eq!(transport.join_count(), 0);
    }
}
