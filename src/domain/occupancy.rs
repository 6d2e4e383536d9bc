//! Occupancy decisions
//!
//! Peers that joined slightly before us are not reported instantly, so the
//! occupied-vs-empty decision waits out a bounded discovery window. Anything
//! ambiguous (transport down, not joined, probe failure) resolves to
//! [`OccupancyOutcome::Empty`].

use crate::domain::presence::PresenceTracker;
use crate::domain::shared::value_objects::{ChannelId, Uid};
use crate::domain::transport::{
    ListenerRef, MailboxListener, RealtimeChannelTransport, TransportEvent,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of an occupancy check, consumed once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "count", rename_all = "lowercase")]
pub enum OccupancyOutcome {
    Occupied(usize),
    Empty,
}

impl OccupancyOutcome {
    pub fn from_count(count: usize) -> Self {
        if count > 0 {
            OccupancyOutcome::Occupied(count)
        } else {
            OccupancyOutcome::Empty
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OccupancyOutcome::Occupied(_) => "occupied",
            OccupancyOutcome::Empty => "empty",
        }
    }
}

/// Timing for occupancy checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyConfig {
    /// Window after join initiation before the first decision
    pub discovery_delay: Duration,
    /// Shorter window used by probe joins
    pub probe_discovery_delay: Duration,
    /// Bound on waiting for probe join/leave callbacks
    pub probe_join_timeout: Duration,
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self {
            discovery_delay: Duration::from_millis(800),
            probe_discovery_delay: Duration::from_millis(500),
            probe_join_timeout: Duration::from_secs(5),
        }
    }
}

/// How a probe join finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeExit {
    /// Transport confirmed the probe left
    Leave,
    /// Transport reported an error
    Error,
    /// The join request itself was refused
    JoinRejected,
    /// The leave request after probing was refused
    LeaveFailed,
    /// A callback never arrived
    Timeout,
    /// The probe future was dropped mid-flight
    Abandoned,
}

/// Temporarily installed transport listener
///
/// Holds whatever listener was registered before and puts it back exactly
/// once: on [`ListenerGuard::restore`] or, failing that, on drop.
pub struct ListenerGuard<'a> {
    transport: &'a dyn RealtimeChannelTransport,
    previous: Option<Option<ListenerRef>>,
}

impl<'a> ListenerGuard<'a> {
    pub fn install(transport: &'a dyn RealtimeChannelTransport, interceptor: ListenerRef) -> Self {
        let previous = transport.set_listener(Some(interceptor));
        debug!(had_listener = previous.is_some(), "probe listener installed");
        Self {
            transport,
            previous: Some(previous),
        }
    }

    pub fn restore(mut self, exit: ProbeExit) {
        self.release(exit);
    }

    fn release(&mut self, exit: ProbeExit) {
        if let Some(previous) = self.previous.take() {
            self.transport.set_listener(previous);
            debug!(?exit, "original listener restored");
        }
    }
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.release(ProbeExit::Abandoned);
    }
}

pub struct OccupancyDecisionEngine {
    transport: Arc<dyn RealtimeChannelTransport>,
    config: OccupancyConfig,
}

impl OccupancyDecisionEngine {
    pub fn new(transport: Arc<dyn RealtimeChannelTransport>, config: OccupancyConfig) -> Self {
        Self { transport, config }
    }

    /// Decide from the tracker's current view
    pub fn evaluate(&self, channel_id: &ChannelId, tracker: &PresenceTracker) -> OccupancyOutcome {
        if !self.transport.is_initialized() {
            debug!(channel = %channel_id, "transport unavailable, treating channel as empty");
            return OccupancyOutcome::Empty;
        }
        if !tracker.is_joined_to(channel_id) {
            debug!(channel = %channel_id, "not joined, treating channel as empty");
            return OccupancyOutcome::Empty;
        }
        OccupancyOutcome::from_count(tracker.count())
    }

    /// Deadline of the discovery window for a join started at `join_started`
    pub fn discovery_deadline(&self, join_started: Instant) -> Instant {
        join_started + self.config.discovery_delay
    }

    /// Sleep until the discovery window closes. Returns `false` if cancelled first.
    pub async fn wait_for_discovery(&self, join_started: Instant, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep_until(self.discovery_deadline(join_started)) => true,
        }
    }

    /// Decide once the discovery window that began at `join_started` closes
    ///
    /// Returns `None` when cancelled before the window closed.
    pub async fn check_occupancy_after_discovery(
        &self,
        channel_id: &ChannelId,
        tracker: &PresenceTracker,
        join_started: Instant,
        cancel: &CancellationToken,
    ) -> Option<OccupancyOutcome> {
        if !self.wait_for_discovery(join_started, cancel).await {
            debug!(channel = %channel_id, "discovery check cancelled");
            return None;
        }
        let outcome = self.evaluate(channel_id, tracker);
        info!(channel = %channel_id, ?outcome, "discovery window closed");
        Some(outcome)
    }

    /// Join, count, and leave again to verify a channel is still live
    ///
    /// Used when resuming with persisted call data that nothing else
    /// corroborates. The currently registered listener is swapped out for
    /// the duration of the probe and restored on every exit path.
    pub async fn check_occupancy_with_quick_join(
        &self,
        channel_id: &ChannelId,
        token: &str,
        uid: Uid,
    ) -> (OccupancyOutcome, ProbeExit) {
        if !self.transport.is_initialized() {
            warn!(channel = %channel_id, "probe skipped, transport unavailable");
            return (OccupancyOutcome::Empty, ProbeExit::JoinRejected);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let interceptor: ListenerRef = Arc::new(MailboxListener::new(tx, |event| event));
        let guard = ListenerGuard::install(self.transport.as_ref(), interceptor);

        let (outcome, exit) = self.run_probe(channel_id, token, uid, &mut rx).await;
        guard.restore(exit);

        info!(channel = %channel_id, ?outcome, ?exit, "probe join finished");
        (outcome, exit)
    }

    async fn run_probe(
        &self,
        channel_id: &ChannelId,
        token: &str,
        uid: Uid,
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (OccupancyOutcome, ProbeExit) {
        if let Err(e) = self.transport.join(channel_id, token, uid).await {
            warn!(channel = %channel_id, error = %e, "probe join rejected");
            return (OccupancyOutcome::Empty, ProbeExit::JoinRejected);
        }

        let tracker = PresenceTracker::new();

        // Join confirmation
        let deadline = Instant::now() + self.config.probe_join_timeout;
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(TransportEvent::JoinSuccess {
                    channel_id: joined,
                    uid: local,
                    ..
                })) => {
                    tracker.on_join_success(&joined, local);
                    break;
                }
                Ok(Some(TransportEvent::Error { code })) => {
                    warn!(channel = %channel_id, code, "probe join failed");
                    self.leave_quietly().await;
                    return (OccupancyOutcome::Empty, ProbeExit::Error);
                }
                Ok(Some(TransportEvent::Leave)) => {
                    return (OccupancyOutcome::Empty, ProbeExit::Leave);
                }
                Ok(Some(other)) => {
                    debug!(event = other.name(), "probe ignoring event before join");
                }
                Ok(None) | Err(_) => {
                    warn!(channel = %channel_id, "probe join never confirmed");
                    self.leave_quietly().await;
                    return (OccupancyOutcome::Empty, ProbeExit::Timeout);
                }
            }
        }

        // Discovery window
        let deadline = Instant::now() + self.config.probe_discovery_delay;
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(TransportEvent::UserJoined { uid, .. })) => {
                    tracker.on_user_joined(uid);
                }
                Ok(Some(TransportEvent::UserOffline { uid, reason })) => {
                    tracker.on_user_left(uid, reason);
                }
                Ok(Some(TransportEvent::Error { code })) => {
                    warn!(channel = %channel_id, code, "transport error during probe");
                    self.leave_quietly().await;
                    return (OccupancyOutcome::Empty, ProbeExit::Error);
                }
                Ok(Some(TransportEvent::Leave)) => {
                    return (OccupancyOutcome::Empty, ProbeExit::Leave);
                }
                Ok(Some(TransportEvent::JoinSuccess { .. })) => {
                    debug!("duplicate join success during probe");
                }
            }
        }

        let outcome = self.evaluate(channel_id, &tracker);

        // Always leave: this was never a real join. The count only stands
        // once the transport confirms it is out of the channel again.
        if let Err(e) = self.transport.leave().await {
            warn!(channel = %channel_id, error = %e, ?outcome, "probe leave rejected, discarding count");
            return (OccupancyOutcome::Empty, ProbeExit::LeaveFailed);
        }

        let deadline = Instant::now() + self.config.probe_join_timeout;
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(TransportEvent::Leave)) => return (outcome, ProbeExit::Leave),
                Ok(Some(TransportEvent::Error { code })) => {
                    warn!(channel = %channel_id, code, ?outcome, "transport error while leaving probe, discarding count");
                    return (OccupancyOutcome::Empty, ProbeExit::Error);
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    warn!(channel = %channel_id, ?outcome, "probe leave never confirmed, discarding count");
                    return (OccupancyOutcome::Empty, ProbeExit::Timeout);
                }
            }
        }
    }

    async fn leave_quietly(&self) {
        if let Err(e) = self.transport.leave().await {
            debug!(error = %e, "leave after failed probe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transport::{same_listener, TransportListener};
    use crate::infrastructure::transport::SimulatedTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener(AtomicUsize);

    impl TransportListener for CountingListener {
        fn on_event(&self, _event: TransportEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn channel(name: &str) -> ChannelId {
        ChannelId::parse(name).unwrap()
    }

    fn engine(transport: Arc<SimulatedTransport>) -> OccupancyDecisionEngine {
        OccupancyDecisionEngine::new(transport, OccupancyConfig::default())
    }

    /// Install an original listener and return it with the swap count so far
    fn with_original(transport: &SimulatedTransport) -> (ListenerRef, Arc<CountingListener>, usize) {
        let counting = Arc::new(CountingListener(AtomicUsize::new(0)));
        let original: ListenerRef = counting.clone();
        transport.set_listener(Some(original.clone()));
        (original, counting, transport.listener_swaps())
    }

    fn assert_restored_once(transport: &SimulatedTransport, original: &ListenerRef, swaps_before: usize) {
        assert_eq!(transport.listener_swaps(), swaps_before + 2);
        let current = transport.listener().expect("listener must be restored");
        assert!(same_listener(&current, original));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_callbacks_yields_empty() {
        let transport = Arc::new(SimulatedTransport::new());
        let engine = engine(transport);
        let tracker = PresenceTracker::new();
        let room = channel("room-1");
        tracker.on_join_success(&room, Uid::new(5));

        let started = Instant::now();
        let outcome = engine
            .check_occupancy_after_discovery(&room, &tracker, started, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Some(OccupancyOutcome::Empty));
        assert!(started.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_joined_within_window_yields_occupied() {
        let transport = Arc::new(SimulatedTransport::new());
        let engine = engine(transport);
        let tracker = Arc::new(PresenceTracker::new());
        let room = channel("room-2");
        tracker.on_join_success(&room, Uid::new(7));

        let started = Instant::now();
        let late = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            late.on_user_joined(Uid::new(42));
        });

        let outcome = engine
            .check_occupancy_after_discovery(&room, &tracker, started, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Some(OccupancyOutcome::Occupied(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_check_yields_nothing() {
        let transport = Arc::new(SimulatedTransport::new());
        let engine = engine(transport);
        let tracker = PresenceTracker::new();
        let room = channel("room-1");
        tracker.on_join_success(&room, Uid::new(5));
        tracker.on_user_joined(Uid::new(9));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = engine
            .check_occupancy_after_discovery(&room, &tracker, Instant::now(), &cancel)
            .await;
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn test_unavailable_transport_is_empty() {
        let transport = Arc::new(SimulatedTransport::uninitialized());
        let engine = engine(transport);
        let tracker = PresenceTracker::new();
        let room = channel("room-1");
        tracker.on_join_success(&room, Uid::new(5));
        tracker.on_user_joined(Uid::new(9));

        assert_eq!(engine.evaluate(&room, &tracker), OccupancyOutcome::Empty);
    }

    #[test]
    fn test_not_joined_is_empty() {
        let transport = Arc::new(SimulatedTransport::new());
        let engine = engine(transport);
        let tracker = PresenceTracker::new();
        tracker.on_join_success(&channel("other"), Uid::new(5));
        tracker.on_user_joined(Uid::new(9));

        assert_eq!(engine.evaluate(&channel("room-1"), &tracker), OccupancyOutcome::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_occupied_then_leaves() {
        let transport = Arc::new(SimulatedTransport::new());
        let room = channel("room-3");
        transport.add_peer(&room, Uid::new(99));
        let (original, counting, swaps) = with_original(&transport);

        let engine = engine(transport.clone());
        let (outcome, exit) = engine
            .check_occupancy_with_quick_join(&room, "tok", Uid::new(5))
            .await;

        assert_eq!(outcome, OccupancyOutcome::Occupied(1));
        assert_eq!(exit, ProbeExit::Leave);
        assert_eq!(transport.leave_count(), 1);
        assert!(transport.current_channel().is_none());
        assert_restored_once(&transport, &original, swaps);
        // Probe traffic never reached the original listener
        assert_eq!(counting.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_empty_still_leaves() {
        let transport = Arc::new(SimulatedTransport::new());
        let (original, _, swaps) = with_original(&transport);

        let engine = engine(transport.clone());
        let (outcome, exit) = engine
            .check_occupancy_with_quick_join(&channel("room-3"), "tok", Uid::new(5))
            .await;

        assert_eq!(outcome, OccupancyOutcome::Empty);
        assert_eq!(exit, ProbeExit::Leave);
        assert_eq!(transport.leave_count(), 1);
        assert_restored_once(&transport, &original, swaps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_join_rejected_restores_listener() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.reject_joins(Some(-17));
        let (original, _, swaps) = with_original(&transport);

        let engine = engine(transport.clone());
        let (outcome, exit) = engine
            .check_occupancy_with_quick_join(&channel("room-3"), "tok", Uid::new(5))
            .await;

        assert_eq!(outcome, OccupancyOutcome::Empty);
        assert_eq!(exit, ProbeExit::JoinRejected);
        assert_eq!(transport.leave_count(), 0);
        assert_restored_once(&transport, &original, swaps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_transport_error_restores_listener() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.hold_join_callbacks(true);
        let (original, _, swaps) = with_original(&transport);

        let engine = engine(transport.clone());
        let injector = transport.clone();
        let probe_channel = channel("room-3");
        let (result, _) = tokio::join!(
            engine.check_occupancy_with_quick_join(&probe_channel, "tok", Uid::new(5)),
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                injector.emit(TransportEvent::Error { code: 110 });
            }
        );

        assert_eq!(result, (OccupancyOutcome::Empty, ProbeExit::Error));
        assert_restored_once(&transport, &original, swaps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_leave_failure_restores_listener() {
        let transport = Arc::new(SimulatedTransport::new());
        let room = channel("room-3");
        transport.add_peer(&room, Uid::new(99));
        transport.fail_leaves(true);
        let (original, _, swaps) = with_original(&transport);

        let engine = engine(transport.clone());
        let (outcome, exit) = engine.check_occupancy_with_quick_join(&room, "tok", Uid::new(5)).await;

        assert_eq!(outcome, OccupancyOutcome::Empty);
        assert_eq!(exit, ProbeExit::LeaveFailed);
        assert_restored_once(&transport, &original, swaps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_while_leaving_quick_join_is_empty() {
        let transport = Arc::new(SimulatedTransport::new());
        let room = channel("room-9");
        transport.add_peer(&room, Uid::new(99));
        transport.suppress_leave_callbacks(true);
        let (original, _, swaps) = with_original(&transport);

        let engine = engine(transport.clone());
        let injector = transport.clone();
        let (result, _) = tokio::join!(
            engine.check_occupancy_with_quick_join(&room, "tok", Uid::new(5)),
            async move {
                // Discovery window closes at 500 ms; the leave wait follows
                tokio::time::sleep(Duration::from_millis(700)).await;
                injector.emit(TransportEvent::Error { code: 110 });
            }
        );

        assert_eq!(result, (OccupancyOutcome::Empty, ProbeExit::Error));
        assert_eq!(transport.leave_count(), 1);
        assert_restored_once(&transport, &original, swaps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_quick_join_leave_is_empty() {
        let transport = Arc::new(SimulatedTransport::new());
        let room = channel("room-9");
        transport.add_peer(&room, Uid::new(99));
        transport.suppress_leave_callbacks(true);
        let (original, _, swaps) = with_original(&transport);

        let engine = engine(transport.clone());
        let started = Instant::now();
        let (outcome, exit) = engine.check_occupancy_with_quick_join(&room, "tok", Uid::new(5)).await;

        assert_eq!(outcome, OccupancyOutcome::Empty);
        assert_eq!(exit, ProbeExit::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(5500));
        assert_restored_once(&transport, &original, swaps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_without_join_confirmation_times_out() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.hold_join_callbacks(true);
        let (original, _, swaps) = with_original(&transport);

        let engine = engine(transport.clone());
        let started = Instant::now();
        let (outcome, exit) = engine
            .check_occupancy_with_quick_join(&channel("room-3"), "tok", Uid::new(5))
            .await;

        assert_eq!(outcome, OccupancyOutcome::Empty);
        assert_eq!(exit, ProbeExit::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_restored_once(&transport, &original, swaps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_restores_listener() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.hold_join_callbacks(true);
        let (original, _, swaps) = with_original(&transport);

        let engine = engine(transport.clone());
        let probe_channel = channel("room-3");
        let probe = engine.check_occupancy_with_quick_join(&probe_channel, "tok", Uid::new(5));
        let _ = tokio::time::timeout(Duration::from_millis(50), probe).await;

        assert_restored_once(&transport, &original, swaps);
    }
}
