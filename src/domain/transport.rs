//! Real-time channel transport port
//!
//! The voice transport itself is an external collaborator. The core only
//! depends on this trait: request-style operations that are accepted or
//! rejected synchronously, and asynchronous callbacks delivered through a
//! single registered [`TransportListener`].

use crate::domain::shared::value_objects::{ChannelId, Uid};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport request failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport engine not initialized")]
    NotInitialized,

    #[error("request rejected with code {code}")]
    Rejected { code: i32 },

    #[error("not in a channel")]
    NotInChannel,

    #[error("transport failure: {0}")]
    Failed(String),
}

/// Why a remote user went offline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    /// User left the channel
    Quit,
    /// No packets received for too long
    Dropped,
    /// User switched to audience role
    BecameAudience,
    /// Code not known to this core
    Other(i32),
}

impl OfflineReason {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => OfflineReason::Quit,
            1 => OfflineReason::Dropped,
            2 => OfflineReason::BecameAudience,
            other => OfflineReason::Other(other),
        }
    }
}

/// Callbacks emitted by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    JoinSuccess {
        channel_id: ChannelId,
        uid: Uid,
        elapsed_ms: u64,
    },
    Leave,
    UserJoined {
        uid: Uid,
        elapsed_ms: u64,
    },
    UserOffline {
        uid: Uid,
        reason: OfflineReason,
    },
    Error {
        code: i32,
    },
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::JoinSuccess { .. } => "join_success",
            TransportEvent::Leave => "leave",
            TransportEvent::UserJoined { .. } => "user_joined",
            TransportEvent::UserOffline { .. } => "user_offline",
            TransportEvent::Error { .. } => "error",
        }
    }
}

/// Receives transport callbacks
///
/// May be invoked from the transport's own callback thread.
pub trait TransportListener: Send + Sync {
    fn on_event(&self, event: TransportEvent);
}

/// Listener that forwards every callback into an unbounded mailbox
pub struct MailboxListener<M> {
    tx: mpsc::UnboundedSender<M>,
    wrap: fn(TransportEvent) -> M,
}

impl<M: Send + 'static> MailboxListener<M> {
    pub fn new(tx: mpsc::UnboundedSender<M>, wrap: fn(TransportEvent) -> M) -> Self {
        Self { tx, wrap }
    }
}

impl<M: Send + 'static> TransportListener for MailboxListener<M> {
    fn on_event(&self, event: TransportEvent) {
        // Receiver gone means the owner already shut down
        let _ = self.tx.send((self.wrap)(event));
    }
}

/// Shared handle to a registered listener
pub type ListenerRef = Arc<dyn TransportListener>;

/// Compare two listener handles by identity
pub fn same_listener(a: &ListenerRef, b: &ListenerRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Real-time voice transport
#[async_trait]
pub trait RealtimeChannelTransport: Send + Sync {
    /// Whether the underlying engine is ready for requests
    fn is_initialized(&self) -> bool;

    /// Request to join a channel. `Ok` means the request was accepted, not
    /// that the join completed; completion arrives as
    /// [`TransportEvent::JoinSuccess`].
    async fn join(&self, channel_id: &ChannelId, token: &str, uid: Uid)
        -> Result<(), TransportError>;

    /// Request to leave the current channel
    async fn leave(&self) -> Result<(), TransportError>;

    async fn mute_local(&self, muted: bool) -> Result<(), TransportError>;

    /// Install a listener, returning the previously registered one
    fn set_listener(&self, listener: Option<ListenerRef>) -> Option<ListenerRef>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_reason_codes() {
        assert_eq!(OfflineReason::from_code(0), OfflineReason::Quit);
        assert_eq!(OfflineReason::from_code(1), OfflineReason::Dropped);
        assert_eq!(OfflineReason::from_code(9), OfflineReason::Other(9));
    }

    #[tokio::test]
    async fn test_mailbox_listener_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = MailboxListener::new(tx, |event| event);
        listener.on_event(TransportEvent::Leave);
        assert_eq!(rx.recv().await, Some(TransportEvent::Leave));
    }

    #[test]
    fn test_same_listener_identity() {
        let (tx, _rx) = mpsc::unbounded_channel::<TransportEvent>();
        let a: ListenerRef = Arc::new(MailboxListener::new(tx.clone(), |e| e));
        let b: ListenerRef = Arc::new(MailboxListener::new(tx, |e| e));
        assert!(same_listener(&a, &a.clone()));
        assert!(!same_listener(&a, &b));
    }
}
