//! UI callback port
//!
//! Invoked from the coordinator's task. Implementations marshal onto their
//! own rendering thread.

use tracing::info;

pub trait CallUiCallbacks: Send + Sync {
    /// A live call with at least one other participant should be shown
    fn on_call_found(&self, display_name: &str, photo_url: Option<&str>, is_muted: bool);

    /// The channel turned out to be empty; any call UI should close
    fn on_channel_empty(&self);

    /// Participant count while call UI is shown
    fn on_channel_occupied(&self, count: usize);
}

/// Callbacks that only log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallbacks;

impl CallUiCallbacks for LoggingCallbacks {
    fn on_call_found(&self, display_name: &str, photo_url: Option<&str>, is_muted: bool) {
        info!(caller = display_name, photo = ?photo_url, is_muted, "call found");
    }

    fn on_channel_empty(&self) {
        info!("channel empty");
    }

    fn on_channel_occupied(&self, count: usize) {
        info!(count, "channel occupied");
    }
}
