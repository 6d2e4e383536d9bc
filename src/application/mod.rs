//! Application layer - Use cases and application services
//!
//! This layer orchestrates domain objects to fulfill use cases.
//! It's responsible for:
//! - Serializing transport callbacks, timers and UI commands
//! - Coordinating the call session, presence and occupancy
//! - Publishing call events and metrics

pub mod callbacks;
pub mod coordinator;
pub mod metrics;

pub use callbacks::{CallUiCallbacks, LoggingCallbacks};
pub use coordinator::{CallLifecycleCoordinator, CallSnapshot, IncomingCall, LeaveOutcome};
