//! VoxChannel - channel presence and auto-leave for voice calls
//!
//! Decides whether a joined voice channel is occupied, leaves it
//! automatically when nobody else is there, and recovers call state after
//! the process is killed. Laid out as domain, application and
//! infrastructure layers; the real-time transport and durable storage are
//! ports.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
