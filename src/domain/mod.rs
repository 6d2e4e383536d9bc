//! Domain layer - Core channel presence rules
//!
//! This layer contains:
//! - Aggregates: the persisted call session
//! - Value Objects: channel ids, uids, lifecycle states
//! - Domain Services: presence tracking and occupancy decisions
//! - Ports: the real-time transport and key-value storage
//! - Domain Events: things that happened to a call

pub mod call;
pub mod occupancy;
pub mod presence;
pub mod shared;
pub mod transport;

// Re-export commonly used types
pub use shared::{DomainError, Result};
