//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Persistence: key-value stores backing the call record
//! - Transport: real-time channel adapters

pub mod persistence;
pub mod transport;
