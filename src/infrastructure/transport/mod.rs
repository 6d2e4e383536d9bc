//! Transport adapters

pub mod simulated;

pub use simulated::SimulatedTransport;
