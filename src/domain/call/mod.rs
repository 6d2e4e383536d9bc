//! Call bounded context - the persisted call session and its lifecycle states

pub mod aggregate;
pub mod event;
pub mod repository;
pub mod store;
pub mod value_object;

pub use aggregate::CallSession;
pub use event::{CallEvent, RecoveryOutcome};
pub use repository::{KeyValueStore, KeyValueStoreExt, StoredValue};
pub use store::CallStateStore;
pub use value_object::{CoordinatorState, LeaveReason, SessionState};
