//! Refresh cycles that keep the local cache consistent with the remote service.

mod coordinator;
mod event;
mod retry;

pub use coordinator::{RefreshOutcome, SyncCoordinator, SyncSettings};
pub use event::{ScopeState, SyncEvent};
pub use retry::RetryPolicy;
