use chrono::{DateTime, Utc};

use crate::error::{FailureClass, RefreshFailure};
use crate::model::{CacheSnapshot, RefreshMode, Scope};

/// Events published to the presentation layer
#[derive(Debug, Clone)]
pub enum SyncEvent {
  /// A refresh finished and the cache holds a new consistent snapshot
  SnapshotUpdated {
    scope: Scope,
    snapshot: CacheSnapshot,
    last_synced_at: DateTime<Utc>,
  },
  /// A refresh ended without completing
  RefreshFailed(RefreshFailure),
}

/// Lifecycle state of one refresh scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeState {
  #[default]
  Idle,
  Refreshing(RefreshMode),
  Failed(FailureClass),
}
