//! Core traits for cached records.

use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::model::{NotificationRecord, Scope, TransactionRecord};

/// Trait for records that can be cached.
///
/// Implementors provide a per-account unique key and a sort key; snapshots are
/// ordered by sort key descending (newest first).
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier within an account (e.g., transaction id)
  fn cache_key(&self) -> String;

  /// Ordering key, larger is newer
  fn sort_key(&self) -> i64;

  /// Scope this record belongs to
  fn scope() -> Scope;

  /// Entity type name for storage organization
  fn entity_type() -> &'static str {
    Self::scope().as_str()
  }

  /// Fold local-only state from the previously cached copy into an incoming copy.
  ///
  /// Called by merges before the incoming copy replaces the cached one.
  fn reconcile(&mut self, _previous: &Self) {}
}

impl Cacheable for TransactionRecord {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn sort_key(&self) -> i64 {
    self.timestamp.timestamp_millis()
  }

  fn scope() -> Scope {
    Scope::Transactions
  }

  // The server copy still wins; a settled transaction changing is worth a trace.
  fn reconcile(&mut self, previous: &Self) {
    if previous.status.is_terminal() && self.status != previous.status {
      warn!(
        id = %self.id,
        from = ?previous.status,
        to = ?self.status,
        "Settled transaction changed status"
      );
    }
  }
}

impl Cacheable for NotificationRecord {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn sort_key(&self) -> i64 {
    self.timestamp.timestamp_millis()
  }

  fn scope() -> Scope {
    Scope::Notifications
  }

  // Read state only moves forward locally.
  fn reconcile(&mut self, previous: &Self) {
    self.read |= previous.read;
  }
}
