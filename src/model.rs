//! Records, pages and snapshots shared by the cache, the gateway and the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Independently synchronized data category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
  Transactions,
  Notifications,
}

impl Scope {
  pub const ALL: [Scope; 2] = [Scope::Transactions, Scope::Notifications];

  pub fn as_str(&self) -> &'static str {
    match self {
      Scope::Transactions => "transactions",
      Scope::Notifications => "notifications",
    }
  }
}

impl fmt::Display for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Kind of record an opaque reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
  Transaction,
  Notification,
}

impl RecordKind {
  /// The refresh scope that owns records of this kind.
  pub fn scope(&self) -> Scope {
    match self {
      RecordKind::Transaction => Scope::Transactions,
      RecordKind::Notification => Scope::Notifications,
    }
  }
}

impl fmt::Display for RecordKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RecordKind::Transaction => f.write_str("transaction"),
      RecordKind::Notification => f.write_str("notification"),
    }
  }
}

/// How much of a scope a refresh walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefreshMode {
  /// Only the newest page(s), stopping at the first overlap with the cache
  Incremental,
  /// Every page from the top until the server runs out or the page cap is hit
  Full,
}

impl fmt::Display for RefreshMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RefreshMode::Incremental => f.write_str("incremental"),
      RefreshMode::Full => f.write_str("full"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
  Pending,
  Completed,
  Failed,
}

impl TransactionStatus {
  /// Completed and failed transactions are settled on the server side.
  pub fn is_terminal(&self) -> bool {
    !matches!(self, TransactionStatus::Pending)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
  pub id: String,
  pub amount: f64,
  pub currency: String,
  pub counterparty_ref: String,
  pub timestamp: DateTime<Utc>,
  pub status: TransactionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
  pub id: String,
  pub title: String,
  pub body: String,
  pub timestamp: DateTime<Utc>,
  pub read: bool,
}

/// Opaque continuation token. Passed back to the server verbatim, never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// One page of records, newest first. `cursor` is `None` on the last page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub cursor: Option<Cursor>,
}

impl<T> Page<T> {
  pub fn new(items: Vec<T>, cursor: Option<Cursor>) -> Self {
    Self { items, cursor }
  }

  /// The last page of a sequence.
  pub fn last(items: Vec<T>) -> Self {
    Self {
      items,
      cursor: None,
    }
  }

  /// The oldest item on the page (pages are ordered newest first).
  pub fn oldest(&self) -> Option<&T> {
    self.items.last()
  }
}

/// Deduplicated local view of both scopes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CacheSnapshot {
  pub transactions: Vec<TransactionRecord>,
  pub notifications: Vec<NotificationRecord>,
  /// Latest successful refresh of either scope
  pub last_synced_at: Option<DateTime<Utc>>,
}

impl CacheSnapshot {
  pub fn transaction(&self, id: &str) -> Option<&TransactionRecord> {
    self.transactions.iter().find(|t| t.id == id)
  }

  pub fn notification(&self, id: &str) -> Option<&NotificationRecord> {
    self.notifications.iter().find(|n| n.id == id)
  }

  pub fn unread_count(&self) -> usize {
    self.notifications.iter().filter(|n| !n.read).count()
  }
}

/// Destination descriptor handed to the navigation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationTarget {
  Receipt {
    transaction_id: String,
    uri: Url,
    amount: f64,
    currency: String,
    status: TransactionStatus,
  },
  Notification {
    notification_id: String,
    title: String,
    timestamp: DateTime<Utc>,
  },
}

impl NavigationTarget {
  pub fn kind(&self) -> RecordKind {
    match self {
      NavigationTarget::Receipt { .. } => RecordKind::Transaction,
      NavigationTarget::Notification { .. } => RecordKind::Notification,
    }
  }

  pub fn id(&self) -> &str {
    match self {
      NavigationTarget::Receipt { transaction_id, .. } => transaction_id,
      NavigationTarget::Notification {
        notification_id, ..
      } => notification_id,
    }
  }
}
