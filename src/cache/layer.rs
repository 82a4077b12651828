//! Account-bound cache layer that merges fetched pages into snapshots.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use super::storage::{CacheStorage, SqliteStorage};
use super::traits::Cacheable;
use crate::model::{CacheSnapshot, NotificationRecord, Page, Scope, TransactionRecord};

/// Local cache of the last-known transactions and notifications for one account.
///
/// The cache is bound to at most one account at a time. Storage rows are partitioned
/// by a hash of the server namespace and the account id, so switching accounts never
/// exposes another account's records.
pub struct LocalCache<S: CacheStorage = SqliteStorage> {
  storage: Arc<S>,
  /// Server identity mixed into partition keys (e.g., base URL)
  namespace: String,
  account: RwLock<Option<String>>,
}

/// A write addressed to an account the cache is no longer bound to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cache is not bound to account {0}")]
pub struct AccountUnbound(pub String);

impl<S: CacheStorage> LocalCache<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S, namespace: impl Into<String>) -> Self {
    Self {
      storage: Arc::new(storage),
      namespace: namespace.into(),
      account: RwLock::new(None),
    }
  }

  /// Stable partition key for an account on this server.
  pub fn partition_key(&self, account_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(account_id.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Direct subsequent reads and merges at `account_id`'s partition.
  ///
  /// Binding a different account than the current one wipes the current account's
  /// records first. Waits for writes running against the current binding.
  pub fn bind(&self, account_id: &str) -> Result<()> {
    let mut account = self
      .account
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(previous) = account.as_deref().filter(|p| *p != account_id) {
      self.storage.clear_scope(&self.partition_key(previous))?;
      info!("Account switched, previous cache invalidated");
    }
    *account = Some(account_id.to_string());
    debug!(account = account_id, "Cache bound");
    Ok(())
  }

  /// Wipe the bound account's records and leave the cache unbound.
  pub fn release(&self) -> Result<()> {
    let mut account = self
      .account
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(previous) = account.take() {
      self.storage.clear_scope(&self.partition_key(&previous))?;
      info!("Cache invalidated and released");
    }
    Ok(())
  }

  pub fn bound_account(&self) -> Option<String> {
    self.account.read().ok().and_then(|a| a.clone())
  }

  /// Run `f` against the bound partition, if any, while the binding is held.
  fn with_bound<R>(&self, f: impl FnOnce(Option<&str>) -> Result<R>) -> Result<R> {
    let account = self
      .account
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let partition = account.as_deref().map(|a| self.partition_key(a));
    f(partition.as_deref())
  }

  fn with_required<R>(&self, f: impl FnOnce(&str) -> Result<R>) -> Result<R> {
    self.with_bound(|partition| match partition {
      Some(partition) => f(partition),
      None => Err(eyre!("Cache is not bound to an account")),
    })
  }

  /// Run `f` against `account_id`'s partition, failing with [`AccountUnbound`] if the
  /// cache is bound elsewhere. Rebinding waits until `f` returns.
  fn with_account<R>(&self, account_id: &str, f: impl FnOnce(&str) -> Result<R>) -> Result<R> {
    let account = self
      .account
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if account.as_deref() != Some(account_id) {
      return Err(AccountUnbound(account_id.to_string()).into());
    }
    f(&self.partition_key(account_id))
  }

  /// Current deduplicated view of both scopes. Empty when no account is bound.
  pub fn read_snapshot(&self) -> Result<CacheSnapshot> {
    self.with_bound(|partition| match partition {
      Some(partition) => self.snapshot_of(partition),
      None => Ok(CacheSnapshot::default()),
    })
  }

  /// Snapshot of `account_id`, provided it is still the bound account.
  pub fn snapshot_for(&self, account_id: &str) -> Result<CacheSnapshot> {
    self.with_account(account_id, |partition| self.snapshot_of(partition))
  }

  fn snapshot_of(&self, partition: &str) -> Result<CacheSnapshot> {
    let transactions = self.storage.load_entities::<TransactionRecord>(partition)?;
    let notifications = self.storage.load_entities::<NotificationRecord>(partition)?;

    let last_synced_at = Scope::ALL
      .iter()
      .map(|scope| self.storage.get_last_synced(partition, scope.as_str()))
      .collect::<Result<Vec<_>>>()?
      .into_iter()
      .flatten()
      .max();

    Ok(CacheSnapshot {
      transactions,
      notifications,
      last_synced_at,
    })
  }

  /// Merge a fetched page and return the resulting snapshot.
  ///
  /// Idempotent: records are deduplicated by id and the copy from the latest merge wins.
  /// The page is written atomically, so readers never observe half of it.
  pub fn merge<T: Cacheable>(&self, page: &Page<T>) -> Result<CacheSnapshot> {
    self.with_required(|partition| self.merge_into(partition, page))
  }

  /// Merge a page fetched for `account_id`. Fails with [`AccountUnbound`] instead of
  /// writing into another account's partition.
  pub fn merge_for<T: Cacheable>(&self, account_id: &str, page: &Page<T>) -> Result<CacheSnapshot> {
    self.with_account(account_id, |partition| self.merge_into(partition, page))
  }

  fn merge_into<T: Cacheable>(&self, partition: &str, page: &Page<T>) -> Result<CacheSnapshot> {
    self.storage.merge_entities(partition, &page.items)?;
    debug!(
      scope = %T::scope(),
      items = page.items.len(),
      "Merged page into cache"
    );
    self.snapshot_of(partition)
  }

  /// A single cached record of the bound account.
  pub fn get<T: Cacheable>(&self, id: &str) -> Result<Option<T>> {
    self.with_bound(|partition| match partition {
      Some(partition) => Ok(
        self
          .storage
          .get_entity::<T>(partition, id)?
          .map(|cached| cached.entity),
      ),
      None => Ok(None),
    })
  }

  /// Whether `account_id`, still bound, has a record with this id cached.
  pub fn contains_for<T: Cacheable>(&self, account_id: &str, id: &str) -> Result<bool> {
    self.with_account(account_id, |partition| {
      Ok(self.storage.get_entity::<T>(partition, id)?.is_some())
    })
  }

  /// Mark a cached notification as read. Returns false if it is not cached.
  pub fn mark_notification_read(&self, id: &str) -> Result<bool> {
    self.with_required(|partition| {
      self
        .storage
        .update_entity::<NotificationRecord, _>(partition, id, |n| n.read = true)
    })
  }

  /// Record a successful refresh of `scope`.
  pub fn mark_synced(&self, scope: Scope, at: DateTime<Utc>) -> Result<()> {
    self.with_required(|partition| self.storage.set_last_synced(partition, scope.as_str(), at))
  }

  /// Record a successful refresh of `scope` made for `account_id`.
  pub fn mark_synced_for(&self, account_id: &str, scope: Scope, at: DateTime<Utc>) -> Result<()> {
    self.with_account(account_id, |partition| {
      self.storage.set_last_synced(partition, scope.as_str(), at)
    })
  }

  /// Clear both collections and the sync markers of the bound account.
  pub fn invalidate_all(&self) -> Result<()> {
    self.with_bound(|partition| {
      if let Some(partition) = partition {
        self.storage.clear_scope(partition)?;
        info!("Cache invalidated");
      }
      Ok(())
    })
  }
}
