//! Turns opaque references (record ids, receipt links) into navigation targets.

use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStorage, LocalCache, SqliteStorage};
use crate::error::ResolveError;
use crate::model::{
  NavigationTarget, NotificationRecord, RecordKind, RefreshMode, TransactionRecord,
};
use crate::sync::SyncCoordinator;

pub struct ReferenceResolver<S: CacheStorage = SqliteStorage> {
  cache: Arc<LocalCache<S>>,
  coordinator: SyncCoordinator<S>,
  /// Receipt locator prefix; transaction ids are appended as the last path segment
  receipt_base: Url,
}

impl<S: CacheStorage + 'static> ReferenceResolver<S> {
  pub fn new(cache: Arc<LocalCache<S>>, coordinator: SyncCoordinator<S>, receipt_base: Url) -> Self {
    Self {
      cache,
      coordinator,
      receipt_base,
    }
  }

  /// Resolve a record reference against the cache.
  ///
  /// A reference that is not cached yet (e.g., a push notification for a record that
  /// has not synced) triggers one incremental refresh of its scope before giving up.
  pub async fn resolve(&self, kind: RecordKind, id: &str) -> Result<NavigationTarget, ResolveError> {
    if let Some(target) = self.lookup(kind, id)? {
      return Ok(target);
    }

    debug!(%kind, id, "Reference not cached, fetching newest page");
    if let Err(failure) = self
      .coordinator
      .refresh(kind.scope(), RefreshMode::Incremental)
      .await
    {
      warn!(%kind, id, error = %failure, "On-demand refresh failed");
    }

    self
      .lookup(kind, id)?
      .ok_or_else(|| ResolveError::not_found(kind, id))
  }

  /// Resolve a receipt link of the form `{receipt_base}{transaction_id}`.
  pub async fn resolve_link(&self, link: &Url) -> Result<NavigationTarget, ResolveError> {
    let id = self.transaction_id_from_link(link)?;
    self.resolve(RecordKind::Transaction, &id).await
  }

  /// Receipt locator for a transaction id.
  pub fn receipt_uri(&self, transaction_id: &str) -> Result<Url, ResolveError> {
    let mut uri = self.receipt_base.clone();
    uri
      .path_segments_mut()
      .map_err(|_| ResolveError::UnrecognizedLink(self.receipt_base.to_string()))?
      .pop_if_empty()
      .push(transaction_id);
    Ok(uri)
  }

  fn transaction_id_from_link(&self, link: &Url) -> Result<String, ResolveError> {
    let unrecognized = || ResolveError::UnrecognizedLink(link.to_string());

    if link.origin() != self.receipt_base.origin() {
      return Err(unrecognized());
    }

    let base: Vec<&str> = self
      .receipt_base
      .path_segments()
      .map(|segments| segments.filter(|s| !s.is_empty()).collect())
      .unwrap_or_default();
    let path: Vec<&str> = link
      .path_segments()
      .map(|segments| segments.filter(|s| !s.is_empty()).collect())
      .ok_or_else(unrecognized)?;

    match path.split_last() {
      Some((id, prefix)) if prefix == base.as_slice() => Ok((*id).to_string()),
      _ => Err(unrecognized()),
    }
  }

  fn lookup(&self, kind: RecordKind, id: &str) -> Result<Option<NavigationTarget>, ResolveError> {
    let cache_error = |e: color_eyre::Report| ResolveError::Cache(e.to_string());

    match kind {
      RecordKind::Transaction => {
        let Some(record) = self.cache.get::<TransactionRecord>(id).map_err(cache_error)? else {
          return Ok(None);
        };
        Ok(Some(NavigationTarget::Receipt {
          uri: self.receipt_uri(&record.id)?,
          transaction_id: record.id,
          amount: record.amount,
          currency: record.currency,
          status: record.status,
        }))
      }
      RecordKind::Notification => Ok(
        self
          .cache
          .get::<NotificationRecord>(id)
          .map_err(cache_error)?
          .map(|record| NavigationTarget::Notification {
            notification_id: record.id,
            title: record.title,
            timestamp: record.timestamp,
          }),
      ),
    }
  }
}
