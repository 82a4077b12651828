//! Inbound facade for the presentation layer.
//!
//! Wires the session store, gateway, cache, coordinator and resolver together and
//! owns the account lifecycle: login binds the cache to the authenticated account,
//! logout drops the session and wipes that account's cached records.

use color_eyre::Result;
use futures::future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheStorage, LocalCache, SqliteStorage};
use crate::config::Config;
use crate::error::{AuthError, ResolveError};
use crate::model::{CacheSnapshot, NavigationTarget, RecordKind, RefreshMode, Scope};
use crate::remote::{Credentials, HttpGateway, RemoteGateway};
use crate::resolver::ReferenceResolver;
use crate::session::{Session, SessionStore};
use crate::sync::{RefreshOutcome, ScopeState, SyncCoordinator, SyncEvent, SyncSettings};

pub struct SyncService<S: CacheStorage = SqliteStorage> {
  gateway: Arc<dyn RemoteGateway>,
  sessions: Arc<SessionStore>,
  cache: Arc<LocalCache<S>>,
  coordinator: SyncCoordinator<S>,
  resolver: ReferenceResolver<S>,
}

impl SyncService<SqliteStorage> {
  /// Build the HTTP gateway and the on-disk cache described by `config`.
  pub fn from_config(config: &Config) -> Result<Self> {
    let gateway = Arc::new(HttpGateway::new(config)?);
    let storage = SqliteStorage::open(config.cache.path.as_deref())?;
    let cache = LocalCache::new(storage, config.server.url.as_str());

    Ok(Self::new(
      gateway,
      Arc::new(cache),
      SyncSettings::from(&config.sync),
      config.server.receipt_url.clone(),
    ))
  }
}

impl<S: CacheStorage + 'static> SyncService<S> {
  pub fn new(
    gateway: Arc<dyn RemoteGateway>,
    cache: Arc<LocalCache<S>>,
    settings: SyncSettings,
    receipt_base: Url,
  ) -> Self {
    let sessions = Arc::new(SessionStore::new());
    let coordinator = SyncCoordinator::new(
      Arc::clone(&gateway),
      Arc::clone(&cache),
      Arc::clone(&sessions),
      settings,
    );
    let resolver = ReferenceResolver::new(Arc::clone(&cache), coordinator.clone(), receipt_base);

    Self {
      gateway,
      sessions,
      cache,
      coordinator,
      resolver,
    }
  }

  /// Authenticate and bind the cache to the returned account.
  ///
  /// A failed attempt leaves the session store untouched. Logging in as a different
  /// account than the bound one wipes the previous account's records first.
  /// Authentication failures are carried as [`AuthError`] inside the report.
  pub async fn login(&self, credentials: &Credentials) -> Result<Session> {
    let session = match self.gateway.authenticate(credentials).await {
      Ok(session) => session,
      Err(e) => {
        warn!(username = %credentials.username, error = %e, "Authentication failed");
        return Err(e.into());
      }
    };

    if self
      .cache
      .bound_account()
      .is_some_and(|previous| previous != session.account_id)
    {
      // Refreshes of the previous account stop at their next cache write
      self.sessions.invalidate();
    }
    self.cache.bind(&session.account_id)?;
    self.sessions.set(session.clone());
    info!(account = %session.account_id, "Logged in");
    Ok(session)
  }

  /// Drop the session and clear the bound account's cache.
  pub fn logout(&self) -> Result<()> {
    self.sessions.invalidate();
    self.cache.release()?;
    info!("Logged out");
    Ok(())
  }

  pub fn session(&self) -> Option<Session> {
    self.sessions.valid()
  }

  pub async fn refresh(&self, scope: Scope, mode: RefreshMode) -> RefreshOutcome {
    self.coordinator.refresh(scope, mode).await
  }

  /// Refresh both scopes concurrently.
  pub async fn refresh_all(&self, mode: RefreshMode) -> Vec<(Scope, RefreshOutcome)> {
    let outcomes = future::join_all(Scope::ALL.iter().map(|scope| self.refresh(*scope, mode))).await;
    Scope::ALL.iter().copied().zip(outcomes).collect()
  }

  /// Last merged state, available offline.
  pub fn snapshot(&self) -> Result<CacheSnapshot> {
    self.cache.read_snapshot()
  }

  pub fn state(&self, scope: Scope) -> ScopeState {
    self.coordinator.state(scope)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.coordinator.subscribe()
  }

  pub async fn resolve(&self, kind: RecordKind, id: &str) -> Result<NavigationTarget, ResolveError> {
    self.resolver.resolve(kind, id).await
  }

  pub async fn resolve_link(&self, link: &Url) -> Result<NavigationTarget, ResolveError> {
    self.resolver.resolve_link(link).await
  }

  pub fn receipt_uri(&self, transaction_id: &str) -> Result<Url, ResolveError> {
    self.resolver.receipt_uri(transaction_id)
  }

  /// Persist the read flag of a cached notification.
  pub fn mark_notification_read(&self, id: &str) -> Result<(), ResolveError> {
    if self.cache.bound_account().is_none() {
      return Err(ResolveError::not_found(RecordKind::Notification, id));
    }
    let found = self
      .cache
      .mark_notification_read(id)
      .map_err(|e| ResolveError::Cache(e.to_string()))?;

    if found {
      Ok(())
    } else {
      Err(ResolveError::not_found(RecordKind::Notification, id))
    }
  }
}

/// Authentication failure carried by a login report, if that is what failed.
pub fn auth_error(report: &color_eyre::Report) -> Option<&AuthError> {
  report.downcast_ref()
}
