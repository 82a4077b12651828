//! Scripted gateway and fixtures shared by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{CacheStorage, Cacheable, CachedEntity, LocalCache, SqliteStorage};
use crate::error::{AuthError, FetchError};
use crate::model::{
  Cursor, NotificationRecord, Page, TransactionRecord, TransactionStatus,
};
use crate::remote::{Credentials, RemoteGateway};
use crate::session::{Session, SessionStore};

type Script<T> = Mutex<VecDeque<Result<Page<T>, FetchError>>>;

/// Replays queued responses per scope and counts calls.
///
/// An exhausted script answers with an empty last page.
#[derive(Default)]
pub struct ScriptedGateway {
  auth: Mutex<VecDeque<Result<Session, AuthError>>>,
  transactions: Script<TransactionRecord>,
  notifications: Script<NotificationRecord>,
  auth_calls: AtomicUsize,
  transaction_calls: AtomicUsize,
  notification_calls: AtomicUsize,
  transaction_cursors: Mutex<Vec<Option<Cursor>>>,
  latency: Duration,
}

impl ScriptedGateway {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn push_auth(&self, result: Result<Session, AuthError>) {
    self.auth.lock().unwrap().push_back(result);
  }

  pub fn push_transactions(&self, result: Result<Page<TransactionRecord>, FetchError>) {
    self.transactions.lock().unwrap().push_back(result);
  }

  pub fn push_notifications(&self, result: Result<Page<NotificationRecord>, FetchError>) {
    self.notifications.lock().unwrap().push_back(result);
  }

  pub fn auth_calls(&self) -> usize {
    self.auth_calls.load(Ordering::SeqCst)
  }

  pub fn transaction_calls(&self) -> usize {
    self.transaction_calls.load(Ordering::SeqCst)
  }

  pub fn notification_calls(&self) -> usize {
    self.notification_calls.load(Ordering::SeqCst)
  }

  pub fn transaction_cursors(&self) -> Vec<Option<Cursor>> {
    self.transaction_cursors.lock().unwrap().clone()
  }

  async fn delay(&self) {
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
  }
}

#[async_trait]
impl RemoteGateway for ScriptedGateway {
  async fn authenticate(&self, _credentials: &Credentials) -> Result<Session, AuthError> {
    self.auth_calls.fetch_add(1, Ordering::SeqCst);
    self.delay().await;
    self
      .auth
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or(Err(AuthError::InvalidCredentials))
  }

  async fn fetch_transactions(
    &self,
    session: &Session,
    cursor: Option<&Cursor>,
    _page_size: u32,
  ) -> Result<Page<TransactionRecord>, FetchError> {
    if !session.is_valid() {
      return Err(FetchError::Unauthorized("session expired".to_string()));
    }
    self.transaction_calls.fetch_add(1, Ordering::SeqCst);
    self.transaction_cursors.lock().unwrap().push(cursor.cloned());
    self.delay().await;
    let next = self.transactions.lock().unwrap().pop_front();
    next.unwrap_or_else(|| Ok(Page::last(Vec::new())))
  }

  async fn fetch_notifications(
    &self,
    session: &Session,
    _cursor: Option<&Cursor>,
    _page_size: u32,
  ) -> Result<Page<NotificationRecord>, FetchError> {
    if !session.is_valid() {
      return Err(FetchError::Unauthorized("session expired".to_string()));
    }
    self.notification_calls.fetch_add(1, Ordering::SeqCst);
    self.delay().await;
    let next = self.notifications.lock().unwrap().pop_front();
    next.unwrap_or_else(|| Ok(Page::last(Vec::new())))
  }
}

type Hook = Box<dyn FnOnce(&SqliteStorage) + Send>;
type HookSlot = Arc<Mutex<Option<Hook>>>;

/// One-shot callbacks fired by [`HookedStorage`] right before an operation reaches SQLite.
#[derive(Clone, Default)]
pub struct StorageHooks {
  before_get: HookSlot,
  before_merge: HookSlot,
  before_update: HookSlot,
}

impl StorageHooks {
  pub fn before_get(&self, hook: impl FnOnce(&SqliteStorage) + Send + 'static) {
    *self.before_get.lock().unwrap() = Some(Box::new(hook));
  }

  pub fn before_merge(&self, hook: impl FnOnce(&SqliteStorage) + Send + 'static) {
    *self.before_merge.lock().unwrap() = Some(Box::new(hook));
  }

  pub fn before_update(&self, hook: impl FnOnce(&SqliteStorage) + Send + 'static) {
    *self.before_update.lock().unwrap() = Some(Box::new(hook));
  }
}

fn fire(slot: &HookSlot, inner: &SqliteStorage) {
  let hook = slot.lock().unwrap().take();
  if let Some(hook) = hook {
    hook(inner);
  }
}

/// In-memory SQLite storage that lets a test interleave work with cache operations.
pub struct HookedStorage {
  inner: SqliteStorage,
  hooks: StorageHooks,
}

impl HookedStorage {
  pub fn new() -> (Self, StorageHooks) {
    let hooks = StorageHooks::default();
    let storage = Self {
      inner: SqliteStorage::open_in_memory().unwrap(),
      hooks: hooks.clone(),
    };
    (storage, hooks)
  }
}

impl CacheStorage for HookedStorage {
  fn merge_entities<T: Cacheable>(&self, scope_key: &str, entities: &[T]) -> color_eyre::Result<()> {
    fire(&self.hooks.before_merge, &self.inner);
    self.inner.merge_entities(scope_key, entities)
  }

  fn load_entities<T: Cacheable>(&self, scope_key: &str) -> color_eyre::Result<Vec<T>> {
    self.inner.load_entities(scope_key)
  }

  fn get_entity<T: Cacheable>(
    &self,
    scope_key: &str,
    entity_key: &str,
  ) -> color_eyre::Result<Option<CachedEntity<T>>> {
    fire(&self.hooks.before_get, &self.inner);
    self.inner.get_entity(scope_key, entity_key)
  }

  fn update_entity<T, F>(&self, scope_key: &str, entity_key: &str, update: F) -> color_eyre::Result<bool>
  where
    T: Cacheable,
    F: FnOnce(&mut T),
  {
    fire(&self.hooks.before_update, &self.inner);
    self.inner.update_entity(scope_key, entity_key, update)
  }

  fn set_last_synced(
    &self,
    scope_key: &str,
    entity_type: &str,
    at: DateTime<Utc>,
  ) -> color_eyre::Result<()> {
    self.inner.set_last_synced(scope_key, entity_type, at)
  }

  fn get_last_synced(
    &self,
    scope_key: &str,
    entity_type: &str,
  ) -> color_eyre::Result<Option<DateTime<Utc>>> {
    self.inner.get_last_synced(scope_key, entity_type)
  }

  fn clear_scope(&self, scope_key: &str) -> color_eyre::Result<()> {
    self.inner.clear_scope(scope_key)
  }
}

pub const ACCOUNT: &str = "acc-1";

pub fn session() -> Session {
  Session::new(
    "key-1",
    ACCOUNT,
    Utc::now() - ChronoDuration::minutes(1),
    ChronoDuration::minutes(30),
  )
}

pub fn sessions_with_valid_session() -> Arc<SessionStore> {
  let sessions = Arc::new(SessionStore::new());
  sessions.set(session());
  sessions
}

pub fn bound_cache() -> Arc<LocalCache> {
  let cache = LocalCache::new(
    SqliteStorage::open_in_memory().unwrap(),
    "https://pay.example/",
  );
  cache.bind(ACCOUNT).unwrap();
  Arc::new(cache)
}

/// Completed transaction at 10:`minute` on a fixed day.
pub fn tx(id: &str, minute: u32) -> TransactionRecord {
  TransactionRecord {
    id: id.to_string(),
    amount: 10.0,
    currency: "USD".to_string(),
    counterparty_ref: "merchant-1".to_string(),
    timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
    status: TransactionStatus::Completed,
  }
}

pub fn note(id: &str, minute: u32) -> NotificationRecord {
  NotificationRecord {
    id: id.to_string(),
    title: format!("Notification {}", id),
    body: "Body".to_string(),
    timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap(),
    read: false,
  }
}

pub fn page(items: Vec<TransactionRecord>, cursor: Option<&str>) -> Page<TransactionRecord> {
  Page::new(items, cursor.map(Cursor::new))
}
