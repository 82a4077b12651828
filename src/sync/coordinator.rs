//! Refresh orchestration with per-scope coalescing.
//!
//! Each scope runs at most one fetch sequence at a time. Callers that ask for a
//! refresh while one is running attach to it and receive its terminal result. The
//! sequence itself runs on a spawned task, so a caller that stops waiting never
//! interrupts it.

use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::event::{ScopeState, SyncEvent};
use super::retry::RetryPolicy;
use crate::cache::{AccountUnbound, CacheStorage, Cacheable, LocalCache, SqliteStorage};
use crate::config::SyncConfig;
use crate::error::{FailureClass, FetchError, RefreshFailure};
use crate::model::{
  CacheSnapshot, Cursor, NotificationRecord, Page, RefreshMode, Scope, TransactionRecord,
};
use crate::remote::RemoteGateway;
use crate::session::{Session, SessionStore};

/// Terminal result of a refresh, shared by every attached caller.
pub type RefreshOutcome = Result<CacheSnapshot, RefreshFailure>;

type OutcomeSender = watch::Sender<Option<RefreshOutcome>>;
type OutcomeReceiver = watch::Receiver<Option<RefreshOutcome>>;

const EVENT_CAPACITY: usize = 64;

/// Tunables for refresh cycles.
#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub page_size: u32,
  pub full_page_cap: u32,
  pub incremental_page_cap: u32,
  pub request_timeout: Duration,
  pub retry: RetryPolicy,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self::from(&SyncConfig::default())
  }
}

impl From<&SyncConfig> for SyncSettings {
  fn from(config: &SyncConfig) -> Self {
    Self {
      page_size: config.page_size,
      full_page_cap: config.full_page_cap.max(1),
      incremental_page_cap: config.incremental_page_cap.max(1),
      request_timeout: config.request_timeout(),
      retry: RetryPolicy::from(&config.retry),
    }
  }
}

impl SyncSettings {
  fn page_cap(&self, mode: RefreshMode) -> u32 {
    match mode {
      RefreshMode::Full => self.full_page_cap,
      RefreshMode::Incremental => self.incremental_page_cap,
    }
  }
}

/// Records the coordinator can page through.
pub(crate) trait Syncable: Cacheable + 'static {
  fn fetch<'a>(
    gateway: &'a dyn RemoteGateway,
    session: &'a Session,
    cursor: Option<&'a Cursor>,
    page_size: u32,
  ) -> BoxFuture<'a, Result<Page<Self>, FetchError>>;
}

impl Syncable for TransactionRecord {
  fn fetch<'a>(
    gateway: &'a dyn RemoteGateway,
    session: &'a Session,
    cursor: Option<&'a Cursor>,
    page_size: u32,
  ) -> BoxFuture<'a, Result<Page<Self>, FetchError>> {
    gateway.fetch_transactions(session, cursor, page_size)
  }
}

impl Syncable for NotificationRecord {
  fn fetch<'a>(
    gateway: &'a dyn RemoteGateway,
    session: &'a Session,
    cursor: Option<&'a Cursor>,
    page_size: u32,
  ) -> BoxFuture<'a, Result<Page<Self>, FetchError>> {
    gateway.fetch_notifications(session, cursor, page_size)
  }
}

/// A running fetch sequence and the callers waiting on it.
struct InFlight {
  mode: RefreshMode,
  result: OutcomeSender,
  /// Full refresh requested while an incremental one was running
  queued_full: Option<OutcomeSender>,
}

#[derive(Default)]
struct ScopeSlot {
  in_flight: Option<InFlight>,
  last: ScopeState,
}

struct Inner<S: CacheStorage> {
  gateway: Arc<dyn RemoteGateway>,
  cache: Arc<LocalCache<S>>,
  sessions: Arc<SessionStore>,
  settings: SyncSettings,
  slots: Mutex<HashMap<Scope, ScopeSlot>>,
  events: broadcast::Sender<SyncEvent>,
}

/// Orchestrates pull, poll and cold-start refreshes of both scopes.
pub struct SyncCoordinator<S: CacheStorage = SqliteStorage> {
  inner: Arc<Inner<S>>,
}

impl<S: CacheStorage> Clone for SyncCoordinator<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: CacheStorage + 'static> SyncCoordinator<S> {
  pub fn new(
    gateway: Arc<dyn RemoteGateway>,
    cache: Arc<LocalCache<S>>,
    sessions: Arc<SessionStore>,
    settings: SyncSettings,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        gateway,
        cache,
        sessions,
        settings,
        slots: Mutex::new(HashMap::new()),
        events,
      }),
    }
  }

  /// Refresh `scope` and wait for the terminal result.
  ///
  /// A request for the same or a weaker mode than the running one joins it. A full
  /// request arriving during an incremental one is queued and runs right after it.
  /// Dropping the returned future only stops this caller's wait.
  pub async fn refresh(&self, scope: Scope, mode: RefreshMode) -> RefreshOutcome {
    let receiver = self.join_or_start(scope, mode);
    wait_for_outcome(scope, receiver).await
  }

  pub fn state(&self, scope: Scope) -> ScopeState {
    let slots = self.inner.lock_slots();
    match slots.get(&scope) {
      Some(ScopeSlot {
        in_flight: Some(in_flight),
        ..
      }) => ScopeState::Refreshing(in_flight.mode),
      Some(slot) => slot.last,
      None => ScopeState::Idle,
    }
  }

  /// Snapshot and failure events for every refresh that finishes from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  fn join_or_start(&self, scope: Scope, mode: RefreshMode) -> OutcomeReceiver {
    let mut slots = self.inner.lock_slots();
    let slot = slots.entry(scope).or_default();

    if let Some(in_flight) = slot.in_flight.as_mut() {
      if mode <= in_flight.mode {
        debug!(%scope, %mode, running = %in_flight.mode, "Joining in-flight refresh");
        return in_flight.result.subscribe();
      }
      debug!(%scope, "Queueing full refresh behind incremental");
      return in_flight
        .queued_full
        .get_or_insert_with(|| watch::channel(None).0)
        .subscribe();
    }

    let (sender, receiver) = watch::channel(None);
    slot.in_flight = Some(InFlight {
      mode,
      result: sender,
      queued_full: None,
    });
    drop(slots);

    let inner = Arc::clone(&self.inner);
    tokio::spawn(async move { inner.drive(scope, mode).await });
    receiver
  }
}

async fn wait_for_outcome(scope: Scope, mut receiver: OutcomeReceiver) -> RefreshOutcome {
  match receiver.wait_for(Option::is_some).await {
    Ok(outcome) => (*outcome).clone().unwrap_or_else(|| {
      Err(RefreshFailure::new(
        scope,
        FailureClass::Fatal,
        "refresh finished without a result",
      ))
    }),
    Err(_) => Err(RefreshFailure::new(
      scope,
      FailureClass::Fatal,
      "refresh task ended unexpectedly",
    )),
  }
}

impl<S: CacheStorage + 'static> Inner<S> {
  fn lock_slots(&self) -> MutexGuard<'_, HashMap<Scope, ScopeSlot>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run refreshes for `scope` until no queued request remains.
  async fn drive(self: Arc<Self>, scope: Scope, mut mode: RefreshMode) {
    let mut guard = DriveGuard {
      slots: &self.slots,
      scope,
      armed: true,
    };

    loop {
      let outcome = self.run(scope, mode).await;
      match self.settle(scope, outcome) {
        Some(queued) => mode = queued,
        None => break,
      }
    }

    guard.armed = false;
  }

  /// Publish a finished refresh to its waiters and promote a queued full refresh.
  fn settle(&self, scope: Scope, outcome: RefreshOutcome) -> Option<RefreshMode> {
    let mut slots = self.lock_slots();
    let slot = slots.entry(scope).or_default();
    let finished = slot.in_flight.take()?;

    finished.result.send_replace(Some(outcome.clone()));
    slot.last = match &outcome {
      Ok(_) => ScopeState::Idle,
      Err(failure) => ScopeState::Failed(failure.class),
    };

    finished.queued_full.map(|queued| {
      slot.in_flight = Some(InFlight {
        mode: RefreshMode::Full,
        result: queued,
        queued_full: None,
      });
      RefreshMode::Full
    })
  }

  async fn run(&self, scope: Scope, mode: RefreshMode) -> RefreshOutcome {
    info!(%scope, %mode, "Refresh started");

    let result = match scope {
      Scope::Transactions => self.walk::<TransactionRecord>(mode).await,
      Scope::Notifications => self.walk::<NotificationRecord>(mode).await,
    };

    match result {
      Ok(snapshot) => {
        info!(
          %scope,
          transactions = snapshot.transactions.len(),
          notifications = snapshot.notifications.len(),
          "Refresh finished"
        );
        let _ = self.events.send(SyncEvent::SnapshotUpdated {
          scope,
          last_synced_at: snapshot.last_synced_at.unwrap_or_else(Utc::now),
          snapshot: snapshot.clone(),
        });
        Ok(snapshot)
      }
      Err(failure) => {
        warn!(%scope, class = ?failure.class, error = %failure.message, "Refresh failed");
        let _ = self.events.send(SyncEvent::RefreshFailed(failure.clone()));
        Err(failure)
      }
    }
  }

  /// Fetch and merge pages newest first. Pages merged before a failure stay merged.
  async fn walk<T: Syncable>(&self, mode: RefreshMode) -> RefreshOutcome {
    let scope = T::scope();
    let page_cap = self.settings.page_cap(mode);
    let mut cursor: Option<Cursor> = None;
    let account_id = self.current_session(scope)?.account_id;

    for page_number in 1..=page_cap {
      let session = self.current_session(scope)?;
      self.ensure_still_bound(scope, &account_id)?;
      let page = self
        .fetch_with_retry::<T>(&session, cursor.as_ref(), page_number)
        .await?;

      // Logout or account switch while the page was in flight
      self.ensure_still_bound(scope, &account_id)?;

      let overlaps = mode == RefreshMode::Incremental
        && match page.oldest() {
          Some(oldest) => self
            .cache
            .contains_for::<T>(&account_id, &oldest.cache_key())
            .map_err(|e| cache_failure(scope, e))?,
          None => false,
        };

      self
        .cache
        .merge_for(&account_id, &page)
        .map_err(|e| cache_failure(scope, e))?;
      debug!(%scope, page = page_number, items = page.items.len(), "Page merged");

      if overlaps {
        debug!(%scope, page = page_number, "Reached cached records");
        break;
      }
      match page.cursor {
        Some(next) => cursor = Some(next),
        None => break,
      }
      if page_number == page_cap {
        debug!(%scope, page_cap, "Page cap reached");
      }
    }

    self
      .cache
      .mark_synced_for(&account_id, scope, Utc::now())
      .map_err(|e| cache_failure(scope, e))?;
    self
      .cache
      .snapshot_for(&account_id)
      .map_err(|e| cache_failure(scope, e))
  }

  /// The valid session, or a reauth failure without touching the network.
  fn current_session(&self, scope: Scope) -> Result<Session, RefreshFailure> {
    match self.sessions.valid() {
      Some(session) => Ok(session),
      None => {
        // Drop an expired session so readers see it as absent
        self.sessions.invalidate();
        Err(RefreshFailure::new(
          scope,
          FailureClass::ReauthRequired,
          "no valid session",
        ))
      }
    }
  }

  /// The session and the cache binding must still belong to `account_id`.
  ///
  /// Cache writes re-check the binding themselves; this stops the walk before another fetch.
  fn ensure_still_bound(&self, scope: Scope, account_id: &str) -> Result<(), RefreshFailure> {
    let same_session = self
      .sessions
      .valid()
      .is_some_and(|current| current.account_id == account_id);
    let same_cache = self.cache.bound_account().as_deref() == Some(account_id);

    if same_session && same_cache {
      Ok(())
    } else {
      Err(session_ended(scope))
    }
  }


  /// Fetch one page, retrying transient failures with backoff.
  async fn fetch_with_retry<T: Syncable>(
    &self,
    session: &Session,
    cursor: Option<&Cursor>,
    page_number: u32,
  ) -> Result<Page<T>, RefreshFailure> {
    let scope = T::scope();
    let retry = &self.settings.retry;
    let mut attempt = 1;

    loop {
      let fetch = T::fetch(
        self.gateway.as_ref(),
        session,
        cursor,
        self.settings.page_size,
      );
      let result = match tokio::time::timeout(self.settings.request_timeout, fetch).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::NetworkUnavailable(format!(
          "request timed out after {:?}",
          self.settings.request_timeout
        ))),
      };

      match result {
        Ok(page) => return Ok(page),
        Err(err @ FetchError::Unauthorized(_)) => {
          warn!(%scope, page = page_number, "Session rejected by server");
          self.sessions.invalidate();
          return Err(RefreshFailure::from_fetch(scope, &err));
        }
        Err(err) if err.is_retryable() && retry.should_retry(attempt) => {
          let delay = retry.delay_after(attempt);
          warn!(
            %scope,
            page = page_number,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Page fetch failed, retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(RefreshFailure::from_fetch(scope, &err)),
      }
    }
  }
}

fn session_ended(scope: Scope) -> RefreshFailure {
  RefreshFailure::new(
    scope,
    FailureClass::ReauthRequired,
    "session ended during refresh",
  )
}

/// A write refused because the account was switched counts as a lost session.
fn cache_failure(scope: Scope, err: color_eyre::Report) -> RefreshFailure {
  if err.downcast_ref::<AccountUnbound>().is_some() {
    return session_ended(scope);
  }
  RefreshFailure::new(scope, FailureClass::Fatal, format!("cache error: {}", err))
}

/// Settles the scope's waiters if a driver task ends without finishing, e.g. on a panic.
struct DriveGuard<'a> {
  slots: &'a Mutex<HashMap<Scope, ScopeSlot>>,
  scope: Scope,
  armed: bool,
}

impl Drop for DriveGuard<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(slot) = slots.get_mut(&self.scope) else {
      return;
    };
    let Some(abandoned) = slot.in_flight.take() else {
      return;
    };

    warn!(scope = %self.scope, "Refresh task aborted");
    let failure = RefreshFailure::new(self.scope, FailureClass::Fatal, "refresh task aborted");
    if let Some(queued) = abandoned.queued_full {
      queued.send_replace(Some(Err(failure.clone())));
    }
    abandoned.result.send_replace(Some(Err(failure)));
    slot.last = ScopeState::Failed(FailureClass::Fatal);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::AuthError;
  use crate::remote::Credentials;
  use crate::testing::{
    bound_cache, note, page, sessions_with_valid_session, tx, HookedStorage, ScriptedGateway,
    ACCOUNT,
  };
  use async_trait::async_trait;

  fn fast_settings() -> SyncSettings {
    SyncSettings {
      page_size: 2,
      full_page_cap: 10,
      incremental_page_cap: 1,
      request_timeout: Duration::from_secs(5),
      retry: RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
      },
    }
  }

  struct Fixture {
    coordinator: SyncCoordinator,
    gateway: Arc<ScriptedGateway>,
    sessions: Arc<SessionStore>,
    cache: Arc<LocalCache>,
  }

  fn fixture_with(gateway: ScriptedGateway, settings: SyncSettings) -> Fixture {
    let gateway = Arc::new(gateway);
    let sessions = sessions_with_valid_session();
    let cache = bound_cache();
    let coordinator = SyncCoordinator::new(
      gateway.clone(),
      cache.clone(),
      sessions.clone(),
      settings,
    );
    Fixture {
      coordinator,
      gateway,
      sessions,
      cache,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(ScriptedGateway::new(), fast_settings())
  }

  fn ids(snapshot: &CacheSnapshot) -> Vec<&str> {
    snapshot
      .transactions
      .iter()
      .map(|t| t.id.as_str())
      .collect()
  }

  #[tokio::test]
  async fn test_full_refresh_walks_all_pages_with_verbatim_cursors() {
    let f = fixture();
    f.gateway
      .push_transactions(Ok(page(vec![tx("t5", 50), tx("t4", 40)], Some("c1"))));
    f.gateway
      .push_transactions(Ok(page(vec![tx("t3", 30), tx("t2", 20)], Some("c2"))));
    f.gateway.push_transactions(Ok(page(vec![tx("t1", 10)], None)));

    let snapshot = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Full)
      .await
      .unwrap();

    assert_eq!(ids(&snapshot), vec!["t5", "t4", "t3", "t2", "t1"]);
    assert!(snapshot.last_synced_at.is_some());
    assert_eq!(
      f.gateway.transaction_cursors(),
      vec![None, Some(Cursor::new("c1")), Some(Cursor::new("c2"))]
    );
    assert_eq!(f.coordinator.state(Scope::Transactions), ScopeState::Idle);
  }

  #[tokio::test]
  async fn test_full_refresh_stops_at_page_cap() {
    let mut settings = fast_settings();
    settings.full_page_cap = 2;
    let f = fixture_with(ScriptedGateway::new(), settings);
    for i in 0..5u32 {
      f.gateway.push_transactions(Ok(page(
        vec![tx(&format!("t{}", i), 50 - i)],
        Some(format!("c{}", i).as_str()),
      )));
    }

    let snapshot = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Full)
      .await
      .unwrap();
    assert_eq!(f.gateway.transaction_calls(), 2);
    assert_eq!(snapshot.transactions.len(), 2);
  }

  #[tokio::test]
  async fn test_incremental_merges_new_records_on_top() {
    let f = fixture();
    f.cache
      .merge(&page(vec![tx("t2", 5), tx("t1", 0)], None))
      .unwrap();
    f.gateway
      .push_transactions(Ok(page(vec![tx("t3", 10), tx("t2", 5)], Some("more"))));

    let snapshot = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Incremental)
      .await
      .unwrap();

    assert_eq!(ids(&snapshot), vec!["t3", "t2", "t1"]);
    assert_eq!(f.gateway.transaction_calls(), 1);
  }

  #[tokio::test]
  async fn test_incremental_stops_early_on_overlap() {
    let mut settings = fast_settings();
    settings.incremental_page_cap = 5;
    let f = fixture_with(ScriptedGateway::new(), settings);
    f.cache.merge(&page(vec![tx("t1", 0)], None)).unwrap();

    f.gateway
      .push_transactions(Ok(page(vec![tx("t3", 10), tx("t2", 5)], Some("c1"))));
    f.gateway
      .push_transactions(Ok(page(vec![tx("t1", 0)], Some("c2"))));
    f.gateway
      .push_transactions(Ok(page(vec![tx("t0", 0)], None)));

    let snapshot = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Incremental)
      .await
      .unwrap();

    // Second page ends on t1, which was already cached
    assert_eq!(f.gateway.transaction_calls(), 2);
    assert_eq!(ids(&snapshot), vec!["t3", "t2", "t1"]);
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_share_one_fetch_sequence() {
    let f = fixture_with(
      ScriptedGateway::new().with_latency(Duration::from_millis(30)),
      fast_settings(),
    );
    f.gateway
      .push_transactions(Ok(page(vec![tx("t2", 20)], Some("c1"))));
    f.gateway.push_transactions(Ok(page(vec![tx("t1", 10)], None)));

    let requests = (0..8).map(|i| {
      let mode = if i % 2 == 0 {
        RefreshMode::Full
      } else {
        RefreshMode::Incremental
      };
      f.coordinator.refresh(Scope::Transactions, mode)
    });
    let outcomes = futures::future::join_all(requests).await;

    assert_eq!(f.gateway.transaction_calls(), 2);
    let first = outcomes[0].clone().unwrap();
    for outcome in outcomes {
      assert_eq!(outcome.unwrap(), first);
    }
  }

  #[tokio::test]
  async fn test_full_request_during_incremental_is_queued_and_runs() {
    let f = fixture_with(
      ScriptedGateway::new().with_latency(Duration::from_millis(30)),
      fast_settings(),
    );
    // Incremental
    f.gateway
      .push_transactions(Ok(page(vec![tx("t9", 50)], Some("x"))));
    // Full, two pages
    f.gateway
      .push_transactions(Ok(page(vec![tx("t9", 50)], Some("c1"))));
    f.gateway.push_transactions(Ok(page(vec![tx("t8", 40)], None)));

    let incremental = {
      let coordinator = f.coordinator.clone();
      tokio::spawn(async move {
        coordinator
          .refresh(Scope::Transactions, RefreshMode::Incremental)
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(
      f.coordinator.state(Scope::Transactions),
      ScopeState::Refreshing(RefreshMode::Incremental)
    );

    let full = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Full)
      .await
      .unwrap();
    let incremental = incremental.await.unwrap().unwrap();

    assert_eq!(ids(&incremental), vec!["t9"]);
    assert_eq!(ids(&full), vec!["t9", "t8"]);
    assert_eq!(f.gateway.transaction_calls(), 3);
  }

  #[tokio::test]
  async fn test_server_error_on_second_page_keeps_first_page() {
    let f = fixture();
    f.gateway
      .push_transactions(Ok(page(vec![tx("t4", 40), tx("t3", 30)], Some("c1"))));
    for _ in 0..3 {
      f.gateway
        .push_transactions(Err(FetchError::ServerError("502".to_string())));
    }
    f.gateway
      .push_transactions(Ok(page(vec![tx("t1", 10)], None)));

    let failure = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Full)
      .await
      .unwrap_err();

    assert_eq!(failure.class, FailureClass::Transient);
    assert_eq!(f.gateway.transaction_calls(), 4);
    assert_eq!(ids(&f.cache.read_snapshot().unwrap()), vec!["t4", "t3"]);
    assert_eq!(
      f.coordinator.state(Scope::Transactions),
      ScopeState::Failed(FailureClass::Transient)
    );
  }

  #[tokio::test]
  async fn test_transient_error_recovers_within_retry_budget() {
    let f = fixture();
    f.gateway
      .push_transactions(Err(FetchError::NetworkUnavailable("offline".to_string())));
    f.gateway.push_transactions(Ok(page(vec![tx("t1", 10)], None)));

    let snapshot = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Full)
      .await
      .unwrap();
    assert_eq!(ids(&snapshot), vec!["t1"]);
    assert_eq!(f.gateway.transaction_calls(), 2);
  }

  #[tokio::test]
  async fn test_unauthorized_is_not_retried_and_invalidates_session() {
    let f = fixture();
    f.gateway
      .push_transactions(Err(FetchError::Unauthorized("401".to_string())));

    let failure = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Full)
      .await
      .unwrap_err();

    assert!(failure.requires_reauth());
    assert_eq!(f.gateway.transaction_calls(), 1);
    assert!(!f.sessions.is_valid());
    assert!(f.sessions.get().is_none());
    assert_eq!(
      f.coordinator.state(Scope::Transactions),
      ScopeState::Failed(FailureClass::ReauthRequired)
    );
  }

  #[tokio::test]
  async fn test_malformed_response_is_fatal_and_keeps_prior_pages() {
    let f = fixture();
    f.gateway
      .push_transactions(Ok(page(vec![tx("t2", 20)], Some("c1"))));
    f.gateway
      .push_transactions(Err(FetchError::MalformedResponse("eof".to_string())));

    let failure = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Full)
      .await
      .unwrap_err();

    assert_eq!(failure.class, FailureClass::Fatal);
    assert_eq!(f.gateway.transaction_calls(), 2);
    assert_eq!(ids(&f.cache.read_snapshot().unwrap()), vec!["t2"]);
  }

  #[tokio::test]
  async fn test_refresh_without_session_fails_before_network() {
    let f = fixture();
    f.sessions.invalidate();

    let failure = f
      .coordinator
      .refresh(Scope::Notifications, RefreshMode::Incremental)
      .await
      .unwrap_err();

    assert!(failure.requires_reauth());
    assert_eq!(f.gateway.notification_calls(), 0);
  }

  #[tokio::test]
  async fn test_timeout_counts_as_network_failure() {
    let mut settings = fast_settings();
    settings.request_timeout = Duration::from_millis(5);
    settings.retry.max_attempts = 2;
    let f = fixture_with(
      ScriptedGateway::new().with_latency(Duration::from_millis(200)),
      settings,
    );

    let failure = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Incremental)
      .await
      .unwrap_err();
    assert_eq!(failure.class, FailureClass::Transient);
    assert_eq!(f.gateway.transaction_calls(), 2);
  }

  #[tokio::test]
  async fn test_cancelled_waiter_does_not_stop_refresh() {
    let f = fixture_with(
      ScriptedGateway::new().with_latency(Duration::from_millis(30)),
      fast_settings(),
    );
    f.gateway.push_transactions(Ok(page(vec![tx("t1", 10)], None)));

    let abandoned = tokio::time::timeout(
      Duration::from_millis(5),
      f.coordinator
        .refresh(Scope::Transactions, RefreshMode::Full),
    )
    .await;
    assert!(abandoned.is_err());

    let snapshot = f
      .coordinator
      .refresh(Scope::Transactions, RefreshMode::Full)
      .await
      .unwrap();
    assert_eq!(ids(&snapshot), vec!["t1"]);
    assert_eq!(f.gateway.transaction_calls(), 1);
  }

  #[tokio::test]
  async fn test_scopes_refresh_independently() {
    let f = fixture_with(
      ScriptedGateway::new().with_latency(Duration::from_millis(10)),
      fast_settings(),
    );
    f.gateway.push_transactions(Ok(page(vec![tx("t1", 10)], None)));
    f.gateway
      .push_notifications(Ok(Page::last(vec![note("n1", 0)])));

    let (transactions, notifications) = tokio::join!(
      f.coordinator
        .refresh(Scope::Transactions, RefreshMode::Full),
      f.coordinator
        .refresh(Scope::Notifications, RefreshMode::Full),
    );

    assert!(transactions.is_ok());
    let snapshot = notifications.unwrap();
    assert_eq!(snapshot.notifications.len(), 1);
    assert_eq!(f.gateway.transaction_calls(), 1);
    assert_eq!(f.gateway.notification_calls(), 1);
  }

  #[tokio::test]
  async fn test_events_report_success_and_failure() {
    let f = fixture();
    let mut events = f.coordinator.subscribe();
    f.gateway.push_transactions(Ok(page(vec![tx("t1", 10)], None)));
    f.gateway
      .push_notifications(Err(FetchError::MalformedResponse("bad".to_string())));

    f.coordinator
      .refresh(Scope::Transactions, RefreshMode::Full)
      .await
      .unwrap();
    f.coordinator
      .refresh(Scope::Notifications, RefreshMode::Full)
      .await
      .unwrap_err();

    match events.recv().await.unwrap() {
      SyncEvent::SnapshotUpdated { scope, snapshot, .. } => {
        assert_eq!(scope, Scope::Transactions);
        assert_eq!(snapshot.transactions.len(), 1);
      }
      other => panic!("unexpected event {:?}", other),
    }
    match events.recv().await.unwrap() {
      SyncEvent::RefreshFailed(failure) => {
        assert_eq!(failure.scope, Scope::Notifications);
        assert_eq!(failure.class, FailureClass::Fatal);
      }
      other => panic!("unexpected event {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_logout_during_refresh_discards_in_flight_page() {
    let f = fixture_with(
      ScriptedGateway::new().with_latency(Duration::from_millis(30)),
      fast_settings(),
    );
    f.gateway.push_transactions(Ok(page(vec![tx("t1", 10)], None)));

    let refresh = {
      let coordinator = f.coordinator.clone();
      tokio::spawn(async move {
        coordinator
          .refresh(Scope::Transactions, RefreshMode::Full)
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    f.sessions.invalidate();
    f.cache.invalidate_all().unwrap();

    let failure = refresh.await.unwrap().unwrap_err();
    assert!(failure.requires_reauth());
    assert!(f.cache.read_snapshot().unwrap().transactions.is_empty());
  }

  #[tokio::test]
  async fn test_account_switch_during_refresh_never_leaks_into_new_account() {
    let (storage, hooks) = HookedStorage::new();
    let cache = Arc::new(LocalCache::new(storage, "https://pay.example/"));
    cache.bind(ACCOUNT).unwrap();
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.push_transactions(Ok(page(vec![tx("acc1-secret", 10)], None)));
    let coordinator = SyncCoordinator::new(
      gateway.clone(),
      cache.clone(),
      sessions_with_valid_session(),
      fast_settings(),
    );

    // Another login rebinds the cache while the overlap check reads the cache
    let switcher = cache.clone();
    hooks.before_get(move |_| {
      let (done_tx, done_rx) = std::sync::mpsc::channel();
      std::thread::spawn(move || {
        switcher.bind("acc-2").unwrap();
        let _ = done_tx.send(());
      });
      let _ = done_rx.recv_timeout(Duration::from_millis(100));
    });

    let _ = coordinator
      .refresh(Scope::Transactions, RefreshMode::Incremental)
      .await;

    for _ in 0..100 {
      if cache.bound_account().as_deref() == Some("acc-2") {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cache.bound_account().as_deref(), Some("acc-2"));
    assert!(cache.read_snapshot().unwrap().transactions.is_empty());
    assert!(cache
      .get::<TransactionRecord>("acc1-secret")
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_refresh_rejected_after_switch_reports_reauth() {
    let f = fixture_with(
      ScriptedGateway::new().with_latency(Duration::from_millis(30)),
      fast_settings(),
    );
    f.gateway.push_transactions(Ok(page(vec![tx("t1", 10)], None)));

    let refresh = {
      let coordinator = f.coordinator.clone();
      tokio::spawn(async move {
        coordinator
          .refresh(Scope::Transactions, RefreshMode::Full)
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    f.cache.bind("acc-2").unwrap();

    let failure = refresh.await.unwrap().unwrap_err();
    assert!(failure.requires_reauth());
    assert!(f.cache.read_snapshot().unwrap().transactions.is_empty());
  }

  struct PanickingGateway;

  #[async_trait]
  impl RemoteGateway for PanickingGateway {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<Session, AuthError> {
      Err(AuthError::InvalidCredentials)
    }

    async fn fetch_transactions(
      &self,
      _session: &Session,
      _cursor: Option<&Cursor>,
      _page_size: u32,
    ) -> Result<Page<TransactionRecord>, FetchError> {
      panic!("decoder bug");
    }

    async fn fetch_notifications(
      &self,
      _session: &Session,
      _cursor: Option<&Cursor>,
      _page_size: u32,
    ) -> Result<Page<NotificationRecord>, FetchError> {
      Ok(Page::last(Vec::new()))
    }
  }

  #[tokio::test]
  async fn test_panicking_refresh_releases_waiters_and_slot() {
    let coordinator = SyncCoordinator::new(
      Arc::new(PanickingGateway),
      bound_cache(),
      sessions_with_valid_session(),
      fast_settings(),
    );

    for _ in 0..2 {
      let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        coordinator.refresh(Scope::Transactions, RefreshMode::Full),
      )
      .await
      .expect("refresh must settle after a panic");
      assert_eq!(outcome.unwrap_err().class, FailureClass::Fatal);
    }
    assert_eq!(
      coordinator.state(Scope::Transactions),
      ScopeState::Failed(FailureClass::Fatal)
    );

    // The other scope is unaffected
    assert!(coordinator
      .refresh(Scope::Notifications, RefreshMode::Full)
      .await
      .is_ok());
  }
}
