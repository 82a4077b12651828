//! In-memory holder of the current authentication credential.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::RwLock;
use tracing::{debug, warn};

/// An authenticated session for one account.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
  credential: String,
  pub issued_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub account_id: String,
}

impl Session {
  pub fn new(
    credential: impl Into<String>,
    account_id: impl Into<String>,
    issued_at: DateTime<Utc>,
    ttl: Duration,
  ) -> Self {
    Self {
      credential: credential.into(),
      issued_at,
      expires_at: issued_at + ttl,
      account_id: account_id.into(),
    }
  }

  /// The opaque token attached to outgoing requests.
  pub fn credential(&self) -> &str {
    &self.credential
  }

  pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    now < self.expires_at
  }

  pub fn is_valid(&self) -> bool {
    self.is_valid_at(Utc::now())
  }
}

// Keeps the token out of logs.
impl fmt::Debug for Session {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Session")
      .field("credential", &"<redacted>")
      .field("issued_at", &self.issued_at)
      .field("expires_at", &self.expires_at)
      .field("account_id", &self.account_id)
      .finish()
  }
}

/// Holds at most one session. Many readers, one writer at a time.
#[derive(Debug, Default)]
pub struct SessionStore {
  current: RwLock<Option<Session>>,
}

impl SessionStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replace the current session.
  pub fn set(&self, session: Session) {
    debug!(account = %session.account_id, expires_at = %session.expires_at, "Session set");
    match self.current.write() {
      Ok(mut guard) => *guard = Some(session),
      Err(poisoned) => *poisoned.into_inner() = Some(session),
    }
  }

  /// The current session, expired or not.
  pub fn get(&self) -> Option<Session> {
    match self.current.read() {
      Ok(guard) => guard.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  /// The current session only if it has not expired.
  pub fn valid(&self) -> Option<Session> {
    self.get().filter(Session::is_valid)
  }

  pub fn is_valid(&self) -> bool {
    self.valid().is_some()
  }

  pub fn invalidate(&self) {
    let previous = match self.current.write() {
      Ok(mut guard) => guard.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(session) = previous {
      warn!(account = %session.account_id, "Session invalidated");
    }
  }
}
