//! Request/response abstraction over the payments API.

mod api_types;
mod client;

pub use client::HttpGateway;

use async_trait::async_trait;
use std::fmt;

use crate::error::{AuthError, FetchError};
use crate::model::{Cursor, NotificationRecord, Page, TransactionRecord};
use crate::session::Session;

/// Username and password presented to `authenticate`.
#[derive(Clone)]
pub struct Credentials {
  pub username: String,
  pub password: String,
}

impl Credentials {
  pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      username: username.into(),
      password: password.into(),
    }
  }
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("username", &self.username)
      .field("password", &"<redacted>")
      .finish()
  }
}

/// Stateless gateway to the remote service.
///
/// Page fetches are idempotent for a given cursor, so a failed call may be repeated
/// verbatim. Implementations must reject an expired session with
/// [`FetchError::Unauthorized`] without touching the network.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
  async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError>;

  async fn fetch_transactions(
    &self,
    session: &Session,
    cursor: Option<&Cursor>,
    page_size: u32,
  ) -> Result<Page<TransactionRecord>, FetchError>;

  async fn fetch_notifications(
    &self,
    session: &Session,
    cursor: Option<&Cursor>,
    page_size: u32,
  ) -> Result<Page<NotificationRecord>, FetchError>;
}
