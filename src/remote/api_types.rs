//! Serde-deserializable types matching the payments API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::model::{
  Cursor, NotificationRecord, Page, TransactionRecord, TransactionStatus,
};

/// Ids arrive as strings from some deployments and as numbers from others.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Id {
    Text(String),
    Number(i64),
  }

  Ok(match Id::deserialize(deserializer)? {
    Id::Text(s) => s,
    Id::Number(n) => n.to_string(),
  })
}

// ============================================================================
// Authentication endpoint
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiAuthRequest<'a> {
  pub username: &'a str,
  pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ApiAuthResponse {
  #[serde(rename = "authenticationKey")]
  pub authentication_key: String,
  #[serde(rename = "accountId", deserialize_with = "string_or_number")]
  pub account_id: String,
  /// Lifetime in seconds; absent when the server does not expire keys
  #[serde(rename = "expiresIn")]
  pub expires_in: Option<i64>,
}

// ============================================================================
// Paged list endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiPage<T> {
  #[serde(default = "Vec::new")]
  pub items: Vec<T>,
  #[serde(rename = "nextCursor")]
  pub next_cursor: Option<String>,
}

impl<T> ApiPage<T> {
  pub fn into_page<U>(self, convert: impl Fn(T) -> U) -> Page<U> {
    Page {
      items: self.items.into_iter().map(convert).collect(),
      // An empty cursor string means the same as a missing one
      cursor: self.next_cursor.filter(|c| !c.is_empty()).map(Cursor::new),
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApiTransactionStatus {
  #[serde(alias = "pending", alias = "PROCESSING")]
  Pending,
  #[serde(alias = "completed", alias = "SUCCESS")]
  Completed,
  #[serde(alias = "failed", alias = "REJECTED")]
  Failed,
}

impl From<ApiTransactionStatus> for TransactionStatus {
  fn from(status: ApiTransactionStatus) -> Self {
    match status {
      ApiTransactionStatus::Pending => TransactionStatus::Pending,
      ApiTransactionStatus::Completed => TransactionStatus::Completed,
      ApiTransactionStatus::Failed => TransactionStatus::Failed,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiTransaction {
  #[serde(deserialize_with = "string_or_number")]
  pub id: String,
  pub amount: f64,
  pub currency: String,
  #[serde(rename = "counterpartyRef", default)]
  pub counterparty_ref: String,
  pub timestamp: DateTime<Utc>,
  pub status: ApiTransactionStatus,
}

impl From<ApiTransaction> for TransactionRecord {
  fn from(api: ApiTransaction) -> Self {
    TransactionRecord {
      id: api.id,
      amount: api.amount,
      currency: api.currency,
      counterparty_ref: api.counterparty_ref,
      timestamp: api.timestamp,
      status: api.status.into(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiNotification {
  #[serde(deserialize_with = "string_or_number")]
  pub id: String,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub body: String,
  pub timestamp: DateTime<Utc>,
  #[serde(default)]
  pub read: bool,
}

impl From<ApiNotification> for NotificationRecord {
  fn from(api: ApiNotification) -> Self {
    NotificationRecord {
      id: api.id,
      title: api.title,
      body: api.body,
      timestamp: api.timestamp,
      read: api.read,
    }
  }
}
