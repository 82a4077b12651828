//! Error taxonomy for authentication, page fetches, refreshes and reference resolution.

use thiserror::Error;

use crate::model::{RecordKind, Scope};

/// Failure of an authentication attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
  #[error("Invalid credentials")]
  InvalidCredentials,

  #[error("Network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("Server error: {0}")]
  ServerError(String),
}

/// Failure of a single page fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// Session expired or rejected. The caller must re-authenticate.
  #[error("Unauthorized: {0}")]
  Unauthorized(String),

  #[error("Network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("Server error: {0}")]
  ServerError(String),

  #[error("Malformed response: {0}")]
  MalformedResponse(String),
}

impl FetchError {
  /// Transient failures may be retried with the same cursor.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      FetchError::NetworkUnavailable(_) | FetchError::ServerError(_)
    )
  }

  /// How a refresh that ends on this error is reported upward.
  pub fn class(&self) -> FailureClass {
    match self {
      FetchError::Unauthorized(_) => FailureClass::ReauthRequired,
      FetchError::NetworkUnavailable(_) | FetchError::ServerError(_) => FailureClass::Transient,
      FetchError::MalformedResponse(_) => FailureClass::Fatal,
    }
  }
}

/// Classification the presentation layer picks its error state from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
  /// "Please sign in again"
  ReauthRequired,
  /// "Tap to retry"
  Transient,
  /// Generic error state
  Fatal,
}

/// Terminal failure of a refresh, shared by every caller that waited on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{scope} refresh failed ({class:?}): {message}")]
pub struct RefreshFailure {
  pub scope: Scope,
  pub class: FailureClass,
  pub message: String,
}

impl RefreshFailure {
  pub fn new(scope: Scope, class: FailureClass, message: impl Into<String>) -> Self {
    Self {
      scope,
      class,
      message: message.into(),
    }
  }

  pub fn from_fetch(scope: Scope, error: &FetchError) -> Self {
    Self::new(scope, error.class(), error.to_string())
  }

  pub fn requires_reauth(&self) -> bool {
    self.class == FailureClass::ReauthRequired
  }
}

/// Failure to turn a reference into a navigation target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
  #[error("{kind} '{id}' not found")]
  NotFound { kind: RecordKind, id: String },

  #[error("Unrecognized link: {0}")]
  UnrecognizedLink(String),

  #[error("Cache error: {0}")]
  Cache(String),
}

impl ResolveError {
  pub fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
    Self::NotFound {
      kind,
      id: id.into(),
    }
  }
}
