use async_trait::async_trait;
use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::api_types::{ApiAuthRequest, ApiAuthResponse, ApiNotification, ApiPage, ApiTransaction};
use super::{Credentials, RemoteGateway};
use crate::config::Config;
use crate::error::{AuthError, FetchError};
use crate::model::{Cursor, NotificationRecord, Page, TransactionRecord};
use crate::session::Session;

const TENANT_HEADER: &str = "Fineract-Platform-TenantId";

/// Payments API client over HTTP
#[derive(Clone)]
pub struct HttpGateway {
  http: reqwest::Client,
  base_url: Url,
  tenant: Option<String>,
  auth_scheme: String,
  default_ttl: Duration,
}

impl HttpGateway {
  pub fn new(config: &Config) -> Result<Self> {
    if config.server.url.cannot_be_a_base() {
      return Err(eyre!("Server URL {} cannot be a base URL", config.server.url));
    }

    // The per-request timeout surfaces as a network failure
    let http = reqwest::Client::builder()
      .timeout(config.sync.request_timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: config.server.url.clone(),
      tenant: config.server.tenant.clone(),
      auth_scheme: config.server.auth_scheme.clone(),
      default_ttl: config.session.default_ttl(),
    })
  }

  fn endpoint(&self, segments: &[&str]) -> std::result::Result<Url, String> {
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| format!("{} cannot be a base URL", self.base_url))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  /// URL of one page of an account's collection.
  fn page_url(
    &self,
    account_id: &str,
    collection: &str,
    cursor: Option<&Cursor>,
    page_size: u32,
  ) -> std::result::Result<Url, FetchError> {
    let mut url = self
      .endpoint(&["accounts", account_id, collection])
      .map_err(FetchError::MalformedResponse)?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("pageSize", &page_size.to_string());
      if let Some(cursor) = cursor {
        query.append_pair("cursor", cursor.as_str());
      }
    }
    Ok(url)
  }

  fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
    let builder = self
      .http
      .request(method, url)
      .header(ACCEPT, "application/json");
    match &self.tenant {
      Some(tenant) => builder.header(TENANT_HEADER, tenant),
      None => builder,
    }
  }

  async fn fetch_page<A, T>(
    &self,
    session: &Session,
    collection: &str,
    cursor: Option<&Cursor>,
    page_size: u32,
  ) -> std::result::Result<Page<T>, FetchError>
  where
    A: DeserializeOwned,
    T: From<A>,
  {
    if !session.is_valid() {
      return Err(FetchError::Unauthorized("session expired".to_string()));
    }

    let url = self.page_url(&session.account_id, collection, cursor, page_size)?;
    debug!(collection, has_cursor = cursor.is_some(), page_size, "Fetching page");

    let response = self
      .request(reqwest::Method::GET, url)
      .header(
        AUTHORIZATION,
        format!("{} {}", self.auth_scheme, session.credential()),
      )
      .send()
      .await
      .map_err(transport_error)?;

    if let Some(err) = fetch_status_error(response.status()) {
      return Err(err);
    }

    let body = response.bytes().await.map_err(transport_error)?;
    let api: ApiPage<A> = serde_json::from_slice(&body)
      .map_err(|e| FetchError::MalformedResponse(format!("{} page: {}", collection, e)))?;

    Ok(api.into_page(T::from))
  }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
  async fn authenticate(&self, credentials: &Credentials) -> std::result::Result<Session, AuthError> {
    let url = self
      .endpoint(&["authentication"])
      .map_err(AuthError::ServerError)?;
    debug!(username = %credentials.username, "Authenticating");

    let response = self
      .request(reqwest::Method::POST, url)
      .json(&ApiAuthRequest {
        username: &credentials.username,
        password: &credentials.password,
      })
      .send()
      .await
      .map_err(|e| AuthError::NetworkUnavailable(e.to_string()))?;

    if let Some(err) = auth_status_error(response.status()) {
      return Err(err);
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| AuthError::NetworkUnavailable(e.to_string()))?;
    let api: ApiAuthResponse = serde_json::from_slice(&body)
      .map_err(|e| AuthError::ServerError(format!("unreadable authentication response: {}", e)))?;

    let ttl = api
      .expires_in
      .map(Duration::seconds)
      .unwrap_or(self.default_ttl);

    Ok(Session::new(
      api.authentication_key,
      api.account_id,
      Utc::now(),
      ttl,
    ))
  }

  async fn fetch_transactions(
    &self,
    session: &Session,
    cursor: Option<&Cursor>,
    page_size: u32,
  ) -> std::result::Result<Page<TransactionRecord>, FetchError> {
    self
      .fetch_page::<ApiTransaction, TransactionRecord>(session, "transactions", cursor, page_size)
      .await
  }

  async fn fetch_notifications(
    &self,
    session: &Session,
    cursor: Option<&Cursor>,
    page_size: u32,
  ) -> std::result::Result<Page<NotificationRecord>, FetchError> {
    self
      .fetch_page::<ApiNotification, NotificationRecord>(session, "notifications", cursor, page_size)
      .await
  }
}

/// Map a non-success page status to its fetch error class.
fn fetch_status_error(status: StatusCode) -> Option<FetchError> {
  if status.is_success() {
    return None;
  }
  Some(match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Unauthorized(status.to_string()),
    StatusCode::TOO_MANY_REQUESTS => FetchError::ServerError(status.to_string()),
    s if s.is_server_error() => FetchError::ServerError(s.to_string()),
    s => FetchError::MalformedResponse(format!("unexpected status {}", s)),
  })
}

fn auth_status_error(status: StatusCode) -> Option<AuthError> {
  if status.is_success() {
    return None;
  }
  Some(match status {
    StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
      AuthError::InvalidCredentials
    }
    s => AuthError::ServerError(s.to_string()),
  })
}

/// Connection failures and timeouts are transient; a body that fails to decode is not.
fn transport_error(err: reqwest::Error) -> FetchError {
  if err.is_decode() {
    FetchError::MalformedResponse(err.to_string())
  } else {
    FetchError::NetworkUnavailable(err.to_string())
  }
}
