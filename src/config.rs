use chrono::Duration as ChronoDuration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub session: SessionConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub url: Url,
  pub username: String,
  /// Tenant sent as `Fineract-Platform-TenantId` when set
  pub tenant: Option<String>,
  /// Authorization scheme prefixed to the session credential
  #[serde(default = "default_auth_scheme")]
  pub auth_scheme: String,
  /// Receipt locator prefix; the transaction id is appended
  pub receipt_url: Url,
}

fn default_auth_scheme() -> String {
  "Basic".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub page_size: u32,
  /// Upper bound on pages walked by a full refresh
  pub full_page_cap: u32,
  /// Upper bound on pages walked by an incremental refresh
  pub incremental_page_cap: u32,
  pub request_timeout_secs: u64,
  pub retry: RetryConfig,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      page_size: 20,
      full_page_cap: 50,
      incremental_page_cap: 1,
      request_timeout_secs: 15,
      retry: RetryConfig::default(),
    }
  }
}

impl SyncConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Attempts per page, including the first one
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 500,
      max_delay_ms: 8_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
  /// Session lifetime assumed when the server does not report one
  pub default_ttl_secs: i64,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: 30 * 60,
    }
  }
}

impl SessionConfig {
  pub fn default_ttl(&self) -> ChronoDuration {
    ChronoDuration::seconds(self.default_ttl_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Database file; defaults to the platform data directory
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./paysync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/paysync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/paysync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("paysync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("paysync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.sync.page_size == 0 {
      return Err(eyre!("sync.page_size must be greater than zero"));
    }
    if self.sync.full_page_cap == 0 || self.sync.incremental_page_cap == 0 {
      return Err(eyre!("sync page caps must be greater than zero"));
    }
    if self.sync.retry.max_attempts == 0 {
      return Err(eyre!("sync.retry.max_attempts must be at least 1"));
    }
    Ok(())
  }

  /// Get the account password from environment variables.
  ///
  /// Checks PAYSYNC_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("PAYSYNC_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set PAYSYNC_PASSWORD environment variable."))
  }
}
