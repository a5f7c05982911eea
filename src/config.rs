//! Configuration for the cardvault service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::GiftCard;

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Socket address the HTTP server listens on.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Order store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Transaction-format policy applied before verification.
    #[serde(default)]
    pub payment: PaymentPolicy,

    /// Fulfillment mailer configuration.
    #[serde(default)]
    pub mailer: MailerConfig,

    /// Card catalog entries.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Order store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Bounded timeout for a single store operation, in milliseconds.
    /// A timeout surfaces as a retryable error, not a rejection.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl StoreConfig {
    /// Operation timeout as a [`Duration`].
    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Format policy for submitted UPI transaction ids.
///
/// A violation is reported as a distinct, actionable rejection before the
/// store is consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPolicy {
    /// Minimum accepted transaction-id length.
    #[serde(default = "default_min_txn_length")]
    pub min_txn_length: usize,

    /// Required transaction-id prefix, if any (e.g. `UPI`).
    #[serde(default)]
    pub required_txn_prefix: Option<String>,
}

impl PaymentPolicy {
    /// Check a transaction id against the policy. Returns a description of
    /// the violation, or `None` if the id is acceptable.
    #[must_use]
    pub fn violation(&self, txn_id: &str) -> Option<String> {
        if txn_id.len() < self.min_txn_length {
            return Some(format!(
                "transaction id must be at least {} characters",
                self.min_txn_length
            ));
        }
        if let Some(prefix) = &self.required_txn_prefix {
            if !txn_id.starts_with(prefix.as_str()) {
                return Some(format!("transaction id must start with {prefix}"));
            }
        }
        None
    }
}

/// Fulfillment mailer configuration.
///
/// Credentials are consumed here, never hardcoded; the API token normally
/// arrives via the CLI environment override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailerConfig {
    /// Enable dispatch. When disabled, deliveries are logged and skipped.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP mail-API endpoint to post messages to.
    #[serde(default)]
    pub api_url: String,

    /// Sender address.
    #[serde(default = "default_from_address")]
    pub from_address: String,

    /// Bearer token for the mail API.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_mail_timeout_secs")]
    pub timeout_secs: u64,

    /// Dispatch attempts per order before flagging for manual redelivery.
    #[serde(default = "default_mail_attempts")]
    pub max_attempts: u32,

    /// Base backoff between dispatch attempts, in milliseconds.
    #[serde(default = "default_mail_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl MailerConfig {
    /// Backoff between dispatch attempts as a [`Duration`].
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Card catalog entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Cards available for sale. Each is a single-unit item.
    #[serde(default)]
    pub cards: Vec<GiftCard>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            store: StoreConfig::default(),
            payment: PaymentPolicy::default(),
            mailer: MailerConfig::default(),
            catalog: CatalogConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self {
            min_txn_length: default_min_txn_length(),
            required_txn_prefix: None,
        }
    }
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: String::new(),
            from_address: default_from_address(),
            api_token: None,
            timeout_secs: default_mail_timeout_secs(),
            max_attempts: default_mail_attempts(),
            retry_backoff_ms: default_mail_backoff_ms(),
        }
    }
}

fn default_bind() -> SocketAddr {
    ([127, 0, 0, 1], 4000).into()
}

fn default_store_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "cardvault")
        .map(|dirs| dirs.data_dir().join("orders.db"))
        .unwrap_or_else(|| PathBuf::from(".cardvault/orders.db"))
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_op_timeout_ms() -> u64 {
    3000
}

const fn default_min_txn_length() -> usize {
    8
}

fn default_from_address() -> String {
    "Gift Cards <no-reply@cardvault.local>".to_string()
}

const fn default_mail_timeout_secs() -> u64 {
    10
}

const fn default_mail_attempts() -> u32 {
    3
}

const fn default_mail_backoff_ms() -> u64 {
    500
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
