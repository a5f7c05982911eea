//! Command-line interface definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use cardvault::config::ServiceConfig;
use clap::Parser;

/// Order and UPI payment-verification service for single-unit gift cards.
#[derive(Parser, Debug)]
#[command(name = "cardvault")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address to listen on.
    #[arg(long, short, env = "CARDVAULT_BIND")]
    pub bind: Option<SocketAddr>,

    /// Path to the SQLite order database.
    #[arg(long, env = "CARDVAULT_DB")]
    pub database: Option<PathBuf>,

    /// Minimum accepted transaction-id length.
    #[arg(long, env = "CARDVAULT_MIN_TXN_LENGTH")]
    pub min_txn_length: Option<usize>,

    /// Required transaction-id prefix (e.g. "UPI").
    #[arg(long, env = "CARDVAULT_TXN_PREFIX")]
    pub txn_prefix: Option<String>,

    /// Enable fulfillment email dispatch.
    #[arg(long, env = "CARDVAULT_MAIL_ENABLED")]
    pub mail_enabled: bool,

    /// Bearer token for the mail API.
    #[arg(long, env = "CARDVAULT_MAIL_TOKEN", hide_env_values = true)]
    pub mail_token: Option<String>,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Convert CLI arguments into a `ServiceConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<ServiceConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            ServiceConfig::from_file(path)?
        } else {
            ServiceConfig::default()
        };

        // Override with CLI arguments
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(database) = self.database {
            config.store.path = database;
        }
        if let Some(min_txn_length) = self.min_txn_length {
            config.payment.min_txn_length = min_txn_length;
        }
        if let Some(prefix) = self.txn_prefix {
            config.payment.required_txn_prefix = Some(prefix);
        }
        if self.mail_enabled {
            config.mailer.enabled = true;
        }
        if let Some(token) = self.mail_token {
            config.mailer.api_token = Some(token);
        }
        config.log_level = self.log_level;

        Ok(config)
    }
}
