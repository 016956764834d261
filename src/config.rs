//! Backend configuration
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! currency = "EUR"
//! base_url = "https://shop.example.com/"
//! port = 9966
//!
//! [[exchanges]]
//! url = "https://exchange.example.com/"
//! master_public_key = "..."
//! ```

use crate::exchange::normalize_url;
use crate::types::MasterPublicKey;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Longest currency code the amount encoding can carry
pub const MAX_CURRENCY_LEN: usize = 11;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value for '{field}': {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// An exchange the backend accepts coins from
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExchangeConfig {
    pub url: String,
    pub master_public_key: MasterPublicKey,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MerchantConfig {
    /// Currency every order is priced in
    pub currency: String,
    /// Storage connection string
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL of the backend
    pub base_url: String,
    /// Seconds a paid contract must be kept before it may be deleted
    #[serde(default = "default_legal_retention")]
    pub legal_retention: u64,
    /// Seconds a request may wait on exchanges
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
}

fn default_database() -> String {
    "memory://".to_string()
}

fn default_port() -> u16 {
    9966
}

fn default_legal_retention() -> u64 {
    crate::core::backend::DEFAULT_LEGAL_RETENTION.as_secs()
}

fn default_exchange_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    crate::db::MAX_RETRIES
}

impl MerchantConfig {
    /// Read, parse and validate the configuration at `path`
    ///
    /// # Errors
    ///
    /// `ConfigError::Io` if the file cannot be read, `Parse` for TOML or
    /// type errors, `Invalid` if a value fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.currency.is_empty() {
            return Err(ConfigError::invalid("currency", "must not be empty"));
        }
        if self.currency.len() > MAX_CURRENCY_LEN
            || !self.currency.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(ConfigError::invalid(
                "currency",
                format!("'{}' is not an upper-case code of at most {} letters", self.currency, MAX_CURRENCY_LEN),
            ));
        }
        if self.database != "memory://" {
            return Err(ConfigError::invalid(
                "database",
                format!("unsupported storage '{}', only memory:// is available", self.database),
            ));
        }
        if !is_http_url(&self.base_url) {
            return Err(ConfigError::invalid("base_url", "must be an http(s) URL"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::invalid("max_retries", "must be at least 1"));
        }
        if self.exchange_timeout == 0 {
            return Err(ConfigError::invalid("exchange_timeout", "must be at least 1 second"));
        }

        let mut seen = HashSet::new();
        for exchange in &self.exchanges {
            if !is_http_url(&exchange.url) {
                return Err(ConfigError::invalid(
                    "exchanges.url",
                    format!("'{}' is not an http(s) URL", exchange.url),
                ));
            }
            if !seen.insert(normalize_url(&exchange.url)) {
                return Err(ConfigError::invalid(
                    "exchanges.url",
                    format!("'{}' is listed twice", exchange.url),
                ));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for MerchantConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: MerchantConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    const MASTER: &str = "0000000000000000000000000000000000000000000000000000";

    fn minimal() -> String {
        format!(
            r#"
currency = "EUR"
base_url = "https://shop.example.com/"

[[exchanges]]
url = "https://exchange.example.com/"
master_public_key = "{MASTER}"
"#
        )
    }

    #[test]
    fn test_defaults_applied() {
        let config: MerchantConfig = minimal().parse().unwrap();
        assert_eq!(config.currency, "EUR");
        assert_eq!(config.database, "memory://");
        assert_eq!(config.port, 9966);
        assert_eq!(config.legal_retention, 10 * 365 * 24 * 60 * 60);
        assert_eq!(config.exchange_timeout, 30);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.exchanges.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal().as_bytes()).unwrap();
        let config = MerchantConfig::load(file.path()).unwrap();
        assert_eq!(config.base_url, "https://shop.example.com/");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = MerchantConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_malformed_master_key_rejected() {
        let text = minimal().replace(MASTER, "not-base32!");
        assert!(matches!(text.parse::<MerchantConfig>(), Err(ConfigError::Parse(_))));
    }

    #[rstest]
    #[case::empty_currency("currency = \"EUR\"", "currency = \"\"", "currency")]
    #[case::long_currency("currency = \"EUR\"", "currency = \"ABCDEFGHIJKL\"", "currency")]
    #[case::lower_currency("currency = \"EUR\"", "currency = \"eur\"", "currency")]
    #[case::bad_base_url(
        "base_url = \"https://shop.example.com/\"",
        "base_url = \"shop.example.com\"",
        "base_url"
    )]
    #[case::ftp_exchange(
        "url = \"https://exchange.example.com/\"",
        "url = \"ftp://exchange.example.com/\"",
        "exchanges.url"
    )]
    #[case::postgres(
        "currency = \"EUR\"",
        "currency = \"EUR\"\ndatabase = \"postgres:///taler\"",
        "database"
    )]
    #[case::zero_retries("currency = \"EUR\"", "currency = \"EUR\"\nmax_retries = 0", "max_retries")]
    fn test_invalid_values(#[case] from: &str, #[case] to: &str, #[case] expected_field: &str) {
        let text = minimal().replace(from, to);
        match text.parse::<MerchantConfig>() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("Expected invalid {}, got {:?}", expected_field, other),
        }
    }

    #[test]
    fn test_duplicate_exchange_rejected() {
        let text = format!(
            "{}\n[[exchanges]]\nurl = \"https://exchange.example.com\"\nmaster_public_key = \"{MASTER}\"\n",
            minimal()
        );
        assert!(matches!(
            text.parse::<MerchantConfig>(),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
