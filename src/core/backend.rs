//! Merchant backend coordinator
//!
//! `MerchantBackend` owns the store and the exchange registry and is the
//! receiver of every operation. The operations themselves live in the
//! sibling modules (`instances`, `products`, `orders`, `payment`,
//! `tracking`, `refunds`, `tips`), each adding an `impl MerchantBackend`
//! block.
//!
//! # Architecture
//!
//! ```text
//! MerchantBackend
//!     ├── Arc<dyn MerchantDb>      (serializable transactions)
//!     ├── Arc<ExchangeRegistry>    (trusted exchanges and keys)
//!     └── BackendSettings          (currency, timeouts, retention)
//! ```
//!
//! # Concurrency
//!
//! Database transactions are synchronous closures run through
//! [`crate::db::transact`]; they never span an `.await`. Exchange calls
//! happen between transactions, under a [`RequestScope`] that carries the
//! request's deadline.

use super::scheduler::{PendingOperation, RequestScope};
use crate::config::MerchantConfig;
use crate::crypto::EddsaKeyPair;
use crate::db::{self, MemoryDb, MerchantDb, MerchantTx};
use crate::exchange::{ExchangeRegistry, ExchangeTransport};
use crate::types::{InstanceRecord, MerchantError, RelativeTime};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Ten years, in seconds
pub const DEFAULT_LEGAL_RETENTION: RelativeTime = RelativeTime::from_secs(10 * 365 * 24 * 60 * 60);

/// Process-wide settings the operations consult
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    /// Currency every order must be priced in
    pub currency: String,
    /// Public base URL, used to build `taler://` URIs
    pub base_url: String,
    /// How long paid contracts must be kept
    pub legal_retention: RelativeTime,
    /// Overall deadline of a request that waits on exchanges
    pub request_timeout: Duration,
    /// Attempts per storage transaction
    pub max_retries: u32,
}

impl BackendSettings {
    pub fn new(currency: &str, base_url: &str) -> Self {
        Self {
            currency: currency.to_string(),
            base_url: base_url.to_string(),
            legal_retention: DEFAULT_LEGAL_RETENTION,
            request_timeout: super::scheduler::DEFAULT_REQUEST_TIMEOUT,
            max_retries: db::MAX_RETRIES,
        }
    }

    /// Host part of the base URL, as used in `taler://` URIs
    pub fn public_host(&self) -> &str {
        let without_scheme = self
            .base_url
            .strip_prefix("https://")
            .or_else(|| self.base_url.strip_prefix("http://"))
            .unwrap_or(&self.base_url);
        without_scheme.trim_end_matches('/')
    }
}

/// Coordinator owning storage and exchange access
pub struct MerchantBackend {
    db: Arc<dyn MerchantDb>,
    exchanges: Arc<ExchangeRegistry>,
    settings: BackendSettings,
}

impl std::fmt::Debug for MerchantBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerchantBackend")
            .field("settings", &self.settings)
            .field("exchanges", &self.exchanges.urls())
            .finish_non_exhaustive()
    }
}

impl MerchantBackend {
    /// Assemble a backend from its parts
    ///
    /// # Arguments
    ///
    /// * `db` - store shared with the exchange registry
    /// * `exchanges` - registry of trusted exchanges
    /// * `settings` - process-wide settings
    pub fn new(
        db: Arc<dyn MerchantDb>,
        exchanges: Arc<ExchangeRegistry>,
        settings: BackendSettings,
    ) -> Self {
        Self {
            db,
            exchanges,
            settings,
        }
    }

    /// Build a backend from validated configuration
    ///
    /// Only the in-memory store is available, so the database string is
    /// checked by [`MerchantConfig::validate`] rather than here.
    pub fn from_config(config: &MerchantConfig, transport: Arc<dyn ExchangeTransport>) -> Self {
        let db: Arc<dyn MerchantDb> = Arc::new(MemoryDb::new());
        let settings = BackendSettings {
            currency: config.currency.clone(),
            base_url: config.base_url.clone(),
            legal_retention: RelativeTime::from_secs(config.legal_retention),
            request_timeout: Duration::from_secs(config.exchange_timeout),
            max_retries: config.max_retries,
        };
        let exchanges = Arc::new(ExchangeRegistry::new(
            transport,
            db.clone(),
            settings.request_timeout,
            settings.max_retries,
        ));
        for exchange in &config.exchanges {
            exchanges.add_trusted(&exchange.url, exchange.master_public_key);
        }
        info!(
            currency = %settings.currency,
            exchanges = config.exchanges.len(),
            "Merchant backend configured"
        );
        Self::new(db, exchanges, settings)
    }

    pub fn db(&self) -> &dyn MerchantDb {
        self.db.as_ref()
    }

    pub fn exchanges(&self) -> &Arc<ExchangeRegistry> {
        &self.exchanges
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// Begin downloading keys from every trusted exchange
    pub fn start(&self) -> Vec<PendingOperation<()>> {
        self.exchanges.start()
    }

    pub fn shutdown(&self) {
        self.exchanges.shutdown();
    }

    /// Run `body` in a transaction with the configured retry policy
    pub(crate) fn transact<T, F>(&self, name: &str, body: F) -> Result<T, MerchantError>
    where
        F: FnMut(&mut dyn MerchantTx) -> Result<T, MerchantError>,
    {
        db::transact(self.db.as_ref(), name, self.settings.max_retries, body)
    }

    /// Fresh scope for a request that will wait on exchanges
    pub(crate) fn scope(&self) -> RequestScope {
        RequestScope::new(self.settings.request_timeout)
    }
}

/// Load an instance or fail with `InstanceUnknown`
pub(crate) fn load_instance(
    tx: &mut dyn MerchantTx,
    instance: &str,
) -> Result<InstanceRecord, MerchantError> {
    tx.lookup_instance(instance)?
        .ok_or_else(|| MerchantError::instance_unknown(instance))
}

/// Signing key of an instance, `InstanceInactive` if it was deleted
pub(crate) fn instance_keypair(record: &InstanceRecord) -> Result<EddsaKeyPair, MerchantError> {
    record
        .merchant_priv
        .as_ref()
        .map(EddsaKeyPair::from_private)
        .ok_or_else(|| MerchantError::InstanceInactive {
            instance: record.settings.id.clone(),
        })
}
