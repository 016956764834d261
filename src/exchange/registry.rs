//! Trusted exchanges and their key material
//!
//! The registry owns one [`ExchangeHandle`] per trusted base URL. A handle
//! becomes *ready* once a `/keys` download signed by the configured
//! master key succeeded; until then operations that need the exchange
//! either fail fast ([`ExchangeRegistry::lookup_ready`]) or wait for it
//! with a timeout ([`ExchangeRegistry::find_exchange`]).
//!
//! # Architecture
//!
//! ```text
//! ExchangeRegistry
//!     ├── DashMap<url, Arc<ExchangeHandle>>
//!     │       ├── ExchangeClient            (typed HTTP)
//!     │       ├── watch<Option<KeysSnapshot>> (readiness + current keys)
//!     │       └── EndpointLimits            (one call in flight per endpoint class)
//!     └── Arc<dyn MerchantDb>               (wire fee statements)
//! ```
//!
//! A new `/keys` reply replaces the snapshot atomically; readers hold an
//! `Arc` to the snapshot they started with.

use super::client::{ExchangeClient, ExchangeError, ExchangeTransport};
use super::wire::{DenominationEntry, KeysResponse, SignKeyEntry, WireResponse};
use crate::core::scheduler::PendingOperation;
use crate::crypto::signatures::{self, CryptoError, DenominationTerms, SignedMessage};
use crate::crypto::hash_wire_method;
use crate::db::{self, DbError, MerchantDb};
use crate::types::{
    Blob, EddsaSignature, ExchangePublicKey, HashCode, MasterPublicKey, MerchantError, Timestamp,
    WireFeeRecord,
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before the first `/keys` retry
pub const KEYS_RETRY_INITIAL: Duration = Duration::from_secs(1);

/// Upper bound for the `/keys` retry delay
pub const KEYS_RETRY_MAX: Duration = Duration::from_secs(60);

/// Normalize a base URL so endpoint paths can be appended
pub fn normalize_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

/// Verified key material of one exchange
#[derive(Debug, Clone, PartialEq)]
pub struct KeysSnapshot {
    pub master_pub: MasterPublicKey,
    pub signkeys: Vec<SignKeyEntry>,
    pub denoms: BTreeMap<HashCode, DenominationEntry>,
    pub list_issue_date: Timestamp,
}

impl KeysSnapshot {
    /// Check a `/keys` reply against the trusted master key
    ///
    /// Entries whose master signature does not verify are dropped with a
    /// warning; the rest of the key set stays usable.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::MasterKeyMismatch`] if the reply names another master key.
    pub fn verify(
        url: &str,
        trusted: &MasterPublicKey,
        keys: KeysResponse,
    ) -> Result<Self, ExchangeError> {
        if &keys.master_public_key != trusted {
            return Err(ExchangeError::MasterKeyMismatch {
                url: url.to_string(),
            });
        }
        let master = trusted.as_bytes();

        let signkeys = keys
            .signkeys
            .into_iter()
            .filter(|sk| {
                let msg = signatures::signing_key_validity(
                    trusted,
                    sk.stamp_start,
                    sk.stamp_expire,
                    sk.stamp_end,
                    &sk.key,
                );
                let ok = signatures::verify(master, &msg, &sk.master_sig).is_ok();
                if !ok {
                    warn!(exchange = url, key = %sk.key, "Dropping signing key with invalid master signature");
                }
                ok
            })
            .collect();

        let mut denoms = BTreeMap::new();
        for denom in keys.denoms {
            let h_denom_pub = denom.denom_pub_hash();
            let terms = DenominationTerms {
                value: &denom.value,
                fee_withdraw: &denom.fee_withdraw,
                fee_deposit: &denom.fee_deposit,
                fee_refresh: &denom.fee_refresh,
                fee_refund: &denom.fee_refund,
                stamp_start: denom.stamp_start,
                stamp_expire_withdraw: denom.stamp_expire_withdraw,
                stamp_expire_deposit: denom.stamp_expire_deposit,
                stamp_expire_legal: denom.stamp_expire_legal,
            };
            let msg = signatures::denomination_validity(trusted, &terms, &h_denom_pub);
            if signatures::verify(master, &msg, &denom.master_sig).is_err() {
                warn!(exchange = url, denomination = %h_denom_pub, "Dropping denomination with invalid master signature");
                continue;
            }
            denoms.insert(h_denom_pub, denom);
        }

        Ok(Self {
            master_pub: keys.master_public_key,
            signkeys,
            denoms,
            list_issue_date: keys.list_issue_date,
        })
    }

    /// Denomination with the given public key hash
    pub fn denomination(&self, h_denom_pub: &HashCode) -> Option<&DenominationEntry> {
        self.denoms.get(h_denom_pub)
    }

    /// Denomination with the given public key
    pub fn denomination_by_pub(&self, denom_pub: &Blob) -> Option<&DenominationEntry> {
        self.denoms.get(&crate::crypto::canonical::sha512(denom_pub.as_bytes()))
    }

    /// Verify a signature made with one of the exchange's online signing keys
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidPublicKey`] if `exchange_pub` is not a
    /// certified signing key, otherwise the verification failure.
    pub fn verify_exchange_signature(
        &self,
        exchange_pub: &ExchangePublicKey,
        message: &SignedMessage,
        signature: &EddsaSignature,
    ) -> Result<(), CryptoError> {
        let now = Timestamp::now();
        if !self
            .signkeys
            .iter()
            .any(|sk| &sk.key == exchange_pub && sk.is_certified_at(now))
        {
            return Err(CryptoError::InvalidPublicKey);
        }
        signatures::verify(exchange_pub.as_bytes(), message, signature)
    }
}

/// Exchange endpoints that are throttled independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Keys,
    Deposit,
    TrackTransaction,
    TrackTransfer,
    Refund,
    AdminAddIncoming,
}

/// One permit per endpoint class; excess callers queue in FIFO order
#[derive(Debug)]
struct EndpointLimits {
    keys: Arc<Semaphore>,
    deposit: Arc<Semaphore>,
    track_transaction: Arc<Semaphore>,
    track_transfer: Arc<Semaphore>,
    refund: Arc<Semaphore>,
    admin: Arc<Semaphore>,
}

impl EndpointLimits {
    fn new() -> Self {
        Self {
            keys: Arc::new(Semaphore::new(1)),
            deposit: Arc::new(Semaphore::new(1)),
            track_transaction: Arc::new(Semaphore::new(1)),
            track_transfer: Arc::new(Semaphore::new(1)),
            refund: Arc::new(Semaphore::new(1)),
            admin: Arc::new(Semaphore::new(1)),
        }
    }

    fn semaphore(&self, class: EndpointClass) -> Arc<Semaphore> {
        match class {
            EndpointClass::Keys => self.keys.clone(),
            EndpointClass::Deposit => self.deposit.clone(),
            EndpointClass::TrackTransaction => self.track_transaction.clone(),
            EndpointClass::TrackTransfer => self.track_transfer.clone(),
            EndpointClass::Refund => self.refund.clone(),
            EndpointClass::AdminAddIncoming => self.admin.clone(),
        }
    }
}

/// A trusted exchange and its current key material
#[derive(Debug)]
pub struct ExchangeHandle {
    url: String,
    master_pub: MasterPublicKey,
    client: ExchangeClient,
    keys: watch::Sender<Option<Arc<KeysSnapshot>>>,
    limits: EndpointLimits,
}

impl ExchangeHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn master_pub(&self) -> &MasterPublicKey {
        &self.master_pub
    }

    pub fn client(&self) -> &ExchangeClient {
        &self.client
    }

    /// Current key snapshot, `None` while `/keys` is pending
    pub fn keys(&self) -> Option<Arc<KeysSnapshot>> {
        self.keys.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.keys.borrow().is_some()
    }

    /// Wait for the single in-flight slot of an endpoint class
    ///
    /// # Errors
    ///
    /// Fails only if the limiter was closed, which happens on shutdown.
    pub async fn acquire(&self, class: EndpointClass) -> Result<OwnedSemaphorePermit, ExchangeError> {
        self.limits
            .semaphore(class)
            .acquire_owned()
            .await
            .map_err(|_| ExchangeError::Transport {
                url: self.url.clone(),
                message: "exchange handle shut down".to_string(),
            })
    }

    fn publish(&self, snapshot: KeysSnapshot) {
        self.keys.send_replace(Some(Arc::new(snapshot)));
    }
}

/// An exchange that is ready together with the keys it was ready with
#[derive(Debug, Clone)]
pub struct ReadyExchange {
    pub handle: Arc<ExchangeHandle>,
    pub keys: Arc<KeysSnapshot>,
}

/// Keyed map of trusted exchanges
pub struct ExchangeRegistry {
    handles: DashMap<String, Arc<ExchangeHandle>>,
    transport: Arc<dyn ExchangeTransport>,
    db: Arc<dyn MerchantDb>,
    find_timeout: Duration,
    max_retries: u32,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ExchangeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeRegistry")
            .field("exchanges", &self.handles.len())
            .field("find_timeout", &self.find_timeout)
            .finish_non_exhaustive()
    }
}

impl ExchangeRegistry {
    /// Create an empty registry
    ///
    /// # Arguments
    ///
    /// * `transport` - network access shared by all exchange clients
    /// * `db` - store receiving verified wire fee statements
    /// * `find_timeout` - how long [`Self::find_exchange`] waits for `/keys`
    /// * `max_retries` - attempts per storage transaction
    pub fn new(
        transport: Arc<dyn ExchangeTransport>,
        db: Arc<dyn MerchantDb>,
        find_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            handles: DashMap::new(),
            transport,
            db,
            find_timeout,
            max_retries,
            shutdown: CancellationToken::new(),
        }
    }

    /// Trust `url` under `master_pub`; the exchange is pending until its keys load
    pub fn add_trusted(&self, url: &str, master_pub: MasterPublicKey) -> Arc<ExchangeHandle> {
        let url = normalize_url(url);
        self.handles
            .entry(url.clone())
            .or_insert_with(|| {
                let (keys, _) = watch::channel(None);
                Arc::new(ExchangeHandle {
                    client: ExchangeClient::new(url.clone(), self.transport.clone()),
                    url,
                    master_pub,
                    keys,
                    limits: EndpointLimits::new(),
                })
            })
            .clone()
    }

    /// Base URLs of all trusted exchanges, sorted
    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        urls.sort();
        urls
    }

    /// Handle for `url` whether or not it is ready
    pub fn lookup(&self, url: &str) -> Option<Arc<ExchangeHandle>> {
        self.handles.get(&normalize_url(url)).map(|e| e.value().clone())
    }

    /// Handle and keys for `url` if the exchange is trusted and ready
    pub fn lookup_ready(&self, url: &str) -> Option<ReadyExchange> {
        let handle = self.lookup(url)?;
        let keys = handle.keys()?;
        Some(ReadyExchange { handle, keys })
    }

    /// Wait until `url` is ready, the timeout fires, or `cancel` is triggered
    ///
    /// # Errors
    ///
    /// * `ExchangeUnknown` - the URL is not trusted, or stayed pending past the timeout
    /// * `ExchangeTimeout` - `cancel` fired first
    pub async fn find_exchange(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ReadyExchange, MerchantError> {
        let handle = self
            .lookup(url)
            .ok_or_else(|| MerchantError::exchange_unknown(url))?;
        let mut receiver = handle.keys.subscribe();
        let wait = receiver.wait_for(|keys| keys.is_some());

        tokio::select! {
            _ = cancel.cancelled() => Err(MerchantError::exchange_timeout(url)),
            _ = self.shutdown.cancelled() => Err(MerchantError::exchange_unknown(url)),
            result = tokio::time::timeout(self.find_timeout, wait) => match result {
                Ok(Ok(keys)) => match keys.clone() {
                    Some(keys) => Ok(ReadyExchange { handle: handle.clone(), keys }),
                    None => Err(MerchantError::exchange_unknown(url)),
                },
                Ok(Err(_)) | Err(_) => {
                    debug!(exchange = url, "Exchange still pending after find timeout");
                    Err(MerchantError::exchange_unknown(url))
                }
            },
        }
    }

    /// Download and verify `/keys` and `/wire` once
    ///
    /// On success the handle becomes ready and the verified wire fees are
    /// stored.
    ///
    /// # Errors
    ///
    /// Transport or protocol failures, or an untrusted master key.
    pub async fn refresh(&self, handle: &ExchangeHandle) -> Result<(), ExchangeError> {
        let _permit = handle.acquire(EndpointClass::Keys).await?;
        let keys = handle.client.keys().await?;
        let snapshot = KeysSnapshot::verify(&handle.url, &handle.master_pub, keys.body)?;
        let wire = handle.client.wire().await?;
        self.store_wire_fees(handle, &wire.body);
        info!(
            exchange = %handle.url,
            denominations = snapshot.denoms.len(),
            signing_keys = snapshot.signkeys.len(),
            "Exchange keys loaded"
        );
        handle.publish(snapshot);
        Ok(())
    }

    fn store_wire_fees(&self, handle: &ExchangeHandle, wire: &WireResponse) {
        let mut verified = Vec::new();
        for (method, fees) in &wire.fees {
            let h_wire_method = hash_wire_method(method);
            for fee in fees {
                let msg = signatures::wire_fee_statement(
                    &h_wire_method,
                    fee.start_date,
                    fee.end_date,
                    &fee.wire_fee,
                    &fee.closing_fee,
                );
                if signatures::verify(handle.master_pub.as_bytes(), &msg, &fee.sig).is_err() {
                    warn!(exchange = %handle.url, method = %method, "Dropping wire fee with invalid master signature");
                    continue;
                }
                verified.push(WireFeeRecord {
                    master_pub: handle.master_pub,
                    h_wire_method,
                    wire_method: method.clone(),
                    wire_fee: fee.wire_fee.clone(),
                    closing_fee: fee.closing_fee.clone(),
                    start_date: fee.start_date,
                    end_date: fee.end_date,
                    master_sig: fee.sig,
                });
            }
        }

        let stored = db::transact(self.db.as_ref(), "store_wire_fees", self.max_retries, |tx| {
            for fee in &verified {
                match tx.insert_wire_fee(fee) {
                    Ok(()) => {}
                    Err(DbError::UniqueViolation { .. }) => {
                        warn!(method = %fee.wire_method, start = %fee.start_date, "Exchange changed a published wire fee; keeping the first statement");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        });
        if let Err(e) = stored {
            warn!(exchange = %handle.url, error = %e, "Failed to store wire fees");
        }
    }

    /// Keep trying [`Self::refresh`] with exponential back-off until it succeeds
    async fn load_keys(self: Arc<Self>, handle: Arc<ExchangeHandle>) {
        let mut delay = KEYS_RETRY_INITIAL;
        loop {
            match self.refresh(&handle).await {
                Ok(()) => return,
                Err(ExchangeError::MasterKeyMismatch { url }) => {
                    warn!(exchange = %url, "Exchange master key differs from the configured one; not trusting it");
                    return;
                }
                Err(e) => {
                    warn!(exchange = %handle.url, error = %e, retry_in = ?delay, "Downloading exchange keys failed");
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(KEYS_RETRY_MAX);
        }
    }

    /// Start downloading keys for every pending exchange
    ///
    /// Must be called from within a Tokio runtime. The returned operations
    /// finish once the keys are loaded; cancelling them stops the retries.
    pub fn start(self: &Arc<Self>) -> Vec<PendingOperation<()>> {
        self.handles
            .iter()
            .map(|e| e.value().clone())
            .filter(|handle| !handle.is_ready())
            .map(|handle| PendingOperation::spawn(&self.shutdown, self.clone().load_keys(handle)))
            .collect()
    }

    /// Stop all background key downloads and release waiting callers
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
