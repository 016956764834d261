//! Persistence layer
//!
//! The backend talks to storage only through [`MerchantDb`] and the
//! transactions it opens ([`MerchantTx`]). Every transaction is
//! serializable. A commit that loses a serialization race fails with
//! [`DbError::Serialization`] and leaves the store untouched; callers
//! never retry by hand but run their body through [`transact`], which
//! replays it up to a bounded number of times.
//!
//! Lookups return `DbResult<Option<T>>`, and updates that may or may not
//! match a row return a [`QueryStatus`]. Absence is therefore always a
//! value, never an error code borrowed from the data range.

pub mod memory;

use crate::types::{
    AccountRecord, Amount, CoinPublicKey, CoinTransfer, ContractRecord, DepositRecord,
    EddsaPrivateKey, HashCode, InstanceRecord, InstanceSettings, MasterPublicKey, MerchantError,
    MerchantPublicKey, OrderFilter, OrderRecord, OrderSummary, ProductDetails, ProductRecord,
    RefundProofRecord, RefundRecord, ReservePublicKey, ReserveSummary, TipAuthorization, TipId,
    TipPickup, TipReserve, Timestamp, TransferProofRecord, WireFeeRecord, WireTransferId,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use memory::MemoryDb;

/// Number of attempts [`transact`] makes by default
pub const MAX_RETRIES: u32 = 3;

/// Persistence failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// The store failed; retrying will not help
    #[error("hard database error: {message}")]
    Hard { message: String },

    /// The transaction conflicted with a concurrent one and was not applied
    #[error("serialization failure")]
    Serialization,

    /// A conditional insert found an existing row
    #[error("unique constraint violated on {table}")]
    UniqueViolation { table: &'static str },
}

/// Outcome of a statement that may match zero, one or many rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    NoResults,
    OneResult,
    ManyResults,
}

impl QueryStatus {
    pub fn from_count(count: usize) -> Self {
        match count {
            0 => QueryStatus::NoResults,
            1 => QueryStatus::OneResult,
            _ => QueryStatus::ManyResults,
        }
    }

    pub fn is_found(&self) -> bool {
        !matches!(self, QueryStatus::NoResults)
    }
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for MerchantError {
    fn from(error: DbError) -> Self {
        match error {
            DbError::Serialization => MerchantError::DbSoftError {
                operation: "transaction".to_string(),
            },
            DbError::Hard { message } => MerchantError::DbHardError {
                operation: "transaction".to_string(),
                message,
            },
            DbError::UniqueViolation { table } => MerchantError::DbHardError {
                operation: format!("insert into {}", table),
                message: "unexpected duplicate".to_string(),
            },
        }
    }
}

/// A storage engine able to open serializable transactions
pub trait MerchantDb: Send + Sync {
    /// Detect and clean up a transaction a previous caller failed to finish
    fn preflight(&self);

    /// Open a transaction; `name` identifies it in logs
    fn begin(&self, name: &str) -> DbResult<Box<dyn MerchantTx + '_>>;
}

/// Operations available inside a transaction
///
/// Nothing is visible to other transactions until [`MerchantTx::commit`]
/// succeeds. Dropping a transaction without finishing it discards its
/// changes and is reported by the next [`MerchantDb::preflight`].
pub trait MerchantTx {
    fn commit(self: Box<Self>) -> DbResult<()>;
    fn rollback(self: Box<Self>);

    // Instances and accounts
    fn insert_instance(
        &mut self,
        settings: &InstanceSettings,
        merchant_pub: &MerchantPublicKey,
        merchant_priv: &EddsaPrivateKey,
    ) -> DbResult<()>;
    fn lookup_instance(&mut self, instance: &str) -> DbResult<Option<InstanceRecord>>;
    fn list_instances(&mut self) -> DbResult<Vec<InstanceRecord>>;
    fn update_instance(&mut self, settings: &InstanceSettings) -> DbResult<QueryStatus>;
    fn delete_instance_private_key(&mut self, instance: &str) -> DbResult<QueryStatus>;
    fn purge_instance(&mut self, instance: &str) -> DbResult<QueryStatus>;
    fn insert_account(&mut self, instance: &str, account: &AccountRecord) -> DbResult<()>;
    fn lookup_accounts(&mut self, instance: &str) -> DbResult<Vec<AccountRecord>>;
    fn inactivate_account(&mut self, instance: &str, h_wire: &HashCode)
        -> DbResult<QueryStatus>;

    // Products and locks
    fn insert_product(
        &mut self,
        instance: &str,
        product_id: &str,
        details: &ProductDetails,
    ) -> DbResult<()>;
    fn lookup_product(&mut self, instance: &str, product_id: &str)
        -> DbResult<Option<ProductRecord>>;
    fn list_products(&mut self, instance: &str) -> DbResult<Vec<String>>;
    fn update_product(
        &mut self,
        instance: &str,
        product_id: &str,
        details: &ProductDetails,
    ) -> DbResult<QueryStatus>;
    fn delete_product(&mut self, instance: &str, product_id: &str) -> DbResult<QueryStatus>;
    /// Hold `quantity` units under `uuid`; `NoResults` if not enough are free
    fn lock_product(
        &mut self,
        instance: &str,
        product_id: &str,
        uuid: Uuid,
        quantity: u64,
        expiration: Timestamp,
        now: Timestamp,
    ) -> DbResult<QueryStatus>;
    fn unlock_inventory(&mut self, instance: &str, uuid: Uuid) -> DbResult<QueryStatus>;
    /// Hold `quantity` units for an order; `NoResults` if not enough are free
    fn insert_order_lock(
        &mut self,
        instance: &str,
        product_id: &str,
        order_id: &str,
        quantity: u64,
        now: Timestamp,
    ) -> DbResult<QueryStatus>;
    fn release_order_locks(&mut self, instance: &str, order_id: &str) -> DbResult<QueryStatus>;
    /// Turn an order's locks into sold units
    fn sell_order_locks(&mut self, instance: &str, order_id: &str) -> DbResult<QueryStatus>;

    // Orders and contracts
    fn insert_order(
        &mut self,
        instance: &str,
        order_id: &str,
        pay_deadline: Timestamp,
        creation_time: Timestamp,
        contract_terms: &serde_json::Value,
    ) -> DbResult<()>;
    fn lookup_order(&mut self, instance: &str, order_id: &str) -> DbResult<Option<OrderRecord>>;
    fn delete_order(&mut self, instance: &str, order_id: &str) -> DbResult<QueryStatus>;
    fn insert_contract_terms(&mut self, instance: &str, contract: &ContractRecord)
        -> DbResult<()>;
    fn lookup_contract_terms(
        &mut self,
        instance: &str,
        order_id: &str,
    ) -> DbResult<Option<ContractRecord>>;
    fn lookup_contract_by_hash(
        &mut self,
        instance: &str,
        h_contract_terms: &HashCode,
    ) -> DbResult<Option<ContractRecord>>;
    fn mark_contract_paid(
        &mut self,
        instance: &str,
        h_contract_terms: &HashCode,
        session_id: Option<&str>,
    ) -> DbResult<QueryStatus>;
    fn mark_contract_wired(
        &mut self,
        instance: &str,
        h_contract_terms: &HashCode,
    ) -> DbResult<QueryStatus>;
    fn delete_contract_terms(&mut self, instance: &str, order_id: &str)
        -> DbResult<QueryStatus>;
    fn list_orders(&mut self, instance: &str, filter: &OrderFilter)
        -> DbResult<Vec<OrderSummary>>;
    /// `OneResult` if the binding was created, `NoResults` if one already existed
    fn insert_session_binding(
        &mut self,
        instance: &str,
        fulfillment_url: &str,
        session_id: &str,
        order_id: &str,
    ) -> DbResult<QueryStatus>;
    fn lookup_session_binding(
        &mut self,
        instance: &str,
        fulfillment_url: &str,
        session_id: &str,
    ) -> DbResult<Option<String>>;

    // Deposits and wire transfers
    fn insert_deposit(&mut self, deposit: &DepositRecord) -> DbResult<()>;
    fn lookup_deposits(
        &mut self,
        merchant_pub: &MerchantPublicKey,
        h_contract_terms: &HashCode,
    ) -> DbResult<Vec<DepositRecord>>;
    fn lookup_deposit(
        &mut self,
        merchant_pub: &MerchantPublicKey,
        h_contract_terms: &HashCode,
        coin_pub: &CoinPublicKey,
    ) -> DbResult<Option<DepositRecord>>;
    /// Idempotent: storing the same mapping twice is a no-op
    fn insert_coin_transfer(&mut self, transfer: &CoinTransfer) -> DbResult<()>;
    fn lookup_coin_transfers(&mut self, h_contract_terms: &HashCode)
        -> DbResult<Vec<CoinTransfer>>;
    fn insert_transfer_proof(&mut self, proof: &TransferProofRecord) -> DbResult<()>;
    fn lookup_transfer_proof(
        &mut self,
        exchange_url: &str,
        wtid: &WireTransferId,
    ) -> DbResult<Option<TransferProofRecord>>;

    // Refunds
    fn lookup_refunds(
        &mut self,
        merchant_pub: &MerchantPublicKey,
        h_contract_terms: &HashCode,
    ) -> DbResult<Vec<RefundRecord>>;
    /// Store a refund increment; the serial field is assigned by the store
    fn insert_refund(&mut self, refund: &RefundRecord) -> DbResult<u64>;
    fn insert_refund_proof(
        &mut self,
        merchant_pub: &MerchantPublicKey,
        h_contract_terms: &HashCode,
        proof: &RefundProofRecord,
    ) -> DbResult<()>;
    fn lookup_refund_proof(
        &mut self,
        merchant_pub: &MerchantPublicKey,
        h_contract_terms: &HashCode,
        coin_pub: &CoinPublicKey,
        rtransaction_id: u64,
    ) -> DbResult<Option<RefundProofRecord>>;

    // Wire fees
    /// Idempotent for identical statements
    fn insert_wire_fee(&mut self, fee: &WireFeeRecord) -> DbResult<()>;
    fn lookup_wire_fee(
        &mut self,
        master_pub: &MasterPublicKey,
        h_wire_method: &HashCode,
        date: Timestamp,
    ) -> DbResult<Option<WireFeeRecord>>;

    // Tipping
    fn lookup_reserve(&mut self, reserve_pub: &ReservePublicKey) -> DbResult<Option<TipReserve>>;
    fn upsert_reserve(&mut self, reserve: &TipReserve) -> DbResult<()>;
    fn list_reserves(&mut self) -> DbResult<Vec<ReserveSummary>>;
    fn insert_credit_uuid(&mut self, credit_uuid: Uuid, reserve_pub: &ReservePublicKey)
        -> DbResult<()>;
    fn insert_tip_authorization(&mut self, tip: &TipAuthorization) -> DbResult<()>;
    fn lookup_tip(&mut self, tip_id: &TipId) -> DbResult<Option<TipAuthorization>>;
    fn update_tip_amount_left(&mut self, tip_id: &TipId, amount_left: &Amount)
        -> DbResult<QueryStatus>;
    fn lookup_pickup(&mut self, tip_id: &TipId, pickup_id: &HashCode)
        -> DbResult<Option<TipPickup>>;
    fn insert_pickup(&mut self, pickup: &TipPickup) -> DbResult<()>;
    fn list_pickups(&mut self, tip_id: &TipId) -> DbResult<Vec<TipPickup>>;
}

/// Run `body` in a serializable transaction, retrying on serialization failure
///
/// `body` may run several times and must not have side effects outside
/// the transaction. A body error that is not transient rolls back and is
/// returned at once.
///
/// # Errors
///
/// `DbSoftError` once `max_retries` attempts all lost serialization
/// races, `DbHardError` on hard failures, or whatever `body` returned.
pub fn transact<T, F>(
    db: &dyn MerchantDb,
    name: &str,
    max_retries: u32,
    mut body: F,
) -> Result<T, MerchantError>
where
    F: FnMut(&mut dyn MerchantTx) -> Result<T, MerchantError>,
{
    for attempt in 1..=max_retries.max(1) {
        db.preflight();
        let mut tx = db.begin(name).map_err(|e| with_operation(e.into(), name))?;
        match body(tx.as_mut()) {
            Ok(value) => match tx.commit() {
                Ok(()) => return Ok(value),
                Err(DbError::Serialization) => {
                    debug!(transaction = name, attempt, "Commit lost serialization race");
                }
                Err(e) => return Err(with_operation(e.into(), name)),
            },
            Err(e) if e.is_transient() => {
                tx.rollback();
                debug!(transaction = name, attempt, "Transaction body hit serialization failure");
            }
            Err(e) => {
                tx.rollback();
                return Err(with_operation(e, name));
            }
        }
    }
    Err(MerchantError::DbSoftError {
        operation: name.to_string(),
    })
}

fn with_operation(error: MerchantError, name: &str) -> MerchantError {
    match error {
        MerchantError::DbSoftError { .. } => MerchantError::DbSoftError {
            operation: name.to_string(),
        },
        MerchantError::DbHardError { message, .. } => MerchantError::DbHardError {
            operation: name.to_string(),
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RelativeTime;
    use std::cell::Cell;

    fn settings(id: &str) -> InstanceSettings {
        InstanceSettings {
            id: id.to_string(),
            name: "Shop".to_string(),
            address: serde_json::Value::Null,
            jurisdiction: serde_json::Value::Null,
            default_max_deposit_fee: "EUR:1".parse().unwrap(),
            default_max_wire_fee: "EUR:1".parse().unwrap(),
            default_wire_fee_amortization: 1,
            default_wire_transfer_delay: RelativeTime::from_secs(60),
            default_pay_delay: RelativeTime::from_secs(60),
        }
    }

    #[test]
    fn test_query_status_from_count() {
        assert_eq!(QueryStatus::from_count(0), QueryStatus::NoResults);
        assert_eq!(QueryStatus::from_count(1), QueryStatus::OneResult);
        assert_eq!(QueryStatus::from_count(5), QueryStatus::ManyResults);
    }

    #[test]
    fn test_transact_succeeds_on_third_attempt() {
        let db = MemoryDb::new();
        db.inject_serialization_failures(2);
        let attempts = Cell::new(0);
        let result = transact(&db, "insert", MAX_RETRIES, |tx| {
            attempts.set(attempts.get() + 1);
            let priv_key = EddsaPrivateKey::generate();
            tx.insert_instance(&settings("a"), &MerchantPublicKey::random(), &priv_key)?;
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_transact_gives_up_after_max_retries() {
        let db = MemoryDb::new();
        db.inject_serialization_failures(3);
        let result = transact(&db, "insert", MAX_RETRIES, |tx| {
            tx.insert_instance(
                &settings("a"),
                &MerchantPublicKey::random(),
                &EddsaPrivateKey::generate(),
            )?;
            Ok(())
        });
        assert_eq!(
            result,
            Err(MerchantError::DbSoftError {
                operation: "insert".to_string()
            })
        );
    }

    #[test]
    fn test_transact_does_not_retry_business_errors() {
        let db = MemoryDb::new();
        let attempts = Cell::new(0);
        let result: Result<(), _> = transact(&db, "lookup", MAX_RETRIES, |_| {
            attempts.set(attempts.get() + 1);
            Err(MerchantError::instance_unknown("x"))
        });
        assert_eq!(result, Err(MerchantError::instance_unknown("x")));
        assert_eq!(attempts.get(), 1);
    }
}
