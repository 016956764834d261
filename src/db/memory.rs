//! In-memory storage engine
//!
//! Selected with the `memory://` database string. Each transaction works
//! on a private copy of the tables taken at `begin`. Commits are
//! optimistic: a transaction that wrote anything may only commit if no
//! other writer committed since it began, otherwise it fails with
//! [`DbError::Serialization`]. This yields serializable histories
//! without holding locks across a transaction body.
//!
//! # Testing hooks
//!
//! [`MemoryDb::inject_serialization_failures`] makes the next `n` commits
//! fail as if they had lost a race, which exercises every retry path.

use super::{DbError, DbResult, MerchantDb, MerchantTx, QueryStatus};
use crate::types::{
    AccountRecord, Amount, CoinPublicKey, CoinTransfer, ContractRecord, DepositRecord,
    EddsaPrivateKey, HashCode, InstanceRecord, InstanceSettings, InventoryLock, MasterPublicKey,
    MerchantPublicKey, OrderFilter, OrderLock, OrderRecord, OrderSummary, ProductDetails,
    ProductRecord, RefundProofRecord, RefundRecord, ReservePublicKey, ReserveSummary,
    TipAuthorization, TipId, TipPickup, TipReserve, Timestamp, TransferProofRecord,
    WireFeeRecord, WireTransferId,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{trace, warn};
use uuid::Uuid;

type InstanceKey = (String, String);

#[derive(Debug, Clone)]
struct StoredProduct {
    serial: u64,
    details: ProductDetails,
    inventory_locks: Vec<InventoryLock>,
    order_locks: Vec<OrderLock>,
}

impl StoredProduct {
    /// Units held by live locks, `None` if they do not fit a `u64`
    fn locked(&self, now: Timestamp) -> Option<u64> {
        self.inventory_locks
            .iter()
            .filter(|l| l.expiration > now)
            .map(|l| l.quantity)
            .chain(self.order_locks.iter().map(|l| l.quantity))
            .try_fold(0u64, u64::checked_add)
    }

    /// Holding `quantity` more must fit both the stock and a `u64` total
    fn can_hold(&self, quantity: u64, now: Timestamp) -> bool {
        let Some(after) = self.locked(now).and_then(|l| l.checked_add(quantity)) else {
            return false;
        };
        self.details.remaining().map_or(true, |remaining| after <= remaining)
    }

    fn drop_expired(&mut self, now: Timestamp) {
        self.inventory_locks.retain(|l| l.expiration > now);
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    next_serial: u64,
    instances: BTreeMap<String, InstanceRecord>,
    accounts: BTreeMap<String, Vec<AccountRecord>>,
    products: BTreeMap<InstanceKey, StoredProduct>,
    orders: BTreeMap<InstanceKey, OrderRecord>,
    contracts: BTreeMap<InstanceKey, ContractRecord>,
    sessions: BTreeMap<(String, String, String), String>,
    deposits: BTreeMap<(HashCode, CoinPublicKey), DepositRecord>,
    coin_transfers: BTreeSet<(HashCode, CoinPublicKey, String, WireTransferId)>,
    transfer_proofs: BTreeMap<(String, WireTransferId), TransferProofRecord>,
    refunds: Vec<RefundRecord>,
    refund_proofs: BTreeMap<(MerchantPublicKey, HashCode, CoinPublicKey, u64), RefundProofRecord>,
    wire_fees: Vec<WireFeeRecord>,
    reserves: BTreeMap<ReservePublicKey, TipReserve>,
    credit_uuids: BTreeSet<(Uuid, ReservePublicKey)>,
    tips: BTreeMap<TipId, TipAuthorization>,
    pickups: BTreeMap<(TipId, HashCode), TipPickup>,
}

impl Tables {
    fn allocate_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    fn merchant_pub_of(&self, instance: &str) -> Option<MerchantPublicKey> {
        self.instances.get(instance).map(|i| i.merchant_pub)
    }

    fn is_refunded(&self, merchant_pub: &MerchantPublicKey, h: &HashCode) -> bool {
        self.refunds
            .iter()
            .any(|r| &r.merchant_pub == merchant_pub && &r.h_contract_terms == h)
    }
}

#[derive(Debug, Default)]
struct Committed {
    version: u64,
    tables: Tables,
}

/// Serializable in-memory store
#[derive(Debug, Default)]
pub struct MemoryDb {
    committed: Mutex<Committed>,
    leaked: Mutex<Vec<String>>,
    injected_failures: AtomicU32,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a serialization error
    pub fn inject_serialization_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl MerchantDb for MemoryDb {
    fn preflight(&self) {
        let mut leaked = self.leaked.lock();
        for name in leaked.drain(..) {
            warn!(transaction = %name, "Transaction was neither committed nor rolled back; its changes were discarded");
        }
    }

    fn begin(&self, name: &str) -> DbResult<Box<dyn MerchantTx + '_>> {
        let committed = self.committed.lock();
        trace!(transaction = name, version = committed.version, "Begin transaction");
        Ok(Box::new(MemoryTx {
            db: self,
            name: name.to_string(),
            base_version: committed.version,
            tables: committed.tables.clone(),
            dirty: false,
            finished: false,
        }))
    }
}

struct MemoryTx<'a> {
    db: &'a MemoryDb,
    name: String,
    base_version: u64,
    tables: Tables,
    dirty: bool,
    finished: bool,
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.db.leaked.lock().push(self.name.clone());
        }
    }
}

impl MemoryTx<'_> {
    fn write(&mut self) -> &mut Tables {
        self.dirty = true;
        &mut self.tables
    }
}

fn unique(table: &'static str) -> DbError {
    DbError::UniqueViolation { table }
}

fn key(instance: &str, id: &str) -> InstanceKey {
    (instance.to_string(), id.to_string())
}

fn found(hit: bool) -> QueryStatus {
    if hit {
        QueryStatus::OneResult
    } else {
        QueryStatus::NoResults
    }
}

#[allow(clippy::too_many_arguments)]
fn summarize(
    tables: &Tables,
    merchant_pub: Option<&MerchantPublicKey>,
    serial: u64,
    order_id: &str,
    creation_time: Timestamp,
    contract_terms: &serde_json::Value,
    paid: bool,
    wired: bool,
    h_contract_terms: Option<&HashCode>,
) -> Option<OrderSummary> {
    let amount: Amount = match contract_terms
        .get("amount")
        .and_then(|a| a.as_str())
        .map(str::parse::<Amount>)
    {
        Some(Ok(amount)) => amount,
        _ => {
            warn!(order_id, "Stored contract terms lack a valid amount");
            return None;
        }
    };
    let refunded = match (merchant_pub, h_contract_terms) {
        (Some(m), Some(h)) => tables.is_refunded(m, h),
        _ => false,
    };
    Some(OrderSummary {
        row_id: serial,
        order_id: order_id.to_string(),
        timestamp: creation_time,
        amount,
        summary: contract_terms
            .get("summary")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
        paid,
        refunded,
        wired,
    })
}

impl MerchantTx for MemoryTx<'_> {
    fn commit(mut self: Box<Self>) -> DbResult<()> {
        self.finished = true;
        if self.db.take_injected_failure() {
            trace!(transaction = %self.name, "Injected serialization failure");
            return Err(DbError::Serialization);
        }
        if !self.dirty {
            return Ok(());
        }
        let mut committed = self.db.committed.lock();
        if committed.version != self.base_version {
            trace!(transaction = %self.name, "Concurrent writer committed first");
            return Err(DbError::Serialization);
        }
        committed.tables = std::mem::take(&mut self.tables);
        committed.version += 1;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) {
        self.finished = true;
    }

    fn insert_instance(
        &mut self,
        settings: &InstanceSettings,
        merchant_pub: &MerchantPublicKey,
        merchant_priv: &EddsaPrivateKey,
    ) -> DbResult<()> {
        if self.tables.instances.contains_key(&settings.id) {
            return Err(unique("instances"));
        }
        let tables = self.write();
        let serial = tables.allocate_serial();
        tables.instances.insert(
            settings.id.clone(),
            InstanceRecord {
                serial,
                settings: settings.clone(),
                merchant_pub: *merchant_pub,
                merchant_priv: Some(merchant_priv.clone()),
            },
        );
        Ok(())
    }

    fn lookup_instance(&mut self, instance: &str) -> DbResult<Option<InstanceRecord>> {
        Ok(self.tables.instances.get(instance).cloned())
    }

    fn list_instances(&mut self) -> DbResult<Vec<InstanceRecord>> {
        let mut all: Vec<InstanceRecord> = self.tables.instances.values().cloned().collect();
        all.sort_by_key(|i| i.serial);
        Ok(all)
    }

    fn update_instance(&mut self, settings: &InstanceSettings) -> DbResult<QueryStatus> {
        if !self.tables.instances.contains_key(&settings.id) {
            return Ok(QueryStatus::NoResults);
        }
        let tables = self.write();
        if let Some(record) = tables.instances.get_mut(&settings.id) {
            record.settings = settings.clone();
        }
        Ok(QueryStatus::OneResult)
    }

    fn delete_instance_private_key(&mut self, instance: &str) -> DbResult<QueryStatus> {
        let has_key = self
            .tables
            .instances
            .get(instance)
            .is_some_and(|i| i.merchant_priv.is_some());
        if !has_key {
            return Ok(QueryStatus::NoResults);
        }
        if let Some(record) = self.write().instances.get_mut(instance) {
            record.merchant_priv = None;
        }
        Ok(QueryStatus::OneResult)
    }

    fn purge_instance(&mut self, instance: &str) -> DbResult<QueryStatus> {
        let Some(merchant_pub) = self.tables.merchant_pub_of(instance) else {
            return Ok(QueryStatus::NoResults);
        };
        let tables = self.write();
        tables.instances.remove(instance);
        tables.accounts.remove(instance);
        tables.products.retain(|(i, _), _| i != instance);
        tables.orders.retain(|(i, _), _| i != instance);
        tables.contracts.retain(|(i, _), _| i != instance);
        tables.sessions.retain(|(i, _, _), _| i != instance);
        tables.deposits.retain(|_, d| d.merchant_pub != merchant_pub);
        tables.refunds.retain(|r| r.merchant_pub != merchant_pub);
        tables.refund_proofs.retain(|(m, _, _, _), _| *m != merchant_pub);
        Ok(QueryStatus::OneResult)
    }

    fn insert_account(&mut self, instance: &str, account: &AccountRecord) -> DbResult<()> {
        let exists = self
            .tables
            .accounts
            .get(instance)
            .is_some_and(|accounts| accounts.iter().any(|a| a.payto_uri == account.payto_uri));
        if exists {
            return Err(unique("accounts"));
        }
        self.write()
            .accounts
            .entry(instance.to_string())
            .or_default()
            .push(account.clone());
        Ok(())
    }

    fn lookup_accounts(&mut self, instance: &str) -> DbResult<Vec<AccountRecord>> {
        Ok(self.tables.accounts.get(instance).cloned().unwrap_or_default())
    }

    fn inactivate_account(&mut self, instance: &str, h_wire: &HashCode) -> DbResult<QueryStatus> {
        let exists = self
            .tables
            .accounts
            .get(instance)
            .is_some_and(|accounts| accounts.iter().any(|a| &a.h_wire == h_wire));
        if !exists {
            return Ok(QueryStatus::NoResults);
        }
        if let Some(accounts) = self.write().accounts.get_mut(instance) {
            for account in accounts.iter_mut().filter(|a| &a.h_wire == h_wire) {
                account.active = false;
            }
        }
        Ok(QueryStatus::OneResult)
    }

    fn insert_product(
        &mut self,
        instance: &str,
        product_id: &str,
        details: &ProductDetails,
    ) -> DbResult<()> {
        let k = key(instance, product_id);
        if self.tables.products.contains_key(&k) {
            return Err(unique("products"));
        }
        let tables = self.write();
        let serial = tables.allocate_serial();
        tables.products.insert(
            k,
            StoredProduct {
                serial,
                details: details.clone(),
                inventory_locks: Vec::new(),
                order_locks: Vec::new(),
            },
        );
        Ok(())
    }

    fn lookup_product(
        &mut self,
        instance: &str,
        product_id: &str,
    ) -> DbResult<Option<ProductRecord>> {
        let now = Timestamp::now();
        Ok(self
            .tables
            .products
            .get(&key(instance, product_id))
            .map(|p| ProductRecord {
                product_id: product_id.to_string(),
                details: p.details.clone(),
                total_locked: p.locked(now).unwrap_or(u64::MAX),
            }))
    }

    fn list_products(&mut self, instance: &str) -> DbResult<Vec<String>> {
        let mut rows: Vec<(u64, String)> = self
            .tables
            .products
            .iter()
            .filter(|((i, _), _)| i == instance)
            .map(|((_, id), p)| (p.serial, id.clone()))
            .collect();
        rows.sort();
        Ok(rows.into_iter().map(|(_, id)| id).collect())
    }

    fn update_product(
        &mut self,
        instance: &str,
        product_id: &str,
        details: &ProductDetails,
    ) -> DbResult<QueryStatus> {
        let k = key(instance, product_id);
        if !self.tables.products.contains_key(&k) {
            return Ok(QueryStatus::NoResults);
        }
        if let Some(product) = self.write().products.get_mut(&k) {
            product.details = details.clone();
        }
        Ok(QueryStatus::OneResult)
    }

    fn delete_product(&mut self, instance: &str, product_id: &str) -> DbResult<QueryStatus> {
        let k = key(instance, product_id);
        if !self.tables.products.contains_key(&k) {
            return Ok(QueryStatus::NoResults);
        }
        self.write().products.remove(&k);
        Ok(QueryStatus::OneResult)
    }

    fn lock_product(
        &mut self,
        instance: &str,
        product_id: &str,
        uuid: Uuid,
        quantity: u64,
        expiration: Timestamp,
        now: Timestamp,
    ) -> DbResult<QueryStatus> {
        let k = key(instance, product_id);
        let Some(product) = self.tables.products.get(&k) else {
            return Ok(QueryStatus::NoResults);
        };
        let mut candidate = product.clone();
        candidate.drop_expired(now);
        if !candidate.can_hold(quantity, now) {
            return Ok(QueryStatus::NoResults);
        }
        match candidate.inventory_locks.iter_mut().find(|l| l.uuid == uuid) {
            Some(lock) => {
                let Some(total) = lock.quantity.checked_add(quantity) else {
                    return Ok(QueryStatus::NoResults);
                };
                lock.quantity = total;
                lock.expiration = lock.expiration.max(expiration);
            }
            None => candidate.inventory_locks.push(InventoryLock {
                uuid,
                quantity,
                expiration,
            }),
        }
        self.write().products.insert(k, candidate);
        Ok(QueryStatus::OneResult)
    }

    fn unlock_inventory(&mut self, instance: &str, uuid: Uuid) -> DbResult<QueryStatus> {
        let holds = self
            .tables
            .products
            .iter()
            .any(|((i, _), p)| i == instance && p.inventory_locks.iter().any(|l| l.uuid == uuid));
        if !holds {
            return Ok(QueryStatus::NoResults);
        }
        let mut released = 0;
        for ((i, _), product) in self.write().products.iter_mut() {
            if i == instance {
                let before = product.inventory_locks.len();
                product.inventory_locks.retain(|l| l.uuid != uuid);
                released += before - product.inventory_locks.len();
            }
        }
        Ok(QueryStatus::from_count(released))
    }

    fn insert_order_lock(
        &mut self,
        instance: &str,
        product_id: &str,
        order_id: &str,
        quantity: u64,
        now: Timestamp,
    ) -> DbResult<QueryStatus> {
        let k = key(instance, product_id);
        let Some(product) = self.tables.products.get(&k) else {
            return Ok(QueryStatus::NoResults);
        };
        let mut candidate = product.clone();
        candidate.drop_expired(now);
        if !candidate.can_hold(quantity, now) {
            return Ok(QueryStatus::NoResults);
        }
        candidate.order_locks.push(OrderLock {
            order_id: order_id.to_string(),
            quantity,
        });
        self.write().products.insert(k, candidate);
        Ok(QueryStatus::OneResult)
    }

    fn release_order_locks(&mut self, instance: &str, order_id: &str) -> DbResult<QueryStatus> {
        let mut released = 0;
        let holds = self.tables.products.iter().any(|((i, _), p)| {
            i == instance && p.order_locks.iter().any(|l| l.order_id == order_id)
        });
        if !holds {
            return Ok(QueryStatus::NoResults);
        }
        for ((i, _), product) in self.write().products.iter_mut() {
            if i == instance {
                let before = product.order_locks.len();
                product.order_locks.retain(|l| l.order_id != order_id);
                released += before - product.order_locks.len();
            }
        }
        Ok(QueryStatus::from_count(released))
    }

    fn sell_order_locks(&mut self, instance: &str, order_id: &str) -> DbResult<QueryStatus> {
        let holds = self.tables.products.iter().any(|((i, _), p)| {
            i == instance && p.order_locks.iter().any(|l| l.order_id == order_id)
        });
        if !holds {
            return Ok(QueryStatus::NoResults);
        }
        let mut converted = 0;
        for ((i, _), product) in self.write().products.iter_mut() {
            if i != instance {
                continue;
            }
            let sold: u64 = product
                .order_locks
                .iter()
                .filter(|l| l.order_id == order_id)
                .fold(0u64, |sum, l| sum.saturating_add(l.quantity));
            if sold > 0 {
                product.order_locks.retain(|l| l.order_id != order_id);
                product.details.total_sold = product.details.total_sold.saturating_add(sold);
                converted += 1;
            }
        }
        Ok(QueryStatus::from_count(converted))
    }

    fn insert_order(
        &mut self,
        instance: &str,
        order_id: &str,
        pay_deadline: Timestamp,
        creation_time: Timestamp,
        contract_terms: &serde_json::Value,
    ) -> DbResult<()> {
        let k = key(instance, order_id);
        if self.tables.orders.contains_key(&k) || self.tables.contracts.contains_key(&k) {
            return Err(unique("orders"));
        }
        let tables = self.write();
        let serial = tables.allocate_serial();
        tables.orders.insert(
            k,
            OrderRecord {
                serial,
                order_id: order_id.to_string(),
                pay_deadline,
                creation_time,
                contract_terms: contract_terms.clone(),
            },
        );
        Ok(())
    }

    fn lookup_order(&mut self, instance: &str, order_id: &str) -> DbResult<Option<OrderRecord>> {
        Ok(self.tables.orders.get(&key(instance, order_id)).cloned())
    }

    fn delete_order(&mut self, instance: &str, order_id: &str) -> DbResult<QueryStatus> {
        let k = key(instance, order_id);
        if !self.tables.orders.contains_key(&k) {
            return Ok(QueryStatus::NoResults);
        }
        self.write().orders.remove(&k);
        Ok(QueryStatus::OneResult)
    }

    fn insert_contract_terms(
        &mut self,
        instance: &str,
        contract: &ContractRecord,
    ) -> DbResult<()> {
        let k = key(instance, &contract.order_id);
        if self.tables.contracts.contains_key(&k) {
            return Err(unique("contract_terms"));
        }
        self.write().contracts.insert(k, contract.clone());
        Ok(())
    }

    fn lookup_contract_terms(
        &mut self,
        instance: &str,
        order_id: &str,
    ) -> DbResult<Option<ContractRecord>> {
        Ok(self.tables.contracts.get(&key(instance, order_id)).cloned())
    }

    fn lookup_contract_by_hash(
        &mut self,
        instance: &str,
        h_contract_terms: &HashCode,
    ) -> DbResult<Option<ContractRecord>> {
        Ok(self
            .tables
            .contracts
            .iter()
            .find(|((i, _), c)| i == instance && &c.h_contract_terms == h_contract_terms)
            .map(|(_, c)| c.clone()))
    }

    fn mark_contract_paid(
        &mut self,
        instance: &str,
        h_contract_terms: &HashCode,
        session_id: Option<&str>,
    ) -> DbResult<QueryStatus> {
        let Some(k) = self
            .tables
            .contracts
            .iter()
            .find(|((i, _), c)| i == instance && &c.h_contract_terms == h_contract_terms)
            .map(|(k, _)| k.clone())
        else {
            return Ok(QueryStatus::NoResults);
        };
        if let Some(contract) = self.write().contracts.get_mut(&k) {
            contract.paid = true;
            if let Some(session) = session_id {
                contract.session_id = Some(session.to_string());
            }
        }
        Ok(QueryStatus::OneResult)
    }

    fn mark_contract_wired(
        &mut self,
        instance: &str,
        h_contract_terms: &HashCode,
    ) -> DbResult<QueryStatus> {
        let Some(k) = self
            .tables
            .contracts
            .iter()
            .find(|((i, _), c)| i == instance && &c.h_contract_terms == h_contract_terms)
            .map(|(k, _)| k.clone())
        else {
            return Ok(QueryStatus::NoResults);
        };
        if let Some(contract) = self.write().contracts.get_mut(&k) {
            contract.wired = true;
        }
        Ok(QueryStatus::OneResult)
    }

    fn delete_contract_terms(&mut self, instance: &str, order_id: &str) -> DbResult<QueryStatus> {
        let k = key(instance, order_id);
        if !self.tables.contracts.contains_key(&k) {
            return Ok(QueryStatus::NoResults);
        }
        self.write().contracts.remove(&k);
        Ok(QueryStatus::OneResult)
    }

    fn list_orders(&mut self, instance: &str, filter: &OrderFilter) -> DbResult<Vec<OrderSummary>> {
        let tables = &self.tables;
        let merchant_pub = tables.merchant_pub_of(instance);
        let mut by_order: BTreeMap<&str, OrderSummary> = BTreeMap::new();

        for ((i, order_id), order) in tables.orders.iter() {
            if i != instance {
                continue;
            }
            if let Some(row) = summarize(
                tables,
                merchant_pub.as_ref(),
                order.serial,
                order_id,
                order.creation_time,
                &order.contract_terms,
                false,
                false,
                None,
            ) {
                by_order.insert(order_id, row);
            }
        }
        // A claimed contract supersedes its order row
        for ((i, order_id), contract) in tables.contracts.iter() {
            if i != instance {
                continue;
            }
            if let Some(row) = summarize(
                tables,
                merchant_pub.as_ref(),
                contract.serial,
                order_id,
                contract.creation_time,
                &contract.contract_terms,
                contract.paid,
                contract.wired,
                Some(&contract.h_contract_terms),
            ) {
                by_order.insert(order_id, row);
            }
        }

        let mut rows: Vec<OrderSummary> = by_order
            .into_values()
            .filter(|r| filter.paid.matches(r.paid))
            .filter(|r| filter.refunded.matches(r.refunded))
            .filter(|r| filter.wired.matches(r.wired))
            .filter(|r| filter.date_after.map_or(true, |d| r.timestamp >= d))
            .filter(|r| filter.date_before.map_or(true, |d| r.timestamp < d))
            .collect();

        let limit = filter.delta.unsigned_abs() as usize;
        if filter.delta >= 0 {
            let start = filter.start_row.unwrap_or(0);
            rows.retain(|r| r.row_id > start);
            rows.sort_by_key(|r| r.row_id);
        } else {
            let start = filter.start_row.unwrap_or(u64::MAX);
            rows.retain(|r| r.row_id < start);
            rows.sort_by_key(|r| std::cmp::Reverse(r.row_id));
        }
        rows.truncate(limit);
        Ok(rows)
    }

    fn insert_session_binding(
        &mut self,
        instance: &str,
        fulfillment_url: &str,
        session_id: &str,
        order_id: &str,
    ) -> DbResult<QueryStatus> {
        let k = (
            instance.to_string(),
            fulfillment_url.to_string(),
            session_id.to_string(),
        );
        if self.tables.sessions.contains_key(&k) {
            return Ok(QueryStatus::NoResults);
        }
        self.write().sessions.insert(k, order_id.to_string());
        Ok(QueryStatus::OneResult)
    }

    fn lookup_session_binding(
        &mut self,
        instance: &str,
        fulfillment_url: &str,
        session_id: &str,
    ) -> DbResult<Option<String>> {
        let k = (
            instance.to_string(),
            fulfillment_url.to_string(),
            session_id.to_string(),
        );
        Ok(self.tables.sessions.get(&k).cloned())
    }

    fn insert_deposit(&mut self, deposit: &DepositRecord) -> DbResult<()> {
        let k = (deposit.h_contract_terms, deposit.coin_pub);
        if self.tables.deposits.contains_key(&k) {
            return Err(unique("deposits"));
        }
        self.write().deposits.insert(k, deposit.clone());
        Ok(())
    }

    fn lookup_deposits(
        &mut self,
        merchant_pub: &MerchantPublicKey,
        h_contract_terms: &HashCode,
    ) -> DbResult<Vec<DepositRecord>> {
        Ok(self
            .tables
            .deposits
            .range((*h_contract_terms, CoinPublicKey::from_bytes([0; 32]))..)
            .take_while(|((h, _), _)| h == h_contract_terms)
            .filter(|(_, d)| &d.merchant_pub == merchant_pub)
            .map(|(_, d)| d.clone())
            .collect())
    }

    fn lookup_deposit(
        &mut self,
        merchant_pub: &MerchantPublicKey,
        h_contract_terms: &HashCode,
        coin_pub: &CoinPublicKey,
    ) -> DbResult<Option<DepositRecord>> {
        Ok(self
            .tables
            .deposits
            .get(&(*h_contract_terms, *coin_pub))
            .filter(|d| &d.merchant_pub == merchant_pub)
            .cloned())
    }

    fn insert_coin_transfer(&mut self, transfer: &CoinTransfer) -> DbResult<()> {
        let k = (
            transfer.h_contract_terms,
            transfer.coin_pub,
            transfer.exchange_url.clone(),
            transfer.wtid,
        );
        if !self.tables.coin_transfers.contains(&k) {
            self.write().coin_transfers.insert(k);
        }
        Ok(())
    }

    fn lookup_coin_transfers(&mut self, h_contract_terms: &HashCode) -> DbResult<Vec<CoinTransfer>> {
        Ok(self
            .tables
            .coin_transfers
            .iter()
            .filter(|(h, _, _, _)| h == h_contract_terms)
            .map(|(h, coin, exchange_url, wtid)| CoinTransfer {
                h_contract_terms: *h,
                coin_pub: *coin,
                exchange_url: exchange_url.clone(),
                wtid: *wtid,
            })
            .collect())
    }

    fn insert_transfer_proof(&mut self, proof: &TransferProofRecord) -> DbResult<()> {
        let k = (proof.exchange_url.clone(), proof.wtid);
        if self.tables.transfer_proofs.contains_key(&k) {
            return Err(unique("transfers"));
        }
        self.write().transfer_proofs.insert(k, proof.clone());
        Ok(())
    }

    fn lookup_transfer_proof(
        &mut self,
        exchange_url: &str,
        wtid: &WireTransferId,
    ) -> DbResult<Option<TransferProofRecord>> {
        Ok(self
            .tables
            .transfer_proofs
            .get(&(exchange_url.to_string(), *wtid))
            .cloned())
    }

    fn lookup_refunds(
        &mut self,
        merchant_pub: &MerchantPublicKey,
        h_contract_terms: &HashCode,
    ) -> DbResult<Vec<RefundRecord>> {
        Ok(self
            .tables
            .refunds
            .iter()
            .filter(|r| &r.merchant_pub == merchant_pub && &r.h_contract_terms == h_contract_terms)
            .cloned()
            .collect())
    }

    fn insert_refund(&mut self, refund: &RefundRecord) -> DbResult<u64> {
        let duplicate = self.tables.refunds.iter().any(|r| {
            r.merchant_pub == refund.merchant_pub
                && r.h_contract_terms == refund.h_contract_terms
                && r.coin_pub == refund.coin_pub
                && r.rtransaction_id == refund.rtransaction_id
        });
        if duplicate {
            return Err(unique("refunds"));
        }
        let tables = self.write();
        let serial = tables.allocate_serial();
        tables.refunds.push(RefundRecord {
            serial,
            ..refund.clone()
        });
        Ok(serial)
    }

    fn insert_refund_proof(
        &mut self,
        merchant_pub: &MerchantPublicKey,
        h_contract_terms: &HashCode,
        proof: &RefundProofRecord,
    ) -> DbResult<()> {
        let k = (
            *merchant_pub,
            *h_contract_terms,
            proof.coin_pub,
            proof.rtransaction_id,
        );
        if self.tables.refund_proofs.contains_key(&k) {
            return Err(unique("refund_proofs"));
        }
        self.write().refund_proofs.insert(k, proof.clone());
        Ok(())
    }

    fn lookup_refund_proof(
        &mut self,
        merchant_pub: &MerchantPublicKey,
        h_contract_terms: &HashCode,
        coin_pub: &CoinPublicKey,
        rtransaction_id: u64,
    ) -> DbResult<Option<RefundProofRecord>> {
        Ok(self
            .tables
            .refund_proofs
            .get(&(*merchant_pub, *h_contract_terms, *coin_pub, rtransaction_id))
            .cloned())
    }

    fn insert_wire_fee(&mut self, fee: &WireFeeRecord) -> DbResult<()> {
        let existing = self.tables.wire_fees.iter().find(|f| {
            f.master_pub == fee.master_pub
                && f.h_wire_method == fee.h_wire_method
                && f.start_date == fee.start_date
        });
        match existing {
            Some(f) if f == fee => Ok(()),
            Some(_) => Err(unique("wire_fees")),
            None => {
                self.write().wire_fees.push(fee.clone());
                Ok(())
            }
        }
    }

    fn lookup_wire_fee(
        &mut self,
        master_pub: &MasterPublicKey,
        h_wire_method: &HashCode,
        date: Timestamp,
    ) -> DbResult<Option<WireFeeRecord>> {
        Ok(self
            .tables
            .wire_fees
            .iter()
            .find(|f| {
                &f.master_pub == master_pub && &f.h_wire_method == h_wire_method && f.covers(date)
            })
            .cloned())
    }

    fn lookup_reserve(&mut self, reserve_pub: &ReservePublicKey) -> DbResult<Option<TipReserve>> {
        Ok(self.tables.reserves.get(reserve_pub).cloned())
    }

    fn upsert_reserve(&mut self, reserve: &TipReserve) -> DbResult<()> {
        self.write()
            .reserves
            .insert(reserve.reserve_pub, reserve.clone());
        Ok(())
    }

    fn list_reserves(&mut self) -> DbResult<Vec<ReserveSummary>> {
        Ok(self
            .tables
            .reserves
            .values()
            .map(|r| ReserveSummary {
                reserve_pub: r.reserve_pub,
                expiration: r.expiration,
                balance: r.balance.clone(),
                tips_authorized: self
                    .tables
                    .tips
                    .values()
                    .filter(|t| t.reserve_pub == r.reserve_pub)
                    .count() as u64,
            })
            .collect())
    }

    fn insert_credit_uuid(
        &mut self,
        credit_uuid: Uuid,
        reserve_pub: &ReservePublicKey,
    ) -> DbResult<()> {
        let k = (credit_uuid, *reserve_pub);
        if self.tables.credit_uuids.contains(&k) {
            return Err(unique("credit_uuids"));
        }
        self.write().credit_uuids.insert(k);
        Ok(())
    }

    fn insert_tip_authorization(&mut self, tip: &TipAuthorization) -> DbResult<()> {
        if self.tables.tips.contains_key(&tip.tip_id) {
            return Err(unique("tips"));
        }
        self.write().tips.insert(tip.tip_id, tip.clone());
        Ok(())
    }

    fn lookup_tip(&mut self, tip_id: &TipId) -> DbResult<Option<TipAuthorization>> {
        Ok(self.tables.tips.get(tip_id).cloned())
    }

    fn update_tip_amount_left(
        &mut self,
        tip_id: &TipId,
        amount_left: &Amount,
    ) -> DbResult<QueryStatus> {
        if !self.tables.tips.contains_key(tip_id) {
            return Ok(QueryStatus::NoResults);
        }
        if let Some(tip) = self.write().tips.get_mut(tip_id) {
            tip.amount_left = amount_left.clone();
        }
        Ok(QueryStatus::OneResult)
    }

    fn lookup_pickup(&mut self, tip_id: &TipId, pickup_id: &HashCode) -> DbResult<Option<TipPickup>> {
        Ok(self.tables.pickups.get(&(*tip_id, *pickup_id)).cloned())
    }

    fn insert_pickup(&mut self, pickup: &TipPickup) -> DbResult<()> {
        let k = (pickup.tip_id, pickup.pickup_id);
        if self.tables.pickups.contains_key(&k) {
            return Err(unique("pickups"));
        }
        self.write().pickups.insert(k, pickup.clone());
        Ok(())
    }

    fn list_pickups(&mut self, tip_id: &TipId) -> DbResult<Vec<TipPickup>> {
        Ok(self
            .tables
            .pickups
            .values()
            .filter(|p| &p.tip_id == tip_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RelativeTime, Stock};
    use serde_json::json;

    fn settings(id: &str) -> InstanceSettings {
        InstanceSettings {
            id: id.to_string(),
            name: "Shop".to_string(),
            address: json!({}),
            jurisdiction: json!({}),
            default_max_deposit_fee: "EUR:1".parse().unwrap(),
            default_max_wire_fee: "EUR:1".parse().unwrap(),
            default_wire_fee_amortization: 1,
            default_wire_transfer_delay: RelativeTime::from_secs(60),
            default_pay_delay: RelativeTime::from_secs(60),
        }
    }

    fn product(stocked: u64) -> ProductDetails {
        ProductDetails {
            description: "widget".to_string(),
            description_i18n: Default::default(),
            unit: "piece".to_string(),
            price: "EUR:5".parse().unwrap(),
            taxes: vec![],
            image: String::new(),
            address: serde_json::Value::Null,
            total_stocked: Stock::Units(stocked),
            total_sold: 0,
            total_lost: 0,
            next_restock: None,
        }
    }

    fn with_product(db: &MemoryDb, stocked: u64) {
        let mut tx = db.begin("setup").unwrap();
        tx.insert_product("shop", "p1", &product(stocked)).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_uncommitted_changes_are_invisible() {
        let db = MemoryDb::new();
        let mut tx = db.begin("writer").unwrap();
        tx.insert_instance(&settings("a"), &MerchantPublicKey::random(), &EddsaPrivateKey::generate())
            .unwrap();
        let mut reader = db.begin("reader").unwrap();
        assert!(reader.lookup_instance("a").unwrap().is_none());
        reader.rollback();
        tx.commit().unwrap();
        let mut reader = db.begin("reader").unwrap();
        assert!(reader.lookup_instance("a").unwrap().is_some());
        reader.rollback();
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let db = MemoryDb::new();
        let mut first = db.begin("first").unwrap();
        let mut second = db.begin("second").unwrap();
        first
            .insert_instance(&settings("a"), &MerchantPublicKey::random(), &EddsaPrivateKey::generate())
            .unwrap();
        second
            .insert_instance(&settings("b"), &MerchantPublicKey::random(), &EddsaPrivateKey::generate())
            .unwrap();
        assert!(first.commit().is_ok());
        assert_eq!(second.commit(), Err(DbError::Serialization));
    }

    #[test]
    fn test_read_only_transactions_never_conflict() {
        let db = MemoryDb::new();
        let mut reader = db.begin("reader").unwrap();
        let mut writer = db.begin("writer").unwrap();
        writer
            .insert_instance(&settings("a"), &MerchantPublicKey::random(), &EddsaPrivateKey::generate())
            .unwrap();
        writer.commit().unwrap();
        assert!(reader.list_instances().unwrap().is_empty());
        assert!(reader.commit().is_ok());
    }

    #[test]
    fn test_duplicate_instance_is_unique_violation() {
        let db = MemoryDb::new();
        let mut tx = db.begin("t").unwrap();
        let s = settings("a");
        tx.insert_instance(&s, &MerchantPublicKey::random(), &EddsaPrivateKey::generate())
            .unwrap();
        assert_eq!(
            tx.insert_instance(&s, &MerchantPublicKey::random(), &EddsaPrivateKey::generate()),
            Err(DbError::UniqueViolation { table: "instances" })
        );
        tx.rollback();
    }

    #[test]
    fn test_locks_respect_available_stock() {
        let db = MemoryDb::new();
        with_product(&db, 5);
        let now = Timestamp::from_secs(1_000);
        let later = Timestamp::from_secs(2_000);
        let mut tx = db.begin("lock").unwrap();
        assert_eq!(
            tx.lock_product("shop", "p1", Uuid::new_v4(), 3, later, now).unwrap(),
            QueryStatus::OneResult
        );
        assert_eq!(
            tx.insert_order_lock("shop", "p1", "o1", 2, now).unwrap(),
            QueryStatus::OneResult
        );
        assert_eq!(
            tx.insert_order_lock("shop", "p1", "o2", 1, now).unwrap(),
            QueryStatus::NoResults
        );
        tx.commit().unwrap();
    }

    #[test]
    fn test_unlimited_locks_refuse_overflowing_totals() {
        let db = MemoryDb::new();
        let mut unlimited = product(0);
        unlimited.total_stocked = Stock::Unlimited;
        let mut tx = db.begin("setup").unwrap();
        tx.insert_product("shop", "p1", &unlimited).unwrap();
        tx.commit().unwrap();

        let now = Timestamp::from_secs(1_000);
        let later = Timestamp::from_secs(2_000);
        let held = Uuid::new_v4();
        let mut tx = db.begin("lock").unwrap();
        assert_eq!(
            tx.lock_product("shop", "p1", held, u64::MAX, later, now).unwrap(),
            QueryStatus::OneResult
        );
        assert_eq!(
            tx.lock_product("shop", "p1", Uuid::new_v4(), 1, later, now).unwrap(),
            QueryStatus::NoResults
        );
        assert_eq!(
            tx.lock_product("shop", "p1", held, 1, later, now).unwrap(),
            QueryStatus::NoResults
        );
        assert_eq!(
            tx.insert_order_lock("shop", "p1", "o1", 1, now).unwrap(),
            QueryStatus::NoResults
        );
        let record = tx.lookup_product("shop", "p1").unwrap().unwrap();
        assert_eq!(record.total_locked, u64::MAX);
        tx.rollback();
    }

    #[test]
    fn test_expired_inventory_locks_free_stock() {
        let db = MemoryDb::new();
        with_product(&db, 2);
        let mut tx = db.begin("lock").unwrap();
        tx.lock_product(
            "shop",
            "p1",
            Uuid::new_v4(),
            2,
            Timestamp::from_secs(100),
            Timestamp::from_secs(50),
        )
        .unwrap();
        assert_eq!(
            tx.insert_order_lock("shop", "p1", "o1", 2, Timestamp::from_secs(150)).unwrap(),
            QueryStatus::OneResult
        );
        tx.rollback();
    }

    #[test]
    fn test_sell_order_locks_moves_units_to_sold() {
        let db = MemoryDb::new();
        with_product(&db, 10);
        let mut tx = db.begin("sell").unwrap();
        tx.insert_order_lock("shop", "p1", "o1", 1, Timestamp::from_secs(1)).unwrap();
        assert_eq!(tx.sell_order_locks("shop", "o1").unwrap(), QueryStatus::OneResult);
        let record = tx.lookup_product("shop", "p1").unwrap().unwrap();
        assert_eq!(record.details.total_sold, 1);
        assert_eq!(record.total_locked, 0);
        assert_eq!(record.details.remaining(), Some(9));
        tx.rollback();
    }

    #[test]
    fn test_leaked_transaction_is_cleared_by_preflight() {
        let db = MemoryDb::new();
        {
            let _tx = db.begin("forgotten").unwrap();
        }
        assert_eq!(db.leaked.lock().len(), 1);
        db.preflight();
        assert!(db.leaked.lock().is_empty());
    }

    #[test]
    fn test_list_orders_pagination_directions() {
        let db = MemoryDb::new();
        let mut tx = db.begin("orders").unwrap();
        tx.insert_instance(&settings("shop"), &MerchantPublicKey::random(), &EddsaPrivateKey::generate())
            .unwrap();
        for n in 0..5 {
            tx.insert_order(
                "shop",
                &format!("o{}", n),
                Timestamp::from_secs(100),
                Timestamp::from_secs(n),
                &json!({"amount": "EUR:1", "summary": "x"}),
            )
            .unwrap();
        }
        let forward = tx
            .list_orders("shop", &OrderFilter { delta: 2, ..OrderFilter::default() })
            .unwrap();
        assert_eq!(
            forward.iter().map(|r| r.order_id.as_str()).collect::<Vec<_>>(),
            vec!["o0", "o1"]
        );
        let backward = tx
            .list_orders("shop", &OrderFilter { delta: -2, ..OrderFilter::default() })
            .unwrap();
        assert_eq!(
            backward.iter().map(|r| r.order_id.as_str()).collect::<Vec<_>>(),
            vec!["o4", "o3"]
        );
        let after = tx
            .list_orders(
                "shop",
                &OrderFilter {
                    delta: 10,
                    start_row: Some(forward[1].row_id),
                    date_before: Some(Timestamp::from_secs(4)),
                    ..OrderFilter::default()
                },
            )
            .unwrap();
        assert_eq!(
            after.iter().map(|r| r.order_id.as_str()).collect::<Vec<_>>(),
            vec!["o2", "o3"]
        );
        tx.rollback();
    }

    #[test]
    fn test_wire_fee_lookup_by_date() {
        let db = MemoryDb::new();
        let fee = WireFeeRecord {
            master_pub: MasterPublicKey::random(),
            h_wire_method: HashCode::random(),
            wire_method: "iban".to_string(),
            wire_fee: "EUR:0.01".parse().unwrap(),
            closing_fee: "EUR:0.01".parse().unwrap(),
            start_date: Timestamp::from_secs(100),
            end_date: Timestamp::from_secs(200),
            master_sig: crate::types::EddsaSignature::from_bytes([0; 64]),
        };
        let mut tx = db.begin("fees").unwrap();
        tx.insert_wire_fee(&fee).unwrap();
        tx.insert_wire_fee(&fee).unwrap();
        let hit = tx
            .lookup_wire_fee(&fee.master_pub, &fee.h_wire_method, Timestamp::from_secs(150))
            .unwrap();
        assert_eq!(hit, Some(fee.clone()));
        let miss = tx
            .lookup_wire_fee(&fee.master_pub, &fee.h_wire_method, Timestamp::from_secs(200))
            .unwrap();
        assert_eq!(miss, None);
        tx.rollback();
    }
}
