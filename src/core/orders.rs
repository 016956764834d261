//! Order proposals, claims and their lifecycle
//!
//! An order is created from a partial contract that the backend completes
//! with the instance defaults. Claiming moves it into the contract table,
//! fixing its canonical hash; from then on the document never changes.
//! Inventory is held for an order through order locks, which become sold
//! units once the contract is paid.

use super::backend::{instance_keypair, load_instance, MerchantBackend};
use crate::crypto::{hash_contract_terms, signatures};
use crate::db::{DbError, MerchantTx};
use crate::types::keys::encode_base32;
use crate::types::{
    Amount, ContractRecord, ContractTerms, EddsaSignature, HashCode, InstanceRecord,
    MerchantError, OrderFilter, OrderSummary, Timestamp,
};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

/// Units of a product to hold for a new order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub product_id: String,
    pub quantity: u64,
}

/// Body of an order creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostOrderRequest {
    /// Partial contract terms; missing fields are filled from the instance defaults
    pub order: Value,
    #[serde(default)]
    pub inventory_products: Vec<LockRequest>,
    /// Inventory locks to release once the order holds its own
    #[serde(default)]
    pub lock_uuids: Vec<Uuid>,
}

/// A claimed contract with the merchant's signature over its hash
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimedContract {
    pub contract_terms: Value,
    pub sig: EddsaSignature,
    pub h_contract_terms: HashCode,
}

/// Payment state of an order as seen by the merchant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderStatus {
    pub order_id: String,
    pub claimed: bool,
    pub paid: bool,
    pub wired: bool,
    pub refunded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_amount: Option<Amount>,
    /// Another order the same session already paid for this fulfillment URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_paid_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h_contract_terms: Option<HashCode>,
    pub contract_terms: Value,
}

/// Fresh order id of the form `YYYY.DDD-NONCE`
fn generate_order_id() -> String {
    let mut nonce = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut nonce);
    format!("{}-{}", Utc::now().format("%Y.%j"), encode_base32(&nonce))
}

fn fill(terms: &mut Map<String, Value>, key: &str, value: impl FnOnce() -> Result<Value, MerchantError>) -> Result<(), MerchantError> {
    if !terms.contains_key(key) {
        terms.insert(key.to_string(), value()?);
    }
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, MerchantError> {
    Ok(serde_json::to_value(value)?)
}

impl MerchantBackend {
    fn trusted_exchanges(&self) -> Value {
        let exchanges: Vec<Value> = self
            .exchanges()
            .urls()
            .into_iter()
            .filter_map(|url| {
                let handle = self.exchanges().lookup(&url)?;
                Some(json!({ "url": url, "master_pub": handle.master_pub() }))
            })
            .collect();
        Value::Array(exchanges)
    }

    /// Complete a partial contract with instance defaults and locked products
    fn complete_terms(
        &self,
        tx: &mut dyn MerchantTx,
        record: &InstanceRecord,
        order_id: &str,
        request: &PostOrderRequest,
        now: Timestamp,
    ) -> Result<Value, MerchantError> {
        let Value::Object(mut terms) = request.order.clone() else {
            return Err(MerchantError::JsonInvalid {
                message: "order must be a JSON object".to_string(),
            });
        };
        let settings = &record.settings;
        let instance = settings.id.as_str();

        let account = tx
            .lookup_accounts(instance)?
            .into_iter()
            .find(|a| a.active)
            .ok_or_else(|| MerchantError::InstanceLacksWire {
                instance: instance.to_string(),
            })?;
        let wire_method = account
            .wire_method()
            .ok_or_else(|| MerchantError::internal("stored account without wire method"))?
            .to_string();

        terms.insert("order_id".to_string(), json!(order_id));
        fill(&mut terms, "timestamp", || to_json(&now))?;
        fill(&mut terms, "refund_deadline", || to_json(&now))?;
        fill(&mut terms, "pay_deadline", || to_json(&(now + settings.default_pay_delay)))?;
        fill(&mut terms, "wire_transfer_deadline", || {
            to_json(&(now + settings.default_wire_transfer_delay))
        })?;
        fill(&mut terms, "max_fee", || to_json(&settings.default_max_deposit_fee))?;
        fill(&mut terms, "max_wire_fee", || to_json(&settings.default_max_wire_fee))?;
        fill(&mut terms, "wire_fee_amortization", || {
            Ok(json!(settings.default_wire_fee_amortization))
        })?;
        fill(&mut terms, "merchant", || {
            Ok(json!({
                "instance": instance,
                "name": settings.name,
                "address": settings.address,
                "jurisdiction": settings.jurisdiction,
            }))
        })?;
        fill(&mut terms, "exchanges", || Ok(self.trusted_exchanges()))?;
        terms.insert("merchant_pub".to_string(), to_json(&record.merchant_pub)?);
        terms.insert("H_wire".to_string(), to_json(&account.h_wire)?);
        terms.insert("wire_method".to_string(), json!(wire_method));

        if !request.inventory_products.is_empty() {
            let mut products = match terms.remove("products") {
                Some(Value::Array(items)) => items,
                Some(_) => return Err(MerchantError::malformed("products", "must be an array")),
                None => Vec::new(),
            };
            for item in &request.inventory_products {
                let product = tx
                    .lookup_product(instance, &item.product_id)?
                    .ok_or_else(|| MerchantError::product_unknown(&item.product_id))?;
                products.push(json!({
                    "product_id": item.product_id,
                    "description": product.details.description,
                    "quantity": item.quantity,
                    "unit": product.details.unit,
                    "price": product.details.price,
                }));
            }
            terms.insert("products".to_string(), Value::Array(products));
        }

        Ok(Value::Object(terms))
    }

    /// Create an order and hold its inventory
    ///
    /// Missing contract fields are filled from the instance defaults. All
    /// order locks are taken in the same transaction as the order row, and
    /// the inventory locks named in `lock_uuids` are released there too.
    ///
    /// # Returns
    ///
    /// The order id, generated when the order carries none.
    ///
    /// # Errors
    ///
    /// * `OrderBadCurrency` - the amount is not in the backend currency
    /// * `InstanceLacksWire` - the instance has no active account
    /// * `ProductUnknown` / `ProductOutOfStock` - an inventory product cannot be held
    /// * `OrderConflict` - the order id is taken
    pub fn create_order(&self, instance: &str, request: &PostOrderRequest) -> Result<String, MerchantError> {
        let amount: Amount = match request.order.get("amount") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| MerchantError::malformed("amount", e.to_string()))?,
            None => return Err(MerchantError::malformed("amount", "missing")),
        };
        let currency = &self.settings().currency;
        if amount.currency() != currency {
            return Err(MerchantError::OrderBadCurrency {
                expected: currency.clone(),
                actual: amount.currency().to_string(),
            });
        }
        let order_id = match request.order.get("order_id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => return Err(MerchantError::malformed("order_id", "must be a non-empty string")),
            None => generate_order_id(),
        };
        let now = Timestamp::now();

        self.transact("create_order", |tx| {
            let record = load_instance(tx, instance)?;
            let terms = self.complete_terms(tx, &record, &order_id, request, now)?;
            let typed = ContractTerms::from_json(&terms)?;

            match tx.insert_order(instance, &order_id, typed.pay_deadline, now, &terms) {
                Err(DbError::UniqueViolation { .. }) => {
                    return Err(MerchantError::OrderConflict {
                        order_id: order_id.clone(),
                    })
                }
                other => other?,
            }
            for uuid in &request.lock_uuids {
                tx.unlock_inventory(instance, *uuid)?;
            }
            for item in &request.inventory_products {
                let status = tx.insert_order_lock(instance, &item.product_id, &order_id, item.quantity, now)?;
                if !status.is_found() {
                    return Err(MerchantError::ProductOutOfStock {
                        product_id: item.product_id.clone(),
                        requested: item.quantity,
                    });
                }
            }
            Ok(())
        })?;

        info!(instance, order_id = %order_id, amount = %amount, "Order created");
        Ok(order_id)
    }

    /// Claim an order for a wallet, turning it into signed contract terms
    ///
    /// The wallet's `nonce` becomes part of the terms. Claiming again with
    /// the same nonce, or without one, returns the same contract.
    ///
    /// # Errors
    ///
    /// * `OrderUnknown` - neither an order nor a contract has this id
    /// * `OrderAlreadyClaimed` - claimed earlier with a different nonce
    /// * `InstanceInactive` - the instance can no longer sign
    pub fn claim_order(
        &self,
        instance: &str,
        order_id: &str,
        nonce: Option<&str>,
    ) -> Result<ClaimedContract, MerchantError> {
        let (record, contract) = self.transact("claim_order", |tx| {
            let record = load_instance(tx, instance)?;
            instance_keypair(&record)?;

            if let Some(existing) = tx.lookup_contract_terms(instance, order_id)? {
                let stored_nonce = existing.contract_terms.get("nonce").and_then(Value::as_str);
                if nonce.is_some() && nonce != stored_nonce {
                    return Err(MerchantError::OrderAlreadyClaimed {
                        order_id: order_id.to_string(),
                    });
                }
                return Ok((record, existing));
            }

            let order = tx
                .lookup_order(instance, order_id)?
                .ok_or_else(|| MerchantError::order_unknown(order_id))?;
            let mut terms = order.contract_terms;
            if let (Some(nonce), Value::Object(fields)) = (nonce, &mut terms) {
                fields.insert("nonce".to_string(), json!(nonce));
            }
            let typed = ContractTerms::from_json(&terms)?;
            let contract = ContractRecord {
                serial: order.serial,
                order_id: order_id.to_string(),
                h_contract_terms: hash_contract_terms(&terms),
                contract_terms: terms,
                creation_time: order.creation_time,
                pay_deadline: typed.pay_deadline,
                refund_deadline: typed.refund_deadline,
                fulfillment_url: typed.fulfillment_url,
                session_id: None,
                paid: false,
                wired: false,
            };
            tx.insert_contract_terms(instance, &contract)?;
            tx.delete_order(instance, order_id)?;
            debug!(instance, order_id, h_contract_terms = %contract.h_contract_terms, "Order claimed");
            Ok((record, contract))
        })?;

        let keypair = instance_keypair(&record)?;
        Ok(ClaimedContract {
            sig: keypair.sign(&signatures::contract_signature(&contract.h_contract_terms)),
            h_contract_terms: contract.h_contract_terms,
            contract_terms: contract.contract_terms,
        })
    }

    /// Delete an order or contract the merchant may forget
    ///
    /// Unpaid orders and contracts may go once their pay deadline passed;
    /// anything may go once the legal retention period is over. The
    /// order's inventory locks are released.
    ///
    /// # Errors
    ///
    /// `OrderUnknown`, or `OrderDeleteNotAllowed` naming the reason.
    pub fn delete_order(&self, instance: &str, order_id: &str) -> Result<(), MerchantError> {
        let now = Timestamp::now();
        let retention = self.settings().legal_retention;
        let not_allowed = |reason: &str| MerchantError::OrderDeleteNotAllowed {
            order_id: order_id.to_string(),
            reason: reason.to_string(),
        };

        self.transact("delete_order", |tx| {
            load_instance(tx, instance)?;
            if let Some(contract) = tx.lookup_contract_terms(instance, order_id)? {
                let retention_over = contract.creation_time + retention < now;
                let abandoned = !contract.paid && contract.pay_deadline < now;
                if !(retention_over || abandoned) {
                    return Err(not_allowed(if contract.paid {
                        "contract is paid and within legal retention"
                    } else {
                        "pay deadline has not passed"
                    }));
                }
                tx.delete_contract_terms(instance, order_id)?;
            } else {
                let order = tx
                    .lookup_order(instance, order_id)?
                    .ok_or_else(|| MerchantError::order_unknown(order_id))?;
                if order.pay_deadline >= now && order.creation_time + retention >= now {
                    return Err(not_allowed("pay deadline has not passed"));
                }
                tx.delete_order(instance, order_id)?;
            }
            tx.release_order_locks(instance, order_id)?;
            Ok(())
        })?;
        info!(instance, order_id, "Order deleted");
        Ok(())
    }

    /// Orders and contracts of an instance, filtered and paginated
    pub fn list_orders(&self, instance: &str, filter: &OrderFilter) -> Result<Vec<OrderSummary>, MerchantError> {
        self.transact("list_orders", |tx| {
            load_instance(tx, instance)?;
            Ok(tx.list_orders(instance, filter)?)
        })
    }

    /// Whether an order was claimed, paid, wired or refunded
    ///
    /// When `session_id` is given and the order is unpaid, reports another
    /// order that the session already paid for the same fulfillment URL.
    pub fn order_status(
        &self,
        instance: &str,
        order_id: &str,
        session_id: Option<&str>,
    ) -> Result<OrderStatus, MerchantError> {
        self.transact("order_status", |tx| {
            let record = load_instance(tx, instance)?;
            let (mut status, fulfillment_url) = match tx.lookup_contract_terms(instance, order_id)? {
                Some(contract) => {
                    let typed = ContractTerms::from_json(&contract.contract_terms)?;
                    let refunds = tx.lookup_refunds(&record.merchant_pub, &contract.h_contract_terms)?;
                    let refund_amount = Amount::sum(
                        typed.amount.currency(),
                        refunds.iter().map(|r| &r.refund_amount),
                    )?;
                    let status = OrderStatus {
                        order_id: order_id.to_string(),
                        claimed: true,
                        paid: contract.paid,
                        wired: contract.wired,
                        refunded: !refund_amount.is_zero(),
                        refund_amount: Some(refund_amount),
                        already_paid_order_id: None,
                        h_contract_terms: Some(contract.h_contract_terms),
                        contract_terms: contract.contract_terms,
                    };
                    (status, contract.fulfillment_url)
                }
                None => {
                    let order = tx
                        .lookup_order(instance, order_id)?
                        .ok_or_else(|| MerchantError::order_unknown(order_id))?;
                    let fulfillment_url = order
                        .contract_terms
                        .get("fulfillment_url")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let status = OrderStatus {
                        order_id: order_id.to_string(),
                        claimed: false,
                        paid: false,
                        wired: false,
                        refunded: false,
                        refund_amount: None,
                        already_paid_order_id: None,
                        h_contract_terms: None,
                        contract_terms: order.contract_terms,
                    };
                    (status, fulfillment_url)
                }
            };

            if let (false, Some(session), Some(url)) = (status.paid, session_id, fulfillment_url) {
                status.already_paid_order_id = tx
                    .lookup_session_binding(instance, &url, session)?
                    .filter(|other| other != order_id);
            }
            Ok(status)
        })
    }

    /// Order id the session paid for `fulfillment_url`, if any
    pub fn lookup_session(
        &self,
        instance: &str,
        fulfillment_url: &str,
        session_id: &str,
    ) -> Result<Option<String>, MerchantError> {
        self.transact("lookup_session", |tx| {
            load_instance(tx, instance)?;
            Ok(tx.lookup_session_binding(instance, fulfillment_url, session_id)?)
        })
    }
}
