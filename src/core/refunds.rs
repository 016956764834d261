//! Refunds
//!
//! Granting a refund only writes refund rows, spread over the contract's
//! deposits, each coin giving at most what it paid. The money moves once the
//! wallet asks for the refund proofs: each row is then signed with the
//! instance key and executed at the coin's exchange, whose confirmation
//! is stored and served again on later requests.

use super::backend::{instance_keypair, load_instance, MerchantBackend};
use super::scheduler::RequestScope;
use crate::crypto::signatures::{self, RefundTerms};
use crate::crypto::EddsaKeyPair;
use crate::db::DbError;
use crate::exchange::wire::RefundRequest;
use crate::exchange::EndpointClass;
use crate::types::{
    Amount, CoinPublicKey, EddsaSignature, ExchangePublicKey, HashCode, MerchantError,
    MerchantPublicKey, RefundProofRecord, RefundRecord, Timestamp,
};
use futures::future::join_all;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{info, warn};

/// Answer to a successful refund increase
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundGranted {
    pub h_contract_terms: HashCode,
    pub taler_refund_uri: String,
}

/// One executed refund with the exchange's confirmation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundProof {
    pub coin_pub: CoinPublicKey,
    pub exchange_url: String,
    pub rtransaction_id: u64,
    pub refund_amount: Amount,
    pub refund_fee: Amount,
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: ExchangePublicKey,
}

/// Every executed refund of a contract
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundProofs {
    pub h_contract_terms: HashCode,
    pub merchant_pub: MerchantPublicKey,
    pub refunds: Vec<RefundProof>,
}

fn refund_terms<'a>(refund: &'a RefundRecord) -> RefundTerms<'a> {
    RefundTerms {
        h_contract_terms: &refund.h_contract_terms,
        coin_pub: &refund.coin_pub,
        merchant_pub: &refund.merchant_pub,
        rtransaction_id: refund.rtransaction_id,
        refund_amount: &refund.refund_amount,
        refund_fee: &refund.refund_fee,
    }
}

fn proof_of(refund: &RefundRecord, proof: RefundProofRecord) -> RefundProof {
    RefundProof {
        coin_pub: refund.coin_pub,
        exchange_url: refund.exchange_url.clone(),
        rtransaction_id: refund.rtransaction_id,
        refund_amount: refund.refund_amount.clone(),
        refund_fee: refund.refund_fee.clone(),
        exchange_sig: proof.exchange_sig,
        exchange_pub: proof.exchange_pub,
    }
}

impl MerchantBackend {
    /// Raise the total refunded for a paid order to `refund`
    ///
    /// A total at or below what is already refunded changes nothing. The
    /// increase is spread over the deposits, never taking more from a coin
    /// than it contributed.
    ///
    /// # Arguments
    ///
    /// * `instance` - instance the order belongs to
    /// * `order_id` - a paid order
    /// * `refund` - new refund total, not an increment
    /// * `reason` - stored with every refund row
    ///
    /// # Errors
    ///
    /// * `OrderUnknown` - no claimed contract with this id
    /// * `RefundOrderNotPaid`, `RefundAfterDeadline`
    /// * `RefundInconsistentAmount` - the total exceeds what the coins paid; nothing is stored
    pub fn increase_refund(
        &self,
        instance: &str,
        order_id: &str,
        refund: &Amount,
        reason: &str,
    ) -> Result<RefundGranted, MerchantError> {
        let now = Timestamp::now();
        let h_contract_terms = self.transact("increase_refund", |tx| {
            let record = load_instance(tx, instance)?;
            let contract = tx
                .lookup_contract_terms(instance, order_id)?
                .ok_or_else(|| MerchantError::order_unknown(order_id))?;
            if !contract.paid {
                return Err(MerchantError::RefundOrderNotPaid {
                    order_id: order_id.to_string(),
                });
            }
            if contract.refund_deadline < now {
                return Err(MerchantError::RefundAfterDeadline {
                    order_id: order_id.to_string(),
                });
            }

            let h = contract.h_contract_terms;
            let deposits = tx.lookup_deposits(&record.merchant_pub, &h)?;
            let existing = tx.lookup_refunds(&record.merchant_pub, &h)?;
            let currency = refund.currency();
            let mut granted = Amount::sum(currency, existing.iter().map(|r| &r.refund_amount))?;
            if refund.checked_cmp(&granted)? != Ordering::Greater {
                return Ok(h);
            }

            let mut rtransaction_id = existing.iter().map(|r| r.rtransaction_id).max().unwrap_or(0);
            for deposit in &deposits {
                let taken = Amount::sum(
                    currency,
                    existing
                        .iter()
                        .filter(|r| r.coin_pub == deposit.coin_pub)
                        .map(|r| &r.refund_amount),
                )?;
                let left = deposit.amount_with_fee.saturating_sub(&taken)?;
                if left.is_zero() {
                    continue;
                }
                let increment = left.checked_min(&refund.checked_sub(&granted)?)?;
                rtransaction_id += 1;
                tx.insert_refund(&RefundRecord {
                    serial: 0,
                    merchant_pub: record.merchant_pub,
                    h_contract_terms: h,
                    coin_pub: deposit.coin_pub,
                    exchange_url: deposit.exchange_url.clone(),
                    rtransaction_id,
                    reason: reason.to_string(),
                    refund_amount: increment.clone(),
                    refund_fee: deposit.refund_fee.clone(),
                    timestamp: now,
                })?;
                granted = granted.checked_add(&increment)?;
                if granted == *refund {
                    break;
                }
            }

            if granted.checked_cmp(refund)? == Ordering::Less {
                let paid = Amount::sum(currency, deposits.iter().map(|d| &d.amount_with_fee))?;
                warn!(instance, order_id, requested = %refund, %paid, "Refund exceeds the amount paid");
                return Err(MerchantError::RefundInconsistentAmount {
                    order_id: order_id.to_string(),
                    requested: refund.to_string(),
                    paid: paid.to_string(),
                });
            }
            Ok(h)
        })?;

        info!(instance, order_id, refund = %refund, "Refund granted");
        Ok(RefundGranted {
            h_contract_terms,
            taler_refund_uri: format!(
                "taler://refund/{}/{}/{}/",
                self.settings().public_host(),
                instance,
                order_id
            ),
        })
    }

    /// Every refund row of an order, in the order they were granted
    pub fn lookup_refunds(&self, instance: &str, order_id: &str) -> Result<Vec<RefundRecord>, MerchantError> {
        self.transact("lookup_refunds", |tx| {
            let record = load_instance(tx, instance)?;
            let contract = tx
                .lookup_contract_terms(instance, order_id)?
                .ok_or_else(|| MerchantError::order_unknown(order_id))?;
            Ok(tx.lookup_refunds(&record.merchant_pub, &contract.h_contract_terms)?)
        })
    }

    /// Execute one refund row at its exchange
    async fn execute_refund(
        &self,
        keypair: &EddsaKeyPair,
        refund: &RefundRecord,
        scope: &RequestScope,
    ) -> Result<RefundProofRecord, MerchantError> {
        let ready = self
            .exchanges()
            .lookup_ready(&refund.exchange_url)
            .ok_or_else(|| MerchantError::exchange_unknown(&refund.exchange_url))?;
        let handle = &ready.handle;
        let terms = refund_terms(refund);
        let request = RefundRequest {
            h_contract_terms: refund.h_contract_terms,
            coin_pub: refund.coin_pub,
            merchant_pub: refund.merchant_pub,
            rtransaction_id: refund.rtransaction_id,
            refund_amount: refund.refund_amount.clone(),
            refund_fee: refund.refund_fee.clone(),
            merchant_sig: keypair.sign(&signatures::refund_permission(&terms)),
        };
        let confirmation = scope
            .run(handle.url(), async {
                let _permit = handle.acquire(EndpointClass::Refund).await?;
                Ok::<_, MerchantError>(handle.client().refund(&request).await?)
            })
            .await?;

        let body = &confirmation.body;
        if ready
            .keys
            .verify_exchange_signature(&body.exchange_pub, &signatures::refund_confirmation(&terms), &body.sig)
            .is_err()
        {
            return Err(MerchantError::ExchangeSignatureInvalid {
                exchange_url: handle.url().to_string(),
                what: "refund confirmation".to_string(),
                exchange_reply: confirmation.raw,
            });
        }
        Ok(RefundProofRecord {
            coin_pub: refund.coin_pub,
            rtransaction_id: refund.rtransaction_id,
            exchange_pub: body.exchange_pub,
            exchange_sig: body.sig,
        })
    }

    /// Execute outstanding refunds and return every confirmation
    ///
    /// Refunds already confirmed are answered from storage. Confirmations
    /// obtained before a sibling refund failed are stored all the same.
    ///
    /// # Errors
    ///
    /// `OrderUnknown`, or the first exchange failure among the outstanding refunds.
    pub async fn fetch_refund_proofs(&self, instance: &str, order_id: &str) -> Result<RefundProofs, MerchantError> {
        let (record, h_contract_terms, refunds, stored) = self.transact("refund_proofs_lookup", |tx| {
            let record = load_instance(tx, instance)?;
            let contract = tx
                .lookup_contract_terms(instance, order_id)?
                .ok_or_else(|| MerchantError::order_unknown(order_id))?;
            let h = contract.h_contract_terms;
            let refunds = tx.lookup_refunds(&record.merchant_pub, &h)?;
            let mut stored = Vec::with_capacity(refunds.len());
            for refund in &refunds {
                stored.push(tx.lookup_refund_proof(
                    &record.merchant_pub,
                    &h,
                    &refund.coin_pub,
                    refund.rtransaction_id,
                )?);
            }
            Ok((record, h, refunds, stored))
        })?;

        let outstanding: Vec<&RefundRecord> = refunds
            .iter()
            .zip(&stored)
            .filter(|(_, proof)| proof.is_none())
            .map(|(refund, _)| refund)
            .collect();
        let mut fresh = Vec::new();
        let mut failure = None;
        if !outstanding.is_empty() {
            let keypair = instance_keypair(&record)?;
            let scope = self.scope();
            let results = join_all(
                outstanding
                    .iter()
                    .map(|refund| self.execute_refund(&keypair, refund, &scope)),
            )
            .await;
            for result in results {
                match result {
                    Ok(proof) => fresh.push(proof),
                    Err(e) => {
                        warn!(instance, order_id, error = %e, "Refund execution failed");
                        failure.get_or_insert(e);
                    }
                }
            }
            self.transact("refund_proofs_store", |tx| {
                for proof in &fresh {
                    match tx.insert_refund_proof(&record.merchant_pub, &h_contract_terms, proof) {
                        Ok(()) | Err(DbError::UniqueViolation { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            })?;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let mut proofs = Vec::with_capacity(refunds.len());
        for (refund, proof) in refunds.iter().zip(stored) {
            let proof = match proof {
                Some(proof) => proof,
                None => fresh
                    .iter()
                    .find(|p| p.coin_pub == refund.coin_pub && p.rtransaction_id == refund.rtransaction_id)
                    .cloned()
                    .ok_or_else(|| MerchantError::internal("refund executed without a confirmation"))?,
            };
            proofs.push(proof_of(refund, proof));
        }
        Ok(RefundProofs {
            h_contract_terms,
            merchant_pub: record.merchant_pub,
            refunds: proofs,
        })
    }
}
