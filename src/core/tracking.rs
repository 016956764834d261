//! Wire transfer tracking and reconciliation
//!
//! `track_transaction` asks the exchanges which wire transfer carried each
//! deposit of a contract. `track_transfer` asks an exchange which deposits
//! a wire transfer aggregated and reconciles the answer with the deposits
//! the backend stored when it was paid. A contract is wired once every one
//! of its deposits is mapped to a transfer whose proof is stored.

use super::backend::{instance_keypair, load_instance, MerchantBackend};
use super::scheduler::RequestScope;
use crate::crypto::hash_wire_method;
use crate::crypto::signatures::{self, TransferDetailTerms};
use crate::crypto::EddsaKeyPair;
use crate::db::{DbError, MerchantTx};
use crate::exchange::client::Decoded;
use crate::exchange::wire::{
    TrackTransactionOutcome, TrackTransactionRequest, TrackTransferResponse,
};
use crate::exchange::{normalize_url, EndpointClass, ExchangeError, ReadyExchange};
use crate::types::{
    Amount, CoinPublicKey, CoinTransfer, DepositRecord, EddsaSignature, ExchangePublicKey,
    HashCode, MasterPublicKey, MerchantError, MerchantPublicKey, Timestamp, TransferProofRecord,
    WireTransferId,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Money one contract received through a wire transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepositSum {
    pub order_id: String,
    pub deposit_value: Amount,
    pub deposit_fee: Amount,
}

/// A wire transfer as the exchange reported it, summed per contract
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackTransferReply {
    pub wtid: WireTransferId,
    pub total_amount: Amount,
    pub wire_fee: Amount,
    pub merchant_pub: MerchantPublicKey,
    #[serde(rename = "H_wire")]
    pub h_wire: HashCode,
    pub execution_time: Timestamp,
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: ExchangePublicKey,
    pub deposits_sums: Vec<DepositSum>,
}

impl TrackTransferReply {
    fn new(transfer: TrackTransferResponse, deposits_sums: Vec<DepositSum>) -> Self {
        Self {
            wtid: transfer.wtid,
            total_amount: transfer.total_amount,
            wire_fee: transfer.wire_fee,
            merchant_pub: transfer.merchant_pub,
            h_wire: transfer.h_wire,
            execution_time: transfer.execution_time,
            exchange_sig: transfer.exchange_sig,
            exchange_pub: transfer.exchange_pub,
            deposits_sums,
        }
    }
}

/// Coins of one contract that went out with the same wire transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractTransfer {
    pub exchange_url: String,
    pub wtid: WireTransferId,
    pub execution_time: Option<Timestamp>,
    pub coins: Vec<CoinPublicKey>,
}

/// Where a contract's money went
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TrackTransactionReply {
    Wired { transfers: Vec<ContractTransfer> },
    /// Some deposit is not aggregated yet; nothing moves before `execution_time`
    Pending { execution_time: Timestamp },
}

impl TrackTransactionReply {
    pub fn http_status(&self) -> u16 {
        match self {
            TrackTransactionReply::Wired { .. } => 200,
            TrackTransactionReply::Pending { .. } => 202,
        }
    }
}

/// What an exchange said about one deposit
enum DepositTrace {
    Wired(CoinTransfer),
    Pending(Timestamp),
}

/// Fail with the signed fee statement if the exchange charged more than it announced
fn check_wire_fee(
    tx: &mut dyn MerchantTx,
    master_pub: &MasterPublicKey,
    wire_method: &str,
    transfer: &TrackTransferResponse,
    raw: &Value,
) -> Result<(), MerchantError> {
    let h_wire_method = hash_wire_method(wire_method);
    match tx.lookup_wire_fee(master_pub, &h_wire_method, transfer.execution_time)? {
        Some(statement) => {
            if transfer.wire_fee.checked_cmp(&statement.wire_fee)? == Ordering::Greater {
                return Err(MerchantError::TrackBadWireFee {
                    wtid: transfer.wtid.to_string(),
                    evidence: json!({
                        "claimed_wire_fee": transfer.wire_fee,
                        "wire_fee_statement": statement,
                        "transfer_proof": raw,
                    }),
                });
            }
            Ok(())
        }
        None => {
            warn!(wtid = %transfer.wtid, wire_method, "No wire fee statement covers the transfer; accepting the exchange's fee");
            Ok(())
        }
    }
}

/// Map each reported deposit that is ours to the transfer
///
/// Returns the contracts the transfer paid into.
fn reconcile(
    tx: &mut dyn MerchantTx,
    merchant_pub: &MerchantPublicKey,
    exchange_url: &str,
    transfer: &TrackTransferResponse,
    raw: &Value,
) -> Result<BTreeSet<HashCode>, MerchantError> {
    let mut contracts = BTreeSet::new();
    for (offset, detail) in transfer.deposits.iter().enumerate() {
        let Some(stored) = tx.lookup_deposit(merchant_pub, &detail.h_contract_terms, &detail.coin_pub)? else {
            debug!(wtid = %transfer.wtid, coin = %detail.coin_pub, "Transfer credits a deposit that is not ours");
            continue;
        };
        if stored.amount_with_fee != detail.amount_with_fee || stored.deposit_fee != detail.deposit_fee {
            warn!(wtid = %transfer.wtid, coin = %detail.coin_pub, offset, "Exchange reports disagree about a deposit");
            return Err(MerchantError::TrackConflictingReports {
                wtid: transfer.wtid.to_string(),
                evidence: json!({
                    "conflict_offset": offset,
                    "coin_pub": detail.coin_pub,
                    "h_contract_terms": detail.h_contract_terms,
                    "deposit_proof": stored.exchange_proof,
                    "transfer_proof": raw,
                    "stored_amount_with_fee": stored.amount_with_fee,
                    "reported_amount_with_fee": detail.amount_with_fee,
                    "stored_deposit_fee": stored.deposit_fee,
                    "reported_deposit_fee": detail.deposit_fee,
                }),
            });
        }
        tx.insert_coin_transfer(&CoinTransfer {
            h_contract_terms: detail.h_contract_terms,
            coin_pub: detail.coin_pub,
            exchange_url: exchange_url.to_string(),
            wtid: transfer.wtid,
        })?;
        contracts.insert(detail.h_contract_terms);
    }
    Ok(contracts)
}

/// Mark the contract wired if every deposit has a transfer with a stored proof
fn settle_wired(
    tx: &mut dyn MerchantTx,
    instance: &str,
    merchant_pub: &MerchantPublicKey,
    h_contract_terms: &HashCode,
) -> Result<bool, MerchantError> {
    let Some(contract) = tx.lookup_contract_by_hash(instance, h_contract_terms)? else {
        return Ok(false);
    };
    if contract.wired {
        return Ok(true);
    }
    let deposits = tx.lookup_deposits(merchant_pub, h_contract_terms)?;
    if deposits.is_empty() {
        return Ok(false);
    }
    let transfers = tx.lookup_coin_transfers(h_contract_terms)?;
    for deposit in &deposits {
        let mut proven = false;
        for transfer in transfers.iter().filter(|t| t.coin_pub == deposit.coin_pub) {
            if tx.lookup_transfer_proof(&transfer.exchange_url, &transfer.wtid)?.is_some() {
                proven = true;
                break;
            }
        }
        if !proven {
            return Ok(false);
        }
    }
    tx.mark_contract_wired(instance, h_contract_terms)?;
    info!(instance, order_id = %contract.order_id, "Contract wired");
    Ok(true)
}

/// Group the reported deposits by contract, in the order the exchange listed them
fn sum_deposits(
    tx: &mut dyn MerchantTx,
    instance: &str,
    transfer: &TrackTransferResponse,
) -> Result<Vec<DepositSum>, MerchantError> {
    let mut groups: Vec<(HashCode, Amount, Amount)> = Vec::new();
    for detail in &transfer.deposits {
        match groups.iter_mut().find(|(h, _, _)| *h == detail.h_contract_terms) {
            Some((_, value, fee)) => {
                *value = value.checked_add(&detail.amount_with_fee)?;
                *fee = fee.checked_add(&detail.deposit_fee)?;
            }
            None => groups.push((
                detail.h_contract_terms,
                detail.amount_with_fee.clone(),
                detail.deposit_fee.clone(),
            )),
        }
    }

    let mut sums = Vec::with_capacity(groups.len());
    for (h_contract_terms, deposit_value, deposit_fee) in groups {
        match tx.lookup_contract_by_hash(instance, &h_contract_terms)? {
            Some(contract) => sums.push(DepositSum {
                order_id: contract.order_id,
                deposit_value,
                deposit_fee,
            }),
            None => debug!(instance, %h_contract_terms, "Transfer pays a contract this instance does not know"),
        }
    }
    Ok(sums)
}

impl MerchantBackend {
    /// Download a transfer and check the exchange's signature on it
    async fn fetch_transfer(
        &self,
        ready: &ReadyExchange,
        wtid: &WireTransferId,
        scope: &RequestScope,
    ) -> Result<Decoded<TrackTransferResponse>, MerchantError> {
        let handle = &ready.handle;
        let decoded = scope
            .run(handle.url(), async {
                let _permit = handle.acquire(EndpointClass::TrackTransfer).await?;
                handle.client().track_transfer(wtid).await.map_err(|e| match e {
                    ExchangeError::Http { status: 404, .. } => MerchantError::TrackTransferUnknown {
                        wtid: wtid.to_string(),
                        exchange_url: handle.url().to_string(),
                    },
                    other => other.into(),
                })
            })
            .await?;

        let body = &decoded.body;
        let h_details = signatures::hash_transfer_details(body.deposits.iter().map(|d| {
            TransferDetailTerms {
                h_contract_terms: &d.h_contract_terms,
                coin_pub: &d.coin_pub,
                amount_with_fee: &d.amount_with_fee,
                deposit_fee: &d.deposit_fee,
            }
        }));
        let message = signatures::track_transfer_confirmation(
            &body.merchant_pub,
            &body.h_wire,
            body.execution_time,
            &body.total_amount,
            &body.wire_fee,
            &h_details,
        );
        if ready
            .keys
            .verify_exchange_signature(&body.exchange_pub, &message, &body.exchange_sig)
            .is_err()
        {
            return Err(MerchantError::ExchangeSignatureInvalid {
                exchange_url: handle.url().to_string(),
                what: "wire transfer".to_string(),
                exchange_reply: decoded.raw,
            });
        }
        Ok(decoded)
    }

    /// Reconcile a wire transfer with the stored deposits
    ///
    /// A transfer whose proof is already stored is answered from storage.
    /// Otherwise the exchange is asked, its wire fee is checked against the
    /// signed fee statement for `wire_method`, and every reported deposit
    /// is compared with ours. Nothing is stored unless all checks pass.
    ///
    /// # Errors
    ///
    /// * `TrackBadWireFee` - the exchange charged more than its fee statement allows
    /// * `TrackConflictingReports` - a reported deposit disagrees with the stored one
    /// * `TrackTransferUnknown` - the exchange does not know the transfer,
    ///   or the stored proof belongs to another merchant
    /// * `ExchangeUnknown`, `ExchangeSignatureInvalid`, `ExchangeTimeout`
    pub async fn track_transfer(
        &self,
        instance: &str,
        exchange_url: &str,
        wtid: &WireTransferId,
        wire_method: &str,
    ) -> Result<TrackTransferReply, MerchantError> {
        self.track_transfer_in(&self.scope(), instance, exchange_url, wtid, wire_method)
            .await
    }

    /// [`Self::track_transfer`] under the caller's request scope
    async fn track_transfer_in(
        &self,
        scope: &RequestScope,
        instance: &str,
        exchange_url: &str,
        wtid: &WireTransferId,
        wire_method: &str,
    ) -> Result<TrackTransferReply, MerchantError> {
        let url = normalize_url(exchange_url);
        let (record, stored) = self.transact("track_transfer_lookup", |tx| {
            let record = load_instance(tx, instance)?;
            let stored = tx.lookup_transfer_proof(&url, wtid)?;
            Ok((record, stored))
        })?;

        if let Some(stored) = stored {
            debug!(instance, exchange = %url, %wtid, "Answering transfer from stored proof");
            let transfer: TrackTransferResponse = serde_json::from_value(stored.proof)?;
            if transfer.merchant_pub != record.merchant_pub {
                return Err(MerchantError::TrackTransferUnknown {
                    wtid: wtid.to_string(),
                    exchange_url: url,
                });
            }
            let sums = self.transact("track_transfer_sums", |tx| sum_deposits(tx, instance, &transfer))?;
            return Ok(TrackTransferReply::new(transfer, sums));
        }

        let ready = self
            .exchanges()
            .lookup_ready(&url)
            .ok_or_else(|| MerchantError::exchange_unknown(exchange_url))?;
        let Decoded { body: transfer, raw } = self.fetch_transfer(&ready, wtid, scope).await?;
        if transfer.merchant_pub != record.merchant_pub {
            return Err(MerchantError::TrackConflictingReports {
                wtid: wtid.to_string(),
                evidence: json!({
                    "expected_merchant_pub": record.merchant_pub,
                    "transfer_proof": raw,
                }),
            });
        }

        let master_pub = *ready.handle.master_pub();
        let sums = self.transact("track_transfer", |tx| {
            check_wire_fee(tx, &master_pub, wire_method, &transfer, &raw)?;
            let proof = TransferProofRecord {
                exchange_url: url.clone(),
                wtid: transfer.wtid,
                execution_time: transfer.execution_time,
                exchange_pub: transfer.exchange_pub,
                proof: raw.clone(),
            };
            match tx.insert_transfer_proof(&proof) {
                Ok(()) | Err(DbError::UniqueViolation { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            for h_contract_terms in reconcile(tx, &record.merchant_pub, &url, &transfer, &raw)? {
                settle_wired(tx, instance, &record.merchant_pub, &h_contract_terms)?;
            }
            sum_deposits(tx, instance, &transfer)
        })?;

        info!(instance, exchange = %url, %wtid, total = %transfer.total_amount, contracts = sums.len(), "Wire transfer reconciled");
        Ok(TrackTransferReply::new(transfer, sums))
    }

    /// Ask the deposit's exchange which transfer carried it
    async fn trace_deposit(
        &self,
        keypair: &EddsaKeyPair,
        h_wire: &HashCode,
        deposit: &DepositRecord,
        scope: &RequestScope,
    ) -> Result<DepositTrace, MerchantError> {
        let ready = self
            .exchanges()
            .lookup_ready(&deposit.exchange_url)
            .ok_or_else(|| MerchantError::exchange_unknown(&deposit.exchange_url))?;
        let handle = &ready.handle;
        let request = TrackTransactionRequest {
            h_wire: *h_wire,
            h_contract_terms: deposit.h_contract_terms,
            coin_pub: deposit.coin_pub,
            merchant_pub: deposit.merchant_pub,
            merchant_sig: keypair.sign(&signatures::track_transaction_request(
                h_wire,
                &deposit.h_contract_terms,
                &deposit.coin_pub,
                &deposit.merchant_pub,
            )),
        };
        let (outcome, raw) = scope
            .run(handle.url(), async {
                let _permit = handle.acquire(EndpointClass::TrackTransaction).await?;
                Ok::<_, MerchantError>(handle.client().track_transaction(&request).await?)
            })
            .await?;

        match outcome {
            TrackTransactionOutcome::Pending { execution_time } => Ok(DepositTrace::Pending(execution_time)),
            TrackTransactionOutcome::Wired(wired) => {
                let message = signatures::track_transaction_confirmation(
                    h_wire,
                    &deposit.h_contract_terms,
                    &wired.wtid,
                    &deposit.coin_pub,
                    &wired.coin_contribution,
                    wired.execution_time,
                );
                if ready
                    .keys
                    .verify_exchange_signature(&wired.exchange_pub, &message, &wired.exchange_sig)
                    .is_err()
                {
                    return Err(MerchantError::ExchangeSignatureInvalid {
                        exchange_url: handle.url().to_string(),
                        what: "deposit tracking".to_string(),
                        exchange_reply: raw,
                    });
                }
                Ok(DepositTrace::Wired(CoinTransfer {
                    h_contract_terms: deposit.h_contract_terms,
                    coin_pub: deposit.coin_pub,
                    exchange_url: handle.url().to_string(),
                    wtid: wired.wtid,
                }))
            }
        }
    }

    /// Find the wire transfers that paid out a contract
    ///
    /// Deposits without a known transfer are traced at their exchange; every
    /// newly learnt transfer is then reconciled with [`Self::track_transfer`].
    /// Both phases share one request scope and so one deadline.
    /// An unpaid contract has no transfers.
    ///
    /// # Returns
    ///
    /// The transfers grouped by exchange and wire transfer id, or `Pending`
    /// with the earliest execution time if any deposit is not aggregated yet.
    pub async fn track_transaction(
        &self,
        instance: &str,
        order_id: &str,
    ) -> Result<TrackTransactionReply, MerchantError> {
        let (record, contract, deposits, known) = self.transact("track_transaction_lookup", |tx| {
            let record = load_instance(tx, instance)?;
            let contract = tx
                .lookup_contract_terms(instance, order_id)?
                .ok_or_else(|| MerchantError::order_unknown(order_id))?;
            let deposits = tx.lookup_deposits(&record.merchant_pub, &contract.h_contract_terms)?;
            let known = tx.lookup_coin_transfers(&contract.h_contract_terms)?;
            Ok((record, contract, deposits, known))
        })?;
        let keypair = instance_keypair(&record)?;
        let terms = crate::types::ContractTerms::from_json(&contract.contract_terms)?;

        let untraced: Vec<&DepositRecord> = deposits
            .iter()
            .filter(|d| !known.iter().any(|t| t.coin_pub == d.coin_pub))
            .collect();
        let scope = self.scope();
        let traces = join_all(
            untraced
                .iter()
                .map(|d| self.trace_deposit(&keypair, &terms.h_wire, d, &scope)),
        )
        .await;

        let mut learned = Vec::new();
        let mut earliest: Option<Timestamp> = None;
        for trace in traces {
            match trace? {
                DepositTrace::Wired(transfer) => learned.push(transfer),
                DepositTrace::Pending(at) => earliest = Some(earliest.map_or(at, |e| e.min(at))),
            }
        }
        if !learned.is_empty() {
            self.transact("track_transaction_store", |tx| {
                for transfer in &learned {
                    tx.insert_coin_transfer(transfer)?;
                }
                Ok(())
            })?;
        }
        if let Some(execution_time) = earliest {
            debug!(instance, order_id, %execution_time, "Deposits not aggregated yet");
            return Ok(TrackTransactionReply::Pending { execution_time });
        }

        let mut groups: BTreeMap<(String, WireTransferId), Vec<CoinPublicKey>> = BTreeMap::new();
        for transfer in known.iter().chain(learned.iter()) {
            groups
                .entry((transfer.exchange_url.clone(), transfer.wtid))
                .or_default()
                .push(transfer.coin_pub);
        }

        let proofs = self.transact("track_transaction_proofs", |tx| {
            let mut proofs = BTreeMap::new();
            for (exchange_url, wtid) in groups.keys() {
                if let Some(proof) = tx.lookup_transfer_proof(exchange_url, wtid)? {
                    proofs.insert((exchange_url.clone(), *wtid), proof.execution_time);
                }
            }
            Ok(proofs)
        })?;
        for (exchange_url, wtid) in groups.keys().filter(|k| !proofs.contains_key(*k)) {
            self.track_transfer_in(&scope, instance, exchange_url, wtid, &terms.wire_method)
                .await?;
        }

        let transfers = self.transact("track_transaction_settle", |tx| {
            settle_wired(tx, instance, &record.merchant_pub, &contract.h_contract_terms)?;
            let mut transfers = Vec::with_capacity(groups.len());
            for ((exchange_url, wtid), coins) in &groups {
                let execution_time = tx
                    .lookup_transfer_proof(exchange_url, wtid)?
                    .map(|p| p.execution_time);
                transfers.push(ContractTransfer {
                    exchange_url: exchange_url.clone(),
                    wtid: *wtid,
                    execution_time,
                    coins: coins.clone(),
                });
            }
            Ok(transfers)
        })?;
        Ok(TrackTransactionReply::Wired { transfers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::backend_with_instance;
    use crate::exchange::wire::TransferDeposit;
    use crate::types::{ContractRecord, ExchangePublicKey};

    const EXCHANGE: &str = "https://ex.test/";

    fn eur(s: &str) -> Amount {
        format!("EUR:{}", s).parse().unwrap()
    }

    fn transfer(merchant_pub: MerchantPublicKey, deposits: Vec<TransferDeposit>) -> TrackTransferResponse {
        TrackTransferResponse {
            wtid: WireTransferId::random(),
            total_amount: eur("9.9"),
            wire_fee: eur("0.1"),
            merchant_pub,
            h_wire: HashCode::random(),
            execution_time: Timestamp::from_secs(1_000),
            deposits,
            exchange_sig: EddsaSignature::random(),
            exchange_pub: ExchangePublicKey::random(),
        }
    }

    fn detail(h: HashCode, coin: CoinPublicKey, amount: &str, fee: &str) -> TransferDeposit {
        TransferDeposit {
            h_contract_terms: h,
            coin_pub: coin,
            amount_with_fee: eur(amount),
            deposit_fee: eur(fee),
        }
    }

    fn deposit(merchant_pub: MerchantPublicKey, h: HashCode, coin: CoinPublicKey, amount: &str) -> DepositRecord {
        DepositRecord {
            h_contract_terms: h,
            merchant_pub,
            coin_pub: coin,
            exchange_url: EXCHANGE.to_string(),
            amount_with_fee: eur(amount),
            deposit_fee: eur("0.01"),
            refund_fee: eur("0.01"),
            wire_fee: eur("0"),
            exchange_pub: ExchangePublicKey::random(),
            exchange_proof: json!({"sig": "proof"}),
        }
    }

    fn contract(order_id: &str, h: HashCode) -> ContractRecord {
        ContractRecord {
            serial: 0,
            order_id: order_id.to_string(),
            contract_terms: json!({}),
            h_contract_terms: h,
            creation_time: Timestamp::from_secs(0),
            pay_deadline: Timestamp::from_secs(0),
            refund_deadline: Timestamp::from_secs(0),
            fulfillment_url: None,
            session_id: None,
            paid: true,
            wired: false,
        }
    }

    /// Backend holding one paid contract with one deposit
    fn paid_contract() -> (MerchantBackend, MerchantPublicKey, HashCode, CoinPublicKey) {
        let backend = backend_with_instance();
        let merchant_pub = backend.get_instance("default").unwrap().merchant_pub;
        let h = HashCode::random();
        let coin = CoinPublicKey::random();
        backend
            .transact("seed", |tx| {
                tx.insert_contract_terms("default", &contract("O1", h))?;
                tx.insert_deposit(&deposit(merchant_pub, h, coin, "5"))?;
                Ok(())
            })
            .unwrap();
        (backend, merchant_pub, h, coin)
    }

    #[test]
    fn test_reconcile_maps_our_deposits_and_wires_contract() {
        let (backend, merchant_pub, h, coin) = paid_contract();
        let reported = transfer(
            merchant_pub,
            vec![
                detail(h, coin, "5", "0.01"),
                detail(HashCode::random(), CoinPublicKey::random(), "3", "0.01"),
            ],
        );
        let wired = backend
            .transact("reconcile", |tx| {
                tx.insert_transfer_proof(&TransferProofRecord {
                    exchange_url: EXCHANGE.to_string(),
                    wtid: reported.wtid,
                    execution_time: reported.execution_time,
                    exchange_pub: reported.exchange_pub,
                    proof: serde_json::to_value(&reported)?,
                })?;
                let contracts = reconcile(tx, &merchant_pub, EXCHANGE, &reported, &Value::Null)?;
                assert_eq!(contracts.into_iter().collect::<Vec<_>>(), vec![h]);
                settle_wired(tx, "default", &merchant_pub, &h)
            })
            .unwrap();
        assert!(wired);
    }

    #[test]
    fn test_reconcile_reports_conflict_with_offset() {
        let (backend, merchant_pub, h, coin) = paid_contract();
        let reported = transfer(
            merchant_pub,
            vec![
                detail(HashCode::random(), CoinPublicKey::random(), "1", "0.01"),
                detail(h, coin, "4", "0.01"),
            ],
        );
        let result = backend.transact("reconcile", |tx| {
            reconcile(tx, &merchant_pub, EXCHANGE, &reported, &json!({"raw": true}))
        });
        let (wtid, evidence) = match result {
            Err(MerchantError::TrackConflictingReports { wtid, evidence }) => (wtid, evidence),
            other => panic!("expected a conflict, got {:?}", other),
        };
        assert_eq!(wtid, reported.wtid.to_string());
        assert_eq!(evidence["conflict_offset"], 1);
        assert_eq!(evidence["stored_amount_with_fee"], "EUR:5");
        assert_eq!(evidence["reported_amount_with_fee"], "EUR:4");
        assert_eq!(evidence["deposit_proof"], json!({"sig": "proof"}));

        // the conflicting transaction stored nothing
        let transfers = backend
            .transact("check", |tx| Ok(tx.lookup_coin_transfers(&h)?))
            .unwrap();
        assert!(transfers.is_empty());
    }

    #[test]
    fn test_deposit_sums_group_by_contract() {
        let (backend, merchant_pub, h, coin) = paid_contract();
        let reported = transfer(
            merchant_pub,
            vec![
                detail(h, coin, "5", "0.01"),
                detail(HashCode::random(), CoinPublicKey::random(), "2", "0.02"),
                detail(h, CoinPublicKey::random(), "1.5", "0.01"),
            ],
        );
        let sums = backend
            .transact("sums", |tx| sum_deposits(tx, "default", &reported))
            .unwrap();
        assert_eq!(
            sums,
            vec![DepositSum {
                order_id: "O1".to_string(),
                deposit_value: eur("6.5"),
                deposit_fee: eur("0.02"),
            }]
        );
    }

    #[tokio::test]
    async fn test_stored_transfer_proof_needs_no_exchange() {
        let (backend, merchant_pub, h, coin) = paid_contract();
        let reported = transfer(merchant_pub, vec![detail(h, coin, "5", "0.01")]);
        backend
            .transact("seed_proof", |tx| {
                tx.insert_transfer_proof(&TransferProofRecord {
                    exchange_url: EXCHANGE.to_string(),
                    wtid: reported.wtid,
                    execution_time: reported.execution_time,
                    exchange_pub: reported.exchange_pub,
                    proof: serde_json::to_value(&reported)?,
                })?;
                Ok(())
            })
            .unwrap();

        // the test backend is offline, so this can only succeed from storage
        let reply = backend
            .track_transfer("default", EXCHANGE, &reported.wtid, "iban")
            .await
            .unwrap();
        assert_eq!(reply.wtid, reported.wtid);
        assert_eq!(reply.deposits_sums.len(), 1);
        assert_eq!(reply.deposits_sums[0].order_id, "O1");
    }

    #[tokio::test]
    async fn test_stored_proof_of_another_merchant_stays_hidden() {
        let (backend, _, h, coin) = paid_contract();
        let foreign = transfer(MerchantPublicKey::random(), vec![detail(h, coin, "5", "0.01")]);
        backend
            .transact("seed_proof", |tx| {
                tx.insert_transfer_proof(&TransferProofRecord {
                    exchange_url: EXCHANGE.to_string(),
                    wtid: foreign.wtid,
                    execution_time: foreign.execution_time,
                    exchange_pub: foreign.exchange_pub,
                    proof: serde_json::to_value(&foreign)?,
                })?;
                Ok(())
            })
            .unwrap();

        let result = backend
            .track_transfer("default", EXCHANGE, &foreign.wtid, "iban")
            .await;
        assert_eq!(
            result,
            Err(MerchantError::TrackTransferUnknown {
                wtid: foreign.wtid.to_string(),
                exchange_url: EXCHANGE.to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_track_transfer_at_unknown_exchange() {
        let (backend, _, _, _) = paid_contract();
        let wtid = WireTransferId::random();
        assert_eq!(
            backend.track_transfer("default", "https://rogue.test/", &wtid, "iban").await,
            Err(MerchantError::exchange_unknown("https://rogue.test/"))
        );
    }

    #[test]
    fn test_pending_reply_status() {
        let pending = TrackTransactionReply::Pending {
            execution_time: Timestamp::from_secs(5),
        };
        assert_eq!(pending.http_status(), 202);
        assert_eq!(TrackTransactionReply::Wired { transfers: vec![] }.http_status(), 200);
    }
}
