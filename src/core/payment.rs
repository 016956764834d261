//! Paying a contract with coins
//!
//! A payment runs in three steps. A first transaction loads the contract
//! and everything needed to check the coins offline: denominations, wallet
//! signatures and whether the coins cover the price plus fees. The coins
//! not yet deposited are then sent to their exchanges concurrently, under
//! one request scope. A last transaction stores the confirmed deposits and,
//! when every coin went through, marks the contract paid. If a concurrent
//! payment with other coins got there first, nothing is stored.
//!
//! Confirmed deposits are kept even when a sibling coin fails, so a wallet
//! retrying the payment never sends the same coin twice.

use super::backend::{instance_keypair, load_instance, MerchantBackend};
use crate::crypto::coin_history;
use crate::crypto::hash_wire_method;
use crate::crypto::signatures::{self, DepositTerms};
use crate::db::DbError;
use crate::exchange::wire::{DepositRequest, WireDetails};
use crate::exchange::{DepositOutcome, EndpointClass, ReadyExchange};
use crate::types::{
    AccountRecord, Amount, Blob, CoinPublicKey, ContractRecord, ContractTerms, DepositRecord,
    EddsaSignature, HashCode, MerchantError, MerchantPublicKey, Timestamp,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// One coin offered by the wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinDeposit {
    pub coin_pub: CoinPublicKey,
    pub denom_pub: Blob,
    pub ub_sig: Blob,
    pub exchange_url: String,
    /// Amount with fee this coin contributes
    pub contribution: Amount,
    pub coin_sig: EddsaSignature,
}

/// A wallet's payment for a claimed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayRequest {
    pub order_id: String,
    #[serde(default)]
    pub merchant_pub: Option<MerchantPublicKey>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub coins: Vec<CoinDeposit>,
}

/// Merchant confirmation of a completed payment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentReceipt {
    pub sig: EddsaSignature,
    pub h_contract_terms: HashCode,
}

/// Contract state loaded before any exchange is contacted
struct PayContext {
    merchant_pub: MerchantPublicKey,
    contract: ContractRecord,
    terms: ContractTerms,
    account: AccountRecord,
    deposited: BTreeSet<CoinPublicKey>,
}

/// A coin that passed every offline check
struct CheckedCoin<'a> {
    coin: &'a CoinDeposit,
    exchange: ReadyExchange,
    value: Amount,
    deposit_fee: Amount,
    refund_fee: Amount,
}

impl CheckedCoin<'_> {
    fn amount_without_fee(&self) -> Result<Amount, MerchantError> {
        Ok(self.coin.contribution.checked_sub(&self.deposit_fee)?)
    }
}

fn deposit_terms<'a>(
    context: &'a PayContext,
    coin_pub: &'a CoinPublicKey,
) -> DepositTerms<'a> {
    DepositTerms {
        h_contract_terms: &context.contract.h_contract_terms,
        h_wire: &context.terms.h_wire,
        timestamp: context.terms.timestamp,
        refund_deadline: context.terms.refund_deadline,
        merchant_pub: &context.merchant_pub,
        coin_pub,
    }
}

/// Price the customer owes once fees above the merchant's limits are added
///
/// Deposit fees above `max_fee` are owed in full; wire fees above
/// `max_wire_fee` are split over `wire_fee_amortization` payments.
pub fn amount_owed(
    terms: &ContractTerms,
    deposit_fees: &Amount,
    wire_fees: &Amount,
) -> Result<Amount, MerchantError> {
    let excess_deposit_fee = deposit_fees.saturating_sub(&terms.max_fee)?;
    let excess_wire_fee = wire_fees
        .saturating_sub(&terms.max_wire_fee)?
        .divide(terms.wire_fee_amortization.max(1));
    Ok(terms
        .amount
        .checked_add(&excess_deposit_fee)?
        .checked_add(&excess_wire_fee)?)
}

impl MerchantBackend {
    fn load_pay_context(&self, instance: &str, request: &PayRequest) -> Result<PayContext, MerchantError> {
        self.transact("pay_prepare", |tx| {
            let record = load_instance(tx, instance)?;
            instance_keypair(&record)?;
            if let Some(claimed) = &request.merchant_pub {
                if claimed != &record.merchant_pub {
                    return Err(MerchantError::PayMerchantMismatch {
                        merchant_pub: claimed.to_string(),
                    });
                }
            }
            let contract = tx
                .lookup_contract_terms(instance, &request.order_id)?
                .ok_or_else(|| MerchantError::order_unknown(&request.order_id))?;
            let terms = ContractTerms::from_json(&contract.contract_terms)?;
            let account = tx
                .lookup_accounts(instance)?
                .into_iter()
                .find(|a| a.h_wire == terms.h_wire)
                .ok_or_else(|| MerchantError::internal("contract names an account the instance does not have"))?;
            let deposited = tx
                .lookup_deposits(&record.merchant_pub, &contract.h_contract_terms)?
                .into_iter()
                .map(|d| d.coin_pub)
                .collect();
            Ok(PayContext {
                merchant_pub: record.merchant_pub,
                contract,
                terms,
                account,
                deposited,
            })
        })
    }

    /// Check one coin against the exchange's keys and its wallet signature
    fn check_coin<'a>(
        &self,
        context: &PayContext,
        coin: &'a CoinDeposit,
        now: Timestamp,
    ) -> Result<CheckedCoin<'a>, MerchantError> {
        let currency = context.terms.amount.currency();
        if coin.contribution.currency() != currency {
            return Err(MerchantError::CurrencyMismatch {
                expected: currency.to_string(),
                actual: coin.contribution.currency().to_string(),
            });
        }
        let exchange = self
            .exchanges()
            .lookup_ready(&coin.exchange_url)
            .ok_or_else(|| MerchantError::exchange_unknown(&coin.exchange_url))?;
        let denomination = exchange
            .keys
            .denomination_by_pub(&coin.denom_pub)
            .ok_or_else(|| MerchantError::PayDenominationUnknown {
                coin_pub: coin.coin_pub.to_string(),
                exchange_url: coin.exchange_url.clone(),
            })?;
        if !denomination.is_spendable_at(now) {
            return Err(MerchantError::PayDenominationExpired {
                coin_pub: coin.coin_pub.to_string(),
            });
        }
        if coin.contribution.checked_cmp(&denomination.fee_deposit)? == Ordering::Less {
            return Err(MerchantError::PayFeesExceedPayment {
                coin_pub: coin.coin_pub.to_string(),
            });
        }

        let message = signatures::deposit_request(
            &deposit_terms(context, &coin.coin_pub),
            &coin.contribution,
            &denomination.fee_deposit,
        );
        if signatures::verify(coin.coin_pub.as_bytes(), &message, &coin.coin_sig).is_err() {
            return Err(MerchantError::PayCoinSignatureInvalid {
                coin_pub: coin.coin_pub.to_string(),
            });
        }

        Ok(CheckedCoin {
            coin,
            value: denomination.value.clone(),
            deposit_fee: denomination.fee_deposit.clone(),
            refund_fee: denomination.fee_refund.clone(),
            exchange,
        })
    }

    /// Wire fee per exchange for the contract's method and date
    fn wire_fees(
        &self,
        context: &PayContext,
        coins: &[CheckedCoin<'_>],
    ) -> Result<BTreeMap<String, Amount>, MerchantError> {
        let h_wire_method = hash_wire_method(&context.terms.wire_method);
        let currency = context.terms.amount.currency();
        let mut exchanges = BTreeMap::new();
        for coin in coins {
            exchanges
                .entry(coin.exchange.handle.url().to_string())
                .or_insert(*coin.exchange.handle.master_pub());
        }
        self.transact("pay_wire_fees", |tx| {
            let mut fees = BTreeMap::new();
            for (url, master_pub) in &exchanges {
                let fee = match tx.lookup_wire_fee(master_pub, &h_wire_method, context.terms.timestamp)? {
                    Some(record) => record.wire_fee,
                    None => {
                        warn!(exchange = %url, method = %context.terms.wire_method, "No wire fee known for contract date; assuming zero");
                        Amount::zero(currency)?
                    }
                };
                fees.insert(url.clone(), fee);
            }
            Ok(fees)
        })
    }

    /// Send one coin to its exchange and check what comes back
    async fn deposit_coin(
        &self,
        context: &PayContext,
        checked: &CheckedCoin<'_>,
        wire_fee: Amount,
        scope: &super::scheduler::RequestScope,
    ) -> Result<DepositRecord, MerchantError> {
        let coin = checked.coin;
        let handle = &checked.exchange.handle;
        let request = DepositRequest {
            coin_pub: coin.coin_pub,
            denom_pub: coin.denom_pub.clone(),
            ub_sig: coin.ub_sig.clone(),
            coin_sig: coin.coin_sig,
            contribution: coin.contribution.clone(),
            wire: WireDetails {
                payto_uri: context.account.payto_uri.clone(),
                salt: context.account.salt,
            },
            h_wire: context.terms.h_wire,
            h_contract_terms: context.contract.h_contract_terms,
            timestamp: context.terms.timestamp,
            refund_deadline: context.terms.refund_deadline,
            wire_transfer_deadline: context.terms.wire_transfer_deadline,
            merchant_pub: context.merchant_pub,
        };

        let outcome = scope
            .run(handle.url(), async {
                let _permit = handle.acquire(EndpointClass::Deposit).await?;
                Ok::<_, MerchantError>(handle.client().deposit(&request).await?)
            })
            .await?;

        match outcome {
            DepositOutcome::Confirmed(confirmation) => {
                let message = signatures::deposit_confirmation(
                    &deposit_terms(context, &coin.coin_pub),
                    &checked.amount_without_fee()?,
                );
                let body = &confirmation.body;
                if checked
                    .exchange
                    .keys
                    .verify_exchange_signature(&body.exchange_pub, &message, &body.sig)
                    .is_err()
                {
                    return Err(MerchantError::ExchangeSignatureInvalid {
                        exchange_url: handle.url().to_string(),
                        what: "deposit confirmation".to_string(),
                        exchange_reply: confirmation.raw,
                    });
                }
                Ok(DepositRecord {
                    h_contract_terms: context.contract.h_contract_terms,
                    merchant_pub: context.merchant_pub,
                    coin_pub: coin.coin_pub,
                    exchange_url: handle.url().to_string(),
                    amount_with_fee: coin.contribution.clone(),
                    deposit_fee: checked.deposit_fee.clone(),
                    refund_fee: checked.refund_fee.clone(),
                    wire_fee,
                    exchange_pub: body.exchange_pub,
                    exchange_proof: confirmation.raw,
                })
            }
            DepositOutcome::DoubleSpent(proof) => {
                let proven = coin_history::proves_double_spending(
                    &coin.coin_pub,
                    &checked.value,
                    &coin.contribution,
                    &proof.body.history,
                );
                match proven {
                    Ok(true) => Err(MerchantError::PayDoubleSpending {
                        coin_pub: coin.coin_pub.to_string(),
                        exchange_url: handle.url().to_string(),
                        history: proof.raw.get("history").cloned().unwrap_or_else(|| proof.raw.clone()),
                    }),
                    outcome => {
                        warn!(exchange = %handle.url(), coin = %coin.coin_pub, ?outcome, "Exchange claimed a double spend it could not prove");
                        Err(MerchantError::PayExchangeRejected {
                            coin_pub: coin.coin_pub.to_string(),
                            exchange_url: handle.url().to_string(),
                            http_status: 403,
                            exchange_reply: proof.raw,
                        })
                    }
                }
            }
            DepositOutcome::Rejected { status, reply } => Err(MerchantError::PayExchangeRejected {
                coin_pub: coin.coin_pub.to_string(),
                exchange_url: handle.url().to_string(),
                http_status: status,
                exchange_reply: reply,
            }),
        }
    }

    /// Pay a claimed contract
    ///
    /// # Arguments
    ///
    /// * `instance` - instance the order belongs to
    /// * `request` - order id, optional merchant key and session, and the coins
    ///
    /// # Returns
    ///
    /// The merchant's signature over the contract hash (purpose
    /// `MERCHANT_PAYMENT_OK`). Paying again with the same coins returns it
    /// again.
    ///
    /// # Errors
    ///
    /// * `PayNoCoins`, `PayMerchantMismatch`, `PayOfferExpired`, `PayAlreadyPaid`
    /// * `ExchangeUnknown` - a coin's exchange is not trusted or its keys are not loaded
    /// * `PayDenominationUnknown`, `PayDenominationExpired`, `PayCoinSignatureInvalid`, `PayFeesExceedPayment`
    /// * `PayInsufficientFunds` - the coins do not cover price plus excess fees
    /// * `PayDoubleSpending` - an exchange proved a coin was spent
    /// * `PayExchangeRejected`, `ExchangeSignatureInvalid`, `ExchangeTimeout`
    pub async fn pay(&self, instance: &str, request: &PayRequest) -> Result<PaymentReceipt, MerchantError> {
        if request.coins.is_empty() {
            return Err(MerchantError::PayNoCoins);
        }
        let offered: BTreeSet<CoinPublicKey> = request.coins.iter().map(|c| c.coin_pub).collect();
        if offered.len() != request.coins.len() {
            return Err(MerchantError::malformed("coins", "the same coin is listed twice"));
        }

        let context = self.load_pay_context(instance, request)?;
        let h_contract_terms = context.contract.h_contract_terms;
        if context.contract.paid {
            if context.deposited == offered {
                return self.payment_receipt(instance, &h_contract_terms);
            }
            return Err(MerchantError::PayAlreadyPaid {
                order_id: request.order_id.clone(),
            });
        }
        let now = Timestamp::now();
        if context.terms.pay_deadline < now {
            return Err(MerchantError::PayOfferExpired {
                order_id: request.order_id.clone(),
            });
        }

        let checked = request
            .coins
            .iter()
            .map(|coin| self.check_coin(&context, coin, now))
            .collect::<Result<Vec<_>, _>>()?;

        let currency = context.terms.amount.currency();
        let wire_fees = self.wire_fees(&context, &checked)?;
        let paid = Amount::sum(currency, checked.iter().map(|c| &c.coin.contribution))?;
        let deposit_fees = Amount::sum(currency, checked.iter().map(|c| &c.deposit_fee))?;
        let total_wire_fees = Amount::sum(currency, wire_fees.values())?;
        let owed = amount_owed(&context.terms, &deposit_fees, &total_wire_fees)?;
        if paid.checked_cmp(&owed)? == Ordering::Less {
            return Err(MerchantError::PayInsufficientFunds {
                paid: paid.to_string(),
                owed: owed.to_string(),
            });
        }

        let scope = self.scope();
        let pending: Vec<&CheckedCoin<'_>> = checked
            .iter()
            .filter(|c| !context.deposited.contains(&c.coin.coin_pub))
            .collect();
        let no_fee = Amount::zero(currency)?;
        let results = join_all(pending.iter().map(|coin| {
            let wire_fee = wire_fees
                .get(coin.exchange.handle.url())
                .unwrap_or(&no_fee)
                .clone();
            self.deposit_coin(&context, coin, wire_fee, &scope)
        }))
        .await;

        let mut confirmed = Vec::new();
        let mut failure = None;
        for result in results {
            match result {
                Ok(deposit) => confirmed.push(deposit),
                Err(e) => {
                    warn!(instance, order_id = %request.order_id, error = %e, "Coin deposit failed");
                    failure.get_or_insert(e);
                }
            }
        }

        let fulfillment_url = context.contract.fulfillment_url.clone();
        let session_id = request.session_id.as_deref();
        let order_id = request.order_id.as_str();
        self.transact("pay_complete", |tx| {
            let contract = tx
                .lookup_contract_terms(instance, order_id)?
                .ok_or_else(|| MerchantError::order_unknown(order_id))?;
            if contract.paid {
                let stored: BTreeSet<CoinPublicKey> = tx
                    .lookup_deposits(&context.merchant_pub, &h_contract_terms)?
                    .into_iter()
                    .map(|d| d.coin_pub)
                    .collect();
                if stored != offered {
                    warn!(instance, order_id, coins = confirmed.len(), "Contract was paid concurrently with other coins");
                    return Err(MerchantError::PayAlreadyPaid {
                        order_id: order_id.to_string(),
                    });
                }
            }
            for deposit in &confirmed {
                match tx.insert_deposit(deposit) {
                    Ok(()) | Err(DbError::UniqueViolation { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if failure.is_some() {
                return Ok(());
            }
            if !contract.paid {
                tx.mark_contract_paid(instance, &h_contract_terms, session_id)?;
                tx.sell_order_locks(instance, order_id)?;
            }
            if let (Some(session), Some(url)) = (session_id, fulfillment_url.as_deref()) {
                tx.insert_session_binding(instance, url, session, order_id)?;
            }
            Ok(())
        })?;

        if let Some(error) = failure {
            return Err(error);
        }
        info!(instance, order_id, amount = %paid, coins = request.coins.len(), "Contract paid");
        self.payment_receipt(instance, &h_contract_terms)
    }

    fn payment_receipt(&self, instance: &str, h_contract_terms: &HashCode) -> Result<PaymentReceipt, MerchantError> {
        let record = self.transact("pay_receipt", |tx| load_instance(tx, instance))?;
        let keypair = instance_keypair(&record)?;
        Ok(PaymentReceipt {
            sig: keypair.sign(&signatures::payment_ok(h_contract_terms)),
            h_contract_terms: *h_contract_terms,
        })
    }
}
