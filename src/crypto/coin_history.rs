//! Verification of coin transaction histories
//!
//! When an exchange refuses a deposit as a double spend it sends the
//! coin's history. The history only proves the claim if every entry is
//! signed by the party that authorized it and the coin's net spending
//! plus the attempted deposit exceeds the coin's value.

use crate::crypto::signatures::{self, CryptoError, DepositTerms, RefundTerms};
use crate::types::{
    Amount, AmountError, CoinPublicKey, EddsaSignature, HashCode, MerchantPublicKey, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// One operation in a coin's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum CoinHistoryEntry {
    Deposit {
        amount: Amount,
        deposit_fee: Amount,
        timestamp: Timestamp,
        refund_deadline: Timestamp,
        merchant_pub: MerchantPublicKey,
        h_contract_terms: HashCode,
        h_wire: HashCode,
        coin_sig: EddsaSignature,
    },
    Melt {
        amount: Amount,
        melt_fee: Amount,
        rc: HashCode,
        coin_sig: EddsaSignature,
    },
    Refund {
        amount: Amount,
        refund_fee: Amount,
        merchant_pub: MerchantPublicKey,
        h_contract_terms: HashCode,
        rtransaction_id: u64,
        merchant_sig: EddsaSignature,
    },
}

/// Reasons a history fails to prove anything
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("history entry {index}: {source}")]
    BadSignature { index: usize, source: CryptoError },

    #[error("history arithmetic failed: {0}")]
    Arithmetic(#[from] AmountError),

    #[error("history refunds more than it spends")]
    RefundsExceedSpending,
}

/// Net amount the history shows as spent from the coin
///
/// # Errors
///
/// Fails if any signature does not verify, amounts mix currencies, or
/// refunds exceed spending.
pub fn spent_total(
    coin_pub: &CoinPublicKey,
    history: &[CoinHistoryEntry],
    currency: &str,
) -> Result<Amount, HistoryError> {
    let mut spent = Amount::zero(currency)?;
    let mut refunded = Amount::zero(currency)?;

    for (index, entry) in history.iter().enumerate() {
        let check = |result: Result<(), CryptoError>| {
            result.map_err(|source| HistoryError::BadSignature { index, source })
        };
        match entry {
            CoinHistoryEntry::Deposit {
                amount,
                deposit_fee,
                timestamp,
                refund_deadline,
                merchant_pub,
                h_contract_terms,
                h_wire,
                coin_sig,
            } => {
                let terms = DepositTerms {
                    h_contract_terms,
                    h_wire,
                    timestamp: *timestamp,
                    refund_deadline: *refund_deadline,
                    merchant_pub,
                    coin_pub,
                };
                let msg = signatures::deposit_request(&terms, amount, deposit_fee);
                check(signatures::verify(coin_pub.as_bytes(), &msg, coin_sig))?;
                spent = spent.checked_add(amount)?;
            }
            CoinHistoryEntry::Melt {
                amount,
                melt_fee,
                rc,
                coin_sig,
            } => {
                let msg = signatures::coin_melt(rc, amount, melt_fee, coin_pub);
                check(signatures::verify(coin_pub.as_bytes(), &msg, coin_sig))?;
                spent = spent.checked_add(amount)?;
            }
            CoinHistoryEntry::Refund {
                amount,
                refund_fee,
                merchant_pub,
                h_contract_terms,
                rtransaction_id,
                merchant_sig,
            } => {
                let terms = RefundTerms {
                    h_contract_terms,
                    coin_pub,
                    merchant_pub,
                    rtransaction_id: *rtransaction_id,
                    refund_amount: amount,
                    refund_fee,
                };
                let msg = signatures::refund_permission(&terms);
                check(signatures::verify(merchant_pub.as_bytes(), &msg, merchant_sig))?;
                refunded = refunded.checked_add(amount)?;
            }
        }
    }

    spent
        .checked_sub(&refunded)
        .map_err(|_| HistoryError::RefundsExceedSpending)
}

/// Whether `history` proves that depositing `attempted` would overspend a coin worth `value`
///
/// Returns `Ok(false)` when the history is authentic but leaves room for
/// the attempted deposit, meaning the exchange refused without cause.
pub fn proves_double_spending(
    coin_pub: &CoinPublicKey,
    value: &Amount,
    attempted: &Amount,
    history: &[CoinHistoryEntry],
) -> Result<bool, HistoryError> {
    let spent = spent_total(coin_pub, history, value.currency())?;
    let total = spent.checked_add(attempted)?;
    Ok(total.checked_cmp(value)? == Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signatures::EddsaKeyPair;

    fn eur(s: &str) -> Amount {
        format!("EUR:{}", s).parse().unwrap()
    }

    fn signed_deposit(coin: &EddsaKeyPair, amount: &str) -> CoinHistoryEntry {
        let coin_pub = CoinPublicKey::from_bytes(coin.public_bytes());
        let h_contract_terms = HashCode::random();
        let h_wire = HashCode::random();
        let merchant_pub = MerchantPublicKey::random();
        let terms = DepositTerms {
            h_contract_terms: &h_contract_terms,
            h_wire: &h_wire,
            timestamp: Timestamp::from_secs(10),
            refund_deadline: Timestamp::from_secs(20),
            merchant_pub: &merchant_pub,
            coin_pub: &coin_pub,
        };
        let coin_sig = coin.sign(&signatures::deposit_request(&terms, &eur(amount), &eur("0.01")));
        CoinHistoryEntry::Deposit {
            amount: eur(amount),
            deposit_fee: eur("0.01"),
            timestamp: Timestamp::from_secs(10),
            refund_deadline: Timestamp::from_secs(20),
            merchant_pub,
            h_contract_terms,
            h_wire,
            coin_sig,
        }
    }

    #[test]
    fn test_genuine_double_spend() {
        let (_, coin) = EddsaKeyPair::generate();
        let coin_pub = CoinPublicKey::from_bytes(coin.public_bytes());
        let history = vec![signed_deposit(&coin, "5")];
        assert_eq!(
            proves_double_spending(&coin_pub, &eur("5"), &eur("5"), &history),
            Ok(true)
        );
    }

    #[test]
    fn test_history_with_room_left_proves_nothing() {
        let (_, coin) = EddsaKeyPair::generate();
        let coin_pub = CoinPublicKey::from_bytes(coin.public_bytes());
        let history = vec![signed_deposit(&coin, "2")];
        assert_eq!(
            proves_double_spending(&coin_pub, &eur("5"), &eur("3"), &history),
            Ok(false)
        );
    }

    #[test]
    fn test_forged_entry_is_rejected() {
        let (_, coin) = EddsaKeyPair::generate();
        let (_, forger) = EddsaKeyPair::generate();
        let coin_pub = CoinPublicKey::from_bytes(coin.public_bytes());
        let history = vec![signed_deposit(&forger, "5")];
        assert!(matches!(
            proves_double_spending(&coin_pub, &eur("5"), &eur("5"), &history),
            Err(HistoryError::BadSignature { index: 0, .. })
        ));
    }

    #[test]
    fn test_history_json_shape() {
        let (_, coin) = EddsaKeyPair::generate();
        let entry = signed_deposit(&coin, "1");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "DEPOSIT");
        let back: CoinHistoryEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
