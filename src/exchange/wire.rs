//! Typed exchange messages
//!
//! One struct per request or reply body the backend exchanges with an
//! exchange. Replies are decoded in a single `serde` pass; fields the
//! backend does not rely on are ignored.

use crate::crypto::canonical::sha512;
use crate::crypto::CoinHistoryEntry;
use crate::types::{
    Amount, Blob, CoinPublicKey, EddsaSignature, ExchangePublicKey, HashCode, MasterPublicKey,
    MerchantPublicKey, ReservePublicKey, Timestamp, WireTransferId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `/keys` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysResponse {
    pub master_public_key: MasterPublicKey,
    #[serde(default)]
    pub signkeys: Vec<SignKeyEntry>,
    #[serde(default)]
    pub denoms: Vec<DenominationEntry>,
    pub list_issue_date: Timestamp,
}

/// An online signing key certified by the master key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignKeyEntry {
    pub key: ExchangePublicKey,
    pub stamp_start: Timestamp,
    pub stamp_expire: Timestamp,
    pub stamp_end: Timestamp,
    pub master_sig: EddsaSignature,
}

impl SignKeyEntry {
    /// Whether signatures by this key are still binding at `now`
    ///
    /// A key stops signing at `stamp_expire` but its signatures stay
    /// verifiable until `stamp_end`.
    pub fn is_certified_at(&self, now: Timestamp) -> bool {
        self.stamp_start <= now && now < self.stamp_end
    }
}

/// A denomination with its fee schedule and validity windows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenominationEntry {
    pub denom_pub: Blob,
    pub value: Amount,
    pub fee_withdraw: Amount,
    pub fee_deposit: Amount,
    pub fee_refresh: Amount,
    pub fee_refund: Amount,
    pub stamp_start: Timestamp,
    pub stamp_expire_withdraw: Timestamp,
    pub stamp_expire_deposit: Timestamp,
    pub stamp_expire_legal: Timestamp,
    pub master_sig: EddsaSignature,
}

impl DenominationEntry {
    /// Hash identifying the denomination key
    pub fn denom_pub_hash(&self) -> HashCode {
        sha512(self.denom_pub.as_bytes())
    }

    /// Whether coins of this denomination may be deposited at `now`
    pub fn is_spendable_at(&self, now: Timestamp) -> bool {
        self.stamp_start <= now && now < self.stamp_expire_deposit
    }

    /// Whether coins of this denomination may be withdrawn at `now`
    pub fn is_withdrawable_at(&self, now: Timestamp) -> bool {
        self.stamp_start <= now && now < self.stamp_expire_withdraw
    }
}

/// `/wire` reply: fee statements per wire method
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WireResponse {
    #[serde(default)]
    pub fees: BTreeMap<String, Vec<WireFeeEntry>>,
}

/// A master-signed wire fee over `[start_date, end_date)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFeeEntry {
    pub wire_fee: Amount,
    pub closing_fee: Amount,
    pub start_date: Timestamp,
    pub end_date: Timestamp,
    pub sig: EddsaSignature,
}

/// Account descriptor revealed to the exchange with a deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDetails {
    pub payto_uri: String,
    pub salt: crate::types::Salt,
}

/// `/deposit` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRequest {
    pub coin_pub: CoinPublicKey,
    pub denom_pub: Blob,
    pub ub_sig: Blob,
    pub coin_sig: EddsaSignature,
    pub contribution: Amount,
    pub wire: WireDetails,
    #[serde(rename = "H_wire")]
    pub h_wire: HashCode,
    pub h_contract_terms: HashCode,
    pub timestamp: Timestamp,
    pub refund_deadline: Timestamp,
    pub wire_transfer_deadline: Timestamp,
    pub merchant_pub: MerchantPublicKey,
}

/// `/deposit` success reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositConfirmation {
    pub sig: EddsaSignature,
    #[serde(rename = "pub")]
    pub exchange_pub: ExchangePublicKey,
}

/// `/deposit` 403 reply carrying the coin's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleSpendReply {
    pub history: Vec<CoinHistoryEntry>,
}

/// `/track/transaction` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTransactionRequest {
    #[serde(rename = "H_wire")]
    pub h_wire: HashCode,
    pub h_contract_terms: HashCode,
    pub coin_pub: CoinPublicKey,
    pub merchant_pub: MerchantPublicKey,
    pub merchant_sig: EddsaSignature,
}

/// `/track/transaction` outcome
#[derive(Debug, Clone, PartialEq)]
pub enum TrackTransactionOutcome {
    /// The deposit went out with a wire transfer
    Wired(TrackTransactionResponse),
    /// Not yet aggregated; expected no earlier than `execution_time`
    Pending { execution_time: Timestamp },
}

/// `/track/transaction` success reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTransactionResponse {
    pub wtid: WireTransferId,
    pub execution_time: Timestamp,
    pub coin_contribution: Amount,
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: ExchangePublicKey,
}

/// `/track/transaction` 202 reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTransactionPending {
    pub execution_time: Timestamp,
}

/// One deposit aggregated into a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDeposit {
    pub h_contract_terms: HashCode,
    pub coin_pub: CoinPublicKey,
    pub amount_with_fee: Amount,
    pub deposit_fee: Amount,
}

/// `/track/transfer` success reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTransferResponse {
    pub wtid: WireTransferId,
    pub total_amount: Amount,
    pub wire_fee: Amount,
    pub merchant_pub: MerchantPublicKey,
    #[serde(rename = "H_wire")]
    pub h_wire: HashCode,
    pub execution_time: Timestamp,
    pub deposits: Vec<TransferDeposit>,
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: ExchangePublicKey,
}

/// `/refund` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub h_contract_terms: HashCode,
    pub coin_pub: CoinPublicKey,
    pub merchant_pub: MerchantPublicKey,
    pub rtransaction_id: u64,
    pub refund_amount: Amount,
    pub refund_fee: Amount,
    pub merchant_sig: EddsaSignature,
}

/// `/refund` success reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundConfirmation {
    pub sig: EddsaSignature,
    #[serde(rename = "pub")]
    pub exchange_pub: ExchangePublicKey,
}

/// `/admin/add-incoming` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddIncomingRequest {
    pub reserve_pub: ReservePublicKey,
    pub amount: Amount,
    pub execution_date: Timestamp,
    pub sender_account_url: String,
    pub transfer_details: serde_json::Value,
}
