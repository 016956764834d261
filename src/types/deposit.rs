//! Deposits, wire transfers, refunds and exchange fee statements

use super::{
    Amount, CoinPublicKey, EddsaSignature, ExchangePublicKey, HashCode, MasterPublicKey,
    MerchantPublicKey, Timestamp, WireTransferId,
};
use serde::{Deserialize, Serialize};

/// A coin the exchange accepted for a contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub h_contract_terms: HashCode,
    pub merchant_pub: MerchantPublicKey,
    pub coin_pub: CoinPublicKey,
    pub exchange_url: String,
    pub amount_with_fee: Amount,
    pub deposit_fee: Amount,
    pub refund_fee: Amount,
    pub wire_fee: Amount,
    pub exchange_pub: ExchangePublicKey,
    pub exchange_proof: serde_json::Value,
}

/// Aggregation of a deposit into a wire transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoinTransfer {
    pub h_contract_terms: HashCode,
    pub coin_pub: CoinPublicKey,
    pub exchange_url: String,
    pub wtid: WireTransferId,
}

/// The exchange's signed account of a wire transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProofRecord {
    pub exchange_url: String,
    pub wtid: WireTransferId,
    pub execution_time: Timestamp,
    pub exchange_pub: ExchangePublicKey,
    pub proof: serde_json::Value,
}

/// One refund increment against one coin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub serial: u64,
    pub merchant_pub: MerchantPublicKey,
    pub h_contract_terms: HashCode,
    pub coin_pub: CoinPublicKey,
    pub exchange_url: String,
    pub rtransaction_id: u64,
    pub reason: String,
    pub refund_amount: Amount,
    pub refund_fee: Amount,
    pub timestamp: Timestamp,
}

/// The exchange's confirmation of a refund
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundProofRecord {
    pub coin_pub: CoinPublicKey,
    pub rtransaction_id: u64,
    pub exchange_pub: ExchangePublicKey,
    pub exchange_sig: EddsaSignature,
}

/// Wire fee an exchange charges for a method over `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFeeRecord {
    pub master_pub: MasterPublicKey,
    pub h_wire_method: HashCode,
    pub wire_method: String,
    pub wire_fee: Amount,
    pub closing_fee: Amount,
    pub start_date: Timestamp,
    pub end_date: Timestamp,
    pub master_sig: EddsaSignature,
}

impl WireFeeRecord {
    pub fn covers(&self, date: Timestamp) -> bool {
        self.start_date <= date && date < self.end_date
    }
}
