//! Orders, claimed contracts and their typed views

use super::{Amount, HashCode, MerchantPublicKey, Timestamp};
use serde::{Deserialize, Serialize};

/// An order that has been proposed but not yet claimed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRecord {
    pub serial: u64,
    pub order_id: String,
    pub pay_deadline: Timestamp,
    pub creation_time: Timestamp,
    pub contract_terms: serde_json::Value,
}

/// A claimed order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractRecord {
    pub serial: u64,
    pub order_id: String,
    pub contract_terms: serde_json::Value,
    pub h_contract_terms: HashCode,
    pub creation_time: Timestamp,
    pub pay_deadline: Timestamp,
    pub refund_deadline: Timestamp,
    pub fulfillment_url: Option<String>,
    pub session_id: Option<String>,
    pub paid: bool,
    pub wired: bool,
}

/// Fields of a contract-terms document the backend acts upon
///
/// The full document is kept as JSON so that unknown fields survive and
/// the canonical hash covers everything the wallet saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractTerms {
    pub order_id: String,
    pub amount: Amount,
    pub max_fee: Amount,
    pub max_wire_fee: Amount,
    #[serde(default = "one")]
    pub wire_fee_amortization: u32,
    pub timestamp: Timestamp,
    pub refund_deadline: Timestamp,
    pub pay_deadline: Timestamp,
    pub wire_transfer_deadline: Timestamp,
    pub merchant_pub: MerchantPublicKey,
    #[serde(rename = "H_wire")]
    pub h_wire: HashCode,
    pub wire_method: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub fulfillment_url: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

fn one() -> u32 {
    1
}

impl ContractTerms {
    /// Typed view of a stored contract document
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Three-valued filter on a boolean flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YesNoAll {
    Yes,
    No,
    #[default]
    All,
}

impl YesNoAll {
    pub fn matches(&self, flag: bool) -> bool {
        match self {
            YesNoAll::Yes => flag,
            YesNoAll::No => !flag,
            YesNoAll::All => true,
        }
    }
}

/// Pagination and filtering for order listings
///
/// A positive `delta` lists up to `delta` rows with serial above
/// `start_row` in ascending order; a negative one lists rows below it
/// in descending order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFilter {
    #[serde(default)]
    pub paid: YesNoAll,
    #[serde(default)]
    pub refunded: YesNoAll,
    #[serde(default)]
    pub wired: YesNoAll,
    #[serde(default)]
    pub date_after: Option<Timestamp>,
    #[serde(default)]
    pub date_before: Option<Timestamp>,
    #[serde(default)]
    pub start_row: Option<u64>,
    #[serde(default = "default_delta")]
    pub delta: i64,
}

fn default_delta() -> i64 {
    -20
}

impl Default for OrderFilter {
    fn default() -> Self {
        Self {
            paid: YesNoAll::All,
            refunded: YesNoAll::All,
            wired: YesNoAll::All,
            date_after: None,
            date_before: None,
            start_row: None,
            delta: default_delta(),
        }
    }
}

/// One row of an order listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderSummary {
    pub row_id: u64,
    pub order_id: String,
    pub timestamp: Timestamp,
    pub amount: Amount,
    pub summary: String,
    pub paid: bool,
    pub refunded: bool,
    pub wired: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::yes_true(YesNoAll::Yes, true, true)]
    #[case::yes_false(YesNoAll::Yes, false, false)]
    #[case::no_true(YesNoAll::No, true, false)]
    #[case::no_false(YesNoAll::No, false, true)]
    #[case::all(YesNoAll::All, false, true)]
    fn test_yes_no_all(#[case] filter: YesNoAll, #[case] flag: bool, #[case] expected: bool) {
        assert_eq!(filter.matches(flag), expected);
    }

    #[test]
    fn test_filter_defaults_from_empty_json() {
        let filter: OrderFilter = serde_json::from_str("{}").unwrap();
        assert_eq!(filter, OrderFilter::default());
    }
}
