//! Merchant instances and their bank accounts

use super::{Amount, EddsaPrivateKey, HashCode, MerchantPublicKey, RelativeTime, Salt};
use serde::{Deserialize, Serialize};

/// Settings that describe a merchant instance
///
/// Two settings values are equal iff every field matches; this is the
/// comparison used to decide whether a repeated instance creation is an
/// idempotent replay or a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSettings {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: serde_json::Value,
    #[serde(default)]
    pub jurisdiction: serde_json::Value,
    pub default_max_deposit_fee: Amount,
    pub default_max_wire_fee: Amount,
    #[serde(default = "default_amortization")]
    pub default_wire_fee_amortization: u32,
    pub default_wire_transfer_delay: RelativeTime,
    pub default_pay_delay: RelativeTime,
}

fn default_amortization() -> u32 {
    1
}

/// Stored instance row
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub serial: u64,
    pub settings: InstanceSettings,
    pub merchant_pub: MerchantPublicKey,
    /// Present iff the instance is active
    pub merchant_priv: Option<EddsaPrivateKey>,
}

impl InstanceRecord {
    pub fn is_active(&self) -> bool {
        self.merchant_priv.is_some()
    }
}

/// Bank account bound to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub h_wire: HashCode,
    pub payto_uri: String,
    pub salt: Salt,
    pub active: bool,
}

impl AccountRecord {
    /// Wire method encoded in the payto URI (`payto://iban/...` gives `iban`)
    pub fn wire_method(&self) -> Option<&str> {
        wire_method_of(&self.payto_uri)
    }
}

/// Extract the wire method from a `payto://METHOD/...` URI
pub fn wire_method_of(payto_uri: &str) -> Option<&str> {
    let rest = payto_uri.strip_prefix("payto://")?;
    let method = rest.split('/').next()?;
    if method.is_empty() {
        None
    } else {
        Some(method)
    }
}

/// Public view of an instance with its active accounts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSummary {
    #[serde(flatten)]
    pub settings: InstanceSettings,
    pub merchant_pub: MerchantPublicKey,
    pub active: bool,
    pub accounts: Vec<AccountRecord>,
}
