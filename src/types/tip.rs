//! Tipping reserves, authorizations and pickups

use super::{Amount, EddsaPrivateKey, HashCode, ReservePublicKey, TipId, Timestamp};
use serde::Serialize;

/// Funds set aside for tipping
#[derive(Debug, Clone, PartialEq)]
pub struct TipReserve {
    pub reserve_priv: EddsaPrivateKey,
    pub reserve_pub: ReservePublicKey,
    pub expiration: Timestamp,
    pub balance: Amount,
}

/// A committed promise to pay a tip
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TipAuthorization {
    pub tip_id: TipId,
    pub reserve_pub: ReservePublicKey,
    pub exchange_url: String,
    pub justification: String,
    pub extra: serde_json::Value,
    pub timestamp: Timestamp,
    pub amount: Amount,
    pub amount_left: Amount,
}

/// A wallet's withdrawal against a tip
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TipPickup {
    pub tip_id: TipId,
    pub pickup_id: HashCode,
    pub amount: Amount,
}

/// Reserve listing entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReserveSummary {
    pub reserve_pub: ReservePublicKey,
    pub expiration: Timestamp,
    pub balance: Amount,
    pub tips_authorized: u64,
}
