//! Tipping
//!
//! A tip reserve is money the merchant wired to an exchange in advance.
//! Authorizing a tip moves part of the reserve balance into a tip; a
//! wallet then picks the tip up in one or more pickups, each of which
//! hands back reserve signatures for the coins the wallet withdraws.

use super::backend::MerchantBackend;
use crate::crypto::canonical::sha512;
use crate::crypto::signatures;
use crate::crypto::EddsaKeyPair;
use crate::db::DbError;
use crate::exchange::wire::AddIncomingRequest;
use crate::exchange::{normalize_url, EndpointClass};
use crate::types::{
    Amount, Blob, EddsaPrivateKey, EddsaSignature, HashCode, MerchantError, ReservePublicKey,
    ReserveSummary, TipAuthorization, TipId, TipPickup, TipReserve, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Most planchets one pickup may carry
pub const MAX_PLANCHETS: usize = 1024;

/// Outcome of crediting a reserve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReserveCredit {
    Credited,
    /// The credit UUID was seen before; nothing changed
    Replayed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizeTipRequest {
    pub reserve_priv: EddsaPrivateKey,
    pub amount: Amount,
    pub justification: String,
    #[serde(default)]
    pub extra: Value,
    pub exchange_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TipGranted {
    pub tip_id: TipId,
    pub expiration: Timestamp,
    pub exchange_url: String,
}

/// A blinded coin the wallet wants withdrawn from the tip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Planchet {
    pub denom_pub_hash: HashCode,
    pub coin_ev: Blob,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReserveSignature {
    pub reserve_sig: EddsaSignature,
}

/// Reserve signatures for the planchets of a pickup, in request order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TipPickupReply {
    pub reserve_pub: ReservePublicKey,
    pub reserve_sigs: Vec<ReserveSignature>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TipStatus {
    pub tip_id: TipId,
    pub amount: Amount,
    pub amount_left: Amount,
    pub exchange_url: String,
    pub expiration: Timestamp,
    pub justification: String,
    pub extra: Value,
    pub timestamp: Timestamp,
}

/// A reserve created through the exchange's administrative interface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FundedReserve {
    pub reserve_pub: ReservePublicKey,
    pub reserve_priv: EddsaPrivateKey,
    pub credit_uuid: Uuid,
}

/// Pickup id and amount of a set of planchets
///
/// The id is the SHA-512 over every `denom_pub_hash ‖ SHA-512(coin_ev)`;
/// the amount adds each denomination's value and withdraw fee.
fn pickup_terms(
    keys: &crate::exchange::KeysSnapshot,
    currency: &str,
    planchets: &[Planchet],
) -> Result<(HashCode, Amount), MerchantError> {
    let mut data = Vec::with_capacity(planchets.len() * 2 * HashCode::LEN);
    let mut total = Amount::zero(currency)?;
    for planchet in planchets {
        let denom = keys.denomination(&planchet.denom_pub_hash).ok_or_else(|| {
            MerchantError::PickupDenominationUnknown {
                denom_pub_hash: planchet.denom_pub_hash.to_string(),
            }
        })?;
        total = total
            .checked_add(&denom.value)?
            .checked_add(&denom.fee_withdraw)?;
        data.extend_from_slice(planchet.denom_pub_hash.as_bytes());
        data.extend_from_slice(sha512(planchet.coin_ev.as_bytes()).as_bytes());
    }
    Ok((sha512(&data), total))
}

impl MerchantBackend {
    /// Credit `amount` to the reserve of `reserve_priv`
    ///
    /// Each `credit_uuid` is applied once. An expired reserve starts over
    /// with the credit as its balance; an active one keeps the later
    /// expiration.
    pub fn enable_reserve(
        &self,
        reserve_priv: &EddsaPrivateKey,
        credit_uuid: Uuid,
        amount: &Amount,
        expiration: Timestamp,
    ) -> Result<ReserveCredit, MerchantError> {
        let reserve_pub = EddsaKeyPair::from_private(reserve_priv).reserve_pub();
        let now = Timestamp::now();
        let outcome = self.transact("enable_reserve", |tx| {
            match tx.insert_credit_uuid(credit_uuid, &reserve_pub) {
                Ok(()) => {}
                Err(DbError::UniqueViolation { .. }) => return Ok(ReserveCredit::Replayed),
                Err(e) => return Err(e.into()),
            }
            let reserve = match tx.lookup_reserve(&reserve_pub)? {
                Some(old) if old.expiration >= now => TipReserve {
                    reserve_priv: reserve_priv.clone(),
                    reserve_pub,
                    expiration: old.expiration.max(expiration),
                    balance: old.balance.checked_add(amount)?,
                },
                previous => {
                    if let Some(old) = previous {
                        info!(%reserve_pub, dropped = %old.balance, "Reserve expired; dropping its balance");
                    }
                    TipReserve {
                        reserve_priv: reserve_priv.clone(),
                        reserve_pub,
                        expiration,
                        balance: amount.clone(),
                    }
                }
            };
            tx.upsert_reserve(&reserve)?;
            Ok(ReserveCredit::Credited)
        })?;
        debug!(%reserve_pub, %credit_uuid, ?outcome, "Reserve credit processed");
        Ok(outcome)
    }

    /// Set part of a reserve aside as a tip
    ///
    /// # Errors
    ///
    /// * `ExchangeUnknown` - the tip's exchange is not trusted
    /// * `TipReserveUnknown`, `TipReserveExpired`
    /// * `TipInsufficientFunds` - the balance is below `amount`
    pub fn authorize_tip(&self, request: &AuthorizeTipRequest) -> Result<TipGranted, MerchantError> {
        let handle = self
            .exchanges()
            .lookup(&request.exchange_url)
            .ok_or_else(|| MerchantError::exchange_unknown(&request.exchange_url))?;
        let exchange_url = handle.url().to_string();
        let reserve_pub = EddsaKeyPair::from_private(&request.reserve_priv).reserve_pub();
        let now = Timestamp::now();

        let granted = self.transact("authorize_tip", |tx| {
            let reserve = tx
                .lookup_reserve(&reserve_pub)?
                .ok_or(MerchantError::TipReserveUnknown)?;
            if reserve.expiration < now {
                return Err(MerchantError::TipReserveExpired);
            }
            if reserve.balance.checked_cmp(&request.amount)? == Ordering::Less {
                return Err(MerchantError::TipInsufficientFunds {
                    balance: reserve.balance.to_string(),
                    requested: request.amount.to_string(),
                });
            }
            let balance = reserve.balance.checked_sub(&request.amount)?;
            tx.upsert_reserve(&TipReserve { balance, ..reserve.clone() })?;

            let tip_id = TipId::random();
            tx.insert_tip_authorization(&TipAuthorization {
                tip_id,
                reserve_pub,
                exchange_url: exchange_url.clone(),
                justification: request.justification.clone(),
                extra: request.extra.clone(),
                timestamp: now,
                amount: request.amount.clone(),
                amount_left: request.amount.clone(),
            })?;
            Ok(TipGranted {
                tip_id,
                expiration: reserve.expiration,
                exchange_url: exchange_url.clone(),
            })
        })?;
        info!(tip_id = %granted.tip_id, amount = %request.amount, justification = %request.justification, "Tip authorized");
        Ok(granted)
    }

    /// Take `amount` from a tip under `pickup_id`
    ///
    /// Repeating a pickup with the same amount succeeds again without
    /// taking more.
    ///
    /// # Returns
    ///
    /// The reserve's private key, for signing the withdrawals.
    ///
    /// # Errors
    ///
    /// * `TipIdUnknown`
    /// * `PickupAmountChanged` - the pickup was made before with another amount
    /// * `PickupNoFunds` - less than `amount` is left
    pub fn pickup(
        &self,
        tip_id: &TipId,
        pickup_id: &HashCode,
        amount: &Amount,
    ) -> Result<EddsaPrivateKey, MerchantError> {
        self.transact("pickup_tip", |tx| {
            let tip = tx
                .lookup_tip(tip_id)?
                .ok_or_else(|| MerchantError::TipIdUnknown {
                    tip_id: tip_id.to_string(),
                })?;
            let reserve = tx
                .lookup_reserve(&tip.reserve_pub)?
                .ok_or(MerchantError::TipReserveUnknown)?;

            if let Some(previous) = tx.lookup_pickup(tip_id, pickup_id)? {
                if previous.amount == *amount {
                    return Ok(reserve.reserve_priv);
                }
                return Err(MerchantError::PickupAmountChanged {
                    tip_id: tip_id.to_string(),
                });
            }
            if tip.amount_left.checked_cmp(amount)? == Ordering::Less {
                return Err(MerchantError::PickupNoFunds {
                    tip_id: tip_id.to_string(),
                    left: tip.amount_left.to_string(),
                    requested: amount.to_string(),
                });
            }
            let left = tip.amount_left.checked_sub(amount)?;
            tx.update_tip_amount_left(tip_id, &left)?;
            tx.insert_pickup(&TipPickup {
                tip_id: *tip_id,
                pickup_id: *pickup_id,
                amount: amount.clone(),
            })?;
            Ok(reserve.reserve_priv)
        })
    }

    /// Withdraw-sign a wallet's planchets against a tip
    ///
    /// # Errors
    ///
    /// * `PickupTooManyPlanchets` - more than [`MAX_PLANCHETS`]
    /// * `PickupDenominationUnknown` - a planchet names a denomination the exchange does not offer
    /// * everything [`Self::pickup`] fails with
    pub async fn pickup_tip(&self, tip_id: &TipId, planchets: &[Planchet]) -> Result<TipPickupReply, MerchantError> {
        if planchets.len() > MAX_PLANCHETS {
            return Err(MerchantError::PickupTooManyPlanchets {
                count: planchets.len(),
            });
        }
        if planchets.is_empty() {
            return Err(MerchantError::malformed("planchets", "at least one planchet is required"));
        }
        let tip = self.query_tip(tip_id)?;
        let scope = self.scope();
        let ready = self
            .exchanges()
            .find_exchange(&tip.exchange_url, scope.token())
            .await?;

        let (pickup_id, amount) = pickup_terms(&ready.keys, tip.amount.currency(), planchets)?;
        let reserve_priv = self.pickup(tip_id, &pickup_id, &amount)?;
        let reserve = EddsaKeyPair::from_private(&reserve_priv);
        let reserve_pub = reserve.reserve_pub();

        let mut reserve_sigs = Vec::with_capacity(planchets.len());
        for planchet in planchets {
            let denom = ready
                .keys
                .denomination(&planchet.denom_pub_hash)
                .ok_or_else(|| MerchantError::PickupDenominationUnknown {
                    denom_pub_hash: planchet.denom_pub_hash.to_string(),
                })?;
            let message = signatures::reserve_withdraw(
                &reserve_pub,
                &denom.value.checked_add(&denom.fee_withdraw)?,
                &denom.fee_withdraw,
                &planchet.denom_pub_hash,
                &sha512(planchet.coin_ev.as_bytes()),
            );
            reserve_sigs.push(ReserveSignature {
                reserve_sig: reserve.sign(&message),
            });
        }
        info!(%tip_id, %pickup_id, %amount, planchets = planchets.len(), "Tip picked up");
        Ok(TipPickupReply {
            reserve_pub,
            reserve_sigs,
        })
    }

    pub fn query_tip(&self, tip_id: &TipId) -> Result<TipStatus, MerchantError> {
        self.transact("query_tip", |tx| {
            let tip = tx
                .lookup_tip(tip_id)?
                .ok_or_else(|| MerchantError::TipIdUnknown {
                    tip_id: tip_id.to_string(),
                })?;
            let expiration = tx
                .lookup_reserve(&tip.reserve_pub)?
                .map(|r| r.expiration)
                .unwrap_or(tip.timestamp);
            Ok(TipStatus {
                tip_id: tip.tip_id,
                amount: tip.amount,
                amount_left: tip.amount_left,
                exchange_url: tip.exchange_url,
                expiration,
                justification: tip.justification,
                extra: tip.extra,
                timestamp: tip.timestamp,
            })
        })
    }

    pub fn list_reserves(&self) -> Result<Vec<ReserveSummary>, MerchantError> {
        self.transact("list_reserves", |tx| Ok(tx.list_reserves()?))
    }

    /// Create a reserve by crediting it at the exchange, then enable it
    ///
    /// # Arguments
    ///
    /// * `exchange_url` - trusted exchange that will hold the reserve
    /// * `amount` - initial balance
    /// * `expiration` - when the reserve stops funding tips
    /// * `sender_account_url` - payto URI of the account the money comes from
    ///
    /// # Errors
    ///
    /// `ExchangeUnknown` or `ExchangeTimeout` before the exchange answers,
    /// `ExchangeFailed` if it refuses the credit, `TipReserveNotEnabled`
    /// with the reserve key if the accepted credit could not be stored.
    pub async fn fund_reserve(
        &self,
        exchange_url: &str,
        amount: &Amount,
        expiration: Timestamp,
        sender_account_url: &str,
    ) -> Result<FundedReserve, MerchantError> {
        let scope = self.scope();
        let ready = self
            .exchanges()
            .find_exchange(&normalize_url(exchange_url), scope.token())
            .await?;
        let handle = &ready.handle;
        let (reserve_priv, reserve) = EddsaKeyPair::generate();
        let reserve_pub = reserve.reserve_pub();
        let credit_uuid = Uuid::new_v4();
        let request = AddIncomingRequest {
            reserve_pub,
            amount: amount.clone(),
            execution_date: Timestamp::now(),
            sender_account_url: sender_account_url.to_string(),
            transfer_details: json!({ "uuid": credit_uuid }),
        };

        scope
            .run(handle.url(), async {
                let _permit = handle.acquire(EndpointClass::AdminAddIncoming).await?;
                Ok::<_, MerchantError>(handle.client().add_incoming(&request).await?)
            })
            .await
            .inspect_err(|e| warn!(exchange = %handle.url(), error = %e, "Exchange refused the reserve credit"))?;

        if let Err(e) = self.enable_reserve(&reserve_priv, credit_uuid, amount, expiration) {
            error!(%reserve_pub, %credit_uuid, exchange = %handle.url(), error = %e, "Credited reserve could not be enabled");
            return Err(MerchantError::TipReserveNotEnabled {
                reserve_pub: reserve_pub.to_string(),
                reserve_priv,
                credit_uuid: credit_uuid.to_string(),
                reason: e.to_string(),
            });
        }
        info!(%reserve_pub, exchange = %handle.url(), %amount, "Reserve funded");
        Ok(FundedReserve {
            reserve_pub,
            reserve_priv,
            credit_uuid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::backend;
    use crate::exchange::wire::DenominationEntry;
    use crate::exchange::KeysSnapshot;
    use crate::types::{MasterPublicKey, RelativeTime};
    use std::collections::BTreeMap;

    fn eur(s: &str) -> Amount {
        format!("EUR:{}", s).parse().unwrap()
    }

    fn in_days(days: u64) -> Timestamp {
        Timestamp::now() + RelativeTime::from_secs(days * 86_400)
    }

    fn tip_request(reserve_priv: &EddsaPrivateKey, amount: &str) -> AuthorizeTipRequest {
        AuthorizeTipRequest {
            reserve_priv: reserve_priv.clone(),
            amount: eur(amount),
            justification: "thanks".to_string(),
            extra: json!({"note": 1}),
            exchange_url: "https://ex.test".to_string(),
        }
    }

    /// Backend trusting `https://ex.test/` with a funded reserve
    fn funded(balance: &str) -> (MerchantBackend, EddsaPrivateKey) {
        let backend = backend();
        backend
            .exchanges()
            .add_trusted("https://ex.test/", MasterPublicKey::random());
        let reserve_priv = EddsaPrivateKey::generate();
        backend
            .enable_reserve(&reserve_priv, Uuid::new_v4(), &eur(balance), in_days(30))
            .unwrap();
        (backend, reserve_priv)
    }

    #[test]
    fn test_enable_reserve_replay_and_top_up() {
        let backend = backend();
        let reserve_priv = EddsaPrivateKey::generate();
        let credit = Uuid::new_v4();
        assert_eq!(
            backend.enable_reserve(&reserve_priv, credit, &eur("10"), in_days(10)),
            Ok(ReserveCredit::Credited)
        );
        assert_eq!(
            backend.enable_reserve(&reserve_priv, credit, &eur("10"), in_days(10)),
            Ok(ReserveCredit::Replayed)
        );
        backend
            .enable_reserve(&reserve_priv, Uuid::new_v4(), &eur("5"), in_days(5))
            .unwrap();

        let reserves = backend.list_reserves().unwrap();
        assert_eq!(reserves.len(), 1);
        assert_eq!(reserves[0].balance, eur("15"));
        // the later expiration is kept
        assert!(reserves[0].expiration > in_days(9));
    }

    #[test]
    fn test_expired_reserve_starts_over() {
        let backend = backend();
        let reserve_priv = EddsaPrivateKey::generate();
        backend
            .enable_reserve(&reserve_priv, Uuid::new_v4(), &eur("10"), Timestamp::from_secs(1_000))
            .unwrap();
        backend
            .enable_reserve(&reserve_priv, Uuid::new_v4(), &eur("3"), in_days(1))
            .unwrap();
        assert_eq!(backend.list_reserves().unwrap()[0].balance, eur("3"));
    }

    #[test]
    fn test_authorize_tip_debits_reserve() {
        let (backend, reserve_priv) = funded("10");
        let granted = backend.authorize_tip(&tip_request(&reserve_priv, "4")).unwrap();
        assert_eq!(granted.exchange_url, "https://ex.test/");

        let status = backend.query_tip(&granted.tip_id).unwrap();
        assert_eq!(status.amount, eur("4"));
        assert_eq!(status.amount_left, eur("4"));
        assert_eq!(status.justification, "thanks");

        let reserves = backend.list_reserves().unwrap();
        assert_eq!(reserves[0].balance, eur("6"));
        assert_eq!(reserves[0].tips_authorized, 1);

        assert_eq!(
            backend.authorize_tip(&tip_request(&reserve_priv, "7")),
            Err(MerchantError::TipInsufficientFunds {
                balance: "EUR:6".to_string(),
                requested: "EUR:7".to_string(),
            })
        );
    }

    #[test]
    fn test_authorize_tip_failures() {
        let (backend, _) = funded("10");
        let stranger = EddsaPrivateKey::generate();
        assert_eq!(
            backend.authorize_tip(&tip_request(&stranger, "1")),
            Err(MerchantError::TipReserveUnknown)
        );

        let expired = EddsaPrivateKey::generate();
        backend
            .enable_reserve(&expired, Uuid::new_v4(), &eur("10"), Timestamp::from_secs(1_000))
            .unwrap();
        assert_eq!(
            backend.authorize_tip(&tip_request(&expired, "1")),
            Err(MerchantError::TipReserveExpired)
        );

        let mut untrusted = tip_request(&expired, "1");
        untrusted.exchange_url = "https://rogue.test/".to_string();
        assert_eq!(
            backend.authorize_tip(&untrusted),
            Err(MerchantError::exchange_unknown("https://rogue.test/"))
        );
    }

    #[test]
    fn test_pickup_is_idempotent_and_bounded() {
        let (backend, reserve_priv) = funded("10");
        let tip_id = backend.authorize_tip(&tip_request(&reserve_priv, "5")).unwrap().tip_id;
        let first = HashCode::random();

        assert_eq!(backend.pickup(&tip_id, &first, &eur("3")), Ok(reserve_priv.clone()));
        assert_eq!(backend.pickup(&tip_id, &first, &eur("3")), Ok(reserve_priv.clone()));
        assert_eq!(
            backend.pickup(&tip_id, &first, &eur("2")),
            Err(MerchantError::PickupAmountChanged {
                tip_id: tip_id.to_string()
            })
        );
        assert_eq!(
            backend.pickup(&tip_id, &HashCode::random(), &eur("2.01")),
            Err(MerchantError::PickupNoFunds {
                tip_id: tip_id.to_string(),
                left: "EUR:2".to_string(),
                requested: "EUR:2.01".to_string(),
            })
        );
        assert_eq!(backend.query_tip(&tip_id).unwrap().amount_left, eur("2"));
    }

    #[test]
    fn test_pickup_unknown_tip() {
        let (backend, _) = funded("1");
        let tip_id = TipId::random();
        assert_eq!(
            backend.pickup(&tip_id, &HashCode::random(), &eur("1")),
            Err(MerchantError::TipIdUnknown {
                tip_id: tip_id.to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_too_many_planchets() {
        let (backend, _) = funded("1");
        let planchet = Planchet {
            denom_pub_hash: HashCode::random(),
            coin_ev: Blob(vec![0]),
        };
        let planchets = vec![planchet; MAX_PLANCHETS + 1];
        assert_eq!(
            backend.pickup_tip(&TipId::random(), &planchets).await,
            Err(MerchantError::PickupTooManyPlanchets {
                count: MAX_PLANCHETS + 1
            })
        );
    }

    #[test]
    fn test_pickup_terms() {
        let denom = DenominationEntry {
            denom_pub: Blob(vec![7; 16]),
            value: eur("1"),
            fee_withdraw: eur("0.01"),
            fee_deposit: eur("0.01"),
            fee_refresh: eur("0.01"),
            fee_refund: eur("0.01"),
            stamp_start: Timestamp::from_secs(0),
            stamp_expire_withdraw: in_days(1),
            stamp_expire_deposit: in_days(2),
            stamp_expire_legal: in_days(3),
            master_sig: EddsaSignature::random(),
        };
        let h_denom = denom.denom_pub_hash();
        let keys = KeysSnapshot {
            master_pub: MasterPublicKey::random(),
            signkeys: vec![],
            denoms: BTreeMap::from([(h_denom, denom)]),
            list_issue_date: Timestamp::from_secs(0),
        };
        let planchets = vec![
            Planchet { denom_pub_hash: h_denom, coin_ev: Blob(vec![1]) },
            Planchet { denom_pub_hash: h_denom, coin_ev: Blob(vec![2]) },
        ];

        let (pickup_id, amount) = pickup_terms(&keys, "EUR", &planchets).unwrap();
        assert_eq!(amount, eur("2.02"));

        let mut expected = Vec::new();
        for p in &planchets {
            expected.extend_from_slice(h_denom.as_bytes());
            expected.extend_from_slice(sha512(p.coin_ev.as_bytes()).as_bytes());
        }
        assert_eq!(pickup_id, sha512(&expected));

        // order matters
        let reversed: Vec<_> = planchets.iter().rev().cloned().collect();
        assert_ne!(pickup_terms(&keys, "EUR", &reversed).unwrap().0, pickup_id);

        let unknown = vec![Planchet { denom_pub_hash: HashCode::random(), coin_ev: Blob(vec![1]) }];
        assert!(matches!(
            pickup_terms(&keys, "EUR", &unknown),
            Err(MerchantError::PickupDenominationUnknown { .. })
        ));
    }
}
