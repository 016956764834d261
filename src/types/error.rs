//! Error types for the merchant backend
//!
//! Every core operation fails with a [`MerchantError`]. Each variant
//! carries the context needed to explain the failure and maps to an
//! HTTP-style [`HttpStatus`] plus a stable numeric [`ErrorCode`].
//!
//! # Error Categories
//!
//! - **Validation**: malformed JSON, parameters or amounts (400)
//! - **Not found**: unknown instance, product, order, tip, ... (404)
//! - **Conflict**: differing duplicates, counter regressions, replays with changed amounts (409)
//! - **Dependency**: the exchange failed, misbehaved or proved something (424, 403 for double spending)
//! - **Database**: serialization failures after retries and hard failures (500)
//! - **Timeout**: the exchange did not answer in time (503)

use super::amount::AmountError;
use super::keys::{EddsaPrivateKey, EncodingError};
use super::product::StockField;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// HTTP-style status class of a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpStatus {
    Ok,
    Accepted,
    NoContent,
    BadRequest,
    Forbidden,
    NotFound,
    NotAcceptable,
    Conflict,
    Gone,
    PreconditionFailed,
    FailedDependency,
    InternalServerError,
    ServiceUnavailable,
}

impl HttpStatus {
    pub fn as_u16(&self) -> u16 {
        match self {
            HttpStatus::Ok => 200,
            HttpStatus::Accepted => 202,
            HttpStatus::NoContent => 204,
            HttpStatus::BadRequest => 400,
            HttpStatus::Forbidden => 403,
            HttpStatus::NotFound => 404,
            HttpStatus::NotAcceptable => 406,
            HttpStatus::Conflict => 409,
            HttpStatus::Gone => 410,
            HttpStatus::PreconditionFailed => 412,
            HttpStatus::FailedDependency => 424,
            HttpStatus::InternalServerError => 500,
            HttpStatus::ServiceUnavailable => 503,
        }
    }

    pub fn is_success(&self) -> bool {
        self.as_u16() < 300
    }
}

impl Serialize for HttpStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

/// Stable numeric error codes
///
/// The numbering is part of the external interface and must never be
/// reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    JsonInvalid = 20,
    ParameterMissing = 21,
    ParameterMalformed = 22,
    CurrencyMismatch = 23,
    AmountOverflow = 24,
    InternalInvariantFailure = 60,
    DbCommitSoftError = 1000,
    DbCommitHardError = 1001,

    InstanceUnknown = 2000,
    InstanceConflict = 2001,
    InstanceInactive = 2002,
    InstanceLacksWire = 2003,
    AccountUnknown = 2004,

    ProductUnknown = 2100,
    ProductConflict = 2101,
    ProductStockedReduced = 2102,
    ProductSoldReduced = 2103,
    ProductLostReduced = 2104,
    ProductLostExceedsStock = 2105,
    ProductOutOfStock = 2106,
    ProductDeleteConflictingLock = 2107,

    OrderUnknown = 2200,
    OrderConflict = 2201,
    OrderAlreadyClaimed = 2202,
    OrderBadCurrency = 2203,
    OrderDeleteNotAllowed = 2204,
    ContractUnknown = 2205,

    PayDenominationUnknown = 2300,
    PayDenominationExpired = 2301,
    PayCoinSignatureInvalid = 2302,
    PayInsufficientFunds = 2303,
    PayFeesExceedPayment = 2304,
    PayAlreadyPaid = 2305,
    PayOfferExpired = 2306,
    PayDoubleSpending = 2307,
    PayExchangeRejected = 2308,
    PayMerchantMismatch = 2309,
    PayNoCoins = 2310,

    TrackConflictingReports = 2400,
    TrackBadWireFee = 2401,
    TrackTransferUnknown = 2402,

    ExchangeUnknown = 2450,
    ExchangeFailed = 2451,
    ExchangeTimeout = 2452,
    ExchangeSignatureInvalid = 2453,

    RefundInconsistentAmount = 2500,
    RefundAfterDeadline = 2501,
    RefundOrderNotPaid = 2502,

    TipReserveUnknown = 2600,
    TipReserveExpired = 2601,
    TipInsufficientFunds = 2602,
    TipIdUnknown = 2603,
    PickupAmountChanged = 2604,
    PickupNoFunds = 2605,
    PickupTooManyPlanchets = 2606,
    PickupDenominationUnknown = 2607,
    TipReserveNotEnabled = 2608,
}

impl ErrorCode {
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

/// Main error type for the merchant backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MerchantError {
    /// Request body is not the JSON shape the operation expects
    #[error("Malformed request: {message}")]
    JsonInvalid { message: String },

    /// A parameter could not be interpreted
    #[error("Malformed parameter '{parameter}': {message}")]
    ParameterMalformed { parameter: String, message: String },

    /// Amounts in different currencies were combined
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    /// A sum exceeded the representable amount range
    #[error("Amount overflow in {operation}")]
    AmountOverflow { operation: String },

    /// A condition the code relies on did not hold
    #[error("Internal invariant failure: {message}")]
    Internal { message: String },

    /// Serialization failures persisted through every retry
    #[error("Database serialization failure in {operation}")]
    DbSoftError { operation: String },

    /// The database failed outright
    #[error("Database failure in {operation}: {message}")]
    DbHardError { operation: String, message: String },

    #[error("Instance '{instance}' unknown")]
    InstanceUnknown { instance: String },

    #[error("Instance '{instance}' already exists with different settings")]
    InstanceConflict { instance: String },

    /// The instance's private key was deleted
    #[error("Instance '{instance}' has no private key")]
    InstanceInactive { instance: String },

    #[error("Instance '{instance}' has no active bank account")]
    InstanceLacksWire { instance: String },

    #[error("Account {h_wire} unknown for instance '{instance}'")]
    AccountUnknown { instance: String, h_wire: String },

    #[error("Product '{product_id}' unknown")]
    ProductUnknown { product_id: String },

    #[error("Product '{product_id}' already exists with different details")]
    ProductConflict { product_id: String },

    /// An update tried to move a monotonic counter backwards
    #[error("Product '{product_id}': {field} may not be reduced")]
    ProductCounterReduced { product_id: String, field: StockField },

    #[error("Product '{product_id}': sold and lost units exceed stock")]
    ProductLostExceedsStock { product_id: String },

    #[error("Product '{product_id}': {requested} units requested, not enough in stock")]
    ProductOutOfStock { product_id: String, requested: u64 },

    #[error("Product '{product_id}' has active locks")]
    ProductDeleteConflictingLock { product_id: String },

    #[error("Order '{order_id}' unknown")]
    OrderUnknown { order_id: String },

    #[error("Order '{order_id}' already exists with different terms")]
    OrderConflict { order_id: String },

    #[error("Order '{order_id}' was already claimed with a different nonce")]
    OrderAlreadyClaimed { order_id: String },

    #[error("Order currency {actual} differs from backend currency {expected}")]
    OrderBadCurrency { expected: String, actual: String },

    #[error("Order '{order_id}' cannot be deleted: {reason}")]
    OrderDeleteNotAllowed { order_id: String, reason: String },

    #[error("Contract {h_contract_terms} unknown")]
    ContractUnknown { h_contract_terms: String },

    #[error("Denomination of coin {coin_pub} unknown at {exchange_url}")]
    PayDenominationUnknown { coin_pub: String, exchange_url: String },

    #[error("Denomination of coin {coin_pub} is not valid for spending")]
    PayDenominationExpired { coin_pub: String },

    #[error("Signature of coin {coin_pub} is invalid")]
    PayCoinSignatureInvalid { coin_pub: String },

    #[error("Payment of {paid} insufficient, {owed} owed")]
    PayInsufficientFunds { paid: String, owed: String },

    #[error("Deposit fee of coin {coin_pub} exceeds its value")]
    PayFeesExceedPayment { coin_pub: String },

    #[error("Order '{order_id}' was already paid with different coins")]
    PayAlreadyPaid { order_id: String },

    #[error("Offer for order '{order_id}' expired")]
    PayOfferExpired { order_id: String },

    /// The exchange proved the coin was already spent
    #[error("Coin {coin_pub} was already spent")]
    PayDoubleSpending {
        coin_pub: String,
        exchange_url: String,
        history: Value,
    },

    #[error("Exchange {exchange_url} rejected coin {coin_pub} with status {http_status}")]
    PayExchangeRejected {
        coin_pub: String,
        exchange_url: String,
        http_status: u16,
        exchange_reply: Value,
    },

    #[error("Payment is for merchant {merchant_pub}, not this instance")]
    PayMerchantMismatch { merchant_pub: String },

    #[error("Payment contains no coins")]
    PayNoCoins,

    /// The exchange's transfer details contradict a stored deposit
    #[error("Exchange reports about wire transfer {wtid} conflict with stored deposits")]
    TrackConflictingReports { wtid: String, evidence: Value },

    /// The exchange charged more wire fee than its master key allowed
    #[error("Exchange charged an excessive wire fee for transfer {wtid}")]
    TrackBadWireFee { wtid: String, evidence: Value },

    #[error("Wire transfer {wtid} unknown at {exchange_url}")]
    TrackTransferUnknown { wtid: String, exchange_url: String },

    #[error("Exchange {exchange_url} is not trusted or not ready")]
    ExchangeUnknown { exchange_url: String },

    #[error("Exchange {exchange_url} failed with status {http_status}")]
    ExchangeFailed {
        exchange_url: String,
        http_status: u16,
        exchange_reply: Value,
    },

    #[error("Exchange {exchange_url} did not answer in time")]
    ExchangeTimeout { exchange_url: String },

    #[error("Exchange {exchange_url} sent an invalid signature on {what}")]
    ExchangeSignatureInvalid {
        exchange_url: String,
        what: String,
        exchange_reply: Value,
    },

    #[error("Refund of {requested} exceeds the {paid} paid for order '{order_id}'")]
    RefundInconsistentAmount {
        order_id: String,
        requested: String,
        paid: String,
    },

    #[error("Refund deadline of order '{order_id}' has passed")]
    RefundAfterDeadline { order_id: String },

    #[error("Order '{order_id}' is not paid")]
    RefundOrderNotPaid { order_id: String },

    #[error("Tip reserve unknown")]
    TipReserveUnknown,

    #[error("Tip reserve expired")]
    TipReserveExpired,

    #[error("Tip reserve holds {balance}, {requested} requested")]
    TipInsufficientFunds { balance: String, requested: String },

    #[error("Tip {tip_id} unknown")]
    TipIdUnknown { tip_id: String },

    /// The exchange holds the credit but the backend did not record it;
    /// the key is handed back so the reserve can be enabled later
    #[error("Reserve {reserve_pub} was credited at the exchange but not enabled: {reason}")]
    TipReserveNotEnabled {
        reserve_pub: String,
        reserve_priv: EddsaPrivateKey,
        credit_uuid: String,
        reason: String,
    },

    #[error("Pickup for tip {tip_id} replayed with a different amount")]
    PickupAmountChanged { tip_id: String },

    #[error("Tip {tip_id} has {left} left, {requested} requested")]
    PickupNoFunds {
        tip_id: String,
        left: String,
        requested: String,
    },

    #[error("Pickup with {count} planchets exceeds the limit")]
    PickupTooManyPlanchets { count: usize },

    #[error("Denomination {denom_pub_hash} unknown at the tip exchange")]
    PickupDenominationUnknown { denom_pub_hash: String },
}

impl MerchantError {
    /// Numeric error code of this failure
    pub fn error_code(&self) -> ErrorCode {
        use MerchantError::*;
        match self {
            JsonInvalid { .. } => ErrorCode::JsonInvalid,
            ParameterMalformed { .. } => ErrorCode::ParameterMalformed,
            CurrencyMismatch { .. } => ErrorCode::CurrencyMismatch,
            AmountOverflow { .. } => ErrorCode::AmountOverflow,
            Internal { .. } => ErrorCode::InternalInvariantFailure,
            DbSoftError { .. } => ErrorCode::DbCommitSoftError,
            DbHardError { .. } => ErrorCode::DbCommitHardError,
            InstanceUnknown { .. } => ErrorCode::InstanceUnknown,
            InstanceConflict { .. } => ErrorCode::InstanceConflict,
            InstanceInactive { .. } => ErrorCode::InstanceInactive,
            InstanceLacksWire { .. } => ErrorCode::InstanceLacksWire,
            AccountUnknown { .. } => ErrorCode::AccountUnknown,
            ProductUnknown { .. } => ErrorCode::ProductUnknown,
            ProductConflict { .. } => ErrorCode::ProductConflict,
            ProductCounterReduced { field, .. } => match field {
                StockField::TotalStocked => ErrorCode::ProductStockedReduced,
                StockField::TotalSold => ErrorCode::ProductSoldReduced,
                StockField::TotalLost => ErrorCode::ProductLostReduced,
            },
            ProductLostExceedsStock { .. } => ErrorCode::ProductLostExceedsStock,
            ProductOutOfStock { .. } => ErrorCode::ProductOutOfStock,
            ProductDeleteConflictingLock { .. } => ErrorCode::ProductDeleteConflictingLock,
            OrderUnknown { .. } => ErrorCode::OrderUnknown,
            OrderConflict { .. } => ErrorCode::OrderConflict,
            OrderAlreadyClaimed { .. } => ErrorCode::OrderAlreadyClaimed,
            OrderBadCurrency { .. } => ErrorCode::OrderBadCurrency,
            OrderDeleteNotAllowed { .. } => ErrorCode::OrderDeleteNotAllowed,
            ContractUnknown { .. } => ErrorCode::ContractUnknown,
            PayDenominationUnknown { .. } => ErrorCode::PayDenominationUnknown,
            PayDenominationExpired { .. } => ErrorCode::PayDenominationExpired,
            PayCoinSignatureInvalid { .. } => ErrorCode::PayCoinSignatureInvalid,
            PayInsufficientFunds { .. } => ErrorCode::PayInsufficientFunds,
            PayFeesExceedPayment { .. } => ErrorCode::PayFeesExceedPayment,
            PayAlreadyPaid { .. } => ErrorCode::PayAlreadyPaid,
            PayOfferExpired { .. } => ErrorCode::PayOfferExpired,
            PayDoubleSpending { .. } => ErrorCode::PayDoubleSpending,
            PayExchangeRejected { .. } => ErrorCode::PayExchangeRejected,
            PayMerchantMismatch { .. } => ErrorCode::PayMerchantMismatch,
            PayNoCoins => ErrorCode::PayNoCoins,
            TrackConflictingReports { .. } => ErrorCode::TrackConflictingReports,
            TrackBadWireFee { .. } => ErrorCode::TrackBadWireFee,
            TrackTransferUnknown { .. } => ErrorCode::TrackTransferUnknown,
            ExchangeUnknown { .. } => ErrorCode::ExchangeUnknown,
            ExchangeFailed { .. } => ErrorCode::ExchangeFailed,
            ExchangeTimeout { .. } => ErrorCode::ExchangeTimeout,
            ExchangeSignatureInvalid { .. } => ErrorCode::ExchangeSignatureInvalid,
            RefundInconsistentAmount { .. } => ErrorCode::RefundInconsistentAmount,
            RefundAfterDeadline { .. } => ErrorCode::RefundAfterDeadline,
            RefundOrderNotPaid { .. } => ErrorCode::RefundOrderNotPaid,
            TipReserveUnknown => ErrorCode::TipReserveUnknown,
            TipReserveExpired => ErrorCode::TipReserveExpired,
            TipInsufficientFunds { .. } => ErrorCode::TipInsufficientFunds,
            TipIdUnknown { .. } => ErrorCode::TipIdUnknown,
            TipReserveNotEnabled { .. } => ErrorCode::TipReserveNotEnabled,
            PickupAmountChanged { .. } => ErrorCode::PickupAmountChanged,
            PickupNoFunds { .. } => ErrorCode::PickupNoFunds,
            PickupTooManyPlanchets { .. } => ErrorCode::PickupTooManyPlanchets,
            PickupDenominationUnknown { .. } => ErrorCode::PickupDenominationUnknown,
        }
    }

    /// HTTP-style status class of this failure
    pub fn http_status(&self) -> HttpStatus {
        use MerchantError::*;
        match self {
            JsonInvalid { .. }
            | ParameterMalformed { .. }
            | CurrencyMismatch { .. }
            | AmountOverflow { .. }
            | OrderBadCurrency { .. }
            | PayMerchantMismatch { .. }
            | PayNoCoins
            | PickupTooManyPlanchets { .. } => HttpStatus::BadRequest,

            PayCoinSignatureInvalid { .. } | PayDoubleSpending { .. } => HttpStatus::Forbidden,

            InstanceUnknown { .. }
            | InstanceLacksWire { .. }
            | AccountUnknown { .. }
            | ProductUnknown { .. }
            | OrderUnknown { .. }
            | ContractUnknown { .. }
            | TrackTransferUnknown { .. }
            | TipReserveUnknown
            | TipIdUnknown { .. }
            | PickupDenominationUnknown { .. } => HttpStatus::NotFound,

            PayInsufficientFunds { .. } | PayFeesExceedPayment { .. } => {
                HttpStatus::NotAcceptable
            }

            InstanceConflict { .. }
            | InstanceInactive { .. }
            | ProductConflict { .. }
            | ProductCounterReduced { .. }
            | ProductLostExceedsStock { .. }
            | ProductDeleteConflictingLock { .. }
            | OrderConflict { .. }
            | OrderAlreadyClaimed { .. }
            | OrderDeleteNotAllowed { .. }
            | PayAlreadyPaid { .. }
            | RefundInconsistentAmount { .. }
            | RefundAfterDeadline { .. }
            | RefundOrderNotPaid { .. }
            | PickupAmountChanged { .. }
            | PickupNoFunds { .. } => HttpStatus::Conflict,

            ProductOutOfStock { .. }
            | PayOfferExpired { .. }
            | PayDenominationExpired { .. }
            | TipReserveExpired => HttpStatus::Gone,

            TipInsufficientFunds { .. } => HttpStatus::PreconditionFailed,

            PayDenominationUnknown { .. }
            | PayExchangeRejected { .. }
            | TrackConflictingReports { .. }
            | TrackBadWireFee { .. }
            | ExchangeUnknown { .. }
            | ExchangeFailed { .. }
            | ExchangeSignatureInvalid { .. } => HttpStatus::FailedDependency,

            Internal { .. }
            | DbSoftError { .. }
            | DbHardError { .. }
            | TipReserveNotEnabled { .. } => HttpStatus::InternalServerError,

            ExchangeTimeout { .. } => HttpStatus::ServiceUnavailable,
        }
    }

    /// Whether retrying the enclosing transaction may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, MerchantError::DbSoftError { .. })
    }

    /// JSON error body: `{code, hint}` plus any evidence the variant carries
    pub fn to_reply(&self) -> Value {
        use MerchantError::*;
        let mut body = Map::new();
        body.insert("code".to_string(), json!(self.error_code().as_u32()));
        body.insert("hint".to_string(), json!(self.to_string()));
        match self {
            ProductCounterReduced { product_id, field } => {
                body.insert("product_id".to_string(), json!(product_id));
                body.insert("field".to_string(), json!(field));
            }
            ProductOutOfStock {
                product_id,
                requested,
            } => {
                body.insert("product_id".to_string(), json!(product_id));
                body.insert("requested_quantity".to_string(), json!(requested));
            }
            PayDoubleSpending {
                coin_pub,
                exchange_url,
                history,
            } => {
                body.insert("coin_pub".to_string(), json!(coin_pub));
                body.insert("exchange_url".to_string(), json!(exchange_url));
                body.insert("history".to_string(), history.clone());
            }
            PayExchangeRejected {
                coin_pub,
                exchange_url,
                http_status,
                exchange_reply,
            } => {
                body.insert("coin_pub".to_string(), json!(coin_pub));
                body.insert("exchange_url".to_string(), json!(exchange_url));
                body.insert("exchange_http_status".to_string(), json!(http_status));
                body.insert("exchange_reply".to_string(), exchange_reply.clone());
            }
            ExchangeFailed {
                exchange_url,
                http_status,
                exchange_reply,
            } => {
                body.insert("exchange_url".to_string(), json!(exchange_url));
                body.insert("exchange_http_status".to_string(), json!(http_status));
                body.insert("exchange_reply".to_string(), exchange_reply.clone());
            }
            ExchangeSignatureInvalid {
                exchange_url,
                exchange_reply,
                ..
            } => {
                body.insert("exchange_url".to_string(), json!(exchange_url));
                body.insert("exchange_reply".to_string(), exchange_reply.clone());
            }
            TipReserveNotEnabled {
                reserve_pub,
                reserve_priv,
                credit_uuid,
                ..
            } => {
                body.insert("reserve_pub".to_string(), json!(reserve_pub));
                body.insert("reserve_priv".to_string(), json!(reserve_priv));
                body.insert("credit_uuid".to_string(), json!(credit_uuid));
            }
            TrackConflictingReports { evidence, .. } | TrackBadWireFee { evidence, .. } => {
                if let Value::Object(fields) = evidence {
                    for (key, value) in fields {
                        body.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
            }
            _ => {}
        }
        Value::Object(body)
    }
}

impl From<AmountError> for MerchantError {
    fn from(error: AmountError) -> Self {
        match error {
            AmountError::CurrencyMismatch { left, right } => MerchantError::CurrencyMismatch {
                expected: left,
                actual: right,
            },
            AmountError::Overflow => MerchantError::AmountOverflow {
                operation: "amount arithmetic".to_string(),
            },
            AmountError::Underflow => MerchantError::Internal {
                message: "amount underflow".to_string(),
            },
            AmountError::Malformed { .. } | AmountError::InvalidCurrency { .. } => {
                MerchantError::ParameterMalformed {
                    parameter: "amount".to_string(),
                    message: error.to_string(),
                }
            }
        }
    }
}

impl From<EncodingError> for MerchantError {
    fn from(error: EncodingError) -> Self {
        MerchantError::ParameterMalformed {
            parameter: "binary value".to_string(),
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for MerchantError {
    fn from(error: serde_json::Error) -> Self {
        MerchantError::JsonInvalid {
            message: error.to_string(),
        }
    }
}

// Helper functions for creating common errors

impl MerchantError {
    pub fn instance_unknown(instance: &str) -> Self {
        MerchantError::InstanceUnknown {
            instance: instance.to_string(),
        }
    }

    pub fn product_unknown(product_id: &str) -> Self {
        MerchantError::ProductUnknown {
            product_id: product_id.to_string(),
        }
    }

    pub fn order_unknown(order_id: &str) -> Self {
        MerchantError::OrderUnknown {
            order_id: order_id.to_string(),
        }
    }

    pub fn exchange_unknown(exchange_url: &str) -> Self {
        MerchantError::ExchangeUnknown {
            exchange_url: exchange_url.to_string(),
        }
    }

    pub fn exchange_timeout(exchange_url: &str) -> Self {
        MerchantError::ExchangeTimeout {
            exchange_url: exchange_url.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        MerchantError::Internal {
            message: message.into(),
        }
    }

    pub fn malformed(parameter: &str, message: impl Into<String>) -> Self {
        MerchantError::ParameterMalformed {
            parameter: parameter.to_string(),
            message: message.into(),
        }
    }
}
