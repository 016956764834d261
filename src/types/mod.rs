//! Types module
//!
//! Contains core data structures used throughout the backend.
//! This module organizes types into logical submodules:
//! - `amount`: checked monetary amounts
//! - `time`: timestamps and relative times
//! - `keys`: keys, hashes, signatures and their base32 encoding
//! - `instance`, `product`, `order`, `deposit`, `tip`: stored entities
//! - `error`: error types, HTTP status classes and error codes

pub mod amount;
pub mod deposit;
pub mod error;
pub mod instance;
pub mod keys;
pub mod order;
pub mod product;
pub mod time;
pub mod tip;

pub use amount::{Amount, AmountError};
pub use deposit::{
    CoinTransfer, DepositRecord, RefundProofRecord, RefundRecord, TransferProofRecord,
    WireFeeRecord,
};
pub use error::{ErrorCode, HttpStatus, MerchantError};
pub use instance::{AccountRecord, InstanceRecord, InstanceSettings, InstanceSummary};
pub use keys::{
    Blob, CoinPublicKey, EddsaPrivateKey, EddsaSignature, EncodingError, ExchangePublicKey,
    HashCode, MasterPublicKey, MerchantPublicKey, ReservePublicKey, Salt, TipId,
    WireTransferId,
};
pub use order::{
    ContractRecord, ContractTerms, OrderFilter, OrderRecord, OrderSummary, YesNoAll,
};
pub use product::{InventoryLock, OrderLock, ProductDetails, ProductRecord, Stock, StockField, Tax};
pub use time::{RelativeTime, Timestamp};
pub use tip::{ReserveSummary, TipAuthorization, TipPickup, TipReserve};
