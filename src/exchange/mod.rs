//! Exchange client
//!
//! - `wire`: typed request and reply bodies
//! - `client`: transport seam and typed per-exchange operations
//! - `registry`: trusted exchanges, key snapshots and readiness

pub mod client;
pub mod registry;
pub mod wire;

pub use client::{
    DepositOutcome, ExchangeClient, ExchangeError, ExchangeTransport, HttpTransport, RawReply,
};
pub use registry::{
    normalize_url, EndpointClass, ExchangeHandle, ExchangeRegistry, KeysSnapshot, ReadyExchange,
};
