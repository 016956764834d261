//! Taler Merchant Backend Library
//! # Overview
//!
//! This library implements the core of a merchant backend for the Taler
//! payment system: it manages merchant instances, inventory and orders,
//! accepts coin payments by depositing them at trusted exchanges, tracks
//! the resulting wire transfers, grants refunds and hands out tips.
//!
//! # Architecture
//!
//! The system is organized into several key components:
//!
//! - [`types`] - Amounts, times, keys and the stored entities
//! - [`crypto`] - Canonical JSON, hashing and EdDSA signatures
//! - [`db`] - Transactional storage with serialization retries
//! - [`exchange`] - Exchange client, key snapshots and readiness
//! - [`core`] - Business logic, one module per operation family:
//!   - [`core::backend`] - The coordinator every operation runs on
//!   - [`core::payment`] - Paying contracts with coins
//!   - [`core::tracking`] - Wire transfer reconciliation
//!   - [`core::refunds`] - Refund increases and proofs
//!   - [`core::tips`] - Tip reserves and pickups
//! - [`api`] - Typed requests and replies
//! - [`io`] - JSON-lines request and reply streams
//! - [`cli`], [`config`] - Command line and configuration file
//!
//! # Order Lifecycle
//!
//! - **Created**: the merchant posts an order; inventory is locked
//! - **Claimed**: a wallet fixes the contract terms with its nonce
//! - **Paid**: deposits cover the price; locks turn into sold stock
//! - **Wired**: every deposit is matched to a wire transfer
//! - **Refunded**: part of the payment went back to the customer

// Module declarations
pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod db;
pub mod exchange;
pub mod io;
pub mod types;

pub use api::{dispatch, Reply, Request};
pub use config::{ConfigError, MerchantConfig};
pub use core::MerchantBackend;
pub use types::{Amount, ErrorCode, HttpStatus, MerchantError};
