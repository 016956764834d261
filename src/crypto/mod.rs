//! Cryptographic layer
//!
//! - `canonical`: canonical JSON and the hashes built on it
//! - `signatures`: purpose-tagged Ed25519 messages
//! - `coin_history`: double-spend proof verification

pub mod canonical;
pub mod coin_history;
pub mod signatures;

pub use canonical::{canonical_json, hash_contract_terms, hash_json, hash_wire, hash_wire_method};
pub use coin_history::{CoinHistoryEntry, HistoryError};
pub use signatures::{verify, CryptoError, EddsaKeyPair, SignedMessage};
