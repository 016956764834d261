//! Core business logic module
//!
//! This module contains the merchant backend's operations:
//! - `backend` - The `MerchantBackend` coordinator owning storage and exchanges
//! - `scheduler` - Request scopes, deadlines and cancellable background work
//! - `instances` - Merchant instances and their bank accounts
//! - `products` - Inventory and stock locks
//! - `orders` - Order proposals, claims, listings and session bindings
//! - `payment` - Paying a contract with coins
//! - `tracking` - Wire transfer tracking and reconciliation
//! - `refunds` - Refund increases and exchange refund proofs
//! - `tips` - Tip reserves, authorizations and pickups

pub mod backend;
pub mod instances;
pub mod orders;
pub mod payment;
pub mod products;
pub mod refunds;
pub mod scheduler;
pub mod tips;
pub mod tracking;

pub use backend::{BackendSettings, MerchantBackend};
pub use instances::InstanceConfig;
pub use orders::{ClaimedContract, LockRequest, OrderStatus, PostOrderRequest};
pub use payment::{CoinDeposit, PayRequest, PaymentReceipt};
pub use refunds::{RefundGranted, RefundProof, RefundProofs};
pub use scheduler::{PendingOperation, RequestScope};
pub use tips::{
    AuthorizeTipRequest, FundedReserve, Planchet, ReserveCredit, TipGranted, TipPickupReply,
    TipStatus,
};
pub use tracking::{ContractTransfer, DepositSum, TrackTransactionReply, TrackTransferReply};

#[cfg(test)]
pub(crate) mod testing {
    //! Backend fixtures for unit tests that never reach an exchange

    use super::{BackendSettings, InstanceConfig, MerchantBackend};
    use crate::db::{MemoryDb, MerchantDb};
    use crate::exchange::{ExchangeError, ExchangeRegistry, ExchangeTransport, RawReply};
    use crate::types::{InstanceSettings, RelativeTime};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    /// Transport for tests that must not talk to any exchange
    pub struct Offline;

    #[async_trait]
    impl ExchangeTransport for Offline {
        async fn get(&self, url: &str) -> Result<RawReply, ExchangeError> {
            Err(ExchangeError::Transport {
                url: url.to_string(),
                message: "offline".to_string(),
            })
        }

        async fn post(&self, url: &str, _body: &Value) -> Result<RawReply, ExchangeError> {
            Err(ExchangeError::Transport {
                url: url.to_string(),
                message: "offline".to_string(),
            })
        }
    }

    pub fn backend_with(db: Arc<MemoryDb>) -> MerchantBackend {
        let shared: Arc<dyn MerchantDb> = db;
        let exchanges = Arc::new(ExchangeRegistry::new(
            Arc::new(Offline),
            shared.clone(),
            Duration::from_secs(1),
            3,
        ));
        MerchantBackend::new(
            shared,
            exchanges,
            BackendSettings::new("EUR", "https://shop.example.com/"),
        )
    }

    pub fn backend() -> MerchantBackend {
        backend_with(Arc::new(MemoryDb::new()))
    }

    pub fn instance_config(id: &str) -> InstanceConfig {
        InstanceConfig {
            settings: InstanceSettings {
                id: id.to_string(),
                name: format!("Shop {}", id),
                address: serde_json::json!({"country": "DE"}),
                jurisdiction: serde_json::json!({"country": "DE"}),
                default_max_deposit_fee: "EUR:0.50".parse().unwrap(),
                default_max_wire_fee: "EUR:0.10".parse().unwrap(),
                default_wire_fee_amortization: 1,
                default_wire_transfer_delay: RelativeTime::from_secs(3600),
                default_pay_delay: RelativeTime::from_secs(3600),
            },
            payto_uris: vec!["payto://iban/DE89370400440532013000".to_string()],
        }
    }

    /// Backend with one active instance named `default`
    pub fn backend_with_instance() -> MerchantBackend {
        let backend = backend();
        backend
            .create_instance(&instance_config("default"))
            .unwrap();
        backend
    }
}
