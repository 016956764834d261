//! Shared fixtures for the integration tests
//!
//! [`ScriptedExchange`] answers the exchange endpoints in-process and
//! signs with real Ed25519 keys, so the backend's signature checks run
//! unchanged. Tests script transfers and double spends on it and inspect
//! what the backend sent.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taler_merchant_backend::core::{
    BackendSettings, ClaimedContract, CoinDeposit, InstanceConfig, LockRequest, MerchantBackend,
    PayRequest, PostOrderRequest,
};
use taler_merchant_backend::crypto::signatures::{self, DepositTerms, RefundTerms, TransferDetailTerms};
use taler_merchant_backend::crypto::{CoinHistoryEntry, EddsaKeyPair};
use taler_merchant_backend::db::{MemoryDb, MerchantDb, MerchantTx};
use taler_merchant_backend::exchange::wire::{
    AddIncomingRequest, DenominationEntry, DepositRequest, KeysResponse, RefundRequest,
    SignKeyEntry, TrackTransactionRequest, TrackTransferResponse, TransferDeposit, WireFeeEntry,
    WireResponse,
};
use taler_merchant_backend::exchange::{ExchangeError, ExchangeRegistry, ExchangeTransport, RawReply};
use taler_merchant_backend::types::{
    Amount, Blob, CoinPublicKey, ContractTerms, ExchangePublicKey, HashCode, InstanceSettings,
    MasterPublicKey, MerchantPublicKey, ProductDetails, RelativeTime, Stock, Timestamp,
    WireTransferId,
};

pub const EXCHANGE_URL: &str = "https://exchange.test/";
pub const INSTANCE: &str = "I1";
pub const WIRE_METHOD: &str = "iban";

const DAY: u64 = 24 * 60 * 60;

pub fn eur(value: &str) -> Amount {
    format!("EUR:{}", value).parse().unwrap()
}

pub fn days_from_now(days: i64) -> Timestamp {
    let now = Timestamp::now().as_secs() as i64;
    Timestamp::from_secs((now + days * DAY as i64).max(0) as u64)
}

/// A wallet coin: its key pair and denomination
pub struct Coin {
    pub keypair: EddsaKeyPair,
    pub coin_pub: CoinPublicKey,
    pub denom: DenominationEntry,
}

impl Coin {
    pub fn new(denom: &DenominationEntry) -> Self {
        let (_, keypair) = EddsaKeyPair::generate();
        let coin_pub = CoinPublicKey::from_bytes(keypair.public_bytes());
        Self {
            keypair,
            coin_pub,
            denom: denom.clone(),
        }
    }

    /// Deposit permission for `contribution` of this coin towards `contract`
    pub fn deposit(&self, contract: &ClaimedContract, contribution: &Amount) -> CoinDeposit {
        let terms = ContractTerms::from_json(&contract.contract_terms).unwrap();
        let deposit_terms = DepositTerms {
            h_contract_terms: &contract.h_contract_terms,
            h_wire: &terms.h_wire,
            timestamp: terms.timestamp,
            refund_deadline: terms.refund_deadline,
            merchant_pub: &terms.merchant_pub,
            coin_pub: &self.coin_pub,
        };
        let message = signatures::deposit_request(&deposit_terms, contribution, &self.denom.fee_deposit);
        CoinDeposit {
            coin_pub: self.coin_pub,
            denom_pub: self.denom.denom_pub.clone(),
            ub_sig: Blob(vec![0xAB; 64]),
            exchange_url: EXCHANGE_URL.to_string(),
            contribution: contribution.clone(),
            coin_sig: self.keypair.sign(&message),
        }
    }

    /// History entry of an earlier, genuine deposit of `amount` at another merchant
    pub fn prior_deposit(&self, amount: &Amount) -> CoinHistoryEntry {
        let h_contract_terms = HashCode::random();
        let h_wire = HashCode::random();
        let merchant_pub = MerchantPublicKey::random();
        let timestamp = days_from_now(-1);
        let terms = DepositTerms {
            h_contract_terms: &h_contract_terms,
            h_wire: &h_wire,
            timestamp,
            refund_deadline: timestamp,
            merchant_pub: &merchant_pub,
            coin_pub: &self.coin_pub,
        };
        let message = signatures::deposit_request(&terms, amount, &self.denom.fee_deposit);
        CoinHistoryEntry::Deposit {
            amount: amount.clone(),
            deposit_fee: self.denom.fee_deposit.clone(),
            timestamp,
            refund_deadline: timestamp,
            merchant_pub,
            h_contract_terms,
            h_wire,
            coin_sig: self.keypair.sign(&message),
        }
    }
}

struct ScriptedTransfer {
    merchant_pub: MerchantPublicKey,
    h_wire: HashCode,
    execution_time: Timestamp,
    wire_fee: Amount,
    deposits: Vec<TransferDeposit>,
}

#[derive(Default)]
struct ExchangeState {
    calls: Vec<String>,
    deposits: Vec<DepositRequest>,
    double_spent: HashMap<CoinPublicKey, Vec<CoinHistoryEntry>>,
    transfers: Vec<(WireTransferId, ScriptedTransfer)>,
    refunds: Vec<RefundRequest>,
    incoming: Vec<AddIncomingRequest>,
    /// Answer delay per endpoint path; `None` never answers
    delays: HashMap<&'static str, Option<Duration>>,
}

/// An exchange living in the test process
pub struct ScriptedExchange {
    master: EddsaKeyPair,
    signer: EddsaKeyPair,
    keys: KeysResponse,
    wire: WireResponse,
    state: Mutex<ExchangeState>,
}

impl ScriptedExchange {
    /// Exchange offering EUR:1 and EUR:5 coins and charging `wire_fee` for `iban`
    pub fn new(wire_fee: &str) -> Self {
        let (_, master) = EddsaKeyPair::generate();
        let (_, signer) = EddsaKeyPair::generate();
        let master_pub = MasterPublicKey::from_bytes(master.public_bytes());
        let signer_pub = ExchangePublicKey::from_bytes(signer.public_bytes());
        let start = days_from_now(-1);
        let end = days_from_now(365);

        let signkey = SignKeyEntry {
            key: signer_pub,
            stamp_start: start,
            stamp_expire: end,
            stamp_end: end,
            master_sig: master.sign(&signatures::signing_key_validity(&master_pub, start, end, end, &signer_pub)),
        };
        let denoms = ["1", "5"]
            .iter()
            .map(|value| Self::denomination(&master, &master_pub, eur(value), start, end))
            .collect();

        let closing_fee = eur("0");
        let fee = WireFeeEntry {
            wire_fee: eur(wire_fee),
            closing_fee: closing_fee.clone(),
            start_date: start,
            end_date: end,
            sig: master.sign(&signatures::wire_fee_statement(
                &taler_merchant_backend::crypto::hash_wire_method(WIRE_METHOD),
                start,
                end,
                &eur(wire_fee),
                &closing_fee,
            )),
        };

        Self {
            keys: KeysResponse {
                master_public_key: master_pub,
                signkeys: vec![signkey],
                denoms,
                list_issue_date: start,
            },
            wire: WireResponse {
                fees: [(WIRE_METHOD.to_string(), vec![fee])].into_iter().collect(),
            },
            master,
            signer,
            state: Mutex::new(ExchangeState::default()),
        }
    }

    fn denomination(
        master: &EddsaKeyPair,
        master_pub: &MasterPublicKey,
        value: Amount,
        start: Timestamp,
        end: Timestamp,
    ) -> DenominationEntry {
        let mut denom = DenominationEntry {
            denom_pub: Blob(EddsaKeyPair::generate().1.public_bytes().to_vec()),
            value,
            fee_withdraw: eur("0.01"),
            fee_deposit: eur("0.01"),
            fee_refresh: eur("0.01"),
            fee_refund: eur("0.01"),
            stamp_start: start,
            stamp_expire_withdraw: end,
            stamp_expire_deposit: end,
            stamp_expire_legal: end,
            master_sig: taler_merchant_backend::types::EddsaSignature::from_bytes([0; 64]),
        };
        let terms = signatures::DenominationTerms {
            value: &denom.value,
            fee_withdraw: &denom.fee_withdraw,
            fee_deposit: &denom.fee_deposit,
            fee_refresh: &denom.fee_refresh,
            fee_refund: &denom.fee_refund,
            stamp_start: denom.stamp_start,
            stamp_expire_withdraw: denom.stamp_expire_withdraw,
            stamp_expire_deposit: denom.stamp_expire_deposit,
            stamp_expire_legal: denom.stamp_expire_legal,
        };
        denom.master_sig = master.sign(&signatures::denomination_validity(master_pub, &terms, &denom.denom_pub_hash()));
        denom
    }

    pub fn master_pub(&self) -> MasterPublicKey {
        self.keys.master_public_key
    }

    fn signer_pub(&self) -> ExchangePublicKey {
        ExchangePublicKey::from_bytes(self.signer.public_bytes())
    }

    /// Denomination worth `value`
    pub fn denom(&self, value: &str) -> DenominationEntry {
        let value = eur(value);
        self.keys
            .denoms
            .iter()
            .find(|d| d.value == value)
            .cloned()
            .unwrap()
    }

    /// Refuse deposits of `coin` with `history` as proof
    pub fn double_spend(&self, coin: &Coin, history: Vec<CoinHistoryEntry>) {
        self.state.lock().double_spent.insert(coin.coin_pub, history);
    }

    /// Announce a wire transfer aggregating `deposits`
    pub fn add_transfer(
        &self,
        wtid: WireTransferId,
        merchant_pub: MerchantPublicKey,
        h_wire: HashCode,
        wire_fee: Amount,
        deposits: Vec<TransferDeposit>,
    ) {
        self.state.lock().transfers.push((
            wtid,
            ScriptedTransfer {
                merchant_pub,
                h_wire,
                execution_time: Timestamp::now(),
                wire_fee,
                deposits,
            },
        ));
    }

    /// Hold back answers from `endpoint` for `delay`
    pub fn delay(&self, endpoint: &'static str, delay: Duration) {
        self.state.lock().delays.insert(endpoint, Some(delay));
    }

    /// Never answer requests to `endpoint`
    pub fn stall(&self, endpoint: &'static str) {
        self.state.lock().delays.insert(endpoint, None);
    }

    /// Wait as scripted for `path`, then let other tasks run
    async fn answer_after_delay(&self, path: &str) {
        let delay = self
            .state
            .lock()
            .delays
            .iter()
            .find(|(endpoint, _)| path.starts_with(**endpoint))
            .map(|(_, delay)| *delay);
        match delay {
            Some(Some(delay)) => tokio::time::sleep(delay).await,
            Some(None) => std::future::pending::<()>().await,
            None => {}
        }
        tokio::task::yield_now().await;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn deposits(&self) -> Vec<DepositRequest> {
        self.state.lock().deposits.clone()
    }

    pub fn refunds(&self) -> Vec<RefundRequest> {
        self.state.lock().refunds.clone()
    }

    pub fn incoming(&self) -> Vec<AddIncomingRequest> {
        self.state.lock().incoming.clone()
    }

    fn reply(status: u16, body: Value) -> Result<RawReply, ExchangeError> {
        Ok(RawReply { status, body })
    }

    fn deposit(&self, body: &Value) -> Result<RawReply, ExchangeError> {
        let Ok(request) = serde_json::from_value::<DepositRequest>(body.clone()) else {
            return Self::reply(400, json!({"error": "malformed deposit"}));
        };
        let mut state = self.state.lock();
        if let Some(history) = state.double_spent.get(&request.coin_pub) {
            return Self::reply(403, json!({ "history": history }));
        }
        let Some(denom) = self.keys.denoms.iter().find(|d| d.denom_pub == request.denom_pub) else {
            return Self::reply(404, json!({"error": "unknown denomination"}));
        };
        let amount_without_fee = request.contribution.checked_sub(&denom.fee_deposit).unwrap();
        let terms = DepositTerms {
            h_contract_terms: &request.h_contract_terms,
            h_wire: &request.h_wire,
            timestamp: request.timestamp,
            refund_deadline: request.refund_deadline,
            merchant_pub: &request.merchant_pub,
            coin_pub: &request.coin_pub,
        };
        let sig = self.signer.sign(&signatures::deposit_confirmation(&terms, &amount_without_fee));
        state.deposits.push(request);
        Self::reply(200, json!({ "sig": sig, "pub": self.signer_pub() }))
    }

    fn track_transaction(&self, body: &Value) -> Result<RawReply, ExchangeError> {
        let Ok(request) = serde_json::from_value::<TrackTransactionRequest>(body.clone()) else {
            return Self::reply(400, json!({"error": "malformed tracking request"}));
        };
        let state = self.state.lock();
        for (wtid, transfer) in &state.transfers {
            let Some(deposit) = transfer
                .deposits
                .iter()
                .find(|d| d.coin_pub == request.coin_pub && d.h_contract_terms == request.h_contract_terms)
            else {
                continue;
            };
            let contribution = deposit.amount_with_fee.checked_sub(&deposit.deposit_fee).unwrap();
            let sig = self.signer.sign(&signatures::track_transaction_confirmation(
                &request.h_wire,
                &request.h_contract_terms,
                wtid,
                &request.coin_pub,
                &contribution,
                transfer.execution_time,
            ));
            return Self::reply(
                200,
                json!({
                    "wtid": wtid,
                    "execution_time": transfer.execution_time,
                    "coin_contribution": contribution,
                    "exchange_sig": sig,
                    "exchange_pub": self.signer_pub(),
                }),
            );
        }
        Self::reply(202, json!({ "execution_time": days_from_now(1) }))
    }

    fn track_transfer(&self, wtid: &str) -> Result<RawReply, ExchangeError> {
        let Ok(wtid) = wtid.parse::<WireTransferId>() else {
            return Self::reply(400, json!({"error": "malformed wtid"}));
        };
        let state = self.state.lock();
        let Some((_, transfer)) = state.transfers.iter().find(|(id, _)| *id == wtid) else {
            return Self::reply(404, json!({"error": "unknown transfer"}));
        };
        let credited = Amount::sum(
            "EUR",
            transfer
                .deposits
                .iter()
                .map(|d| d.amount_with_fee.checked_sub(&d.deposit_fee).unwrap())
                .collect::<Vec<_>>()
                .iter(),
        )
        .unwrap();
        let total_amount = credited.saturating_sub(&transfer.wire_fee).unwrap();
        let h_details = signatures::hash_transfer_details(transfer.deposits.iter().map(|d| TransferDetailTerms {
            h_contract_terms: &d.h_contract_terms,
            coin_pub: &d.coin_pub,
            amount_with_fee: &d.amount_with_fee,
            deposit_fee: &d.deposit_fee,
        }));
        let sig = self.signer.sign(&signatures::track_transfer_confirmation(
            &transfer.merchant_pub,
            &transfer.h_wire,
            transfer.execution_time,
            &total_amount,
            &transfer.wire_fee,
            &h_details,
        ));
        let response = TrackTransferResponse {
            wtid,
            total_amount,
            wire_fee: transfer.wire_fee.clone(),
            merchant_pub: transfer.merchant_pub,
            h_wire: transfer.h_wire,
            execution_time: transfer.execution_time,
            deposits: transfer.deposits.clone(),
            exchange_sig: sig,
            exchange_pub: self.signer_pub(),
        };
        Self::reply(200, serde_json::to_value(response).unwrap())
    }

    fn refund(&self, body: &Value) -> Result<RawReply, ExchangeError> {
        let Ok(request) = serde_json::from_value::<RefundRequest>(body.clone()) else {
            return Self::reply(400, json!({"error": "malformed refund"}));
        };
        let terms = RefundTerms {
            h_contract_terms: &request.h_contract_terms,
            coin_pub: &request.coin_pub,
            merchant_pub: &request.merchant_pub,
            rtransaction_id: request.rtransaction_id,
            refund_amount: &request.refund_amount,
            refund_fee: &request.refund_fee,
        };
        let sig = self.signer.sign(&signatures::refund_confirmation(&terms));
        self.state.lock().refunds.push(request);
        Self::reply(200, json!({ "sig": sig, "pub": self.signer_pub() }))
    }

    fn add_incoming(&self, body: &Value) -> Result<RawReply, ExchangeError> {
        let Ok(request) = serde_json::from_value::<AddIncomingRequest>(body.clone()) else {
            return Self::reply(400, json!({"error": "malformed credit"}));
        };
        self.state.lock().incoming.push(request);
        Self::reply(200, json!({}))
    }
}

#[async_trait]
impl ExchangeTransport for ScriptedExchange {
    async fn get(&self, url: &str) -> Result<RawReply, ExchangeError> {
        let path = url.strip_prefix(EXCHANGE_URL).unwrap_or(url);
        self.state.lock().calls.push(format!("GET {}", path));
        self.answer_after_delay(path).await;
        match path {
            "keys" => Self::reply(200, serde_json::to_value(&self.keys).unwrap()),
            "wire" => Self::reply(200, serde_json::to_value(&self.wire).unwrap()),
            _ => match path.strip_prefix("track/transfer?wtid=") {
                Some(wtid) => self.track_transfer(wtid),
                None => Self::reply(404, json!({"error": "not found"})),
            },
        }
    }

    async fn post(&self, url: &str, body: &Value) -> Result<RawReply, ExchangeError> {
        let path = url.strip_prefix(EXCHANGE_URL).unwrap_or(url);
        self.state.lock().calls.push(format!("POST {}", path));
        self.answer_after_delay(path).await;
        match path {
            "deposit" => self.deposit(body),
            "track/transaction" => self.track_transaction(body),
            "refund" => self.refund(body),
            "admin/add-incoming" => self.add_incoming(body),
            _ => Self::reply(404, json!({"error": "not found"})),
        }
    }
}

pub fn instance_config(id: &str) -> InstanceConfig {
    InstanceConfig {
        settings: InstanceSettings {
            id: id.to_string(),
            name: format!("Shop {}", id),
            address: json!({"country": "DE"}),
            jurisdiction: json!({"country": "DE"}),
            default_max_deposit_fee: eur("0.50"),
            default_max_wire_fee: eur("0.10"),
            default_wire_fee_amortization: 1,
            default_wire_transfer_delay: RelativeTime::from_secs(DAY),
            default_pay_delay: RelativeTime::from_secs(DAY),
        },
        payto_uris: vec!["payto://iban/DE89370400440532013000".to_string()],
    }
}

pub fn product(price: &str, stocked: u64) -> ProductDetails {
    ProductDetails {
        description: "widget".to_string(),
        description_i18n: Default::default(),
        unit: "piece".to_string(),
        price: eur(price),
        taxes: vec![],
        image: String::new(),
        address: Value::Null,
        total_stocked: Stock::Units(stocked),
        total_sold: 0,
        total_lost: 0,
        next_restock: None,
    }
}

/// Backend with instance `I1` and a ready exchange
pub struct Shop {
    pub backend: MerchantBackend,
    pub db: Arc<MemoryDb>,
    pub exchange: Arc<ScriptedExchange>,
}

impl Shop {
    pub async fn open() -> Self {
        Self::open_with_wire_fee("0.01").await
    }

    pub async fn open_with_wire_fee(wire_fee: &str) -> Self {
        let db = Arc::new(MemoryDb::new());
        let exchange = Arc::new(ScriptedExchange::new(wire_fee));
        let shared_db: Arc<dyn MerchantDb> = db.clone();
        let transport: Arc<dyn ExchangeTransport> = exchange.clone();
        let registry = Arc::new(ExchangeRegistry::new(transport, shared_db.clone(), Duration::from_secs(2), 3));
        let handle = registry.add_trusted(EXCHANGE_URL, exchange.master_pub());
        registry.refresh(&handle).await.unwrap();

        let backend = MerchantBackend::new(
            shared_db,
            registry,
            BackendSettings::new("EUR", "https://shop.test/"),
        );
        backend.create_instance(&instance_config(INSTANCE)).unwrap();
        Self { backend, db, exchange }
    }

    /// Run `inspect` in a read-only transaction
    pub fn read<T>(&self, inspect: impl FnOnce(&mut dyn MerchantTx) -> T) -> T {
        let mut tx = self.db.begin("inspect").unwrap();
        let value = inspect(tx.as_mut());
        tx.rollback();
        value
    }

    pub fn merchant_pub(&self) -> MerchantPublicKey {
        self.backend.get_instance(INSTANCE).unwrap().merchant_pub
    }

    /// Create and claim an order for `amount`, optionally buying products
    pub fn claimed_order(&self, amount: &str, products: &[(&str, u64)]) -> ClaimedContract {
        let request = PostOrderRequest {
            order: json!({
                "amount": amount,
                "summary": "test order",
                "fulfillment_url": "https://shop.test/article",
                "refund_deadline": days_from_now(7),
            }),
            inventory_products: products
                .iter()
                .map(|(product_id, quantity)| LockRequest {
                    product_id: product_id.to_string(),
                    quantity: *quantity,
                })
                .collect(),
            lock_uuids: vec![],
        };
        let order_id = self.backend.create_order(INSTANCE, &request).unwrap();
        self.backend
            .claim_order(INSTANCE, &order_id, Some("wallet-nonce"))
            .unwrap()
    }

    pub fn pay_request(contract: &ClaimedContract, coins: Vec<CoinDeposit>) -> PayRequest {
        PayRequest {
            order_id: order_id(contract),
            merchant_pub: None,
            session_id: None,
            coins,
        }
    }
}

pub fn order_id(contract: &ClaimedContract) -> String {
    contract.contract_terms["order_id"].as_str().unwrap().to_string()
}
