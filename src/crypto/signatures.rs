//! Ed25519 signatures over purpose-tagged binary messages
//!
//! Every signed message starts with an 8-byte header: the total size of
//! the message (header included) and the purpose tag, both as 32-bit
//! big-endian integers. The body follows with every numeric field in
//! network byte order. A signature made for one purpose can therefore
//! never verify as another.

use crate::crypto::canonical::sha512;
use crate::types::{
    Amount, CoinPublicKey, EddsaPrivateKey, EddsaSignature, ExchangePublicKey, HashCode,
    MasterPublicKey, MerchantPublicKey, ReservePublicKey, Timestamp, WireTransferId,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

/// Purpose tags of the signed messages the backend creates or checks
pub mod purpose {
    pub const MASTER_SIGNING_KEY_VALIDITY: u32 = 1024;
    pub const MASTER_DENOMINATION_KEY_VALIDITY: u32 = 1025;
    pub const MASTER_WIRE_FEES: u32 = 1028;
    pub const EXCHANGE_CONFIRM_DEPOSIT: u32 = 1033;
    pub const EXCHANGE_CONFIRM_WIRE: u32 = 1036;
    pub const EXCHANGE_CONFIRM_REFUND: u32 = 1037;
    pub const EXCHANGE_CONFIRM_WIRE_DEPOSIT: u32 = 1038;
    pub const MERCHANT_CONTRACT: u32 = 1101;
    pub const MERCHANT_REFUND: u32 = 1102;
    pub const MERCHANT_TRACK_TRANSACTION: u32 = 1103;
    pub const MERCHANT_PAYMENT_OK: u32 = 1104;
    pub const WALLET_RESERVE_WITHDRAW: u32 = 1200;
    pub const WALLET_COIN_DEPOSIT: u32 = 1201;
    pub const WALLET_COIN_MELT: u32 = 1202;
}

/// Signature verification failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("signature with purpose {purpose} does not verify")]
    SignatureInvalid { purpose: u32 },
}

/// A purpose-tagged message under construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    purpose: u32,
    body: Vec<u8>,
}

impl SignedMessage {
    pub fn new(purpose: u32) -> Self {
        Self {
            purpose,
            body: Vec::with_capacity(256),
        }
    }

    pub fn purpose(&self) -> u32 {
        self.purpose
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.body.extend_from_slice(data);
        self
    }

    pub fn hash(self, hash: &HashCode) -> Self {
        self.bytes(hash.as_bytes())
    }

    pub fn amount(self, amount: &Amount) -> Self {
        self.bytes(&amount.to_nbo())
    }

    pub fn timestamp(self, timestamp: Timestamp) -> Self {
        self.bytes(&timestamp.to_nbo())
    }

    pub fn u64(self, value: u64) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    /// Full byte string that is signed: header then body
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = (8 + self.body.len()) as u32;
        let mut out = Vec::with_capacity(size as usize);
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(&self.purpose.to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// An Ed25519 key pair held in memory
#[derive(Clone)]
pub struct EddsaKeyPair {
    signing_key: SigningKey,
}

impl std::fmt::Debug for EddsaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EddsaKeyPair")
            .field("public", &crate::types::keys::encode_base32(&self.public_bytes()))
            .finish()
    }
}

impl EddsaKeyPair {
    pub fn from_private(private: &EddsaPrivateKey) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(private.as_bytes()),
        }
    }

    /// Generate a fresh key pair and return its private half as well
    pub fn generate() -> (EddsaPrivateKey, Self) {
        let private = EddsaPrivateKey::generate();
        let pair = Self::from_private(&private);
        (private, pair)
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn merchant_pub(&self) -> MerchantPublicKey {
        MerchantPublicKey::from_bytes(self.public_bytes())
    }

    pub fn reserve_pub(&self) -> ReservePublicKey {
        ReservePublicKey::from_bytes(self.public_bytes())
    }

    pub fn sign(&self, message: &SignedMessage) -> EddsaSignature {
        EddsaSignature::from_bytes(self.signing_key.sign(&message.to_bytes()).to_bytes())
    }
}

/// Verify `signature` over `message` with the raw public key `public`
pub fn verify(
    public: &[u8; 32],
    message: &SignedMessage,
    signature: &EddsaSignature,
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    key.verify(&message.to_bytes(), &sig)
        .map_err(|_| CryptoError::SignatureInvalid {
            purpose: message.purpose(),
        })
}

/// Fields shared by the wallet's deposit permission and the exchange's confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositTerms<'a> {
    pub h_contract_terms: &'a HashCode,
    pub h_wire: &'a HashCode,
    pub timestamp: Timestamp,
    pub refund_deadline: Timestamp,
    pub merchant_pub: &'a MerchantPublicKey,
    pub coin_pub: &'a CoinPublicKey,
}

/// What a wallet signs with the coin key to deposit it
pub fn deposit_request(
    terms: &DepositTerms<'_>,
    amount_with_fee: &Amount,
    deposit_fee: &Amount,
) -> SignedMessage {
    SignedMessage::new(purpose::WALLET_COIN_DEPOSIT)
        .hash(terms.h_contract_terms)
        .hash(terms.h_wire)
        .timestamp(terms.timestamp)
        .timestamp(terms.refund_deadline)
        .amount(amount_with_fee)
        .amount(deposit_fee)
        .bytes(terms.merchant_pub.as_bytes())
        .bytes(terms.coin_pub.as_bytes())
}

/// What the exchange signs to confirm a deposit
pub fn deposit_confirmation(terms: &DepositTerms<'_>, amount_without_fee: &Amount) -> SignedMessage {
    SignedMessage::new(purpose::EXCHANGE_CONFIRM_DEPOSIT)
        .hash(terms.h_contract_terms)
        .hash(terms.h_wire)
        .timestamp(terms.timestamp)
        .timestamp(terms.refund_deadline)
        .amount(amount_without_fee)
        .bytes(terms.coin_pub.as_bytes())
        .bytes(terms.merchant_pub.as_bytes())
}

/// Master-key statement of the wire fee for a method over `[start, end)`
pub fn wire_fee_statement(
    h_wire_method: &HashCode,
    start_date: Timestamp,
    end_date: Timestamp,
    wire_fee: &Amount,
    closing_fee: &Amount,
) -> SignedMessage {
    SignedMessage::new(purpose::MASTER_WIRE_FEES)
        .hash(h_wire_method)
        .timestamp(start_date)
        .timestamp(end_date)
        .amount(wire_fee)
        .amount(closing_fee)
}

/// Master-key certification of an online signing key
pub fn signing_key_validity(
    master_pub: &MasterPublicKey,
    start: Timestamp,
    expire_sign: Timestamp,
    expire_legal: Timestamp,
    signkey_pub: &ExchangePublicKey,
) -> SignedMessage {
    SignedMessage::new(purpose::MASTER_SIGNING_KEY_VALIDITY)
        .bytes(master_pub.as_bytes())
        .timestamp(start)
        .timestamp(expire_sign)
        .timestamp(expire_legal)
        .bytes(signkey_pub.as_bytes())
}

/// Validity window and fees of a denomination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenominationTerms<'a> {
    pub value: &'a Amount,
    pub fee_withdraw: &'a Amount,
    pub fee_deposit: &'a Amount,
    pub fee_refresh: &'a Amount,
    pub fee_refund: &'a Amount,
    pub stamp_start: Timestamp,
    pub stamp_expire_withdraw: Timestamp,
    pub stamp_expire_deposit: Timestamp,
    pub stamp_expire_legal: Timestamp,
}

/// Master-key certification of a denomination key
pub fn denomination_validity(
    master_pub: &MasterPublicKey,
    terms: &DenominationTerms<'_>,
    h_denom_pub: &HashCode,
) -> SignedMessage {
    SignedMessage::new(purpose::MASTER_DENOMINATION_KEY_VALIDITY)
        .bytes(master_pub.as_bytes())
        .timestamp(terms.stamp_start)
        .timestamp(terms.stamp_expire_withdraw)
        .timestamp(terms.stamp_expire_deposit)
        .timestamp(terms.stamp_expire_legal)
        .amount(terms.value)
        .amount(terms.fee_withdraw)
        .amount(terms.fee_deposit)
        .amount(terms.fee_refresh)
        .amount(terms.fee_refund)
        .hash(h_denom_pub)
}

/// Merchant signature binding it to a contract
pub fn contract_signature(h_contract_terms: &HashCode) -> SignedMessage {
    SignedMessage::new(purpose::MERCHANT_CONTRACT).hash(h_contract_terms)
}

/// Merchant signature confirming a completed payment
pub fn payment_ok(h_contract_terms: &HashCode) -> SignedMessage {
    SignedMessage::new(purpose::MERCHANT_PAYMENT_OK).hash(h_contract_terms)
}

/// Fields of a refund permission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundTerms<'a> {
    pub h_contract_terms: &'a HashCode,
    pub coin_pub: &'a CoinPublicKey,
    pub merchant_pub: &'a MerchantPublicKey,
    pub rtransaction_id: u64,
    pub refund_amount: &'a Amount,
    pub refund_fee: &'a Amount,
}

fn refund_body(purpose: u32, terms: &RefundTerms<'_>) -> SignedMessage {
    SignedMessage::new(purpose)
        .hash(terms.h_contract_terms)
        .bytes(terms.coin_pub.as_bytes())
        .bytes(terms.merchant_pub.as_bytes())
        .u64(terms.rtransaction_id)
        .amount(terms.refund_amount)
        .amount(terms.refund_fee)
}

/// Merchant permission to refund part of a coin
pub fn refund_permission(terms: &RefundTerms<'_>) -> SignedMessage {
    refund_body(purpose::MERCHANT_REFUND, terms)
}

/// Exchange confirmation that a refund was executed
pub fn refund_confirmation(terms: &RefundTerms<'_>) -> SignedMessage {
    refund_body(purpose::EXCHANGE_CONFIRM_REFUND, terms)
}

/// Merchant request to learn the transfer of one deposit
pub fn track_transaction_request(
    h_wire: &HashCode,
    h_contract_terms: &HashCode,
    coin_pub: &CoinPublicKey,
    merchant_pub: &MerchantPublicKey,
) -> SignedMessage {
    SignedMessage::new(purpose::MERCHANT_TRACK_TRANSACTION)
        .hash(h_wire)
        .hash(h_contract_terms)
        .bytes(coin_pub.as_bytes())
        .bytes(merchant_pub.as_bytes())
}

/// Exchange statement of which transfer carried a deposit
pub fn track_transaction_confirmation(
    h_wire: &HashCode,
    h_contract_terms: &HashCode,
    wtid: &WireTransferId,
    coin_pub: &CoinPublicKey,
    coin_contribution: &Amount,
    execution_time: Timestamp,
) -> SignedMessage {
    SignedMessage::new(purpose::EXCHANGE_CONFIRM_WIRE)
        .hash(h_wire)
        .hash(h_contract_terms)
        .bytes(wtid.as_bytes())
        .bytes(coin_pub.as_bytes())
        .amount(coin_contribution)
        .timestamp(execution_time)
}

/// One aggregated deposit as the exchange reports it in a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDetailTerms<'a> {
    pub h_contract_terms: &'a HashCode,
    pub coin_pub: &'a CoinPublicKey,
    pub amount_with_fee: &'a Amount,
    pub deposit_fee: &'a Amount,
}

/// Hash over the concatenated details of a transfer
pub fn hash_transfer_details<'a, I>(details: I) -> HashCode
where
    I: IntoIterator<Item = TransferDetailTerms<'a>>,
{
    let mut data = Vec::new();
    for detail in details {
        data.extend_from_slice(detail.h_contract_terms.as_bytes());
        data.extend_from_slice(detail.coin_pub.as_bytes());
        data.extend_from_slice(&detail.amount_with_fee.to_nbo());
        data.extend_from_slice(&detail.deposit_fee.to_nbo());
    }
    sha512(&data)
}

/// Exchange statement about the deposits aggregated into a transfer
pub fn track_transfer_confirmation(
    merchant_pub: &MerchantPublicKey,
    h_wire: &HashCode,
    execution_time: Timestamp,
    total_amount: &Amount,
    wire_fee: &Amount,
    h_details: &HashCode,
) -> SignedMessage {
    SignedMessage::new(purpose::EXCHANGE_CONFIRM_WIRE_DEPOSIT)
        .bytes(merchant_pub.as_bytes())
        .hash(h_wire)
        .timestamp(execution_time)
        .amount(total_amount)
        .amount(wire_fee)
        .hash(h_details)
}

/// Reserve signature authorizing a withdrawal of one coin
pub fn reserve_withdraw(
    reserve_pub: &ReservePublicKey,
    amount_with_fee: &Amount,
    withdraw_fee: &Amount,
    h_denom_pub: &HashCode,
    h_coin_envelope: &HashCode,
) -> SignedMessage {
    SignedMessage::new(purpose::WALLET_RESERVE_WITHDRAW)
        .bytes(reserve_pub.as_bytes())
        .amount(amount_with_fee)
        .amount(withdraw_fee)
        .hash(h_denom_pub)
        .hash(h_coin_envelope)
}

/// Coin signature authorizing a melt
pub fn coin_melt(
    rc: &HashCode,
    amount_with_fee: &Amount,
    melt_fee: &Amount,
    coin_pub: &CoinPublicKey,
) -> SignedMessage {
    SignedMessage::new(purpose::WALLET_COIN_MELT)
        .hash(rc)
        .amount(amount_with_fee)
        .amount(melt_fee)
        .bytes(coin_pub.as_bytes())
}
