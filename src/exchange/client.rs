//! HTTP access to one exchange
//!
//! [`ExchangeTransport`] is the seam between the backend and the network:
//! it moves raw JSON and reports the HTTP status. [`HttpTransport`] is the
//! `reqwest` implementation used in production; tests substitute a
//! scripted exchange. [`ExchangeClient`] sits on top and turns raw
//! replies into the typed messages of [`super::wire`].

use super::wire::{
    AddIncomingRequest, DepositConfirmation, DepositRequest, DoubleSpendReply, KeysResponse,
    RefundConfirmation, RefundRequest, TrackTransactionOutcome, TrackTransactionPending,
    TrackTransactionRequest, TrackTransactionResponse, TrackTransferResponse, WireResponse,
};
use crate::types::{MerchantError, WireTransferId};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failures talking to an exchange
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// The request never produced a reply
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The exchange answered with a status the operation does not expect
    #[error("{url} answered with HTTP status {status}")]
    Http { url: String, status: u16, body: Value },

    /// The reply body does not have the expected shape
    #[error("malformed reply from {url}: {message}")]
    Protocol { url: String, message: String, body: Value },

    /// A signature in the reply did not verify
    #[error("invalid {what} signature from {url}")]
    BadSignature { url: String, what: String, body: Value },

    /// `/keys` is signed by a master key other than the trusted one
    #[error("{url} presented an untrusted master key")]
    MasterKeyMismatch { url: String },
}

impl From<ExchangeError> for MerchantError {
    fn from(error: ExchangeError) -> Self {
        match error {
            ExchangeError::Timeout { url } => MerchantError::ExchangeTimeout { exchange_url: url },
            ExchangeError::Transport { url, message } => MerchantError::ExchangeFailed {
                exchange_url: url,
                http_status: 0,
                exchange_reply: serde_json::json!({ "error": message }),
            },
            ExchangeError::Http { url, status, body } => MerchantError::ExchangeFailed {
                exchange_url: url,
                http_status: status,
                exchange_reply: body,
            },
            ExchangeError::Protocol { url, body, .. } => MerchantError::ExchangeFailed {
                exchange_url: url,
                http_status: 200,
                exchange_reply: body,
            },
            ExchangeError::BadSignature { url, what, body } => {
                MerchantError::ExchangeSignatureInvalid {
                    exchange_url: url,
                    what,
                    exchange_reply: body,
                }
            }
            ExchangeError::MasterKeyMismatch { url } => MerchantError::ExchangeUnknown { exchange_url: url },
        }
    }
}

/// Status and body of an exchange reply
#[derive(Debug, Clone, PartialEq)]
pub struct RawReply {
    pub status: u16,
    pub body: Value,
}

/// Moves JSON between the backend and an exchange
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<RawReply, ExchangeError>;
    async fn post(&self, url: &str, body: &Value) -> Result<RawReply, ExchangeError>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport whose requests give up after `timeout`
    ///
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ExchangeError::Transport {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    async fn finish(
        url: &str,
        result: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<RawReply, ExchangeError> {
        let response = result.map_err(|e| map_reqwest(url, e))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| map_reqwest(url, e))?;
        // Exchanges answer errors with JSON too, but an empty body is legal
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Ok(RawReply { status, body })
    }
}

fn map_reqwest(url: &str, error: reqwest::Error) -> ExchangeError {
    if error.is_timeout() {
        ExchangeError::Timeout {
            url: url.to_string(),
        }
    } else {
        ExchangeError::Transport {
            url: url.to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl ExchangeTransport for HttpTransport {
    async fn get(&self, url: &str) -> Result<RawReply, ExchangeError> {
        let result = self.client.get(url).send().await;
        Self::finish(url, result).await
    }

    async fn post(&self, url: &str, body: &Value) -> Result<RawReply, ExchangeError> {
        let result = self.client.post(url).json(body).send().await;
        Self::finish(url, result).await
    }
}

/// A decoded reply together with the body it was decoded from
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub body: T,
    pub raw: Value,
}

/// How an exchange answered a deposit
#[derive(Debug, Clone, PartialEq)]
pub enum DepositOutcome {
    Confirmed(Decoded<DepositConfirmation>),
    /// 403 with the coin history the exchange claims proves a double spend
    DoubleSpent(Decoded<DoubleSpendReply>),
    /// Any other refusal; the reply is kept as evidence
    Rejected { status: u16, reply: Value },
}

/// Typed operations against one exchange base URL
#[derive(Clone)]
pub struct ExchangeClient {
    base_url: String,
    transport: Arc<dyn ExchangeTransport>,
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ExchangeClient {
    /// Create a client for `base_url`, which must end with `/`
    pub fn new(base_url: impl Into<String>, transport: Arc<dyn ExchangeTransport>) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn decode<T: DeserializeOwned>(&self, url: &str, raw: Value) -> Result<Decoded<T>, ExchangeError> {
        match serde_json::from_value(raw.clone()) {
            Ok(body) => Ok(Decoded { body, raw }),
            Err(e) => Err(ExchangeError::Protocol {
                url: url.to_string(),
                message: e.to_string(),
                body: raw,
            }),
        }
    }

    fn encode<T: Serialize>(&self, url: &str, request: &T) -> Result<Value, ExchangeError> {
        serde_json::to_value(request).map_err(|e| ExchangeError::Protocol {
            url: url.to_string(),
            message: e.to_string(),
            body: Value::Null,
        })
    }

    fn expect_ok<T: DeserializeOwned>(&self, url: &str, reply: RawReply) -> Result<Decoded<T>, ExchangeError> {
        if reply.status != 200 {
            return Err(ExchangeError::Http {
                url: url.to_string(),
                status: reply.status,
                body: reply.body,
            });
        }
        self.decode(url, reply.body)
    }

    /// Download the key set
    pub async fn keys(&self) -> Result<Decoded<KeysResponse>, ExchangeError> {
        let url = self.endpoint("keys");
        let reply = self.transport.get(&url).await?;
        self.expect_ok(&url, reply)
    }

    /// Download the wire fee schedule
    pub async fn wire(&self) -> Result<Decoded<WireResponse>, ExchangeError> {
        let url = self.endpoint("wire");
        let reply = self.transport.get(&url).await?;
        self.expect_ok(&url, reply)
    }

    /// Deposit one coin
    ///
    /// A refusal is not an error: the caller decides what a 403 proves.
    pub async fn deposit(&self, request: &DepositRequest) -> Result<DepositOutcome, ExchangeError> {
        let url = self.endpoint("deposit");
        let body = self.encode(&url, request)?;
        let reply = self.transport.post(&url, &body).await?;
        debug!(exchange = %self.base_url, status = reply.status, coin = %request.coin_pub, "Deposit answered");
        match reply.status {
            200 => Ok(DepositOutcome::Confirmed(self.decode(&url, reply.body)?)),
            403 => match self.decode::<DoubleSpendReply>(&url, reply.body.clone()) {
                Ok(decoded) => Ok(DepositOutcome::DoubleSpent(decoded)),
                Err(_) => Ok(DepositOutcome::Rejected {
                    status: 403,
                    reply: reply.body,
                }),
            },
            status if (400..500).contains(&status) => Ok(DepositOutcome::Rejected {
                status,
                reply: reply.body,
            }),
            status => Err(ExchangeError::Http {
                url,
                status,
                body: reply.body,
            }),
        }
    }

    /// Ask which wire transfer carried a deposit
    pub async fn track_transaction(
        &self,
        request: &TrackTransactionRequest,
    ) -> Result<(TrackTransactionOutcome, Value), ExchangeError> {
        let url = self.endpoint("track/transaction");
        let body = self.encode(&url, request)?;
        let reply = self.transport.post(&url, &body).await?;
        match reply.status {
            200 => {
                let decoded: Decoded<TrackTransactionResponse> = self.decode(&url, reply.body)?;
                Ok((TrackTransactionOutcome::Wired(decoded.body), decoded.raw))
            }
            202 => {
                let decoded: Decoded<TrackTransactionPending> = self.decode(&url, reply.body)?;
                Ok((
                    TrackTransactionOutcome::Pending {
                        execution_time: decoded.body.execution_time,
                    },
                    decoded.raw,
                ))
            }
            status => Err(ExchangeError::Http {
                url,
                status,
                body: reply.body,
            }),
        }
    }

    /// Ask which deposits a wire transfer aggregated
    pub async fn track_transfer(
        &self,
        wtid: &WireTransferId,
    ) -> Result<Decoded<TrackTransferResponse>, ExchangeError> {
        let url = self.endpoint(&format!("track/transfer?wtid={}", wtid));
        let reply = self.transport.get(&url).await?;
        self.expect_ok(&url, reply)
    }

    /// Execute a refund permission
    pub async fn refund(&self, request: &RefundRequest) -> Result<Decoded<RefundConfirmation>, ExchangeError> {
        let url = self.endpoint("refund");
        let body = self.encode(&url, request)?;
        let reply = self.transport.post(&url, &body).await?;
        self.expect_ok(&url, reply)
    }

    /// Credit a reserve through the exchange's administrative interface
    pub async fn add_incoming(&self, request: &AddIncomingRequest) -> Result<(), ExchangeError> {
        let url = self.endpoint("admin/add-incoming");
        let body = self.encode(&url, request)?;
        let reply = self.transport.post(&url, &body).await?;
        if reply.status == 200 {
            Ok(())
        } else {
            Err(ExchangeError::Http {
                url,
                status: reply.status,
                body: reply.body,
            })
        }
    }
}
