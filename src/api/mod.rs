//! Typed operations and their replies
//!
//! A [`Request`] names one backend operation and carries its arguments.
//! [`dispatch`] runs it against a [`MerchantBackend`] and turns the
//! outcome into a [`Reply`]: a status code plus a JSON body, the error
//! body being [`MerchantError::to_reply`].

use crate::core::{AuthorizeTipRequest, InstanceConfig, MerchantBackend, PayRequest, Planchet, PostOrderRequest};
use crate::types::{
    Amount, EddsaPrivateKey, HashCode, HttpStatus, MerchantError, OrderFilter, ProductDetails,
    RelativeTime, TipId, Timestamp, WireTransferId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

/// One operation, tagged by `op`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateInstance {
        config: InstanceConfig,
    },
    UpdateInstance {
        instance: String,
        config: InstanceConfig,
    },
    DeleteInstance {
        instance: String,
        #[serde(default)]
        purge: bool,
    },
    GetInstance {
        instance: String,
    },
    ListInstances,
    DeactivateAccount {
        instance: String,
        h_wire: HashCode,
    },

    CreateProduct {
        instance: String,
        product_id: String,
        details: ProductDetails,
    },
    UpdateProduct {
        instance: String,
        product_id: String,
        details: ProductDetails,
    },
    GetProduct {
        instance: String,
        product_id: String,
    },
    ListProducts {
        instance: String,
    },
    DeleteProduct {
        instance: String,
        product_id: String,
    },
    LockProduct {
        instance: String,
        product_id: String,
        uuid: Uuid,
        quantity: u64,
        /// Seconds the lock is held
        duration: RelativeTime,
    },

    CreateOrder {
        instance: String,
        order: PostOrderRequest,
    },
    ClaimOrder {
        instance: String,
        order_id: String,
        #[serde(default)]
        nonce: Option<String>,
    },
    DeleteOrder {
        instance: String,
        order_id: String,
    },
    ListOrders {
        instance: String,
        #[serde(default)]
        filter: OrderFilter,
    },
    OrderStatus {
        instance: String,
        order_id: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    LookupSession {
        instance: String,
        fulfillment_url: String,
        session_id: String,
    },

    Pay {
        instance: String,
        payment: PayRequest,
    },
    TrackTransfer {
        instance: String,
        exchange_url: String,
        wtid: WireTransferId,
        wire_method: String,
    },
    TrackTransaction {
        instance: String,
        order_id: String,
    },

    IncreaseRefund {
        instance: String,
        order_id: String,
        refund: Amount,
        reason: String,
    },
    LookupRefunds {
        instance: String,
        order_id: String,
    },
    FetchRefundProofs {
        instance: String,
        order_id: String,
    },

    EnableReserve {
        reserve_priv: EddsaPrivateKey,
        credit_uuid: Uuid,
        amount: Amount,
        expiration: Timestamp,
    },
    FundReserve {
        exchange_url: String,
        amount: Amount,
        expiration: Timestamp,
        sender_account_url: String,
    },
    AuthorizeTip {
        tip: AuthorizeTipRequest,
    },
    PickupTip {
        tip_id: TipId,
        planchets: Vec<Planchet>,
    },
    QueryTip {
        tip_id: TipId,
    },
    ListReserves,
}

impl Request {
    /// Operation name, as written in the `op` tag
    pub fn name(&self) -> &'static str {
        match self {
            Request::CreateInstance { .. } => "create_instance",
            Request::UpdateInstance { .. } => "update_instance",
            Request::DeleteInstance { .. } => "delete_instance",
            Request::GetInstance { .. } => "get_instance",
            Request::ListInstances => "list_instances",
            Request::DeactivateAccount { .. } => "deactivate_account",
            Request::CreateProduct { .. } => "create_product",
            Request::UpdateProduct { .. } => "update_product",
            Request::GetProduct { .. } => "get_product",
            Request::ListProducts { .. } => "list_products",
            Request::DeleteProduct { .. } => "delete_product",
            Request::LockProduct { .. } => "lock_product",
            Request::CreateOrder { .. } => "create_order",
            Request::ClaimOrder { .. } => "claim_order",
            Request::DeleteOrder { .. } => "delete_order",
            Request::ListOrders { .. } => "list_orders",
            Request::OrderStatus { .. } => "order_status",
            Request::LookupSession { .. } => "lookup_session",
            Request::Pay { .. } => "pay",
            Request::TrackTransfer { .. } => "track_transfer",
            Request::TrackTransaction { .. } => "track_transaction",
            Request::IncreaseRefund { .. } => "increase_refund",
            Request::LookupRefunds { .. } => "lookup_refunds",
            Request::FetchRefundProofs { .. } => "fetch_refund_proofs",
            Request::EnableReserve { .. } => "enable_reserve",
            Request::FundReserve { .. } => "fund_reserve",
            Request::AuthorizeTip { .. } => "authorize_tip",
            Request::PickupTip { .. } => "pickup_tip",
            Request::QueryTip { .. } => "query_tip",
            Request::ListReserves => "list_reserves",
        }
    }
}

/// Outcome of one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    pub fn ok<T: Serialize>(body: &T) -> Self {
        Self::with_status(HttpStatus::Ok.as_u16(), body)
    }

    pub fn no_content() -> Self {
        Reply {
            status: HttpStatus::NoContent.as_u16(),
            body: Value::Null,
        }
    }

    pub fn error(error: &MerchantError) -> Self {
        Reply {
            status: error.http_status().as_u16(),
            body: error.to_reply(),
        }
    }

    fn with_status<T: Serialize>(status: u16, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Reply { status, body },
            Err(e) => Reply::error(&MerchantError::Internal {
                message: format!("cannot encode reply: {}", e),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn respond<T: Serialize>(result: Result<T, MerchantError>) -> Reply {
    match result {
        Ok(body) => Reply::ok(&body),
        Err(e) => Reply::error(&e),
    }
}

fn respond_empty(result: Result<(), MerchantError>) -> Reply {
    match result {
        Ok(()) => Reply::no_content(),
        Err(e) => Reply::error(&e),
    }
}

/// Run `request` against `backend`
///
/// Never fails: every error becomes a reply carrying its status and
/// error code.
pub async fn dispatch(backend: &MerchantBackend, request: Request) -> Reply {
    let op = request.name();
    debug!(op, "Dispatching request");
    let reply = match request {
        Request::CreateInstance { config } => respond_empty(backend.create_instance(&config)),
        Request::UpdateInstance { instance, config } => {
            respond_empty(backend.update_instance(&instance, &config))
        }
        Request::DeleteInstance { instance, purge } => {
            respond_empty(backend.delete_instance(&instance, purge))
        }
        Request::GetInstance { instance } => respond(backend.get_instance(&instance)),
        Request::ListInstances => respond(backend.list_instances()),
        Request::DeactivateAccount { instance, h_wire } => {
            respond_empty(backend.deactivate_account(&instance, &h_wire))
        }

        Request::CreateProduct {
            instance,
            product_id,
            details,
        } => respond_empty(backend.create_product(&instance, &product_id, &details)),
        Request::UpdateProduct {
            instance,
            product_id,
            details,
        } => respond_empty(backend.update_product(&instance, &product_id, &details)),
        Request::GetProduct {
            instance,
            product_id,
        } => respond(backend.get_product(&instance, &product_id)),
        Request::ListProducts { instance } => respond(backend.list_products(&instance)),
        Request::DeleteProduct {
            instance,
            product_id,
        } => respond_empty(backend.delete_product(&instance, &product_id)),
        Request::LockProduct {
            instance,
            product_id,
            uuid,
            quantity,
            duration,
        } => respond_empty(backend.lock_product(&instance, &product_id, uuid, quantity, duration)),

        Request::CreateOrder { instance, order } => respond(
            backend
                .create_order(&instance, &order)
                .map(|order_id| serde_json::json!({ "order_id": order_id })),
        ),
        Request::ClaimOrder {
            instance,
            order_id,
            nonce,
        } => respond(backend.claim_order(&instance, &order_id, nonce.as_deref())),
        Request::DeleteOrder { instance, order_id } => {
            respond_empty(backend.delete_order(&instance, &order_id))
        }
        Request::ListOrders { instance, filter } => respond(backend.list_orders(&instance, &filter)),
        Request::OrderStatus {
            instance,
            order_id,
            session_id,
        } => respond(backend.order_status(&instance, &order_id, session_id.as_deref())),
        Request::LookupSession {
            instance,
            fulfillment_url,
            session_id,
        } => respond(
            backend
                .lookup_session(&instance, &fulfillment_url, &session_id)
                .map(|order_id| serde_json::json!({ "order_id": order_id })),
        ),

        Request::Pay { instance, payment } => respond(backend.pay(&instance, &payment).await),
        Request::TrackTransfer {
            instance,
            exchange_url,
            wtid,
            wire_method,
        } => respond(
            backend
                .track_transfer(&instance, &exchange_url, &wtid, &wire_method)
                .await,
        ),
        Request::TrackTransaction { instance, order_id } => {
            match backend.track_transaction(&instance, &order_id).await {
                Ok(tracked) => Reply::with_status(tracked.http_status(), &tracked),
                Err(e) => Reply::error(&e),
            }
        }

        Request::IncreaseRefund {
            instance,
            order_id,
            refund,
            reason,
        } => respond(backend.increase_refund(&instance, &order_id, &refund, &reason)),
        Request::LookupRefunds { instance, order_id } => {
            respond(backend.lookup_refunds(&instance, &order_id))
        }
        Request::FetchRefundProofs { instance, order_id } => {
            respond(backend.fetch_refund_proofs(&instance, &order_id).await)
        }

        Request::EnableReserve {
            reserve_priv,
            credit_uuid,
            amount,
            expiration,
        } => respond(backend.enable_reserve(&reserve_priv, credit_uuid, &amount, expiration)),
        Request::FundReserve {
            exchange_url,
            amount,
            expiration,
            sender_account_url,
        } => respond(
            backend
                .fund_reserve(&exchange_url, &amount, expiration, &sender_account_url)
                .await,
        ),
        Request::AuthorizeTip { tip } => respond(backend.authorize_tip(&tip)),
        Request::PickupTip { tip_id, planchets } => {
            respond(backend.pickup_tip(&tip_id, &planchets).await)
        }
        Request::QueryTip { tip_id } => respond(backend.query_tip(&tip_id)),
        Request::ListReserves => respond(backend.list_reserves()),
    };

    if reply.status >= 500 {
        error!(op, status = reply.status, body = %reply.body, "Request failed");
    } else {
        debug!(op, status = reply.status, "Request completed");
    }
    reply
}
