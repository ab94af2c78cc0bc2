//! HTTP surface: payment commands, webhook intake, and the SSE update feed.

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use futures_util::Stream;
use serde::Serialize;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::gateway::{CreatePaymentRequest, PaymentGateway};
use crate::ledger::Ledger;
use crate::notify::{PaymentBroadcaster, StreamMessage};
use crate::types::{Payment, PaymentId, Transaction, WebhookSource, WebhookStatus};
use crate::webhook::WebhookIngress;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<PaymentGateway>,
    pub ingress: Arc<WebhookIngress>,
    pub broadcaster: PaymentBroadcaster,
    pub ledger: Arc<Ledger>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/payments", post(create_payment))
        .route("/payments/{id}", get(get_payment))
        .route("/payments/{id}/cancel", post(cancel_payment))
        .route("/payments/{id}/refund", post(refund_payment))
        .route("/payments/{id}/updates", get(payment_updates))
        .route("/webhooks/{source}", post(ingest_webhook))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
pub struct PaymentView {
    #[serde(flatten)]
    pub payment: Payment,
    pub transactions: Vec<Transaction>,
}

async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<Payment>), GatewayError> {
    let payment = state.gateway.create_payment(request).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentView>, GatewayError> {
    let (payment, transactions) = state.gateway.get_payment(PaymentId(id))?;
    Ok(Json(PaymentView {
        payment,
        transactions,
    }))
}

#[derive(Serialize)]
pub struct CommandAck {
    pub status: crate::types::PaymentStatus,
    pub applied: bool,
}

async fn cancel_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CommandAck>, GatewayError> {
    let applied = state.gateway.cancel_payment(PaymentId(id)).await?;
    Ok(Json(CommandAck {
        status: applied.status,
        applied: applied.applied,
    }))
}

async fn refund_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CommandAck>, GatewayError> {
    let applied = state.gateway.refund_payment(PaymentId(id)).await?;
    Ok(Json(CommandAck {
        status: applied.status,
        applied: applied.applied,
    }))
}

#[derive(Serialize)]
pub struct WebhookAck {
    pub record_id: Uuid,
    pub status: WebhookStatus,
    pub duplicate: bool,
    pub payment_id: Option<PaymentId>,
}

async fn ingest_webhook(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, GatewayError> {
    let source: WebhookSource = source.parse().map_err(GatewayError::Validation)?;

    let event_id = event_id_of(&headers, &body).ok_or_else(|| {
        GatewayError::Validation("delivery carries no event id".to_string())
    })?;
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let header_json = serde_json::Value::Object(
        headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), serde_json::Value::from(v)))
            })
            .collect(),
    );

    let result = state
        .ingress
        .ingest(source, &event_id, &body, signature, Some(header_json))
        .await?;
    Ok(Json(WebhookAck {
        record_id: result.record_id,
        status: result.status,
        duplicate: result.duplicate,
        payment_id: result.payment_id,
    }))
}

/// Delivery id: the `x-event-id` header when present, else the payload's
/// top-level `id` field.
fn event_id_of(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if let Some(id) = headers.get("x-event-id").and_then(|v| v.to_str().ok()) {
        return Some(id.to_string());
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("id")?.as_str().map(|s| s.to_string())
}

async fn payment_updates(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let payment_id = PaymentId(id);
    if state.ledger.payment(payment_id).is_none() {
        return Err(GatewayError::NotFound(format!("payment {}", payment_id)));
    }

    let updates = state
        .broadcaster
        .subscribe(Some(HashSet::from([payment_id])));
    let stream = futures_util::stream::unfold(updates, |mut updates| async move {
        let message = updates.next().await?;
        let event = match message {
            StreamMessage::Update(update) => {
                Event::default().event("update").json_data(&update).ok()?
            }
            StreamMessage::Gap { missed } => Event::default()
                .event("gap")
                .json_data(serde_json::json!({ "missed": missed }))
                .ok()?,
        };
        Some((Ok::<_, Infallible>(event), updates))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::engine::StateMachineEngine;
    use crate::gateway::{DepositAddressProvider, LightningInvoice, LightningNode, ProcessorClient};
    use crate::reconcile::AddressReconciler;
    use crate::types::{Currency, PaymentMethod, PaymentStatus};
    use crate::webhook::SignatureVerifier;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StubProcessor;

    #[async_trait]
    impl ProcessorClient for StubProcessor {
        async fn create_order(
            &self,
            _amount: i64,
            _currency: Currency,
            receipt: &str,
        ) -> Result<String, GatewayError> {
            Ok(format!("order_{}", receipt))
        }
    }

    struct StubAddresses;

    #[async_trait]
    impl DepositAddressProvider for StubAddresses {
        async fn next_address(&self, _chain: Chain) -> Result<String, GatewayError> {
            Ok("0xstub".to_string())
        }
    }

    struct StubLightning;

    #[async_trait]
    impl LightningNode for StubLightning {
        async fn create_invoice(
            &self,
            _amount_sat: i64,
            _description: Option<&str>,
        ) -> Result<LightningInvoice, GatewayError> {
            Ok(LightningInvoice {
                invoice: "lnbc...".to_string(),
                payment_hash: crate::types::TxHash::from("hash_1"),
            })
        }
    }

    struct AcceptAll;

    impl SignatureVerifier for AcceptAll {
        fn verify(
            &self,
            _source: WebhookSource,
            _payload: &[u8],
            _signature: Option<&str>,
        ) -> Result<bool, GatewayError> {
            Ok(true)
        }
    }

    fn state() -> AppState {
        let ledger = Arc::new(Ledger::new());
        let broadcaster = PaymentBroadcaster::new();
        let engine = Arc::new(StateMachineEngine::new(ledger.clone(), broadcaster.clone()));
        let reconciler = Arc::new(AddressReconciler::new(ledger.clone(), engine.clone()));
        let ingress = Arc::new(WebhookIngress::new(
            ledger.clone(),
            engine.clone(),
            reconciler,
            Arc::new(AcceptAll),
        ));
        let gateway = Arc::new(PaymentGateway::new(
            ledger.clone(),
            engine,
            Arc::new(StubProcessor),
            Arc::new(StubAddresses),
            Arc::new(StubLightning),
            900,
            HashMap::new(),
        ));
        AppState {
            gateway,
            ingress,
            broadcaster,
            ledger,
        }
    }

    #[tokio::test]
    async fn test_create_then_get_payment() {
        let state = state();
        let (status, Json(payment)) = create_payment(
            State(state.clone()),
            Json(CreatePaymentRequest {
                amount: 1_000,
                currency: Currency::USDT,
                method: PaymentMethod::Ethereum,
                order_id: None,
                description: None,
                metadata: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let Json(view) = get_payment(State(state), Path(payment.id.0)).await.unwrap();
        assert_eq!(view.payment.id, payment.id);
        assert_eq!(view.transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_route_resolves_event_id_from_body() {
        let state = state();
        let (_, Json(payment)) = create_payment(
            State(state.clone()),
            Json(CreatePaymentRequest {
                amount: 50_000,
                currency: Currency::INR,
                method: PaymentMethod::Upi,
                order_id: Some("rcpt_1".into()),
                description: None,
                metadata: None,
            }),
        )
        .await
        .unwrap();

        let body = serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "event": "payment.captured",
            "payload": { "payment": { "entity": { "order_id": "order_rcpt_1" } } }
        }))
        .unwrap();

        let Json(ack) = ingest_webhook(
            State(state.clone()),
            Path("processor".to_string()),
            HeaderMap::new(),
            Bytes::from(body),
        )
        .await
        .unwrap();
        assert_eq!(ack.status, WebhookStatus::Processed);
        assert_eq!(ack.payment_id, Some(payment.id));
        assert_eq!(
            state.ledger.payment(payment.id).unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_webhook_route_rejects_unknown_source() {
        let state = state();
        let result = ingest_webhook(
            State(state),
            Path("carrier-pigeon".to_string()),
            HeaderMap::new(),
            Bytes::from_static(b"{\"id\":\"evt_1\"}"),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Validation(_))));
    }

    #[tokio::test]
    async fn test_updates_requires_known_payment() {
        let state = state();
        let result = payment_updates(State(state), Path(Uuid::new_v4())).await;
        assert!(result.is_err());
    }
}
