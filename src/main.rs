//! Gateway HTTP entrypoint.
//!
//! Launches the axum server and the two background workers (expiration
//! sweeper, confirmation poller) over one shared ledger.
//!
//! Endpoints:
//! - `POST /payments` – Create a payment intent
//! - `GET /payments/{id}` – Payment with its transactions
//! - `POST /payments/{id}/cancel` / `POST /payments/{id}/refund`
//! - `GET /payments/{id}/updates` – SSE stream of state transitions
//! - `POST /webhooks/{source}` – Webhook intake (processor, blockchain, lightning, internal)
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `OTEL_*` variables enable span export
//! - `WEBHOOK_SECRET_*` enable per-source webhook verification

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tower_http::cors;

use railgate::chain::ChainClient;
use railgate::config::Config;
use railgate::confirm::{ConfirmationPoller, ConfirmationTracker};
use railgate::engine::StateMachineEngine;
use railgate::gateway::PaymentGateway;
use railgate::handlers::{self, AppState};
use railgate::ledger::Ledger;
use railgate::notify::PaymentBroadcaster;
use railgate::rails::{
    LocalAddressBook, LocalInvoiceBook, LocalOrderBook, SharedSecretVerifier,
    UnconfiguredChainClient,
};
use railgate::reconcile::AddressReconciler;
use railgate::sig_down::SigDown;
use railgate::sweeper::ExpirationSweeper;
use railgate::telemetry::Telemetry;
use railgate::webhook::WebhookIngress;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;

    let ledger = Arc::new(Ledger::new());
    let broadcaster = PaymentBroadcaster::new();
    let engine = Arc::new(StateMachineEngine::new(ledger.clone(), broadcaster.clone()));
    let reconciler = Arc::new(AddressReconciler::new(ledger.clone(), engine.clone()));
    let tracker = Arc::new(ConfirmationTracker::new(ledger.clone(), engine.clone()));

    let chain_client: Arc<dyn ChainClient> = Arc::new(UnconfiguredChainClient);
    let ingress = Arc::new(WebhookIngress::new(
        ledger.clone(),
        engine.clone(),
        reconciler,
        Arc::new(SharedSecretVerifier::from_env()),
    ));
    let gateway = Arc::new(PaymentGateway::new(
        ledger.clone(),
        engine.clone(),
        Arc::new(LocalOrderBook),
        Arc::new(LocalAddressBook),
        Arc::new(LocalInvoiceBook),
        config.payment_ttl_secs(),
        config.confirmations().clone(),
    ));

    let sig_down = SigDown::try_new()?;
    let workers = TaskTracker::new();

    let sweeper = ExpirationSweeper::new(ledger.clone(), engine.clone(), config.sweep_interval());
    workers.spawn(sweeper.run(sig_down.cancellation_token()));

    let poller = ConfirmationPoller::new(
        ledger.clone(),
        tracker,
        chain_client,
        config.poll_interval(),
    );
    workers.spawn(poller.run(sig_down.cancellation_token()));
    workers.close();

    let state = AppState {
        gateway,
        ingress,
        broadcaster,
        ledger,
    };
    let http_endpoints = Router::new()
        .merge(handlers::routes(state))
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    // Drain background workers before exit.
    workers.wait().await;

    Ok(())
}
