//! Background expiry of stale payments.
//!
//! Scans the ledger on a fixed interval and dispatches [`PaymentEvent::Expired`]
//! for every pending or processing payment past its deadline. Expiry races
//! settlement by design: the per-payment lock in the engine decides the
//! winner, and the loser's event is absorbed as a no-op.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::engine::StateMachineEngine;
use crate::ledger::Ledger;
use crate::timestamp::UnixTimestamp;
use crate::types::PaymentEvent;

pub struct ExpirationSweeper {
    ledger: Arc<Ledger>,
    engine: Arc<StateMachineEngine>,
    interval: Duration,
}

impl ExpirationSweeper {
    pub fn new(ledger: Arc<Ledger>, engine: Arc<StateMachineEngine>, interval: Duration) -> Self {
        ExpirationSweeper {
            ledger,
            engine,
            interval,
        }
    }

    /// Runs until cancelled. A sweep in progress finishes before shutdown.
    pub async fn run(self, cancellation_token: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("expiration sweeper stopping");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.sweep().await;
        }
    }

    /// One pass over the ledger.
    pub async fn sweep(&self) {
        let expired = self.ledger.expired_payments(UnixTimestamp::now());
        if expired.is_empty() {
            return;
        }
        tracing::info!(count = expired.len(), "expiring stale payments");
        for payment_id in expired {
            match self.engine.apply(payment_id, PaymentEvent::Expired).await {
                Ok(applied) if applied.applied => {
                    tracing::info!(%payment_id, "payment expired");
                }
                Ok(_) => {
                    // Lost the race to a settlement event between scan and apply.
                    tracing::debug!(%payment_id, "expiry absorbed, payment moved on");
                }
                Err(error) => {
                    tracing::error!(%payment_id, %error, "expiry dispatch failed");
                }
            }
        }
    }
}
