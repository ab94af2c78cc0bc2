//! The state machine engine: the single authority that applies domain events
//! to a payment.
//!
//! Every signal — processor webhook, confirmation verdict, reconciliation
//! verdict, expiry sweep — arrives here as a [`PaymentEvent`] and is applied
//! under the payment's serialization lock, so the transition check-and-apply
//! is atomic with respect to concurrent signals for the same payment.
//!
//! The core correctness property is terminal-state absorption: duplicate or
//! late-arriving events against a terminal payment are no-ops (`applied:
//! false`), never errors, and never re-fire side effects such as
//! notifications.

use std::sync::Arc;
use tracing::instrument;

use crate::error::GatewayError;
use crate::ledger::Ledger;
use crate::notify::PaymentBroadcaster;
use crate::timestamp::UnixTimestamp;
use crate::types::{PaymentEvent, PaymentId, PaymentStatus, PaymentUpdate};

/// Outcome of one event application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub previous: PaymentStatus,
    pub status: PaymentStatus,
    /// `false` means the event was absorbed as a no-op.
    pub applied: bool,
}

/// The transition table. `None` is a no-op, not an error: omitted
/// combinations absorb idempotently so out-of-order and duplicate delivery
/// converge on the same end state.
pub fn next_status(current: PaymentStatus, event: &PaymentEvent) -> Option<PaymentStatus> {
    use PaymentStatus::*;
    match (current, event) {
        (Pending, PaymentEvent::FundingObserved { .. }) => Some(Processing),
        (Pending | Processing, PaymentEvent::FundingConfirmed) => Some(Completed),
        (Pending | Processing, PaymentEvent::SettlementFailed { .. }) => Some(Failed),
        (Pending, PaymentEvent::CancelRequested) => Some(Cancelled),
        (Pending | Processing, PaymentEvent::Expired) => Some(Expired),
        (Completed, PaymentEvent::RefundRequested) => Some(Refunded),
        _ => None,
    }
}

pub struct StateMachineEngine {
    ledger: Arc<Ledger>,
    broadcaster: PaymentBroadcaster,
}

impl StateMachineEngine {
    pub fn new(ledger: Arc<Ledger>, broadcaster: PaymentBroadcaster) -> Self {
        StateMachineEngine { ledger, broadcaster }
    }

    pub fn broadcaster(&self) -> &PaymentBroadcaster {
        &self.broadcaster
    }

    /// Applies one event to one payment under the per-payment lock.
    ///
    /// On an applied transition the payment row is committed, linked addresses
    /// are deactivated when the new state is terminal, and the transition is
    /// published to subscribers. A no-op commits nothing and publishes
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] for an unknown payment id. Frozen
    /// payments absorb every event as a no-op rather than erroring.
    #[instrument(skip(self), fields(event = event.name()))]
    pub async fn apply(
        &self,
        payment_id: PaymentId,
        event: PaymentEvent,
    ) -> Result<Applied, GatewayError> {
        let lock = self.ledger.payment_lock(payment_id);
        let _guard = lock.lock().await;

        let mut payment = self
            .ledger
            .payment(payment_id)
            .ok_or_else(|| GatewayError::NotFound(format!("payment {}", payment_id)))?;
        let previous = payment.status;

        if payment.frozen {
            tracing::warn!(%payment_id, "event against frozen payment absorbed");
            return Ok(Applied {
                previous,
                status: previous,
                applied: false,
            });
        }

        let Some(next) = next_status(previous, &event) else {
            tracing::debug!(%payment_id, status = %previous, "event absorbed as no-op");
            return Ok(Applied {
                previous,
                status: previous,
                applied: false,
            });
        };

        let now = UnixTimestamp::now();
        payment.status = next;
        payment.updated_at = now;
        if next == PaymentStatus::Completed {
            payment.completed_at = Some(now);
        }
        self.ledger.put_payment(payment);

        if next.is_terminal() {
            self.ledger.deactivate_addresses_for(payment_id);
        }

        tracing::info!(%payment_id, from = %previous, to = %next, "payment transitioned");
        self.broadcaster.publish(PaymentUpdate {
            payment_id,
            previous_status: previous,
            new_status: next,
            timestamp: now,
        });

        Ok(Applied {
            previous,
            status: next,
            applied: true,
        })
    }

    /// Freezes a payment after a fatal inconsistency. No further automatic
    /// transitions will be applied until manual review clears the flag.
    pub async fn freeze(&self, payment_id: PaymentId, reason: &str) -> Result<(), GatewayError> {
        let lock = self.ledger.payment_lock(payment_id);
        let _guard = lock.lock().await;
        let mut payment = self
            .ledger
            .payment(payment_id)
            .ok_or_else(|| GatewayError::NotFound(format!("payment {}", payment_id)))?;
        if !payment.frozen {
            payment.frozen = true;
            payment.updated_at = UnixTimestamp::now();
            self.ledger.put_payment(payment);
            tracing::error!(%payment_id, reason, "payment frozen pending manual review");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::types::{Currency, Payment, PaymentMethod, RailDetails};

    fn pending_payment() -> Payment {
        let now = UnixTimestamp::now();
        Payment {
            id: PaymentId::new(),
            external_id: None,
            order_id: None,
            amount: 100,
            currency: Currency::USDT,
            status: PaymentStatus::Pending,
            method: PaymentMethod::Ethereum,
            description: None,
            metadata: None,
            rail: RailDetails::Crypto {
                chain: Chain::Ethereum,
                address: "0xaaa".to_string(),
                tx_hash: None,
            },
            frozen: false,
            expires_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn engine_with(payment: Payment) -> (StateMachineEngine, PaymentId) {
        let ledger = Arc::new(Ledger::new());
        let id = payment.id;
        ledger.insert_payment(payment).unwrap();
        (
            StateMachineEngine::new(ledger, PaymentBroadcaster::new()),
            id,
        )
    }

    #[test]
    fn test_transition_table() {
        use PaymentStatus::*;
        let observed = PaymentEvent::FundingObserved { amount: 100 };
        let failed = PaymentEvent::SettlementFailed {
            reason: "declined".into(),
        };

        assert_eq!(next_status(Pending, &observed), Some(Processing));
        assert_eq!(next_status(Processing, &observed), None);
        assert_eq!(
            next_status(Pending, &PaymentEvent::FundingConfirmed),
            Some(Completed)
        );
        assert_eq!(
            next_status(Processing, &PaymentEvent::FundingConfirmed),
            Some(Completed)
        );
        assert_eq!(next_status(Pending, &failed), Some(Failed));
        assert_eq!(next_status(Processing, &failed), Some(Failed));
        assert_eq!(
            next_status(Pending, &PaymentEvent::CancelRequested),
            Some(Cancelled)
        );
        assert_eq!(next_status(Processing, &PaymentEvent::CancelRequested), None);
        assert_eq!(next_status(Pending, &PaymentEvent::Expired), Some(Expired));
        assert_eq!(next_status(Processing, &PaymentEvent::Expired), Some(Expired));
        assert_eq!(
            next_status(Completed, &PaymentEvent::RefundRequested),
            Some(Refunded)
        );

        // Terminal absorption: every event against every terminal state,
        // except the documented refund path.
        for terminal in [Completed, Failed, Cancelled, Refunded, Expired] {
            for event in [
                PaymentEvent::FundingObserved { amount: 1 },
                PaymentEvent::FundingConfirmed,
                PaymentEvent::SettlementFailed {
                    reason: String::new(),
                },
                PaymentEvent::CancelRequested,
                PaymentEvent::Expired,
            ] {
                assert_eq!(next_status(terminal, &event), None);
            }
        }
        for terminal in [Failed, Cancelled, Refunded, Expired] {
            assert_eq!(next_status(terminal, &PaymentEvent::RefundRequested), None);
        }
    }

    #[tokio::test]
    async fn test_apply_commits_and_publishes() {
        let (engine, id) = engine_with(pending_payment());
        let mut stream = engine.broadcaster().subscribe(None);

        let result = engine
            .apply(id, PaymentEvent::FundingObserved { amount: 100 })
            .await
            .unwrap();
        assert!(result.applied);
        assert_eq!(result.previous, PaymentStatus::Pending);
        assert_eq!(result.status, PaymentStatus::Processing);

        match stream.next().await.unwrap() {
            crate::notify::StreamMessage::Update(update) => {
                assert_eq!(update.payment_id, id);
                assert_eq!(update.new_status, PaymentStatus::Processing);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completion_sets_timestamp_and_deactivates_address() {
        let ledger = Arc::new(Ledger::new());
        let payment = pending_payment();
        let id = payment.id;
        ledger.insert_payment(payment).unwrap();
        ledger
            .insert_address(crate::types::CryptoAddress::new(
                "0xaaa".into(),
                Chain::Ethereum,
                Some(id),
                100,
            ))
            .unwrap();
        let engine = StateMachineEngine::new(ledger.clone(), PaymentBroadcaster::new());

        engine.apply(id, PaymentEvent::FundingConfirmed).await.unwrap();

        let payment = ledger.payment(id).unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment.completed_at.is_some());
        let addr = ledger.address(Chain::Ethereum, "0xaaa").unwrap();
        assert!(!addr.is_active);
    }

    #[tokio::test]
    async fn test_terminal_absorption_is_silent() {
        let (engine, id) = engine_with(pending_payment());
        engine.apply(id, PaymentEvent::FundingConfirmed).await.unwrap();

        let mut stream = engine.broadcaster().subscribe(None);
        let result = engine
            .apply(id, PaymentEvent::FundingObserved { amount: 100 })
            .await
            .unwrap();
        assert!(!result.applied);
        assert_eq!(result.status, PaymentStatus::Completed);

        // No notification was re-fired for the absorbed event.
        engine.apply(id, PaymentEvent::RefundRequested).await.unwrap();
        match stream.next().await.unwrap() {
            crate::notify::StreamMessage::Update(update) => {
                assert_eq!(update.new_status, PaymentStatus::Refunded);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frozen_payment_absorbs_everything() {
        let (engine, id) = engine_with(pending_payment());
        engine.freeze(id, "confirmations regressed").await.unwrap();

        let result = engine
            .apply(id, PaymentEvent::FundingConfirmed)
            .await
            .unwrap();
        assert!(!result.applied);
        assert_eq!(result.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_payment_is_not_found() {
        let ledger = Arc::new(Ledger::new());
        let engine = StateMachineEngine::new(ledger, PaymentBroadcaster::new());
        let result = engine
            .apply(PaymentId::new(), PaymentEvent::FundingConfirmed)
            .await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_expiry_and_confirmation_yield_one_winner() {
        let (engine, id) = engine_with(pending_payment());
        let engine = Arc::new(engine);

        let confirm = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.apply(id, PaymentEvent::FundingConfirmed).await })
        };
        let expire = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.apply(id, PaymentEvent::Expired).await })
        };

        let confirmed = confirm.await.unwrap().unwrap();
        let expired = expire.await.unwrap().unwrap();

        // Exactly one of the two events is applied; the other is absorbed.
        assert!(confirmed.applied ^ expired.applied);
        let final_status = if confirmed.applied {
            PaymentStatus::Completed
        } else {
            PaymentStatus::Expired
        };
        assert_eq!(
            if confirmed.applied { confirmed.status } else { expired.status },
            final_status
        );
    }
}
