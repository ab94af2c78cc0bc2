//! Converts chain block-height observations into confirmation counts and
//! confirmed/failed verdicts.
//!
//! The tracker recomputes `confirmations = height - tx.block_number + 1`,
//! clamped to non-negative and never decreasing while the transaction is
//! non-terminal. Crossing `required_confirmations` marks the transaction
//! confirmed and emits `FundingConfirmed` for its owning payment. A regression
//! below the threshold on an already-confirmed transaction means the chain
//! reorged under a settlement the payment may already have completed on: that
//! is a fatal inconsistency, the payment is frozen for manual review.
//!
//! [`ConfirmationPoller`] drives the tracker from the [`ChainClient`]
//! collaborator on a fixed interval; RPC failures are transient and retried
//! on the next tick.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::chain::{Chain, ChainClient};
use crate::engine::StateMachineEngine;
use crate::error::GatewayError;
use crate::ledger::Ledger;
use crate::timestamp::UnixTimestamp;
use crate::types::{PaymentEvent, TransactionStatus, TxHash};

/// Verdict of one block observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// No watched transaction for `(chain, tx_hash)`, or it is terminal.
    Dropped,
    /// Confirmation count updated, threshold not yet reached.
    Counting { confirmations: u64 },
    /// Threshold newly crossed; `FundingConfirmed` was dispatched.
    Confirmed,
}

pub struct ConfirmationTracker {
    ledger: Arc<Ledger>,
    engine: Arc<StateMachineEngine>,
}

impl ConfirmationTracker {
    pub fn new(ledger: Arc<Ledger>, engine: Arc<StateMachineEngine>) -> Self {
        ConfirmationTracker { ledger, engine }
    }

    /// Folds one chain-height observation into the watched transaction for
    /// `(chain, tx_hash)`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::FatalInconsistency`] when a confirmed
    /// transaction regresses below its threshold; the owning payment is
    /// frozen before returning.
    #[instrument(skip(self), fields(%chain, block_number, %tx_hash))]
    pub async fn on_block_observed(
        &self,
        chain: Chain,
        block_number: u64,
        tx_hash: &TxHash,
    ) -> Result<ConfirmationOutcome, GatewayError> {
        let Some(tx) = self.ledger.transaction_by_chain_hash(chain, tx_hash) else {
            tracing::debug!("block observation for unknown transaction dropped");
            return Ok(ConfirmationOutcome::Dropped);
        };

        let Some(tx_block) = tx.block_number else {
            tracing::debug!(tx_id = %tx.id, "transaction has no confirmation base yet");
            return Ok(ConfirmationOutcome::Dropped);
        };

        let observed = if block_number >= tx_block {
            block_number - tx_block + 1
        } else {
            0
        };

        if tx.status.is_terminal() {
            if tx.status == TransactionStatus::Confirmed {
                if observed < tx.required_confirmations {
                    return self
                        .fatal(
                            &format!(
                                "confirmations regressed to {} (< {}) on confirmed transaction {}",
                                observed, tx.required_confirmations, tx.id
                            ),
                            tx.payment_id,
                        )
                        .await;
                }
                // A count below the stored one but still at or above the
                // threshold is not folded back: lagging nodes routinely
                // report lower heights, and the transaction stays final
                // either way.
                if observed < tx.confirmations {
                    tracing::debug!(
                        tx_id = %tx.id,
                        observed,
                        stored = tx.confirmations,
                        "confirmation count receded above threshold"
                    );
                }
            }
            return Ok(ConfirmationOutcome::Dropped);
        }

        // Non-decreasing while non-terminal.
        let confirmations = observed.max(tx.confirmations);
        let crossed = confirmations >= tx.required_confirmations;

        let mut updated = tx.clone();
        updated.confirmations = confirmations;
        updated.status = if crossed {
            TransactionStatus::Confirmed
        } else if confirmations > 0 {
            TransactionStatus::Confirming
        } else {
            updated.status
        };
        updated.updated_at = UnixTimestamp::now();
        self.ledger.put_transaction(updated);

        if crossed {
            tracing::info!(tx_id = %tx.id, confirmations, "transaction confirmed");
            self.engine
                .apply(tx.payment_id, PaymentEvent::FundingConfirmed)
                .await?;
            Ok(ConfirmationOutcome::Confirmed)
        } else {
            Ok(ConfirmationOutcome::Counting { confirmations })
        }
    }

    /// Handles the chain no longer knowing a transaction. Harmless while the
    /// transaction is unconfirmed (mempool drop, it may reappear); fatal once
    /// it was confirmed.
    pub async fn on_transaction_missing(
        &self,
        chain: Chain,
        tx_hash: &TxHash,
    ) -> Result<ConfirmationOutcome, GatewayError> {
        let Some(tx) = self.ledger.transaction_by_chain_hash(chain, tx_hash) else {
            return Ok(ConfirmationOutcome::Dropped);
        };
        if tx.status == TransactionStatus::Confirmed {
            return self
                .fatal(
                    &format!("confirmed transaction {} disappeared from {}", tx.id, chain),
                    tx.payment_id,
                )
                .await;
        }
        tracing::debug!(tx_id = %tx.id, "unconfirmed transaction not found on chain");
        Ok(ConfirmationOutcome::Dropped)
    }

    async fn fatal(
        &self,
        reason: &str,
        payment_id: crate::types::PaymentId,
    ) -> Result<ConfirmationOutcome, GatewayError> {
        self.engine.freeze(payment_id, reason).await?;
        Err(GatewayError::FatalInconsistency(reason.to_string()))
    }
}

/// Periodic driver that feeds the tracker from the chain-RPC collaborator.
pub struct ConfirmationPoller {
    ledger: Arc<Ledger>,
    tracker: Arc<ConfirmationTracker>,
    chain_client: Arc<dyn ChainClient>,
    interval: Duration,
}

impl ConfirmationPoller {
    pub fn new(
        ledger: Arc<Ledger>,
        tracker: Arc<ConfirmationTracker>,
        chain_client: Arc<dyn ChainClient>,
        interval: Duration,
    ) -> Self {
        ConfirmationPoller {
            ledger,
            tracker,
            chain_client,
            interval,
        }
    }

    /// Runs until cancelled. Each tick is driven to completion before the
    /// token is checked again, so an in-flight apply is never torn.
    pub async fn run(self, cancellation_token: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("confirmation poller stopping");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.tick().await;
        }
    }

    /// One polling pass over all watched transactions.
    pub async fn tick(&self) {
        let watched = self.ledger.watched_transactions();
        if watched.is_empty() {
            return;
        }

        let mut heights: std::collections::HashMap<Chain, u64> = std::collections::HashMap::new();
        for tx in watched {
            let (Some(chain), Some(tx_hash)) = (tx.chain, tx.tx_hash.clone()) else {
                continue;
            };
            let height = match heights.get(&chain) {
                Some(height) => *height,
                None => match self.chain_client.current_block_height(chain).await {
                    Ok(height) => {
                        heights.insert(chain, height);
                        height
                    }
                    Err(error) => {
                        tracing::warn!(%chain, %error, "block height unavailable, retrying next tick");
                        continue;
                    }
                },
            };

            // Discover the confirmation base for transactions still missing it.
            if tx.block_number.is_none() {
                match self.chain_client.get_transaction(chain, &tx_hash).await {
                    Ok(Some(chain_tx)) => {
                        if chain_tx.block_number.is_some() {
                            let _ = self.ledger.attach_funding_tx(
                                tx.payment_id,
                                chain,
                                &tx_hash,
                                chain_tx.block_number,
                                Some(chain_tx.from),
                            );
                        }
                    }
                    Ok(None) => {
                        if let Err(error) =
                            self.tracker.on_transaction_missing(chain, &tx_hash).await
                        {
                            tracing::error!(%error, "transaction missing verdict");
                        }
                        continue;
                    }
                    Err(error) => {
                        tracing::warn!(%chain, %error, "transaction lookup failed, retrying next tick");
                        continue;
                    }
                }
            }

            if let Err(error) = self.tracker.on_block_observed(chain, height, &tx_hash).await {
                // Fatal inconsistencies have already frozen the payment.
                tracing::error!(%error, %tx_hash, "block observation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::PaymentBroadcaster;
    use crate::types::{
        Currency, Payment, PaymentId, PaymentMethod, PaymentStatus, RailDetails, Transaction,
        TransactionType,
    };

    fn setup(required: u64) -> (Arc<Ledger>, Arc<StateMachineEngine>, ConfirmationTracker, PaymentId, TxHash) {
        let ledger = Arc::new(Ledger::new());
        let now = UnixTimestamp::now();
        let payment = Payment {
            id: PaymentId::new(),
            external_id: None,
            order_id: None,
            amount: 100,
            currency: Currency::USDT,
            status: PaymentStatus::Processing,
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
        };
        let payment_id = payment.id;
        ledger.insert_payment(payment).unwrap();

        let mut tx = Transaction::new(
            payment_id,
            TransactionType::Payment,
            100,
            Currency::USDT,
            Some(Chain::Ethereum),
            required,
        );
        let hash = TxHash::from("0xfeed");
        tx.tx_hash = Some(hash.clone());
        tx.block_number = Some(100);
        ledger.insert_transaction(tx).unwrap();

        let engine = Arc::new(StateMachineEngine::new(
            ledger.clone(),
            PaymentBroadcaster::new(),
        ));
        let tracker = ConfirmationTracker::new(ledger.clone(), engine.clone());
        (ledger, engine, tracker, payment_id, hash)
    }

    #[tokio::test]
    async fn test_confirms_exactly_at_threshold() {
        let (ledger, _, tracker, payment_id, hash) = setup(2);

        // Height 100 = 1 confirmation: below threshold.
        let outcome = tracker
            .on_block_observed(Chain::Ethereum, 100, &hash)
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Counting { confirmations: 1 });
        let tx = ledger.transaction_by_chain_hash(Chain::Ethereum, &hash).unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirming);
        assert_eq!(
            ledger.payment(payment_id).unwrap().status,
            PaymentStatus::Processing
        );

        // Height 101 = 2 confirmations: threshold crossed.
        let outcome = tracker
            .on_block_observed(Chain::Ethereum, 101, &hash)
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Confirmed);
        let tx = ledger.transaction_by_chain_hash(Chain::Ethereum, &hash).unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert_eq!(tx.confirmations, 2);
        assert_eq!(
            ledger.payment(payment_id).unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_duplicate_observation_is_dropped() {
        let (ledger, _, tracker, payment_id, hash) = setup(2);
        tracker
            .on_block_observed(Chain::Ethereum, 101, &hash)
            .await
            .unwrap();

        // Same height observed again: transaction is terminal, nothing moves.
        let outcome = tracker
            .on_block_observed(Chain::Ethereum, 101, &hash)
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Dropped);
        assert_eq!(
            ledger.payment(payment_id).unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_confirmations_clamped_non_negative() {
        let (ledger, _, tracker, _, hash) = setup(5);
        // Observed height below the containing block (stale node).
        let outcome = tracker
            .on_block_observed(Chain::Ethereum, 50, &hash)
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Counting { confirmations: 0 });
        let tx = ledger.transaction_by_chain_hash(Chain::Ethereum, &hash).unwrap();
        assert_eq!(tx.confirmations, 0);
        assert_eq!(tx.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_confirmations_never_decrease_while_pending() {
        let (ledger, _, tracker, _, hash) = setup(10);
        tracker
            .on_block_observed(Chain::Ethereum, 104, &hash)
            .await
            .unwrap();
        tracker
            .on_block_observed(Chain::Ethereum, 102, &hash)
            .await
            .unwrap();
        let tx = ledger.transaction_by_chain_hash(Chain::Ethereum, &hash).unwrap();
        assert_eq!(tx.confirmations, 5);
    }

    #[tokio::test]
    async fn test_reorg_below_confirmed_is_fatal_and_freezes() {
        let (ledger, _, tracker, payment_id, hash) = setup(2);
        tracker
            .on_block_observed(Chain::Ethereum, 101, &hash)
            .await
            .unwrap();

        let result = tracker.on_block_observed(Chain::Ethereum, 100, &hash).await;
        assert!(matches!(result, Err(GatewayError::FatalInconsistency(_))));
        assert!(ledger.payment(payment_id).unwrap().frozen);

        // The frozen payment keeps its completed status.
        assert_eq!(
            ledger.payment(payment_id).unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_recede_above_threshold_stays_confirmed() {
        let (ledger, _, tracker, payment_id, hash) = setup(2);
        // Height 105 = 6 confirmations, well past the threshold.
        tracker
            .on_block_observed(Chain::Ethereum, 105, &hash)
            .await
            .unwrap();

        // A lagging node reports height 101 = 2 confirmations: lower than the
        // stored count but still at the threshold, so nothing moves.
        let outcome = tracker
            .on_block_observed(Chain::Ethereum, 101, &hash)
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Dropped);
        let tx = ledger.transaction_by_chain_hash(Chain::Ethereum, &hash).unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert_eq!(tx.confirmations, 6);
        assert!(!ledger.payment(payment_id).unwrap().frozen);
    }

    #[tokio::test]
    async fn test_confirmed_transaction_missing_is_fatal() {
        let (ledger, _, tracker, payment_id, hash) = setup(1);
        tracker
            .on_block_observed(Chain::Ethereum, 100, &hash)
            .await
            .unwrap();

        let result = tracker.on_transaction_missing(Chain::Ethereum, &hash).await;
        assert!(matches!(result, Err(GatewayError::FatalInconsistency(_))));
        assert!(ledger.payment(payment_id).unwrap().frozen);
    }

    #[tokio::test]
    async fn test_unconfirmed_missing_is_harmless() {
        let (ledger, _, tracker, payment_id, hash) = setup(5);
        let outcome = tracker
            .on_transaction_missing(Chain::Ethereum, &hash)
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Dropped);
        assert!(!ledger.payment(payment_id).unwrap().frozen);
    }
}
