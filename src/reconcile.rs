//! Matches observed on-chain fund movements to watched addresses.
//!
//! Observations arrive at-least-once from polling loops and blockchain
//! webhooks. The reconciler deduplicates them by funding transaction hash,
//! accumulates `received_amount`, and emits `FundingObserved` to the engine
//! exactly once, at the first crossing of `expected_amount`. The accumulation
//! runs under the address row's shard lock in the ledger, so concurrent
//! observers of the same address cannot double-count.

use std::sync::Arc;
use tracing::instrument;

use crate::chain::Chain;
use crate::engine::{Applied, StateMachineEngine};
use crate::error::GatewayError;
use crate::ledger::Ledger;
use crate::timestamp::UnixTimestamp;
use crate::types::{PaymentEvent, TxHash};

/// What one observation did to the watched address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundsOutcome {
    /// No watched active address for `(address, chain)`; logged and dropped.
    Unsolicited,
    /// The funding transaction was already counted.
    Duplicate,
    /// Counted, but `received_amount` is still below `expected_amount`.
    Partial,
    /// First crossing of `expected_amount`; `FundingObserved` was emitted.
    Funded,
    /// Counted after the expectation was already met (late surplus).
    Surplus,
}

pub struct AddressReconciler {
    ledger: Arc<Ledger>,
    engine: Arc<StateMachineEngine>,
}

impl AddressReconciler {
    pub fn new(ledger: Arc<Ledger>, engine: Arc<StateMachineEngine>) -> Self {
        AddressReconciler { ledger, engine }
    }

    /// Records one observed fund movement into a watched address.
    ///
    /// `block_number` is the block containing the funding transaction when
    /// the observer knows it; it seeds the confirmation base on the payment's
    /// settlement transaction.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] for a non-positive amount, before
    /// any ledger mutation: `received_amount` only ever grows.
    #[instrument(skip(self), fields(%address, %chain, amount, %tx_hash))]
    pub async fn on_funds_observed(
        &self,
        address: &str,
        chain: Chain,
        amount: i64,
        tx_hash: &TxHash,
        block_number: Option<u64>,
        from_address: Option<String>,
    ) -> Result<(FundsOutcome, Option<Applied>), GatewayError> {
        if amount <= 0 {
            return Err(GatewayError::Validation(format!(
                "funding amount must be positive, got {}",
                amount
            )));
        }

        struct Accumulated {
            outcome: FundsOutcome,
            payment_id: Option<crate::types::PaymentId>,
            received: i64,
        }

        let accumulated = self.ledger.with_address_mut(chain, address, |addr| {
            if !addr.is_active {
                return None;
            }
            if addr.funding_txs.contains(tx_hash) {
                return Some(Accumulated {
                    outcome: FundsOutcome::Duplicate,
                    payment_id: None,
                    received: addr.received_amount,
                });
            }
            addr.funding_txs.insert(tx_hash.clone());
            addr.received_amount += amount;
            addr.last_checked_at = Some(UnixTimestamp::now());

            let crossed = !addr.funding_emitted && addr.received_amount >= addr.expected_amount;
            if crossed {
                addr.funding_emitted = true;
            }
            if addr.received_amount > addr.expected_amount && !addr.overpaid {
                addr.overpaid = true;
                tracing::warn!(
                    %chain,
                    received = addr.received_amount,
                    expected = addr.expected_amount,
                    "address overpaid, surplus flagged for manual handling"
                );
            }

            let outcome = if crossed {
                FundsOutcome::Funded
            } else if addr.received_amount < addr.expected_amount {
                FundsOutcome::Partial
            } else {
                FundsOutcome::Surplus
            };
            Some(Accumulated {
                outcome,
                payment_id: addr.payment_id,
                received: addr.received_amount,
            })
        });

        let Some(Some(accumulated)) = accumulated else {
            tracing::info!(%address, %chain, amount, "unsolicited funding observation dropped");
            return Ok((FundsOutcome::Unsolicited, None));
        };

        if accumulated.outcome == FundsOutcome::Duplicate {
            tracing::debug!(%tx_hash, "funding transaction already counted");
            return Ok((FundsOutcome::Duplicate, None));
        }

        // Make the funding hash discoverable by the confirmation tracker,
        // whatever the accumulation outcome.
        if let Some(payment_id) = accumulated.payment_id {
            let _ = self
                .ledger
                .attach_funding_tx(payment_id, chain, tx_hash, block_number, from_address);
        }

        if accumulated.outcome == FundsOutcome::Funded {
            if let Some(payment_id) = accumulated.payment_id {
                let applied = self
                    .engine
                    .apply(
                        payment_id,
                        PaymentEvent::FundingObserved {
                            amount: accumulated.received,
                        },
                    )
                    .await?;
                return Ok((FundsOutcome::Funded, Some(applied)));
            }
        }

        Ok((accumulated.outcome, None))
    }
}
