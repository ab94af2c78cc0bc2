//! Inbound notification processing for every rail.
//!
//! Every delivery is persisted before anything else, so the audit trail has a
//! row even for garbage. Deduplication is claim-based: the first delivery to
//! claim `(source, event_id)` processes it, concurrent duplicates are stored
//! and acknowledged as ignored. A claim is released on failure so a later
//! redelivery can retry; a processed claim is permanent.
//!
//! Translation is the other half of this module: each source's payload shape
//! is mapped onto the engine's [`PaymentEvent`] vocabulary. Unknown event
//! types are acknowledged and ignored rather than failed, so a newer upstream
//! does not cause retry storms here.

use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::chain::Chain;
use crate::engine::StateMachineEngine;
use crate::error::GatewayError;
use crate::ledger::Ledger;
use crate::reconcile::AddressReconciler;
use crate::timestamp::UnixTimestamp;
use crate::types::{
    PaymentEvent, PaymentId, TransactionStatus, TxHash, WebhookEvent, WebhookSource, WebhookStatus,
};

/// Verifies a delivery's authenticity for its source.
///
/// Implementations hold the per-source secret (processor HMAC key, node
/// shared token). Verification is a pure computation over the raw body.
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        source: WebhookSource,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<bool, GatewayError>;
}

/// Ingestion outcome handed back to the HTTP layer.
#[derive(Debug, Clone)]
pub struct WebhookResult {
    /// The audit record written for this delivery.
    pub record_id: Uuid,
    pub payment_id: Option<PaymentId>,
    pub status: WebhookStatus,
    /// `true` when another delivery of the same `(source, event_id)` already
    /// processed (or is processing) the event.
    pub duplicate: bool,
}

/// What a payload translates to.
enum Translation {
    /// Dispatch an engine event against a resolved payment.
    Apply(PaymentId, PaymentEvent),
    /// A paid Lightning invoice: settle the invoice's transaction, then
    /// complete the payment.
    InvoiceSettled {
        payment_id: PaymentId,
        payment_hash: TxHash,
    },
    /// Route an on-chain funding observation through the reconciler.
    Funds {
        address: String,
        chain: Chain,
        amount: i64,
        tx_hash: TxHash,
        block_number: Option<u64>,
        from_address: Option<String>,
    },
    /// Event type is not one we act on.
    Ignore,
}

#[derive(Deserialize)]
struct ProcessorEntity {
    order_id: Option<String>,
    amount: Option<i64>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct BlockchainPayload {
    address: String,
    chain: Chain,
    amount: i64,
    tx_hash: TxHash,
    block_number: Option<u64>,
    from_address: Option<String>,
}

#[derive(Deserialize)]
struct LightningPayload {
    payment_hash: TxHash,
}

#[derive(Deserialize)]
struct InternalPayload {
    payment_id: PaymentId,
}

pub struct WebhookIngress {
    ledger: Arc<Ledger>,
    engine: Arc<StateMachineEngine>,
    reconciler: Arc<AddressReconciler>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl WebhookIngress {
    pub fn new(
        ledger: Arc<Ledger>,
        engine: Arc<StateMachineEngine>,
        reconciler: Arc<AddressReconciler>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        WebhookIngress {
            ledger,
            engine,
            reconciler,
            verifier,
        }
    }

    /// Ingests one delivery: persist, deduplicate, verify, translate, apply.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Validation`] for an unparseable or incomplete payload,
    /// [`GatewayError::Auth`] for a failed signature check. In both cases the
    /// audit record is finished as `failed` and the dedup claim is released so
    /// a corrected redelivery can process.
    #[instrument(skip(self, payload, signature, headers), fields(%source, event_id))]
    pub async fn ingest(
        &self,
        source: WebhookSource,
        event_id: &str,
        payload: &[u8],
        signature: Option<String>,
        headers: Option<serde_json::Value>,
    ) -> Result<WebhookResult, GatewayError> {
        // Audit-first: the raw delivery is stored before parsing can reject it.
        let parsed: Result<serde_json::Value, _> = serde_json::from_slice(payload);
        let (body, event_type) = match &parsed {
            Ok(value) => {
                let event_type = value
                    .get("event")
                    .and_then(|e| e.as_str())
                    .unwrap_or_default()
                    .to_string();
                (value.clone(), event_type)
            }
            Err(_) => (
                serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()),
                String::new(),
            ),
        };
        let mut event = WebhookEvent::new(source, event_type.clone(), event_id.to_string(), body);
        event.signature = signature.clone();
        event.headers = headers;
        let record_id = self.ledger.record_webhook(event);

        let value = match parsed {
            Ok(value) => value,
            Err(error) => {
                let message = format!("unparseable payload: {}", error);
                self.ledger.finish_webhook(
                    record_id,
                    WebhookStatus::Failed,
                    false,
                    None,
                    Some(message.clone()),
                );
                return Err(GatewayError::Validation(message));
            }
        };

        // Fast path: a previous delivery already fully processed this key.
        if let Some(done) = self.ledger.processed_webhook(source, event_id) {
            tracing::debug!("duplicate of processed event acknowledged");
            self.ledger
                .finish_webhook(record_id, WebhookStatus::Ignored, false, done.payment_id, None);
            return Ok(WebhookResult {
                record_id,
                payment_id: done.payment_id,
                status: WebhookStatus::Ignored,
                duplicate: true,
            });
        }

        // Claim the key. A concurrent duplicate loses the claim and is
        // acknowledged without reprocessing.
        if let Err(holder) = self.ledger.claim_webhook(source, event_id, record_id) {
            tracing::debug!(holder = %holder.id, "event claimed by concurrent delivery");
            self.ledger
                .finish_webhook(record_id, WebhookStatus::Ignored, false, holder.payment_id, None);
            return Ok(WebhookResult {
                record_id,
                payment_id: holder.payment_id,
                status: WebhookStatus::Ignored,
                duplicate: true,
            });
        }
        self.ledger
            .finish_webhook(record_id, WebhookStatus::Processing, false, None, None);

        if !self
            .verifier
            .verify(source, payload, signature.as_deref())?
        {
            let message = "signature verification failed".to_string();
            self.ledger.finish_webhook(
                record_id,
                WebhookStatus::Failed,
                false,
                None,
                Some(message.clone()),
            );
            self.ledger.release_webhook_claim(source, event_id, record_id);
            return Err(GatewayError::Auth(message));
        }

        match self.translate(source, &event_type, &value) {
            Ok(Translation::Ignore) => {
                tracing::debug!(event_type, "event type not handled, acknowledged");
                self.ledger
                    .finish_webhook(record_id, WebhookStatus::Ignored, true, None, None);
                self.ledger.release_webhook_claim(source, event_id, record_id);
                Ok(WebhookResult {
                    record_id,
                    payment_id: None,
                    status: WebhookStatus::Ignored,
                    duplicate: false,
                })
            }
            Ok(Translation::Apply(payment_id, domain_event)) => {
                self.apply_and_finish(record_id, source, event_id, payment_id, domain_event)
                    .await
            }
            Ok(Translation::InvoiceSettled {
                payment_id,
                payment_hash,
            }) => {
                // The invoice's transaction is final the moment the node
                // reports it paid; there is no confirmation counting to wait
                // for on this rail.
                self.settle_invoice_transaction(payment_id, &payment_hash);
                self.apply_and_finish(
                    record_id,
                    source,
                    event_id,
                    payment_id,
                    PaymentEvent::FundingConfirmed,
                )
                .await
            }
            Ok(Translation::Funds {
                address,
                chain,
                amount,
                tx_hash,
                block_number,
                from_address,
            }) => {
                let outcome = self
                    .reconciler
                    .on_funds_observed(&address, chain, amount, &tx_hash, block_number, from_address)
                    .await;
                match outcome {
                    Ok(_) => {
                        let payment_id = self
                            .ledger
                            .address(chain, &address)
                            .and_then(|addr| addr.payment_id);
                        self.ledger.finish_webhook(
                            record_id,
                            WebhookStatus::Processed,
                            true,
                            payment_id,
                            None,
                        );
                        Ok(WebhookResult {
                            record_id,
                            payment_id,
                            status: WebhookStatus::Processed,
                            duplicate: false,
                        })
                    }
                    Err(error) => {
                        self.fail_and_release(record_id, source, event_id, &error);
                        Err(error)
                    }
                }
            }
            Err(error) => {
                self.fail_and_release(record_id, source, event_id, &error);
                Err(error)
            }
        }
    }

    async fn apply_and_finish(
        &self,
        record_id: Uuid,
        source: WebhookSource,
        event_id: &str,
        payment_id: PaymentId,
        domain_event: PaymentEvent,
    ) -> Result<WebhookResult, GatewayError> {
        match self.engine.apply(payment_id, domain_event).await {
            Ok(_) => {
                self.ledger.finish_webhook(
                    record_id,
                    WebhookStatus::Processed,
                    true,
                    Some(payment_id),
                    None,
                );
                Ok(WebhookResult {
                    record_id,
                    payment_id: Some(payment_id),
                    status: WebhookStatus::Processed,
                    duplicate: false,
                })
            }
            Err(error) => {
                self.fail_and_release(record_id, source, event_id, &error);
                Err(error)
            }
        }
    }

    /// Marks the payment's open Lightning transaction confirmed and stamps it
    /// with the payment hash. A no-op when the transaction already settled.
    fn settle_invoice_transaction(&self, payment_id: PaymentId, payment_hash: &TxHash) {
        let open = self
            .ledger
            .transactions_for_payment(payment_id)
            .into_iter()
            .find(|tx| tx.chain == Some(Chain::Lightning) && !tx.status.is_terminal());
        if let Some(mut tx) = open {
            tx.tx_hash = Some(payment_hash.clone());
            tx.confirmations = tx.required_confirmations.max(1);
            tx.status = TransactionStatus::Confirmed;
            tx.updated_at = UnixTimestamp::now();
            self.ledger.put_transaction(tx);
        }
    }

    fn fail_and_release(
        &self,
        record_id: Uuid,
        source: WebhookSource,
        event_id: &str,
        error: &GatewayError,
    ) {
        self.ledger.finish_webhook(
            record_id,
            WebhookStatus::Failed,
            true,
            None,
            Some(error.to_string()),
        );
        self.ledger.release_webhook_claim(source, event_id, record_id);
    }

    fn translate(
        &self,
        source: WebhookSource,
        event_type: &str,
        value: &serde_json::Value,
    ) -> Result<Translation, GatewayError> {
        match source {
            WebhookSource::Processor => self.translate_processor(event_type, value),
            WebhookSource::Blockchain => {
                let funds: BlockchainPayload = parse(value)?;
                Ok(Translation::Funds {
                    address: funds.address,
                    chain: funds.chain,
                    amount: funds.amount,
                    tx_hash: funds.tx_hash,
                    block_number: funds.block_number,
                    from_address: funds.from_address,
                })
            }
            WebhookSource::Lightning => match event_type {
                "invoice.paid" | "invoice.settled" => {
                    let invoice: LightningPayload = parse(value)?;
                    let payment = self
                        .ledger
                        .payment_by_payment_hash(&invoice.payment_hash)
                        .ok_or_else(|| {
                            GatewayError::NotFound(format!(
                                "no payment for payment hash {}",
                                invoice.payment_hash
                            ))
                        })?;
                    Ok(Translation::InvoiceSettled {
                        payment_id: payment.id,
                        payment_hash: invoice.payment_hash,
                    })
                }
                "invoice.expired" => {
                    let invoice: LightningPayload = parse(value)?;
                    let payment = self
                        .ledger
                        .payment_by_payment_hash(&invoice.payment_hash)
                        .ok_or_else(|| {
                            GatewayError::NotFound(format!(
                                "no payment for payment hash {}",
                                invoice.payment_hash
                            ))
                        })?;
                    Ok(Translation::Apply(payment.id, PaymentEvent::Expired))
                }
                _ => Ok(Translation::Ignore),
            },
            WebhookSource::Internal => match event_type {
                "payment.cancel" => {
                    let body: InternalPayload = parse(value)?;
                    Ok(Translation::Apply(body.payment_id, PaymentEvent::CancelRequested))
                }
                "payment.refund" => {
                    let body: InternalPayload = parse(value)?;
                    Ok(Translation::Apply(body.payment_id, PaymentEvent::RefundRequested))
                }
                _ => Ok(Translation::Ignore),
            },
        }
    }

    fn translate_processor(
        &self,
        event_type: &str,
        value: &serde_json::Value,
    ) -> Result<Translation, GatewayError> {
        let domain_event = match event_type {
            "payment.authorized" => None,
            "payment.captured" => Some(PaymentEvent::FundingConfirmed),
            "payment.failed" => None,
            "refund.processed" => Some(PaymentEvent::RefundRequested),
            _ => return Ok(Translation::Ignore),
        };

        let entity: ProcessorEntity = parse(
            value
                .pointer("/payload/payment/entity")
                .or_else(|| value.pointer("/payload/refund/entity"))
                .ok_or_else(|| {
                    GatewayError::Validation("processor payload missing entity".to_string())
                })?,
        )?;
        let order_ref = entity.order_id.as_deref().ok_or_else(|| {
            GatewayError::Validation("processor entity missing order_id".to_string())
        })?;
        let payment = self.ledger.payment_by_order_ref(order_ref).ok_or_else(|| {
            GatewayError::NotFound(format!("no payment for order {}", order_ref))
        })?;

        let domain_event = match event_type {
            "payment.authorized" => PaymentEvent::FundingObserved {
                amount: entity.amount.unwrap_or(payment.amount),
            },
            "payment.failed" => PaymentEvent::SettlementFailed {
                reason: entity
                    .error_description
                    .unwrap_or_else(|| "processor reported failure".to_string()),
            },
            _ => match domain_event {
                Some(event) => event,
                // Unreachable: the first match returned Ignore for other types.
                None => return Ok(Translation::Ignore),
            },
        };
        Ok(Translation::Apply(payment.id, domain_event))
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<T, GatewayError> {
    serde_json::from_value(value.clone())
        .map_err(|e| GatewayError::Validation(format!("malformed payload: {}", e)))
}
