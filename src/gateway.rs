//! Payment intent creation and the outward-facing command surface.
//!
//! Creation composes the rail-specific setup: a processor order for fiat
//! instruments, a watched deposit address plus a pending settlement
//! transaction for on-chain methods, an invoice for Lightning. The external
//! collaborators behind those steps sit behind traits so the core is testable
//! without live upstreams.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

use crate::chain::Chain;
use crate::engine::{Applied, StateMachineEngine};
use crate::error::GatewayError;
use crate::ledger::Ledger;
use crate::timestamp::UnixTimestamp;
use crate::types::{
    CryptoAddress, Currency, Payment, PaymentEvent, PaymentId, PaymentMethod, RailDetails,
    Transaction, TransactionType, TxHash,
};

/// Issues fresh deposit addresses for on-chain settlement.
#[async_trait]
pub trait DepositAddressProvider: Send + Sync {
    async fn next_address(&self, chain: Chain) -> Result<String, GatewayError>;
}

/// Creates orders with the third-party processor (card/UPI rails).
#[async_trait]
pub trait ProcessorClient: Send + Sync {
    /// Returns the processor's order reference for the new order.
    async fn create_order(
        &self,
        amount: i64,
        currency: Currency,
        receipt: &str,
    ) -> Result<String, GatewayError>;
}

pub struct LightningInvoice {
    pub invoice: String,
    pub payment_hash: TxHash,
}

/// Creates Lightning invoices against the node.
#[async_trait]
pub trait LightningNode: Send + Sync {
    async fn create_invoice(
        &self,
        amount_sat: i64,
        description: Option<&str>,
    ) -> Result<LightningInvoice, GatewayError>;
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreatePaymentRequest {
    /// Amount in integer minor units of `currency`.
    pub amount: i64,
    pub currency: Currency,
    pub method: PaymentMethod,
    pub order_id: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

pub struct PaymentGateway {
    ledger: Arc<Ledger>,
    engine: Arc<StateMachineEngine>,
    processor: Arc<dyn ProcessorClient>,
    deposit_addresses: Arc<dyn DepositAddressProvider>,
    lightning: Arc<dyn LightningNode>,
    payment_ttl_secs: u64,
    /// Per-chain overrides of the confirmation threshold.
    confirmations: HashMap<Chain, u64>,
}

impl PaymentGateway {
    pub fn new(
        ledger: Arc<Ledger>,
        engine: Arc<StateMachineEngine>,
        processor: Arc<dyn ProcessorClient>,
        deposit_addresses: Arc<dyn DepositAddressProvider>,
        lightning: Arc<dyn LightningNode>,
        payment_ttl_secs: u64,
        confirmations: HashMap<Chain, u64>,
    ) -> Self {
        PaymentGateway {
            ledger,
            engine,
            processor,
            deposit_addresses,
            lightning,
            payment_ttl_secs,
            confirmations,
        }
    }

    fn required_confirmations(&self, chain: Chain) -> u64 {
        self.confirmations
            .get(&chain)
            .copied()
            .unwrap_or_else(|| chain.default_required_confirmations())
    }

    /// Creates a payment intent and its rail-specific scaffolding.
    #[instrument(skip(self, request), fields(amount = request.amount, currency = %request.currency, method = %request.method))]
    pub async fn create_payment(
        &self,
        request: CreatePaymentRequest,
    ) -> Result<Payment, GatewayError> {
        if request.amount <= 0 {
            return Err(GatewayError::Validation(
                "amount must be a positive number of minor units".to_string(),
            ));
        }
        validate_pairing(request.method, request.currency)?;

        let id = PaymentId::new();
        let now = UnixTimestamp::now();
        let expires_at = now + self.payment_ttl_secs;

        let rail = match request.method {
            method if method.is_processor() => {
                let receipt = request.order_id.clone().unwrap_or_else(|| id.to_string());
                let order_ref = self
                    .processor
                    .create_order(request.amount, request.currency, &receipt)
                    .await?;
                RailDetails::Processor {
                    order_ref: Some(order_ref),
                    payment_ref: None,
                    signature: None,
                }
            }
            PaymentMethod::Lightning => {
                let invoice = self
                    .lightning
                    .create_invoice(request.amount, request.description.as_deref())
                    .await?;
                RailDetails::Lightning {
                    invoice: invoice.invoice,
                    payment_hash: invoice.payment_hash,
                }
            }
            method => {
                // On-chain methods always map to a chain.
                let chain = method.chain().ok_or_else(|| {
                    GatewayError::Validation(format!("method {} has no settlement rail", method))
                })?;
                let address = self.deposit_addresses.next_address(chain).await?;
                RailDetails::Crypto {
                    chain,
                    address,
                    tx_hash: None,
                }
            }
        };

        let payment = Payment {
            id,
            external_id: None,
            order_id: request.order_id,
            amount: request.amount,
            currency: request.currency,
            status: crate::types::PaymentStatus::Pending,
            method: request.method,
            description: request.description,
            metadata: request.metadata,
            rail: rail.clone(),
            frozen: false,
            expires_at: Some(expires_at),
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.ledger.insert_payment(payment.clone())?;

        match &rail {
            RailDetails::Crypto { chain, address, .. } => {
                self.ledger.insert_address(CryptoAddress::new(
                    address.clone(),
                    *chain,
                    Some(id),
                    request.amount,
                ))?;
                self.ledger.insert_transaction(Transaction::new(
                    id,
                    TransactionType::Payment,
                    request.amount,
                    request.currency,
                    Some(*chain),
                    self.required_confirmations(*chain),
                ))?;
            }
            RailDetails::Lightning { .. } => {
                self.ledger.insert_transaction(Transaction::new(
                    id,
                    TransactionType::Payment,
                    request.amount,
                    request.currency,
                    Some(Chain::Lightning),
                    self.required_confirmations(Chain::Lightning),
                ))?;
            }
            RailDetails::Processor { .. } => {}
        }

        tracing::info!(payment_id = %id, "payment created");
        Ok(payment)
    }

    pub fn get_payment(
        &self,
        payment_id: PaymentId,
    ) -> Result<(Payment, Vec<Transaction>), GatewayError> {
        let payment = self
            .ledger
            .payment(payment_id)
            .ok_or_else(|| GatewayError::NotFound(format!("payment {}", payment_id)))?;
        let transactions = self.ledger.transactions_for_payment(payment_id);
        Ok((payment, transactions))
    }

    pub async fn cancel_payment(&self, payment_id: PaymentId) -> Result<Applied, GatewayError> {
        self.engine
            .apply(payment_id, PaymentEvent::CancelRequested)
            .await
    }

    pub async fn refund_payment(&self, payment_id: PaymentId) -> Result<Applied, GatewayError> {
        self.engine
            .apply(payment_id, PaymentEvent::RefundRequested)
            .await
    }
}

/// Currency/method pairing: processor instruments settle fiat, Lightning
/// settles BTC, chain methods settle crypto assets.
fn validate_pairing(method: PaymentMethod, currency: Currency) -> Result<(), GatewayError> {
    let valid = if method.is_processor() {
        currency.is_fiat()
    } else if method == PaymentMethod::Lightning {
        currency == Currency::BTC
    } else {
        !currency.is_fiat() && currency != Currency::BTC
    };
    if valid {
        Ok(())
    } else {
        Err(GatewayError::Validation(format!(
            "currency {} cannot settle via {}",
            currency, method
        )))
    }
}
