//! Stand-in rail adapters.
//!
//! Custody, processor SDKs and chain RPC glue live outside this service.
//! These adapters satisfy the collaborator traits so the gateway runs
//! end-to-end on its own: addresses and order references are generated
//! locally, webhook authenticity is a shared-secret check, and the chain
//! client reports upstream unavailability until an RPC adapter replaces it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::env;
use uuid::Uuid;

use crate::chain::{Chain, ChainClient, ChainTransaction};
use crate::error::GatewayError;
use crate::gateway::{DepositAddressProvider, LightningInvoice, LightningNode, ProcessorClient};
use crate::types::{TxHash, WebhookSource};

/// Generates order references locally instead of calling a processor API.
pub struct LocalOrderBook;

#[async_trait]
impl ProcessorClient for LocalOrderBook {
    async fn create_order(
        &self,
        _amount: i64,
        _currency: crate::types::Currency,
        receipt: &str,
    ) -> Result<String, GatewayError> {
        Ok(format!("order_{}", receipt))
    }
}

/// Derives unique per-payment deposit addresses locally, standing in for an
/// HD-wallet derivation service.
pub struct LocalAddressBook;

#[async_trait]
impl DepositAddressProvider for LocalAddressBook {
    async fn next_address(&self, chain: Chain) -> Result<String, GatewayError> {
        Ok(format!("{}:{}", chain, Uuid::new_v4().simple()))
    }
}

/// Issues synthetic invoices, standing in for a Lightning node.
pub struct LocalInvoiceBook;

#[async_trait]
impl LightningNode for LocalInvoiceBook {
    async fn create_invoice(
        &self,
        amount_sat: i64,
        _description: Option<&str>,
    ) -> Result<LightningInvoice, GatewayError> {
        let payment_hash = TxHash(Uuid::new_v4().simple().to_string());
        Ok(LightningInvoice {
            invoice: format!("lnrg{}x{}", amount_sat, payment_hash),
            payment_hash,
        })
    }
}

/// Shared-secret webhook verification.
///
/// Secrets come from `WEBHOOK_SECRET_PROCESSOR`, `WEBHOOK_SECRET_BLOCKCHAIN`,
/// `WEBHOOK_SECRET_LIGHTNING` and `WEBHOOK_SECRET_INTERNAL`. A source without
/// a configured secret accepts every delivery, which is the development mode.
pub struct SharedSecretVerifier {
    secrets: HashMap<WebhookSource, String>,
}

impl SharedSecretVerifier {
    pub fn from_env() -> Self {
        let mut secrets = HashMap::new();
        for (source, var) in [
            (WebhookSource::Processor, "WEBHOOK_SECRET_PROCESSOR"),
            (WebhookSource::Blockchain, "WEBHOOK_SECRET_BLOCKCHAIN"),
            (WebhookSource::Lightning, "WEBHOOK_SECRET_LIGHTNING"),
            (WebhookSource::Internal, "WEBHOOK_SECRET_INTERNAL"),
        ] {
            if let Ok(secret) = env::var(var) {
                secrets.insert(source, secret);
            }
        }
        if secrets.is_empty() {
            tracing::warn!("no webhook secrets configured, accepting all deliveries");
        }
        Self { secrets }
    }

    #[cfg(test)]
    pub fn with_secret(source: WebhookSource, secret: &str) -> Self {
        Self {
            secrets: HashMap::from([(source, secret.to_string())]),
        }
    }
}

impl crate::webhook::SignatureVerifier for SharedSecretVerifier {
    fn verify(
        &self,
        source: WebhookSource,
        _payload: &[u8],
        signature: Option<&str>,
    ) -> Result<bool, GatewayError> {
        match self.secrets.get(&source) {
            None => Ok(true),
            Some(secret) => Ok(signature == Some(secret.as_str())),
        }
    }
}

/// Chain client used until an RPC adapter is wired in. Every call reports the
/// upstream as unavailable; the poller retries on its next tick.
pub struct UnconfiguredChainClient;

#[async_trait]
impl ChainClient for UnconfiguredChainClient {
    async fn current_block_height(&self, chain: Chain) -> Result<u64, GatewayError> {
        Err(GatewayError::Transient(format!(
            "no RPC endpoint configured for {}",
            chain
        )))
    }

    async fn get_transaction(
        &self,
        chain: Chain,
        _tx_hash: &TxHash,
    ) -> Result<Option<ChainTransaction>, GatewayError> {
        Err(GatewayError::Transient(format!(
            "no RPC endpoint configured for {}",
            chain
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::SignatureVerifier;

    #[test]
    fn test_shared_secret_verifier() {
        let verifier = SharedSecretVerifier::with_secret(WebhookSource::Processor, "s3cret");
        assert!(verifier
            .verify(WebhookSource::Processor, b"{}", Some("s3cret"))
            .unwrap());
        assert!(!verifier
            .verify(WebhookSource::Processor, b"{}", Some("wrong"))
            .unwrap());
        assert!(!verifier
            .verify(WebhookSource::Processor, b"{}", None)
            .unwrap());
        // Sources without a secret accept everything.
        assert!(verifier
            .verify(WebhookSource::Blockchain, b"{}", None)
            .unwrap());
    }

    #[tokio::test]
    async fn test_local_address_book_is_unique_per_call() {
        let book = LocalAddressBook;
        let a = book.next_address(Chain::Ethereum).await.unwrap();
        let b = book.next_address(Chain::Ethereum).await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("ethereum:"));
    }
}
