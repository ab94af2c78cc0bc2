//! The authoritative store of payments, transactions, watched addresses and
//! webhook audit records.
//!
//! All components read and mutate through this type; none of them touch each
//! other's state directly. Two invariants are enforced here at the storage
//! level because concurrent writers bypass any in-process check:
//!
//! - `(address, chain)` is unique across [`CryptoAddress`] rows, and at most
//!   one active address per chain may be linked to a non-terminal payment;
//! - `(source, event_id)` is unique *in effect* for webhook events: duplicate
//!   deliveries are stored, but only one claim per key can ever be processed.
//!
//! The ledger also owns the per-payment serialization point: a keyed async
//! mutex handed to the state machine engine so check-and-apply is atomic per
//! payment while distinct payments proceed fully in parallel.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chain::Chain;
use crate::error::GatewayError;
use crate::timestamp::UnixTimestamp;
use crate::types::{
    CryptoAddress, Payment, PaymentId, PaymentStatus, RailDetails, Transaction, TransactionId,
    TransactionStatus, TxHash, WebhookEvent, WebhookSource, WebhookStatus,
};

type AddressKey = (Chain, String);

#[derive(Default)]
pub struct Ledger {
    payments: DashMap<PaymentId, Payment>,
    payments_by_order: DashMap<String, PaymentId>,
    payments_by_payment_hash: DashMap<TxHash, PaymentId>,
    transactions: DashMap<TransactionId, Transaction>,
    tx_ids_by_payment: DashMap<PaymentId, Vec<TransactionId>>,
    tx_by_chain_hash: DashMap<(Chain, TxHash), TransactionId>,
    addresses: DashMap<AddressKey, CryptoAddress>,
    addr_keys_by_payment: DashMap<PaymentId, Vec<AddressKey>>,
    webhook_events: DashMap<Uuid, WebhookEvent>,
    webhook_claims: DashMap<(WebhookSource, String), Uuid>,
    locks: DashMap<PaymentId, Arc<Mutex<()>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The serialization point for one payment. All event applications for
    /// the same payment id must hold this lock across check-and-apply.
    pub fn payment_lock(&self, payment_id: PaymentId) -> Arc<Mutex<()>> {
        self.locks
            .entry(payment_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------

    pub fn insert_payment(&self, payment: Payment) -> Result<(), GatewayError> {
        if self.payments.contains_key(&payment.id) {
            return Err(GatewayError::Conflict(format!(
                "payment {} already exists",
                payment.id
            )));
        }
        self.index_payment(&payment);
        self.payments.insert(payment.id, payment);
        Ok(())
    }

    pub fn payment(&self, payment_id: PaymentId) -> Option<Payment> {
        self.payments.get(&payment_id).map(|p| p.clone())
    }

    /// Writes back a payment row. The caller must hold the payment lock.
    pub fn put_payment(&self, payment: Payment) {
        self.index_payment(&payment);
        self.payments.insert(payment.id, payment);
    }

    fn index_payment(&self, payment: &Payment) {
        match &payment.rail {
            RailDetails::Processor {
                order_ref: Some(order_ref),
                ..
            } => {
                self.payments_by_order
                    .insert(order_ref.clone(), payment.id);
            }
            RailDetails::Lightning { payment_hash, .. } => {
                self.payments_by_payment_hash
                    .insert(payment_hash.clone(), payment.id);
            }
            _ => {}
        }
    }

    pub fn payment_by_order_ref(&self, order_ref: &str) -> Option<Payment> {
        let id = self.payments_by_order.get(order_ref)?;
        self.payment(*id)
    }

    pub fn payment_by_payment_hash(&self, payment_hash: &TxHash) -> Option<Payment> {
        let id = self.payments_by_payment_hash.get(payment_hash)?;
        self.payment(*id)
    }

    /// Payments in `pending`/`processing` whose expiry has passed.
    pub fn expired_payments(&self, now: UnixTimestamp) -> Vec<PaymentId> {
        self.payments
            .iter()
            .filter(|entry| {
                let p = entry.value();
                matches!(p.status, PaymentStatus::Pending | PaymentStatus::Processing)
                    && p.expires_at.is_some_and(|expires_at| expires_at.is_past(now))
            })
            .map(|entry| entry.value().id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn insert_transaction(&self, tx: Transaction) -> Result<(), GatewayError> {
        if self.transactions.contains_key(&tx.id) {
            return Err(GatewayError::Conflict(format!(
                "transaction {} already exists",
                tx.id
            )));
        }
        self.tx_ids_by_payment
            .entry(tx.payment_id)
            .or_default()
            .push(tx.id);
        self.index_transaction_hash(&tx);
        self.transactions.insert(tx.id, tx);
        Ok(())
    }

    pub fn transaction(&self, tx_id: TransactionId) -> Option<Transaction> {
        self.transactions.get(&tx_id).map(|t| t.clone())
    }

    pub fn put_transaction(&self, tx: Transaction) {
        self.index_transaction_hash(&tx);
        self.transactions.insert(tx.id, tx);
    }

    fn index_transaction_hash(&self, tx: &Transaction) {
        if let (Some(chain), Some(hash)) = (tx.chain, tx.tx_hash.as_ref()) {
            self.tx_by_chain_hash.insert((chain, hash.clone()), tx.id);
        }
    }

    pub fn transaction_by_chain_hash(&self, chain: Chain, tx_hash: &TxHash) -> Option<Transaction> {
        let id = self.tx_by_chain_hash.get(&(chain, tx_hash.clone()))?;
        self.transaction(*id)
    }

    pub fn transactions_for_payment(&self, payment_id: PaymentId) -> Vec<Transaction> {
        let Some(ids) = self.tx_ids_by_payment.get(&payment_id) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.transaction(*id)).collect()
    }

    /// Attaches an observed funding transaction hash to the payment's open
    /// settlement transaction, making it discoverable by the confirmation
    /// tracker. A no-op if the hash is already attached elsewhere or the
    /// payment has no open transaction on that chain.
    pub fn attach_funding_tx(
        &self,
        payment_id: PaymentId,
        chain: Chain,
        tx_hash: &TxHash,
        block_number: Option<u64>,
        from_address: Option<String>,
    ) -> Option<Transaction> {
        if self.tx_by_chain_hash.contains_key(&(chain, tx_hash.clone())) {
            return self.transaction_by_chain_hash(chain, tx_hash);
        }
        let open = self.transactions_for_payment(payment_id).into_iter().find(|tx| {
            tx.chain == Some(chain) && tx.tx_hash.is_none() && !tx.status.is_terminal()
        })?;
        let mut tx = open;
        tx.tx_hash = Some(tx_hash.clone());
        tx.block_number = block_number;
        if from_address.is_some() {
            tx.from_address = from_address;
        }
        tx.updated_at = UnixTimestamp::now();
        self.put_transaction(tx.clone());
        Some(tx)
    }

    /// Non-terminal on-chain transactions with a known hash, for the poller.
    pub fn watched_transactions(&self) -> Vec<Transaction> {
        self.transactions
            .iter()
            .filter(|entry| {
                let tx = entry.value();
                !tx.status.is_terminal() && tx.chain.is_some() && tx.tx_hash.is_some()
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Crypto addresses
    // ------------------------------------------------------------------

    pub fn insert_address(&self, address: CryptoAddress) -> Result<(), GatewayError> {
        let key = (address.chain, address.address.clone());
        if self.addresses.contains_key(&key) {
            return Err(GatewayError::Conflict(format!(
                "address {} on {} already watched",
                address.address, address.chain
            )));
        }
        if let Some(payment_id) = address.payment_id {
            let has_active_on_chain = self
                .addr_keys_by_payment
                .get(&payment_id)
                .map(|keys| {
                    keys.iter().any(|k| {
                        k.0 == address.chain
                            && self
                                .addresses
                                .get(k)
                                .is_some_and(|existing| existing.is_active)
                    })
                })
                .unwrap_or(false);
            if has_active_on_chain {
                return Err(GatewayError::Conflict(format!(
                    "payment {} already has an active {} address",
                    payment_id, address.chain
                )));
            }
            self.addr_keys_by_payment
                .entry(payment_id)
                .or_default()
                .push(key.clone());
        }
        self.addresses.insert(key, address);
        Ok(())
    }

    pub fn address(&self, chain: Chain, address: &str) -> Option<CryptoAddress> {
        self.addresses
            .get(&(chain, address.to_string()))
            .map(|a| a.clone())
    }

    /// Mutates an address row atomically under its shard lock; concurrent
    /// observers of the same address serialize here, which is what makes the
    /// received-amount accumulation and tx-hash dedup race-free.
    pub fn with_address_mut<R>(
        &self,
        chain: Chain,
        address: &str,
        f: impl FnOnce(&mut CryptoAddress) -> R,
    ) -> Option<R> {
        let mut entry = self.addresses.get_mut(&(chain, address.to_string()))?;
        let result = f(entry.value_mut());
        entry.updated_at = UnixTimestamp::now();
        Some(result)
    }

    /// Deactivates every address linked to the payment. Called by the engine
    /// once the payment reaches a terminal state.
    pub fn deactivate_addresses_for(&self, payment_id: PaymentId) {
        let Some(keys) = self
            .addr_keys_by_payment
            .get(&payment_id)
            .map(|keys| keys.clone())
        else {
            return;
        };
        for key in keys {
            if let Some(mut addr) = self.addresses.get_mut(&key) {
                addr.is_active = false;
                addr.updated_at = UnixTimestamp::now();
            }
        }
    }

    // ------------------------------------------------------------------
    // Webhook events
    // ------------------------------------------------------------------

    /// Persists the raw event immediately, before any verification or side
    /// effect. Audit-first: every delivery leaves a row.
    pub fn record_webhook(&self, event: WebhookEvent) -> Uuid {
        let id = event.id;
        self.webhook_events.insert(id, event);
        id
    }

    pub fn webhook_event(&self, id: Uuid) -> Option<WebhookEvent> {
        self.webhook_events.get(&id).map(|e| e.clone())
    }

    /// Claims the `(source, event_id)` key for processing. Returns the event
    /// currently holding the claim if another delivery got there first — the
    /// caller short-circuits instead of reapplying.
    pub fn claim_webhook(
        &self,
        source: WebhookSource,
        event_id: &str,
        claimant: Uuid,
    ) -> Result<(), WebhookEvent> {
        let key = (source, event_id.to_string());
        let entry = self.webhook_claims.entry(key).or_insert(claimant);
        let holder = *entry.value();
        drop(entry);
        if holder == claimant {
            Ok(())
        } else {
            Err(self
                .webhook_event(holder)
                .unwrap_or_else(|| WebhookEvent::new(source, String::new(), event_id.to_string(), serde_json::Value::Null)))
        }
    }

    /// Releases a claim after a failed or ignored processing attempt so a
    /// later redelivery may try again. Processed claims are never released.
    pub fn release_webhook_claim(&self, source: WebhookSource, event_id: &str, claimant: Uuid) {
        let key = (source, event_id.to_string());
        self.webhook_claims
            .remove_if(&key, |_, holder| *holder == claimant);
    }

    /// The processed record for a dedup key, if any.
    pub fn processed_webhook(&self, source: WebhookSource, event_id: &str) -> Option<WebhookEvent> {
        let key = (source, event_id.to_string());
        let holder = *self.webhook_claims.get(&key)?;
        self.webhook_event(holder)
            .filter(|e| e.status == WebhookStatus::Processed)
    }

    /// Moves a webhook record to a new processing status. Records that have
    /// already reached a terminal status are left untouched.
    pub fn finish_webhook(
        &self,
        id: Uuid,
        status: WebhookStatus,
        signature_verified: bool,
        payment_id: Option<PaymentId>,
        error_message: Option<String>,
    ) {
        let Some(mut event) = self.webhook_events.get_mut(&id) else {
            return;
        };
        if event.status.is_terminal() {
            return;
        }
        event.status = status;
        event.signature_verified = signature_verified;
        if payment_id.is_some() {
            event.payment_id = payment_id;
        }
        if error_message.is_some() {
            event.error_message = error_message;
        }
        if status.is_terminal() {
            event.processed_at = Some(UnixTimestamp::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Currency, PaymentMethod, TransactionType};

    fn crypto_payment(chain: Chain, address: &str) -> Payment {
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
                chain,
                address: address.to_string(),
                tx_hash: None,
            },
            frozen: false,
            expires_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_address_unique_per_chain() {
        let ledger = Ledger::new();
        let addr = CryptoAddress::new("0xabc".into(), Chain::Ethereum, None, 100);
        ledger.insert_address(addr.clone()).unwrap();
        assert!(matches!(
            ledger.insert_address(addr),
            Err(GatewayError::Conflict(_))
        ));
        // Same address string on another chain is a different row.
        let other = CryptoAddress::new("0xabc".into(), Chain::Polygon, None, 100);
        ledger.insert_address(other).unwrap();
    }

    #[test]
    fn test_one_active_address_per_payment_per_chain() {
        let ledger = Ledger::new();
        let payment = crypto_payment(Chain::Ethereum, "0xaaa");
        let payment_id = payment.id;
        ledger.insert_payment(payment).unwrap();
        ledger
            .insert_address(CryptoAddress::new(
                "0xaaa".into(),
                Chain::Ethereum,
                Some(payment_id),
                100,
            ))
            .unwrap();
        let second = CryptoAddress::new("0xbbb".into(), Chain::Ethereum, Some(payment_id), 100);
        assert!(matches!(
            ledger.insert_address(second),
            Err(GatewayError::Conflict(_))
        ));
        // After deactivation a fresh address may be linked.
        ledger.deactivate_addresses_for(payment_id);
        let third = CryptoAddress::new("0xccc".into(), Chain::Ethereum, Some(payment_id), 100);
        ledger.insert_address(third).unwrap();
    }

    #[test]
    fn test_webhook_claim_is_exclusive() {
        let ledger = Ledger::new();
        let first = WebhookEvent::new(
            WebhookSource::Processor,
            "payment.captured".into(),
            "evt_1".into(),
            serde_json::json!({}),
        );
        let second = WebhookEvent::new(
            WebhookSource::Processor,
            "payment.captured".into(),
            "evt_1".into(),
            serde_json::json!({}),
        );
        let first_id = ledger.record_webhook(first);
        let second_id = ledger.record_webhook(second);

        assert!(ledger
            .claim_webhook(WebhookSource::Processor, "evt_1", first_id)
            .is_ok());
        assert!(ledger
            .claim_webhook(WebhookSource::Processor, "evt_1", second_id)
            .is_err());

        // A released claim can be retaken; a processed one cannot.
        ledger.release_webhook_claim(WebhookSource::Processor, "evt_1", first_id);
        assert!(ledger
            .claim_webhook(WebhookSource::Processor, "evt_1", second_id)
            .is_ok());
        ledger.finish_webhook(second_id, WebhookStatus::Processed, true, None, None);
        assert!(ledger
            .processed_webhook(WebhookSource::Processor, "evt_1")
            .is_some());
    }

    #[test]
    fn test_finish_webhook_is_write_once() {
        let ledger = Ledger::new();
        let event = WebhookEvent::new(
            WebhookSource::Processor,
            "payment.captured".into(),
            "evt_2".into(),
            serde_json::json!({}),
        );
        let id = ledger.record_webhook(event);
        ledger.finish_webhook(id, WebhookStatus::Failed, false, None, Some("bad sig".into()));
        ledger.finish_webhook(id, WebhookStatus::Processed, true, None, None);
        let stored = ledger.webhook_event(id).unwrap();
        assert_eq!(stored.status, WebhookStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("bad sig"));
    }

    #[test]
    fn test_attach_funding_tx_indexes_hash() {
        let ledger = Ledger::new();
        let payment = crypto_payment(Chain::Ethereum, "0xaaa");
        let payment_id = payment.id;
        ledger.insert_payment(payment).unwrap();
        ledger
            .insert_transaction(Transaction::new(
                payment_id,
                TransactionType::Payment,
                100,
                Currency::USDT,
                Some(Chain::Ethereum),
                2,
            ))
            .unwrap();

        let hash = TxHash::from("0xdeadbeef");
        let tx = ledger
            .attach_funding_tx(payment_id, Chain::Ethereum, &hash, Some(10), None)
            .unwrap();
        assert_eq!(tx.tx_hash, Some(hash.clone()));
        assert_eq!(tx.block_number, Some(10));
        let found = ledger.transaction_by_chain_hash(Chain::Ethereum, &hash).unwrap();
        assert_eq!(found.id, tx.id);
    }
}
