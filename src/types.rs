//! Domain vocabulary of the reconciliation core.
//!
//! Everything the state machine, reconciler, and webhook ingress exchange is
//! defined here: payment and transaction records, watched crypto addresses,
//! webhook audit rows, and the single [`PaymentEvent`] vocabulary that all
//! rails are translated into before they reach the engine.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::chain::Chain;
use crate::timestamp::UnixTimestamp;

/// Identifier of a [`Payment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub Uuid);

impl PaymentId {
    pub fn new() -> Self {
        PaymentId(Uuid::new_v4())
    }
}

impl Default for PaymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An on-chain transaction hash (or Lightning payment hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TxHash {
    fn from(s: &str) -> Self {
        TxHash(s.to_string())
    }
}

/// The seven payer-visible payment states.
///
/// `pending` is initial. `completed`, `failed`, `cancelled`, `refunded` and
/// `expired` are terminal, except that `completed` may still move to
/// `refunded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    Expired,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

/// How the payer chose to settle: a processor instrument or a specific chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Upi,
    NetBanking,
    Wallet,
    Ethereum,
    Polygon,
    Bsc,
    Arbitrum,
    Solana,
    Lightning,
}

impl PaymentMethod {
    /// The chain this method settles on, `None` for processor rails.
    pub fn chain(&self) -> Option<Chain> {
        match self {
            PaymentMethod::Ethereum => Some(Chain::Ethereum),
            PaymentMethod::Polygon => Some(Chain::Polygon),
            PaymentMethod::Bsc => Some(Chain::Bsc),
            PaymentMethod::Arbitrum => Some(Chain::Arbitrum),
            PaymentMethod::Solana => Some(Chain::Solana),
            PaymentMethod::Lightning => Some(Chain::Lightning),
            _ => None,
        }
    }

    pub fn is_processor(&self) -> bool {
        matches!(
            self,
            PaymentMethod::Card
                | PaymentMethod::Upi
                | PaymentMethod::NetBanking
                | PaymentMethod::Wallet
        )
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

/// Closed set of supported fiat and crypto assets. Amounts are always integer
/// minor units of one of these; the gateway never handles floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum Currency {
    INR,
    USD,
    EUR,
    ETH,
    MATIC,
    BNB,
    SOL,
    BTC,
    USDT,
    USDC,
}

impl Currency {
    pub fn is_fiat(&self) -> bool {
        matches!(self, Currency::INR | Currency::USD | Currency::EUR)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

/// Rail-specific payload attached to a payment, tagged by rail instead of a
/// flat record of nullable columns so only valid fields exist per method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rail", rename_all = "snake_case")]
pub enum RailDetails {
    /// Third-party processor settlement (card/UPI/net-banking/wallet).
    Processor {
        order_ref: Option<String>,
        payment_ref: Option<String>,
        signature: Option<String>,
    },
    /// Direct on-chain settlement against a watched deposit address.
    Crypto {
        chain: Chain,
        address: String,
        tx_hash: Option<TxHash>,
    },
    /// Bitcoin Lightning invoice settlement.
    Lightning { invoice: String, payment_hash: TxHash },
}

/// One purchase/settlement intent. Owned exclusively by the [`Ledger`];
/// mutated only through the state machine engine.
///
/// [`Ledger`]: crate::ledger::Ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub external_id: Option<String>,
    pub order_id: Option<String>,
    /// Amount in integer minor units.
    pub amount: i64,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub method: PaymentMethod,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub rail: RailDetails,
    /// Set on fatal inconsistency; a frozen payment accepts no further
    /// automatic transitions.
    pub frozen: bool,
    pub expires_at: Option<UnixTimestamp>,
    pub completed_at: Option<UnixTimestamp>,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Payment,
    Refund,
    Transfer,
    Withdrawal,
}

/// `confirmed`, `failed` and `cancelled` are terminal; `confirming` means the
/// transaction is in a block but below its confirmation threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirming,
    Confirmed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Confirmed
                | TransactionStatus::Failed
                | TransactionStatus::Cancelled
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

/// One settlement movement belonging to exactly one [`Payment`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub payment_id: PaymentId,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: i64,
    pub fee: Option<i64>,
    pub currency: Currency,
    pub tx_hash: Option<TxHash>,
    /// Block containing the transaction; the confirmation base.
    pub block_number: Option<u64>,
    /// Non-decreasing while the status is non-terminal.
    pub confirmations: u64,
    pub required_confirmations: u64,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub chain: Option<Chain>,
    pub raw_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
}

impl Transaction {
    pub fn new(
        payment_id: PaymentId,
        tx_type: TransactionType,
        amount: i64,
        currency: Currency,
        chain: Option<Chain>,
        required_confirmations: u64,
    ) -> Self {
        let now = UnixTimestamp::now();
        Transaction {
            id: TransactionId::new(),
            payment_id,
            tx_type,
            status: TransactionStatus::Pending,
            amount,
            fee: None,
            currency,
            tx_hash: None,
            block_number: None,
            confirmations: 0,
            required_confirmations,
            from_address: None,
            to_address: None,
            chain,
            raw_data: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A watched receive address, unique per `(address, chain)`.
///
/// The payment link is a weak back-reference: address rows may outlive or
/// predate the link. At most one active address per chain may be linked to a
/// non-terminal payment; the row is deactivated once that payment reaches a
/// terminal state so a stale receive address is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoAddress {
    pub address: String,
    pub chain: Chain,
    pub payment_id: Option<PaymentId>,
    pub is_active: bool,
    /// Amount in minor units this address is expected to receive.
    pub expected_amount: i64,
    /// Monotonically accumulated sum of distinct observed fundings.
    pub received_amount: i64,
    /// Funding transactions already counted, keyed by hash so a polling loop
    /// observing the same transfer twice cannot double-count it.
    pub funding_txs: HashSet<TxHash>,
    /// Latch: `FundingObserved` fires exactly once, at first crossing of
    /// `expected_amount`.
    pub funding_emitted: bool,
    /// Surplus received beyond `expected_amount`; flagged for manual handling,
    /// never auto-refunded.
    pub overpaid: bool,
    pub last_checked_at: Option<UnixTimestamp>,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
}

impl CryptoAddress {
    pub fn new(address: String, chain: Chain, payment_id: Option<PaymentId>, expected_amount: i64) -> Self {
        let now = UnixTimestamp::now();
        CryptoAddress {
            address,
            chain,
            payment_id,
            is_active: true,
            expected_amount,
            received_amount: 0,
            funding_txs: HashSet::new(),
            funding_emitted: false,
            overpaid: false,
            last_checked_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Where a webhook came from; scopes the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    Processor,
    Blockchain,
    Lightning,
    Internal,
}

impl fmt::Display for WebhookSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

impl FromStr for WebhookSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let json = format!("\"{}\"", s);
        serde_json::from_str(&json).map_err(|e| format!("unknown webhook source '{}': {}", s, e))
    }
}

/// Processing lifecycle of a stored webhook event. `processed`, `failed` and
/// `ignored` are terminal; the record is never mutated after reaching one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Received,
    Processing,
    Processed,
    Failed,
    Ignored,
}

impl WebhookStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WebhookStatus::Processed | WebhookStatus::Failed | WebhookStatus::Ignored
        )
    }
}

/// Audit record of one inbound notification. Created on receipt regardless of
/// outcome; duplicates of the same `(source, event_id)` are stored but applied
/// at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub source: WebhookSource,
    pub event_type: String,
    pub event_id: String,
    pub payment_id: Option<PaymentId>,
    pub status: WebhookStatus,
    pub payload: serde_json::Value,
    pub headers: Option<serde_json::Value>,
    pub signature: Option<String>,
    pub signature_verified: bool,
    pub error_message: Option<String>,
    pub processed_at: Option<UnixTimestamp>,
    pub created_at: UnixTimestamp,
}

impl WebhookEvent {
    pub fn new(
        source: WebhookSource,
        event_type: String,
        event_id: String,
        payload: serde_json::Value,
    ) -> Self {
        WebhookEvent {
            id: Uuid::new_v4(),
            source,
            event_type,
            event_id,
            payment_id: None,
            status: WebhookStatus::Received,
            payload,
            headers: None,
            signature: None,
            signature_verified: false,
            error_message: None,
            processed_at: None,
            created_at: UnixTimestamp::now(),
        }
    }
}

/// The uniform event vocabulary consumed by the state machine engine. All
/// rails — processor webhooks, confirmation verdicts, reconciliation verdicts,
/// expiry sweeps — are translated into these before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    /// Funds for the payment were observed but are not yet final.
    FundingObserved { amount: i64 },
    /// The settlement reached its finality threshold.
    FundingConfirmed,
    /// Settlement failed on the rail (not a gateway error).
    SettlementFailed { reason: String },
    CancelRequested,
    RefundRequested,
    Expired,
}

impl PaymentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PaymentEvent::FundingObserved { .. } => "funding_observed",
            PaymentEvent::FundingConfirmed => "funding_confirmed",
            PaymentEvent::SettlementFailed { .. } => "settlement_failed",
            PaymentEvent::CancelRequested => "cancel_requested",
            PaymentEvent::RefundRequested => "refund_requested",
            PaymentEvent::Expired => "expired",
        }
    }
}

/// A committed state transition, published to subscribers on every applied
/// (non-no-op) event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentUpdate {
    pub payment_id: PaymentId,
    pub previous_status: PaymentStatus,
    pub new_status: PaymentStatus,
    pub timestamp: UnixTimestamp,
}
