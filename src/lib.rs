//! Payment gateway core: the reconciliation and confirmation engine.
//!
//! This crate unifies two settlement rails under one authoritative ledger: a
//! third-party processor for card/UPI/net-banking/wallet payments, and direct
//! cryptocurrency payments on EVM chains, Solana and Bitcoin Lightning. Its
//! job is turning asynchronous, at-least-once signals — webhooks, chain
//! polling observations, timers — into exactly-once payment state effects.
//!
//! # Overview
//!
//! Every signal, whatever its rail, is translated into one [`types::PaymentEvent`]
//! and applied by the [`engine::StateMachineEngine`] under per-payment mutual
//! exclusion. Duplicate and late-arriving signals are absorbed idempotently:
//! a terminal payment never moves again (except `completed` → `refunded`), and
//! an absorbed event never re-fires a notification.
//!
//! # Modules
//!
//! - [`ledger`] — Authoritative in-process store of payments, transactions, watched addresses and webhook audit records.
//! - [`engine`] — The state machine applying domain events under per-payment serialization.
//! - [`webhook`] — Audit-first webhook intake with claim-based `(source, event_id)` deduplication.
//! - [`confirm`] — Confirmation counting, threshold verdicts, and the chain poller.
//! - [`reconcile`] — Matching observed on-chain fund movements to watched deposit addresses.
//! - [`sweeper`] — Periodic expiry of stale pending payments.
//! - [`notify`] — Broadcast fan-out of committed transitions to subscribers.
//! - [`gateway`] — Payment creation and the outward command surface.
//! - [`handlers`] — Axum HTTP routes, including the SSE update feed.
//! - [`rails`] — Stand-in adapters for the external rail collaborators.
//! - [`chain`] — Supported chains and the chain RPC collaborator trait.
//! - [`config`] — Server configuration with env-var fallbacks.
//! - [`timestamp`] — Unix timestamp type for expiry windows and audit fields.

pub mod chain;
pub mod config;
pub mod confirm;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod ledger;
pub mod notify;
pub mod rails;
pub mod reconcile;
pub mod sig_down;
pub mod sweeper;
pub mod telemetry;
pub mod timestamp;
pub mod types;
pub mod webhook;
