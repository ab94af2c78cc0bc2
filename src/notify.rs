//! Fan-out of committed state transitions to subscribers.
//!
//! Delivery is at-least-once over a bounded broadcast channel. A slow or
//! disconnected subscriber never blocks the engine: when a receiver falls
//! behind, the channel drops its oldest backlog and the subscriber gets a
//! [`StreamMessage::Gap`] with the number of missed updates instead of
//! exerting backpressure on the ledger.

use std::collections::HashSet;
use tokio::sync::broadcast;

use crate::types::{PaymentId, PaymentUpdate};

const CHANNEL_CAPACITY: usize = 1024;

/// What a subscriber receives: either an update of interest or a notice that
/// some were dropped while it lagged.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Update(PaymentUpdate),
    Gap { missed: u64 },
}

#[derive(Clone)]
pub struct PaymentBroadcaster {
    sender: broadcast::Sender<PaymentUpdate>,
}

impl PaymentBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publishes an applied transition. Send errors mean no active
    /// subscribers, which is fine.
    pub fn publish(&self, update: PaymentUpdate) {
        match self.sender.send(update) {
            Ok(count) => {
                tracing::debug!(subscribers = count, "published payment update");
            }
            Err(_) => {}
        }
    }

    /// Subscribes to updates, optionally filtered to a set of payment ids.
    pub fn subscribe(&self, payment_ids: Option<HashSet<PaymentId>>) -> UpdateStream {
        UpdateStream {
            receiver: self.sender.subscribe(),
            filter: payment_ids,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for PaymentBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// A filtered subscription to payment updates.
pub struct UpdateStream {
    receiver: broadcast::Receiver<PaymentUpdate>,
    filter: Option<HashSet<PaymentId>>,
}

impl UpdateStream {
    /// Waits for the next message of interest. Returns `None` once the
    /// broadcaster is gone.
    pub async fn next(&mut self) -> Option<StreamMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(update) => {
                    let interested = self
                        .filter
                        .as_ref()
                        .is_none_or(|ids| ids.contains(&update.payment_id));
                    if interested {
                        return Some(StreamMessage::Update(update));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(StreamMessage::Gap { missed });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
