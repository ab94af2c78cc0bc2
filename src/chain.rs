//! Chain identifiers and the chain-RPC collaborator seam.
//!
//! The gateway never talks to a node directly: raw RPC plumbing lives behind
//! [`ChainClient`], which the confirmation poller calls to translate chain
//! state into domain observations. Implementations are expected to be backed
//! by JSON-RPC providers per chain; the core only needs block heights and
//! transaction lookups.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;
use crate::types::TxHash;

/// A settlement chain watched by the gateway.
///
/// Lightning is modeled as a chain with a confirmation threshold of one:
/// an invoice is either settled or it is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Polygon,
    Bsc,
    Arbitrum,
    Solana,
    Lightning,
}

impl Chain {
    pub fn variants() -> &'static [Chain] {
        &[
            Chain::Ethereum,
            Chain::Polygon,
            Chain::Bsc,
            Chain::Arbitrum,
            Chain::Solana,
            Chain::Lightning,
        ]
    }

    /// Default confirmation threshold, used when the config carries no
    /// per-chain override.
    pub fn default_required_confirmations(&self) -> u64 {
        match self {
            Chain::Ethereum => 12,
            Chain::Polygon => 30,
            Chain::Bsc => 15,
            Chain::Arbitrum => 12,
            Chain::Solana => 32,
            Chain::Lightning => 1,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Use serde_json to get the serialized string value
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        let s = json.trim_matches('"');
        write!(f, "{}", s)
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let json = format!("\"{}\"", s);
        serde_json::from_str(&json).map_err(|e| format!("unknown chain '{}': {}", s, e))
    }
}

/// A transaction as reported by the chain-RPC collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    /// Block containing the transaction, `None` while still in the mempool.
    pub block_number: Option<u64>,
    /// Transferred amount in minor units of the watched asset.
    pub amount: i64,
    pub from: String,
    pub to: String,
}

/// Read-only chain access consumed by the confirmation poller.
///
/// Failures map to [`GatewayError::Transient`] and are retried on the next
/// poll tick; they never surface as a payment failure.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_block_height(&self, chain: Chain) -> Result<u64, GatewayError>;

    /// Looks up a transaction by hash. `Ok(None)` means the chain does not
    /// know the transaction (dropped from the mempool or reorged away).
    async fn get_transaction(
        &self,
        chain: Chain,
        tx_hash: &TxHash,
    ) -> Result<Option<ChainTransaction>, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_serialize() {
        assert_eq!(serde_json::to_string(&Chain::Ethereum).unwrap(), "\"ethereum\"");
        assert_eq!(serde_json::to_string(&Chain::Bsc).unwrap(), "\"bsc\"");
    }

    #[test]
    fn test_chain_roundtrip() {
        for chain in Chain::variants() {
            let parsed: Chain = chain.to_string().parse().unwrap();
            assert_eq!(parsed, *chain);
        }
    }

    #[test]
    fn test_chain_from_str_unknown() {
        assert!(Chain::from_str("dogecoin").is_err());
    }
}
