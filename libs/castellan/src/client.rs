use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, TxHash, U256};

use crate::artifacts::ContractArtifact;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DeployedContract {
    pub address: Address,
    pub tx_hash: TxHash,
    pub gas_used: Option<U256>,
}

#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub tx_hash: TxHash,
    pub gas_used: Option<U256>,
}

/// Signer-plus-provider pair the orchestrator drives the chain through.
///
/// Implementations own gas handling (estimate, bounded multiplier, fresh
/// per-transaction price fetch) and retry of transient sub-operations;
/// callers see either a confirmed outcome or a classified error. `send`
/// and `deploy` wait for the transaction receipt before returning.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn sender(&self) -> Address;

    async fn chain_id(&self) -> Result<u64>;

    async fn check_connectivity(&self) -> Result<()>;

    async fn deploy(
        &self,
        artifact: &ContractArtifact,
        constructor_args: Vec<Token>,
    ) -> Result<DeployedContract>;

    /// State-changing call; `function` is a human-readable signature.
    async fn send(&self, to: Address, function: &str, args: Vec<Token>) -> Result<TxOutcome>;

    /// Read-only call; returns the decoded output tokens.
    async fn read(&self, to: Address, function: &str, args: Vec<Token>) -> Result<Vec<Token>>;
}
