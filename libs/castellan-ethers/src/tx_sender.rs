use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::{HumanReadableParser, Token};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionReceipt, TransactionRequest, TxHash, U256};
use tracing::debug;

use castellan::artifacts::ContractArtifact;
use castellan::client::{ChainClient, DeployedContract, TxOutcome};
use castellan::config::DeployerSettings;
use castellan::error::{Error, Result};
use castellan::retry::RetryPolicy;

pub type DeployerMiddleware = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Signer+provider pair over HTTP, with per-transaction gas handling and
/// retry of the transient sub-operations (estimation, price fetch,
/// broadcast). Receipt waits are never retried: once a transaction is out,
/// resending is the chain's business, not ours.
pub struct EthersClient {
    client: Arc<DeployerMiddleware>,
    retry: RetryPolicy,
    gas_multiplier: f64,
}

impl EthersClient {
    pub async fn try_new(settings: &DeployerSettings) -> Result<Self> {
        settings.validate()?;
        let provider = Provider::<Http>::try_from(settings.rpc_url.as_str()).map_err(|e| {
            Error::Configuration(format!("malformed RPC endpoint {:?}: {e}", settings.rpc_url))
        })?;
        let wallet = LocalWallet::from_str(&settings.private_key)
            .map_err(|e| Error::Configuration(format!("malformed private key: {e}")))?;
        let retry = RetryPolicy::new(
            settings.max_retries,
            settings.retry_base_delay,
            settings.retry_jitter,
        )?;

        let chain_id = {
            let provider_ref = &provider;
            retry
                .run("chain id fetch", move || async move {
                    provider_ref
                        .get_chainid()
                        .await
                        .map_err(|e| Error::Connection(e.to_string()))
                })
                .await?
        };
        let client = Arc::new(SignerMiddleware::new(
            provider,
            wallet.with_chain_id(chain_id.as_u64()),
        ));
        Ok(Self {
            client,
            retry,
            gas_multiplier: settings.gas_multiplier,
        })
    }

    pub fn middleware(&self) -> Arc<DeployerMiddleware> {
        self.client.clone()
    }

    /// Estimates gas, applies the bounded safety multiplier, and stamps a
    /// freshly fetched price. No price caching across transactions.
    async fn prepare(&self, mut tx: TypedTransaction) -> Result<TypedTransaction> {
        let gas = {
            let client = &self.client;
            let tx_ref = &tx;
            self.retry
                .run("gas estimation", move || async move {
                    client
                        .estimate_gas(tx_ref, None)
                        .await
                        .map_err(|e| Error::GasEstimation(e.to_string()))
                })
                .await?
        };
        tx.set_gas(apply_multiplier(gas, self.gas_multiplier));
        tx.set_gas_price(self.fetch_gas_price().await?);
        Ok(tx)
    }

    async fn fetch_gas_price(&self) -> Result<U256> {
        let client = &self.client;
        self.retry
            .run("gas price fetch", move || async move {
                match client.estimate_eip1559_fees(None).await {
                    Ok((max_fee, _priority_fee)) => Ok(max_fee),
                    Err(err) => {
                        debug!(error = %err, "EIP-1559 estimate unavailable, using legacy gas price");
                        client
                            .get_gas_price()
                            .await
                            .map_err(|e| Error::Connection(e.to_string()))
                    }
                }
            })
            .await
    }

    async fn broadcast(&self, tx: TypedTransaction) -> Result<(TxHash, Option<TransactionReceipt>)> {
        let client = &self.client;
        let tx_ref = &tx;
        let pending = self
            .retry
            .run("transaction broadcast", move || {
                let tx = tx_ref.clone();
                async move {
                    client
                        .send_transaction(tx, None)
                        .await
                        .map_err(|e| Error::Connection(e.to_string()))
                }
            })
            .await?;
        let tx_hash = *pending;
        debug!(tx = ?tx_hash, "broadcast, awaiting receipt");
        let receipt = pending
            .await
            .map_err(|e| Error::Connection(format!("awaiting receipt for {tx_hash:?}: {e}")))?;
        Ok((tx_hash, receipt))
    }
}

#[async_trait]
impl ChainClient for EthersClient {
    fn sender(&self) -> Address {
        self.client.address()
    }

    async fn chain_id(&self) -> Result<u64> {
        let client = &self.client;
        let chain_id = self
            .retry
            .run("chain id fetch", move || async move {
                client
                    .get_chainid()
                    .await
                    .map_err(|e| Error::Connection(e.to_string()))
            })
            .await?;
        Ok(chain_id.as_u64())
    }

    async fn check_connectivity(&self) -> Result<()> {
        let client = &self.client;
        self.retry
            .run("connectivity check", move || async move {
                client
                    .get_block_number()
                    .await
                    .map(|_| ())
                    .map_err(|e| Error::Connection(e.to_string()))
            })
            .await
    }

    async fn deploy(
        &self,
        artifact: &ContractArtifact,
        constructor_args: Vec<Token>,
    ) -> Result<DeployedContract> {
        let data = encode_constructor(artifact, &constructor_args)?;
        let tx: TypedTransaction = TransactionRequest::new().data(data).into();
        let tx = self.prepare(tx).await?;
        let (tx_hash, receipt) = self.broadcast(tx).await?;
        let receipt = receipt.ok_or_else(|| {
            Error::ContractDeployment(format!("deployment transaction {tx_hash:?} has no receipt"))
        })?;
        if receipt.status != Some(1u64.into()) {
            return Err(Error::ContractDeployment(format!(
                "deployment transaction {tx_hash:?} reverted"
            )));
        }
        let address = receipt.contract_address.ok_or_else(|| {
            Error::ContractDeployment(format!(
                "receipt for {tx_hash:?} carries no contract address"
            ))
        })?;
        Ok(DeployedContract {
            address,
            tx_hash,
            gas_used: receipt.gas_used,
        })
    }

    async fn send(&self, to: Address, function: &str, args: Vec<Token>) -> Result<TxOutcome> {
        let function = parse_function(function)?;
        let data = function
            .encode_input(&args)
            .map_err(|e| Error::Configuration(format!("cannot encode {}: {e}", function.name)))?;
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        let tx = self.prepare(tx).await?;
        let (tx_hash, receipt) = self.broadcast(tx).await?;
        let receipt = receipt.ok_or_else(|| {
            Error::TransactionFailed(format!("transaction {tx_hash:?} has no receipt"))
        })?;
        if receipt.status != Some(1u64.into()) {
            return Err(Error::TransactionFailed(format!(
                "transaction {tx_hash:?} ({}) reverted",
                function.name
            )));
        }
        Ok(TxOutcome {
            tx_hash,
            gas_used: receipt.gas_used,
        })
    }

    async fn read(&self, to: Address, function: &str, args: Vec<Token>) -> Result<Vec<Token>> {
        let function = parse_function(function)?;
        let data = function
            .encode_input(&args)
            .map_err(|e| Error::Configuration(format!("cannot encode {}: {e}", function.name)))?;
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        let raw = self
            .client
            .call(&tx, None)
            .await
            .map_err(|e| Error::Connection(format!("call to {}: {e}", function.name)))?;
        function
            .decode_output(&raw)
            .map_err(|e| Error::Connection(format!("undecodable output of {}: {e}", function.name)))
    }
}

fn parse_function(signature: &str) -> Result<ethers::abi::Function> {
    HumanReadableParser::parse_function(signature)
        .map_err(|e| Error::Configuration(format!("invalid function signature {signature:?}: {e}")))
}

fn encode_constructor(artifact: &ContractArtifact, args: &[Token]) -> Result<ethers::types::Bytes> {
    let code = artifact.bytecode.to_vec();
    if args.is_empty() {
        return Ok(ethers::types::Bytes::from(code));
    }
    let constructor = artifact.abi.constructor().ok_or_else(|| {
        Error::Configuration("constructor arguments supplied but ABI declares no constructor".into())
    })?;
    let data = constructor
        .encode_input(code, args)
        .map_err(|e| Error::Configuration(format!("bad constructor arguments: {e}")))?;
    Ok(ethers::types::Bytes::from(data))
}

fn apply_multiplier(gas: U256, multiplier: f64) -> U256 {
    // Multiplier is bounded to [1.0, 2.0] at settings validation; scaling
    // through integer hundredths keeps the U256 math exact.
    let hundredths = (multiplier * 100.0).round() as u64;
    gas * U256::from(hundredths) / U256::from(100u64)
}
