//! Chain RPC capability
//!
//! Every chain interaction the settler needs goes through [`ChainClient`], so
//! the trigger loop and the outcome checker can run against a real node
//! ([`RpcChain`]) or an in-memory double in tests.

use alloy::eips::BlockId;
use alloy::network::{Ethereum, ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::TransactionRequest;
use eyre::{Context, Result};
use std::future::Future;
use std::sync::Arc;

/// Type alias for read-only provider
type ReadProvider = Arc<RootProvider<Ethereum>>;

/// A read-only or to-be-sent contract call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMessage {
    /// Sender used for simulation and estimation
    pub from: Address,
    /// Target contract address
    pub to: Address,
    /// Encoded calldata
    pub data: Bytes,
}

impl CallMessage {
    /// Create a new call message
    pub fn new(from: Address, to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            from,
            to,
            data: data.into(),
        }
    }

    fn to_request(&self) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.from)
            .with_to(self.to)
            .with_input(self.data.clone())
    }
}

/// Result of a read-only call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutput {
    /// Execution succeeded with this return data
    Return(Bytes),
    /// Execution reverted with this payload (possibly empty)
    Revert(Bytes),
}

/// The parts of a mined receipt the settler cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinedReceipt {
    /// Whether execution succeeded
    pub success: bool,
    /// Gas consumed by execution
    pub gas_used: u64,
    /// Block the transaction was included in
    pub block_number: u64,
    /// Price actually paid per unit of gas
    pub effective_gas_price: u128,
}

impl MinedReceipt {
    /// Total fee paid, in wei
    pub fn fee(&self) -> U256 {
        U256::from(self.gas_used) * U256::from(self.effective_gas_price)
    }
}

/// Chain RPC operations consumed by the settler
///
/// Implementations must be safe to share between the trigger loop and every
/// outcome checker task.
pub trait ChainClient: Send + Sync + 'static {
    /// Chain id used for the EIP-155 signing domain
    fn chain_id(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Latest block height
    fn block_number(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Native balance of an account at the latest block
    fn balance(&self, address: Address) -> impl Future<Output = Result<U256>> + Send;

    /// Next nonce including pending transactions
    fn pending_nonce(&self, address: Address) -> impl Future<Output = Result<u64>> + Send;

    /// Suggested legacy gas price
    fn gas_price(&self) -> impl Future<Output = Result<u128>> + Send;

    /// Gas estimate for a call
    fn estimate_gas(&self, msg: &CallMessage) -> impl Future<Output = Result<u64>> + Send;

    /// Read-only call, at the latest block or at `block`
    fn call(
        &self,
        msg: &CallMessage,
        block: Option<u64>,
    ) -> impl Future<Output = Result<CallOutput>> + Send;

    /// Broadcast an EIP-2718 encoded signed transaction
    fn send_raw_transaction(&self, raw: Bytes) -> impl Future<Output = Result<TxHash>> + Send;

    /// Receipt of a transaction, `None` while it is not mined
    fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> impl Future<Output = Result<Option<MinedReceipt>>> + Send;

    /// Whether the node knows the transaction
    fn transaction_exists(&self, hash: TxHash) -> impl Future<Output = Result<bool>> + Send;
}

/// [`ChainClient`] backed by an alloy provider
#[derive(Clone)]
pub struct RpcChain {
    provider: ReadProvider,
}

impl RpcChain {
    /// Connect to an http(s) or ws(s) endpoint and verify it answers
    pub async fn dial(rpc_url: &str) -> Result<Self> {
        // No fillers: nonce, gas and signing are all handled by the settler
        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .network::<Ethereum>()
            .connect(rpc_url)
            .await
            .with_context(|| format!("Failed to connect to {}", rpc_url))?;

        let chain = Self {
            provider: Arc::new(provider),
        };
        chain
            .provider
            .get_chain_id()
            .await
            .context("Endpoint did not answer eth_chainId")?;

        Ok(chain)
    }
}

impl ChainClient for RpcChain {
    async fn chain_id(&self) -> Result<u64> {
        self.provider
            .get_chain_id()
            .await
            .context("Failed to get chain id")
    }

    async fn block_number(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .context("Failed to get block number")
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.provider
            .get_balance(address)
            .await
            .context("Failed to get balance")
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .context("Failed to get pending nonce")
    }

    async fn gas_price(&self) -> Result<u128> {
        self.provider
            .get_gas_price()
            .await
            .context("Failed to get gas price")
    }

    async fn estimate_gas(&self, msg: &CallMessage) -> Result<u64> {
        self.provider
            .estimate_gas(msg.to_request())
            .await
            .context("Failed to estimate gas")
    }

    async fn call(&self, msg: &CallMessage, block: Option<u64>) -> Result<CallOutput> {
        let mut call = self.provider.call(msg.to_request());
        if let Some(number) = block {
            call = call.block(BlockId::number(number));
        }

        match call.await {
            Ok(output) => Ok(CallOutput::Return(output)),
            Err(err) => {
                // Reverts come back as JSON-RPC errors carrying the payload
                let revert = err.as_error_resp().and_then(|payload| {
                    payload.as_revert_data().or_else(|| {
                        is_execution_revert(payload.code, &payload.message).then(Bytes::new)
                    })
                });
                match revert {
                    Some(data) => Ok(CallOutput::Revert(data)),
                    None => Err(err).context("Failed to call contract"),
                }
            }
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash> {
        let pending = self
            .provider
            .send_raw_transaction(&raw)
            .await
            .context("Failed to send transaction")?;

        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<MinedReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .context("Failed to get transaction receipt")?;

        Ok(receipt.and_then(|receipt| {
            // Pending receipts without a block are not final yet
            let block_number = receipt.block_number()?;
            Some(MinedReceipt {
                success: receipt.status(),
                gas_used: receipt.gas_used(),
                block_number,
                effective_gas_price: receipt.effective_gas_price(),
            })
        }))
    }

    async fn transaction_exists(&self, hash: TxHash) -> Result<bool> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .context("Failed to get transaction by hash")?;

        Ok(tx.is_some())
    }
}

/// Whether a JSON-RPC error describes a reverted execution
///
/// Code 3 is the execution-reverted code; nodes that do not use it still say
/// "revert" in the message. Anything else (rate limits, pruned state, unknown
/// block) is a transport failure.
pub fn is_execution_revert(code: i64, message: &str) -> bool {
    code == 3 || message.to_ascii_lowercase().contains("revert")
}
