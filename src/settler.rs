//! Settlement trigger loop
//!
//! On every new block the loop asks the contract whether settlement is due.
//! When it is, the loop builds a legacy `settleAll()` transaction, signs its
//! EIP-155 digest with the configured signer, broadcasts it and hands it to
//! the outcome checker without waiting for it to be mined.
//!
//! Nonces are serialised through [`NonceTracker`]: a nonce is only recorded
//! once its transaction has been broadcast, and a tick that finds the chain's
//! pending nonce not yet past the last broadcast one skips instead of
//! resending.

use crate::alert::{AlertChannel, Notifier};
use crate::balance::{is_sample_due, BalanceGuard};
use crate::chain::{CallMessage, CallOutput, ChainClient};
use crate::checker::{decode_revert_reason, TxCheckMsg, TxCheckerHandle};
use crate::config::SettlePolicy;
use crate::constants::GAS_LIMIT_MULTIPLIER;
use crate::contracts::ITenantManager;
use crate::shutdown::ShutdownSignal;
use crate::signer::TransactionSigner;
use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, Bytes, TxHash, TxKind, U256};
use alloy::sol_types::SolCall;
use eyre::{bail, Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::MissedTickBehavior;

/// Static parameters of the trigger loop
#[derive(Debug, Clone)]
pub struct SettlerOptions {
    /// TenantManager proxy address
    pub contract: Address,
    /// Chain id for the EIP-155 signing domain
    pub chain_id: u64,
    /// Settlement-due policy
    pub policy: SettlePolicy,
    /// Block polling interval
    pub polling_interval: Duration,
    /// Blocks between balance samples
    pub balance_check_interval: u64,
}

/// Tracks the last nonce this process broadcast
#[derive(Debug, Default)]
pub struct NonceTracker {
    last_sent: Option<u64>,
}

impl NonceTracker {
    /// Tracker with no broadcast yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Last broadcast nonce
    pub fn last_sent(&self) -> Option<u64> {
        self.last_sent
    }

    /// Nonce to use given the chain's pending nonce
    ///
    /// `None` while the chain has not yet moved past the last broadcast
    /// nonce, i.e. the previous settlement is still in flight.
    pub fn next(&self, pending: u64) -> Option<u64> {
        match self.last_sent {
            Some(last) if pending <= last => None,
            _ => Some(pending),
        }
    }

    /// Record a successful broadcast
    pub fn record(&mut self, nonce: u64) {
        debug_assert!(self.last_sent.map_or(true, |last| nonce > last));
        self.last_sent = Some(nonce);
    }
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Settlement not due; nothing built
    Idle,
    /// Previous settlement still pending on chain
    Waiting { pending: u64, last_sent: u64 },
    /// A settlement transaction was broadcast
    Submitted {
        tx_hash: TxHash,
        nonce: u64,
        gas_limit: u64,
    },
    /// Shutdown arrived before anything was broadcast
    Interrupted,
}

/// A signed settlement waiting for broadcast, holding the nonce lock
struct Submission<'a> {
    nonces: MutexGuard<'a, NonceTracker>,
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    tx_hash: TxHash,
    raw: Bytes,
    msg: CallMessage,
}

enum Prepared<'a> {
    Done(TickOutcome),
    Ready(Submission<'a>),
}

/// The settlement trigger loop
pub struct Settler<C, S, N = AlertChannel> {
    chain: Arc<C>,
    signer: S,
    checker: TxCheckerHandle,
    guard: Option<BalanceGuard<N>>,
    options: SettlerOptions,
    nonce: Mutex<NonceTracker>,
}

impl<C, S, N> Settler<C, S, N>
where
    C: ChainClient,
    S: TransactionSigner,
    N: Notifier,
{
    /// Create a trigger loop handing transactions to `checker`
    pub fn new(chain: Arc<C>, signer: S, checker: TxCheckerHandle, options: SettlerOptions) -> Self {
        Self {
            chain,
            signer,
            checker,
            guard: None,
            options,
            nonce: Mutex::new(NonceTracker::new()),
        }
    }

    /// Sample the settler balance on the block cadence
    pub fn with_balance_guard(mut self, guard: BalanceGuard<N>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// The signing account
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Last nonce broadcast by this process
    pub async fn last_sent_nonce(&self) -> Option<u64> {
        self.nonce.lock().await.last_sent()
    }

    /// Run until shutdown
    ///
    /// Polls the block height every `polling_interval`; each new height
    /// triggers one settlement tick and, when due, one balance sample. Tick
    /// failures are logged and the next block retries from scratch. Every
    /// chain or key service wait before a broadcast gives way to shutdown.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        tracing::info!(
            address = %self.address(),
            contract = %self.options.contract,
            chain_id = self.options.chain_id,
            policy = ?self.options.policy,
            "Settler started"
        );

        let mut interval = tokio::time::interval(self.options.polling_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut balance_shutdown = shutdown.clone();
        let mut last_block: Option<u64> = None;

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.recv() => None,
                block = async {
                    interval.tick().await;
                    self.chain.block_number().await
                } => Some(block),
            };
            let block = match polled {
                None => {
                    tracing::info!("Shutdown requested, settler stopping");
                    return;
                }
                Some(Ok(block)) => block,
                Some(Err(e)) => {
                    tracing::warn!("Failed to poll block number: {:#}", e);
                    continue;
                }
            };
            if last_block.is_some_and(|last| block <= last) {
                continue;
            }
            let previous = last_block.replace(block);
            tracing::debug!(block, "New block");

            let (result, ()) = tokio::join!(
                self.tick_until(shutdown.recv()),
                self.check_balance(previous, block, balance_shutdown.recv())
            );
            if let Err(e) = result {
                tracing::error!(
                    block,
                    account = %self.address(),
                    contract = %self.options.contract,
                    method = "settleAll",
                    "Settlement tick abandoned: {:#}",
                    e
                );
            }
        }
    }

    /// Whether the contract reports settlement as due
    pub async fn settlement_due(&self) -> Result<bool> {
        match self.options.policy {
            SettlePolicy::Predicate => {
                let call = ITenantManager::checkSettleRequiredCall {};
                let output = self
                    .read(call.abi_encode())
                    .await
                    .context("Failed to call checkSettleRequired")?;
                ITenantManager::checkSettleRequiredCall::abi_decode_returns(&output)
                    .context("Failed to decode checkSettleRequired")
            }
            SettlePolicy::RequiredTenants => {
                let call = ITenantManager::getSettleRequiredTenantsCall {};
                let output = self
                    .read(call.abi_encode())
                    .await
                    .context("Failed to call getSettleRequiredTenants")?;
                let tenants =
                    ITenantManager::getSettleRequiredTenantsCall::abi_decode_returns(&output)
                        .context("Failed to decode getSettleRequiredTenants")?;
                tracing::debug!(tenants = tenants.len(), "Tenants requiring settlement");
                Ok(!tenants.is_empty())
            }
        }
    }

    async fn read(&self, data: Vec<u8>) -> Result<Bytes> {
        let msg = CallMessage::new(self.address(), self.options.contract, data);
        match self.chain.call(&msg, None).await? {
            CallOutput::Return(output) => Ok(output),
            CallOutput::Revert(payload) => {
                let reason = decode_revert_reason(&payload).unwrap_or_else(|| payload.to_string());
                bail!("Call reverted: {}", reason)
            }
        }
    }

    /// One pass of the trigger state machine
    pub async fn tick(&self) -> Result<TickOutcome> {
        self.tick_until(std::future::pending()).await
    }

    /// One pass of the trigger state machine, abandoned if `cancel` resolves
    /// before the broadcast starts
    ///
    /// Once the transaction is handed to the node the tick always runs to
    /// completion, so a broadcast transaction is never left untracked.
    pub async fn tick_until<F>(&self, cancel: F) -> Result<TickOutcome>
    where
        F: Future<Output = ()>,
    {
        let prepared = tokio::select! {
            biased;
            _ = cancel => {
                tracing::info!("Shutdown requested, settlement tick stopped before broadcast");
                return Ok(TickOutcome::Interrupted);
            }
            prepared = self.prepare() => prepared?,
        };

        match prepared {
            Prepared::Done(outcome) => Ok(outcome),
            Prepared::Ready(submission) => self.broadcast(submission).await,
        }
    }

    /// Everything up to a signed transaction, with the nonce lock held
    async fn prepare(&self) -> Result<Prepared<'_>> {
        if !self.settlement_due().await? {
            tracing::debug!("No settlement required");
            return Ok(Prepared::Done(TickOutcome::Idle));
        }

        let address = self.address();
        let contract = self.options.contract;

        // Held until the broadcast resolves so nonce choice and send are atomic
        let nonces = self.nonce.lock().await;

        let gas_price = self.chain.gas_price().await?;
        let pending = self.chain.pending_nonce(address).await?;
        let Some(nonce) = nonces.next(pending) else {
            let last_sent = nonces.last_sent().unwrap_or_default();
            tracing::info!(
                %address,
                pending,
                last_sent,
                "Previous settlement still pending, waiting"
            );
            return Ok(Prepared::Done(TickOutcome::Waiting { pending, last_sent }));
        };

        let data: Bytes = ITenantManager::settleAllCall {}.abi_encode().into();
        let msg = CallMessage::new(address, contract, data.clone());

        let estimate = self
            .chain
            .estimate_gas(&msg)
            .await
            .with_context(|| format!("settleAll gas estimation failed at nonce {}", nonce))?;
        let gas_limit = estimate.saturating_mul(GAS_LIMIT_MULTIPLIER);
        tracing::debug!(estimate, gas_limit, "Gas limit");

        let tx = TxLegacy {
            chain_id: Some(self.options.chain_id),
            nonce,
            gas_price,
            gas_limit,
            to: TxKind::Call(contract),
            value: U256::ZERO,
            input: data,
        };

        let signature = self
            .signer
            .sign_hash(tx.signature_hash())
            .await
            .with_context(|| format!("Failed to sign settleAll at nonce {}", nonce))?;
        let signed = tx.into_signed(signature);
        let tx_hash = *signed.hash();
        let raw: Bytes = TxEnvelope::from(signed).encoded_2718().into();

        Ok(Prepared::Ready(Submission {
            nonces,
            nonce,
            gas_price,
            gas_limit,
            tx_hash,
            raw,
            msg,
        }))
    }

    async fn broadcast(&self, submission: Submission<'_>) -> Result<TickOutcome> {
        let Submission {
            mut nonces,
            nonce,
            gas_price,
            gas_limit,
            tx_hash,
            raw,
            msg,
        } = submission;

        let sent = self
            .chain
            .send_raw_transaction(raw)
            .await
            .with_context(|| format!("Failed to send transaction {} at nonce {}", tx_hash, nonce))?;
        nonces.record(nonce);
        drop(nonces);

        if sent != tx_hash {
            tracing::warn!(%tx_hash, node_hash = %sent, "Node reported a different transaction hash");
        }
        tracing::info!(%tx_hash, nonce, gas_limit, address = %msg.from, "Transaction sent");

        let record = TxCheckMsg {
            tx_hash,
            nonce,
            gas_price,
            msg,
        };
        if let Err(e) = self.checker.check_transaction(record) {
            tracing::error!(%tx_hash, "Outcome will not be tracked: {:#}", e);
        }

        Ok(TickOutcome::Submitted {
            tx_hash,
            nonce,
            gas_limit,
        })
    }

    async fn check_balance<F>(&self, previous: Option<u64>, block: u64, cancel: F)
    where
        F: Future<Output = ()>,
    {
        let Some(guard) = &self.guard else {
            return;
        };
        if !is_sample_due(previous, block, self.options.balance_check_interval) {
            return;
        }

        let address = self.address();
        let sample = async {
            match self.chain.balance(address).await {
                Ok(balance) => {
                    tracing::debug!(block, %balance, "Balance sampled");
                    guard.observe(address, balance).await;
                }
                Err(e) => tracing::warn!(block, "Failed to check balance: {:#}", e),
            }
        };

        tokio::select! {
            biased;
            _ = cancel => tracing::debug!(block, "Balance sample skipped for shutdown"),
            _ = sample => {}
        }
    }
}
