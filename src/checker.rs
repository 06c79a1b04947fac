//! Transaction outcome checker
//!
//! The trigger loop hands every broadcast transaction to the checker and moves
//! on. The checker waits for each one to be mined on its own task, logs the fee
//! on success, and on failure replays the original call at the mined block to
//! recover a revert reason.
//!
//! Shutdown protocol: [`TxChecker::shutdown`] closes the intake (further
//! [`TxCheckerHandle::check_transaction`] calls fail), spawns a handler for
//! every record still queued, then waits for all handlers. Handlers stop
//! waiting for mining once the process-wide shutdown signal fires, so draining
//! never blocks on a slow chain.

use crate::chain::{CallMessage, CallOutput, ChainClient, MinedReceipt};
use crate::constants::format_fee;
use crate::contracts::ITenantManager::ITenantManagerErrors;
use crate::shutdown::ShutdownSignal;
use alloy::primitives::{TxHash, U256};
use alloy::sol_types::{Panic, Revert, SolError, SolInterface};
use eyre::{eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

/// A sent transaction awaiting its outcome
#[derive(Debug, Clone)]
pub struct TxCheckMsg {
    /// Hash of the broadcast transaction
    pub tx_hash: TxHash,
    /// Nonce it was sent with
    pub nonce: u64,
    /// Gas price it was sent with
    pub gas_price: u128,
    /// Original call, replayed on failure
    pub msg: CallMessage,
}

/// How a record's lifecycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Mined with success status
    Confirmed { gas_used: u64, fee: U256 },
    /// Mined with failure status
    Reverted { reason: Option<String> },
    /// Shutdown arrived before the transaction was mined
    Abandoned,
}

/// Tally of finished records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckerReport {
    pub confirmed: usize,
    pub reverted: usize,
    pub abandoned: usize,
    /// Handlers that panicked
    pub failed: usize,
}

impl CheckerReport {
    /// Number of records whose lifecycle ended
    pub fn total(&self) -> usize {
        self.confirmed + self.reverted + self.abandoned + self.failed
    }

    fn record(&mut self, outcome: &CheckOutcome) {
        match outcome {
            CheckOutcome::Confirmed { .. } => self.confirmed += 1,
            CheckOutcome::Reverted { .. } => self.reverted += 1,
            CheckOutcome::Abandoned => self.abandoned += 1,
        }
    }
}

/// Cloneable intake side of the checker
#[derive(Clone)]
pub struct TxCheckerHandle {
    pub(crate) sender: mpsc::UnboundedSender<TxCheckMsg>,
}

impl TxCheckerHandle {
    /// Queue a record; fails once the checker has shut down
    pub fn check_transaction(&self, record: TxCheckMsg) -> Result<()> {
        self.sender
            .send(record)
            .map_err(|e| eyre!("Transaction checker is shut down, dropped {}", e.0.tx_hash))
    }
}

/// Running outcome checker
pub struct TxChecker {
    handle: TxCheckerHandle,
    stop: oneshot::Sender<()>,
    worker: JoinHandle<CheckerReport>,
}

impl TxChecker {
    /// Start the checker worker
    ///
    /// `poll_interval` paces receipt polling while waiting for mining.
    pub fn start<C: ChainClient>(
        chain: Arc<C>,
        shutdown: ShutdownSignal,
        poll_interval: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (stop, stop_rx) = oneshot::channel();

        let worker = tokio::spawn(run_worker(chain, receiver, stop_rx, shutdown, poll_interval));

        Self {
            handle: TxCheckerHandle { sender },
            stop,
            worker,
        }
    }

    /// Intake handle for producers
    pub fn handle(&self) -> TxCheckerHandle {
        self.handle.clone()
    }

    /// Stop intake, drain queued records and wait for every handler
    pub async fn shutdown(self) -> CheckerReport {
        let _ = self.stop.send(());
        drop(self.handle);

        match self.worker.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Transaction checker worker failed: {}", e);
                CheckerReport::default()
            }
        }
    }
}

async fn run_worker<C: ChainClient>(
    chain: Arc<C>,
    mut receiver: mpsc::UnboundedReceiver<TxCheckMsg>,
    mut stop: oneshot::Receiver<()>,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
) -> CheckerReport {
    let mut tasks = JoinSet::new();
    let mut report = CheckerReport::default();
    let mut closing = false;

    loop {
        tokio::select! {
            // A dropped stop sender also closes intake
            _ = &mut stop, if !closing => {
                closing = true;
                receiver.close();
            }
            record = receiver.recv() => match record {
                Some(record) => {
                    tasks.spawn(check_transaction_status(
                        chain.clone(),
                        record,
                        shutdown.clone(),
                        poll_interval,
                    ));
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                tally(&mut report, joined);
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        tally(&mut report, joined);
    }

    tracing::info!(
        confirmed = report.confirmed,
        reverted = report.reverted,
        abandoned = report.abandoned,
        failed = report.failed,
        "Transaction checker shutting down..."
    );
    report
}

fn tally(report: &mut CheckerReport, joined: Result<CheckOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => report.record(&outcome),
        Err(e) => {
            tracing::error!("Transaction check task failed: {}", e);
            report.failed += 1;
        }
    }
}

/// Poll for a receipt until mined or until shutdown
///
/// Transient RPC errors are logged and polling continues. Returns `None` when
/// shutdown interrupts the wait.
async fn wait_mined<C: ChainClient>(
    chain: &C,
    tx_hash: TxHash,
    shutdown: &mut ShutdownSignal,
    poll_interval: Duration,
) -> Option<MinedReceipt> {
    loop {
        match chain.transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => return Some(receipt),
            Ok(None) => {}
            Err(e) => tracing::debug!(%tx_hash, "Receipt query failed: {:#}", e),
        }

        tokio::select! {
            _ = shutdown.recv() => return None,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Full lifecycle of one record
pub async fn check_transaction_status<C: ChainClient>(
    chain: Arc<C>,
    record: TxCheckMsg,
    mut shutdown: ShutdownSignal,
    poll_interval: Duration,
) -> CheckOutcome {
    let tx_hash = record.tx_hash;

    let Some(receipt) = wait_mined(chain.as_ref(), tx_hash, &mut shutdown, poll_interval).await
    else {
        tracing::warn!(%tx_hash, nonce = record.nonce, "Abandoned waiting for transaction mining");
        return CheckOutcome::Abandoned;
    };

    if receipt.success {
        let fee = receipt.fee();
        tracing::info!(%tx_hash, nonce = record.nonce, block = receipt.block_number, "Transaction successful");
        tracing::debug!(
            %tx_hash,
            gas_used = receipt.gas_used,
            gas_price = record.gas_price,
            "Total fee (ether): {} ETH",
            format_fee(fee)
        );
        return CheckOutcome::Confirmed {
            gas_used: receipt.gas_used,
            fee,
        };
    }

    tracing::warn!(
        %tx_hash,
        nonce = record.nonce,
        block = receipt.block_number,
        contract = %record.msg.to,
        "Transaction failed"
    );
    let reason = diagnose_revert(chain.as_ref(), &record, receipt.block_number).await;
    CheckOutcome::Reverted { reason }
}

/// Replay a failed call at its block and decode the revert payload
///
/// Best-effort only: every failure is logged and yields `None`.
async fn diagnose_revert<C: ChainClient>(
    chain: &C,
    record: &TxCheckMsg,
    block_number: u64,
) -> Option<String> {
    let tx_hash = record.tx_hash;

    match chain.transaction_exists(tx_hash).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(%tx_hash, "Transaction unknown to node, skipping revert replay");
            return None;
        }
        Err(e) => {
            tracing::debug!(%tx_hash, "Failed to get transaction by hash: {:#}", e);
            return None;
        }
    }

    let payload = match chain.call(&record.msg, Some(block_number)).await {
        Ok(CallOutput::Revert(data)) | Ok(CallOutput::Return(data)) => data,
        Err(e) => {
            tracing::debug!(%tx_hash, "Failed to call contract: {:#}", e);
            return None;
        }
    };

    if payload.is_empty() {
        tracing::warn!(%tx_hash, "No revert reason available");
        return None;
    }

    match decode_revert_reason(&payload) {
        Some(reason) => {
            tracing::warn!(%tx_hash, "Revert reason: {}", reason);
            Some(reason)
        }
        None => {
            tracing::warn!(%tx_hash, payload = %payload, "No revert reason available, payload not decodable");
            None
        }
    }
}

/// Decode a revert payload into a human-readable reason
///
/// Tries, in order: the settlement contract's custom errors, `Error(string)`,
/// `Panic(uint256)`, and a JSON object with an `error` string field.
pub fn decode_revert_reason(payload: &[u8]) -> Option<String> {
    if payload.is_empty() {
        return None;
    }

    if let Ok(error) = ITenantManagerErrors::abi_decode(payload) {
        return match error {
            ITenantManagerErrors::SettlementFailed(e) => Some(e.reason),
        };
    }

    if let Ok(revert) = Revert::abi_decode(payload) {
        return Some(revert.reason);
    }

    if let Ok(panic) = Panic::abi_decode(payload) {
        return Some(format!("panic code {}", panic.code));
    }

    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|value| value.get("error")?.as_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ITenantManager;
    use crate::shutdown::Shutdown;
    use alloy::primitives::{Address, Bytes};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Chain double for the checker: receipts and replay output per hash
    #[derive(Default)]
    struct ReceiptChain {
        receipts: Mutex<HashMap<TxHash, MinedReceipt>>,
        replay: Mutex<Option<CallOutput>>,
        known: Mutex<bool>,
        replays: Mutex<Vec<(CallMessage, Option<u64>)>>,
    }

    impl ChainClient for ReceiptChain {
        async fn chain_id(&self) -> Result<u64> {
            Ok(1)
        }
        async fn block_number(&self) -> Result<u64> {
            Ok(1)
        }
        async fn balance(&self, _address: Address) -> Result<U256> {
            Ok(U256::ZERO)
        }
        async fn pending_nonce(&self, _address: Address) -> Result<u64> {
            Ok(0)
        }
        async fn gas_price(&self) -> Result<u128> {
            Ok(1)
        }
        async fn estimate_gas(&self, _msg: &CallMessage) -> Result<u64> {
            Ok(21_000)
        }
        async fn call(&self, msg: &CallMessage, block: Option<u64>) -> Result<CallOutput> {
            self.replays.lock().unwrap().push((msg.clone(), block));
            self.replay
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| eyre!("replay unavailable"))
        }
        async fn send_raw_transaction(&self, _raw: Bytes) -> Result<TxHash> {
            Err(eyre!("not used"))
        }
        async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<MinedReceipt>> {
            Ok(self.receipts.lock().unwrap().get(&hash).copied())
        }
        async fn transaction_exists(&self, _hash: TxHash) -> Result<bool> {
            Ok(*self.known.lock().unwrap())
        }
    }

    fn record(n: u8) -> TxCheckMsg {
        TxCheckMsg {
            tx_hash: TxHash::repeat_byte(n),
            nonce: n as u64,
            gas_price: 2_000_000_000,
            msg: CallMessage::new(
                Address::repeat_byte(0x01),
                Address::repeat_byte(0x02),
                Bytes::from_static(&[0xaa, 0xbb, 0xcc, 0xdd]),
            ),
        }
    }

    fn mined(success: bool) -> MinedReceipt {
        MinedReceipt {
            success,
            gas_used: 50_000,
            block_number: 42,
            effective_gas_price: 2_000_000_000,
        }
    }

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn test_decode_custom_error() {
        let payload = ITenantManager::SettlementFailed {
            reason: "tenant 3 has no treasury".to_string(),
        }
        .abi_encode();
        assert_eq!(
            decode_revert_reason(&payload).as_deref(),
            Some("tenant 3 has no treasury")
        );
    }

    #[test]
    fn test_decode_standard_revert() {
        let payload = Revert {
            reason: "Ownable: caller is not the owner".to_string(),
        }
        .abi_encode();
        assert_eq!(
            decode_revert_reason(&payload).as_deref(),
            Some("Ownable: caller is not the owner")
        );
    }

    #[test]
    fn test_decode_panic_and_json() {
        let payload = Panic {
            code: U256::from(0x11u64),
        }
        .abi_encode();
        assert_eq!(decode_revert_reason(&payload).as_deref(), Some("panic code 17"));

        let json = br#"{"error":"settlement window closed"}"#;
        assert_eq!(
            decode_revert_reason(json).as_deref(),
            Some("settlement window closed")
        );
    }

    #[test]
    fn test_decode_nothing() {
        assert_eq!(decode_revert_reason(&[]), None);
        assert_eq!(decode_revert_reason(&[0xde, 0xad, 0xbe, 0xef, 0x00]), None);
        assert_eq!(decode_revert_reason(br#"{"code":3}"#), None);
    }

    #[tokio::test]
    async fn test_successful_transaction() {
        let chain = Arc::new(ReceiptChain::default());
        chain
            .receipts
            .lock()
            .unwrap()
            .insert(record(1).tx_hash, mined(true));
        let shutdown = Shutdown::new();

        let outcome = check_transaction_status(chain.clone(), record(1), shutdown.subscribe(), POLL).await;

        assert_eq!(
            outcome,
            CheckOutcome::Confirmed {
                gas_used: 50_000,
                fee: U256::from(100_000_000_000_000u64),
            }
        );
        assert!(chain.replays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reverted_transaction_with_reason() {
        let chain = Arc::new(ReceiptChain::default());
        chain
            .receipts
            .lock()
            .unwrap()
            .insert(record(2).tx_hash, mined(false));
        *chain.known.lock().unwrap() = true;
        *chain.replay.lock().unwrap() = Some(CallOutput::Revert(
            ITenantManager::SettlementFailed {
                reason: "payout period not reached".to_string(),
            }
            .abi_encode()
            .into(),
        ));
        let shutdown = Shutdown::new();

        let outcome = check_transaction_status(chain.clone(), record(2), shutdown.subscribe(), POLL).await;

        assert_eq!(
            outcome,
            CheckOutcome::Reverted {
                reason: Some("payout period not reached".to_string())
            }
        );
        // replayed once, with the original message, at the mined block
        let replays = chain.replays.lock().unwrap();
        assert_eq!(replays.len(), 1);
        assert_eq!(replays[0], (record(2).msg, Some(42)));
    }

    #[tokio::test]
    async fn test_reverted_transaction_without_reason() {
        let chain = Arc::new(ReceiptChain::default());
        chain
            .receipts
            .lock()
            .unwrap()
            .insert(record(3).tx_hash, mined(false));
        *chain.known.lock().unwrap() = true;
        *chain.replay.lock().unwrap() = Some(CallOutput::Revert(Bytes::new()));
        let shutdown = Shutdown::new();

        let outcome = check_transaction_status(chain.clone(), record(3), shutdown.subscribe(), POLL).await;
        assert_eq!(outcome, CheckOutcome::Reverted { reason: None });

        // replay failing outright is also contained
        *chain.replay.lock().unwrap() = None;
        let outcome = check_transaction_status(chain.clone(), record(3), shutdown.subscribe(), POLL).await;
        assert_eq!(outcome, CheckOutcome::Reverted { reason: None });

        // unknown transaction skips the replay
        *chain.known.lock().unwrap() = false;
        chain.replays.lock().unwrap().clear();
        let outcome = check_transaction_status(chain.clone(), record(3), shutdown.subscribe(), POLL).await;
        assert_eq!(outcome, CheckOutcome::Reverted { reason: None });
        assert!(chain.replays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_waits_until_mined() {
        let chain = Arc::new(ReceiptChain::default());
        let shutdown = Shutdown::new();
        let task = tokio::spawn(check_transaction_status(
            chain.clone(),
            record(4),
            shutdown.subscribe(),
            POLL,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        chain
            .receipts
            .lock()
            .unwrap()
            .insert(record(4).tx_hash, mined(true));
        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, CheckOutcome::Confirmed { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_records() {
        let chain = Arc::new(ReceiptChain::default());
        // even records get mined, odd ones never do
        for n in (0u8..10).filter(|n| n % 2 == 0) {
            chain
                .receipts
                .lock()
                .unwrap()
                .insert(record(n).tx_hash, mined(true));
        }

        let shutdown = Shutdown::new();
        let checker = TxChecker::start(chain.clone(), shutdown.subscribe(), POLL);
        let handle = checker.handle();
        for n in 0u8..10 {
            handle.check_transaction(record(n)).unwrap();
        }

        shutdown.trigger();
        let report = tokio::time::timeout(Duration::from_secs(2), checker.shutdown())
            .await
            .unwrap();

        assert_eq!(report.total(), 10);
        assert_eq!(report.confirmed, 5);
        assert_eq!(report.abandoned, 5);
        assert_eq!(report.failed, 0);

        // intake is closed afterwards
        assert!(handle.check_transaction(record(11)).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_mining_without_cancellation() {
        let chain = Arc::new(ReceiptChain::default());
        let shutdown = Shutdown::new();
        let checker = TxChecker::start(chain.clone(), shutdown.subscribe(), POLL);
        checker.handle().check_transaction(record(7)).unwrap();

        let chain_later = chain.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            chain_later
                .receipts
                .lock()
                .unwrap()
                .insert(record(7).tx_hash, mined(false));
        });

        let report = tokio::time::timeout(Duration::from_secs(2), checker.shutdown())
            .await
            .unwrap();
        assert_eq!(report.reverted, 1);
        assert_eq!(report.total(), 1);
    }
}
