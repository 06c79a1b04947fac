//! Service wiring
//!
//! Builds every component from a [`SettlerConfig`], runs the trigger loop
//! until shutdown and then drains the outcome checker.

use crate::alert::AlertChannel;
use crate::balance::{BalanceGuard, BalanceThresholds};
use crate::chain::{ChainClient, RpcChain};
use crate::checker::{CheckerReport, TxChecker};
use crate::config::SettlerConfig;
use crate::constants::format_balance;
use crate::settler::{Settler, SettlerOptions};
use crate::shutdown::Shutdown;
use crate::signer::{SettlerSigner, TransactionSigner};
use eyre::{Context, Result};
use std::sync::Arc;

/// Run the settlement agent until `shutdown` fires
///
/// Returns once the trigger loop has stopped and every tracked transaction
/// has been resolved or abandoned. Startup failures are returned before any
/// task is spawned.
pub async fn start(config: SettlerConfig, shutdown: &Shutdown) -> Result<CheckerReport> {
    let chain = Arc::new(
        RpcChain::dial(&config.rpc_url)
            .await
            .context("Failed to connect to RPC endpoint")?,
    );
    let chain_id = chain.chain_id().await?;

    let signer = SettlerSigner::from_config(&config.sign_mode)
        .await
        .context("Failed to initialise signer")?;
    let address = signer.address();

    match chain.balance(address).await {
        Ok(balance) => tracing::info!(
            %address,
            balance = %format_balance(balance),
            "Settler account balance"
        ),
        Err(e) => tracing::warn!(%address, "Failed to read starting balance: {:#}", e),
    }

    tracing::info!(
        chain_id,
        %address,
        signer = signer.mode(),
        contract = %config.contract,
        "Settlement agent starting"
    );

    let alerts = AlertChannel::from_webhook(config.slack_webhook_url.as_deref())?;
    let guard = BalanceGuard::new(
        BalanceThresholds {
            danger: config.danger_threshold,
            change: config.change_threshold,
        },
        alerts,
    );

    let checker = TxChecker::start(
        chain.clone(),
        shutdown.subscribe(),
        config.receipt_poll_interval,
    );

    let options = SettlerOptions {
        contract: config.contract,
        chain_id,
        policy: config.settle_policy,
        polling_interval: config.polling_interval,
        balance_check_interval: config.balance_check_interval,
    };
    Settler::new(chain, signer, checker.handle(), options)
        .with_balance_guard(guard)
        .run(shutdown.subscribe())
        .await;

    let report = checker.shutdown().await;
    tracing::info!(
        confirmed = report.confirmed,
        reverted = report.reverted,
        abandoned = report.abandoned,
        failed = report.failed,
        "Transaction checker drained"
    );

    Ok(report)
}
