//! Tenant settlement agent
//!
//! Watches new blocks, calls `settleAll()` on the TenantManager contract
//! whenever it reports settlement as due, tracks every broadcast transaction
//! until it is mined, and alerts when the settler account runs low on ETH.
//!
//! # Components
//!
//! - [`Settler`]: block-driven trigger loop with nonce discipline
//! - [`TxChecker`]: asynchronous outcome checker with revert diagnosis
//! - [`BalanceGuard`]: hysteresis-based balance alerts
//! - [`SettlerSigner`]: in-process key or remote key service
//!
//! # Example
//!
//! ```rust,ignore
//! use op_settler::{service, SettlerConfig, Shutdown};
//!
//! #[tokio::main]
//! async fn main() -> eyre::Result<()> {
//!     let config = SettlerConfig::from_env()?;
//!     let shutdown = Shutdown::new();
//!
//!     let trigger = shutdown.clone();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         trigger.trigger();
//!     });
//!
//!     service::start(config, &shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod alert;
pub mod balance;
pub mod chain;
pub mod checker;
pub mod config;
pub mod constants;
pub mod contracts;
pub mod error;
pub mod logging;
pub mod service;
pub mod settler;
pub mod shutdown;
pub mod signer;

// Re-export main types for convenience
pub use alert::{AlertChannel, Notifier, SlackNotifier};
pub use balance::{BalanceAlert, BalanceGuard, BalanceThresholds};
pub use chain::{CallMessage, CallOutput, ChainClient, MinedReceipt, RpcChain};
pub use checker::{CheckOutcome, CheckerReport, TxCheckMsg, TxChecker, TxCheckerHandle};
pub use config::{SettlePolicy, SettlerConfig, SignMode};
pub use error::{eyre, Context, Report, Result};
pub use settler::{NonceTracker, Settler, SettlerOptions, TickOutcome};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use signer::{LocalSigner, RemoteSigner, SettlerSigner, TransactionSigner};
