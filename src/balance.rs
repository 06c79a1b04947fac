//! Balance guard
//!
//! Turns sparse balance samples of the settler account into danger/recovery
//! alerts with hysteresis: an alert fires when the balance crosses the danger
//! threshold in either direction, and again while in danger each time the
//! balance has dropped by at least the change threshold since the last alert.

use crate::alert::Notifier;
use crate::constants::format_balance;
use alloy::primitives::{Address, U256};
use std::sync::{Mutex, PoisonError};

/// Alert thresholds, in wei
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceThresholds {
    /// Balance strictly below this is dangerous
    pub danger: U256,
    /// Drop since the last alert that warrants another one while in danger
    pub change: U256,
}

/// Hysteresis state, reset only by restarting the process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceState {
    /// Balance reported by the most recent alert
    pub last_alert_balance: Option<U256>,
    /// Whether the most recent alert was a danger alert
    pub in_danger: bool,
}

/// An alert decided by the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceAlert {
    /// Balance is below the danger threshold
    Danger { balance: U256 },
    /// Balance is back above the danger threshold
    Recovered { balance: U256 },
}

impl BalanceAlert {
    /// Operator-facing message for `address`
    pub fn message(&self, address: Address) -> String {
        match self {
            Self::Danger { balance } => format!(
                "⚠️ Settler wallet ETH balance has dropped to a dangerous level.\n *Address*: {}\n *Current balance*: {} ETH\n",
                address,
                format_balance(*balance)
            ),
            Self::Recovered { balance } => format!(
                "✅ Settler wallet ETH balance has recovered.\n *Address*: {}\n *Current balance*: {} ETH\n",
                address,
                format_balance(*balance)
            ),
        }
    }
}

/// Whether a sample of `current` should produce an alert
pub fn should_send_alert(
    current: U256,
    last_alert_balance: Option<U256>,
    was_in_danger: bool,
    thresholds: &BalanceThresholds,
) -> bool {
    let is_danger = current < thresholds.danger;
    if is_danger != was_in_danger {
        return true;
    }

    match last_alert_balance {
        Some(last) if is_danger => last.saturating_sub(current) >= thresholds.change,
        _ => false,
    }
}

/// Whether block `current` starts a new sampling window of `interval` blocks
///
/// The first observed block is always sampled. Afterwards a sample is due
/// each time the height crosses a multiple of `interval`, so skipped blocks
/// never skip a sample.
pub fn is_sample_due(previous: Option<u64>, current: u64, interval: u64) -> bool {
    let interval = interval.max(1);
    match previous {
        None => true,
        Some(previous) => current / interval > previous / interval,
    }
}

/// Balance guard with its own hysteresis state
pub struct BalanceGuard<N> {
    thresholds: BalanceThresholds,
    notifier: N,
    state: Mutex<BalanceState>,
}

impl<N: Notifier> BalanceGuard<N> {
    /// Create a guard with empty state
    pub fn new(thresholds: BalanceThresholds, notifier: N) -> Self {
        Self {
            thresholds,
            notifier,
            state: Mutex::new(BalanceState::default()),
        }
    }

    /// Alert delivery channel
    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Snapshot of the current state
    pub fn state(&self) -> BalanceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide on a sample and update the state if it alerts
    ///
    /// The lock is held only for the decision and the update.
    pub fn evaluate(&self, balance: U256) -> Option<BalanceAlert> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if !should_send_alert(
            balance,
            state.last_alert_balance,
            state.in_danger,
            &self.thresholds,
        ) {
            return None;
        }

        let is_danger = balance < self.thresholds.danger;
        state.in_danger = is_danger;
        state.last_alert_balance = Some(balance);

        Some(if is_danger {
            BalanceAlert::Danger { balance }
        } else {
            BalanceAlert::Recovered { balance }
        })
    }

    /// Evaluate a sample for `address` and deliver any resulting alert
    ///
    /// Delivery failures are logged only; the state update stands.
    pub async fn observe(&self, address: Address, balance: U256) -> Option<BalanceAlert> {
        let alert = self.evaluate(balance)?;

        match alert {
            BalanceAlert::Danger { .. } => tracing::warn!(
                %address,
                balance = %format_balance(balance),
                "Sending danger alert"
            ),
            BalanceAlert::Recovered { .. } => tracing::info!(
                %address,
                balance = %format_balance(balance),
                "Sending recovery alert"
            ),
        }

        if let Err(e) = self.notifier.notify(&alert.message(address)).await {
            tracing::error!(%address, "Failed to deliver balance alert: {:#}", e);
        }

        Some(alert)
    }
}
