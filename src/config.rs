//! Service configuration for the settler
//!
//! Values come from the process environment (optionally seeded from a `.env`
//! file by the binary). Loading is written against a key lookup function so
//! it can be exercised without touching the real environment.

use crate::constants::{
    DEFAULT_BALANCE_CHECK_INTERVAL, DEFAULT_BALANCE_DECREASE_THRESHOLD,
    DEFAULT_DANGER_BALANCE_THRESHOLD, DEFAULT_POLLING_INTERVAL, DEFAULT_RECEIPT_POLL_INTERVAL,
};
use alloy::primitives::utils::parse_ether;
use alloy::primitives::{Address, U256};
use eyre::{bail, eyre, Context, Result};
use std::fmt;
use std::time::Duration;

const RPC_ENDPOINT: &str = "RPC_ENDPOINT";
const PROXY_ADDRESS: &str = "PROXY_ADDRESS";
const SIGN_MODE: &str = "SIGN_MODE";
const PRIVATE_KEY: &str = "PRIVATE_KEY";
const KMS_KEY_ID: &str = "KMS_KEY_ID";
const KMS_ENDPOINT: &str = "KMS_ENDPOINT";
const KMS_ACCESS_TOKEN: &str = "KMS_ACCESS_TOKEN";
const POLLING_INTERVAL: &str = "POLLING_INTERVAL";
const RECEIPT_POLL_INTERVAL_MS: &str = "RECEIPT_POLL_INTERVAL_MS";
const DANGER_BALANCE_THRESHOLD: &str = "DANGER_BALANCE_THRESHOLD";
const BALANCE_DECREASE_THRESHOLD: &str = "BALANCE_DECREASE_THRESHOLD";
const BALANCE_CHECK_INTERVAL: &str = "BALANCE_CHECK_INTERVAL";
const SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";
const SETTLE_POLICY: &str = "SETTLE_POLICY";

/// Where signatures come from
#[derive(Clone)]
pub enum SignMode {
    /// In-process secp256k1 key
    Local {
        /// Hex-encoded private key (with or without 0x prefix)
        private_key: String,
    },
    /// Key held by a remote key service
    Remote {
        /// Base URL of the key service
        endpoint: String,
        /// Identifier of the signing key
        key_id: String,
        /// Optional bearer token
        access_token: Option<String>,
    },
}

// Keep key material out of logs.
impl fmt::Debug for SignMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { .. } => f.write_str("Local"),
            Self::Remote {
                endpoint, key_id, ..
            } => f
                .debug_struct("Remote")
                .field("endpoint", endpoint)
                .field("key_id", key_id)
                .finish(),
        }
    }
}

/// How the trigger loop decides that settlement is due
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SettlePolicy {
    /// Ask the contract's `checkSettleRequired()` predicate
    #[default]
    Predicate,
    /// Treat a non-empty `getSettleRequiredTenants()` list as due
    RequiredTenants,
}

impl std::str::FromStr for SettlePolicy {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "predicate" => Ok(Self::Predicate),
            "required-tenants" | "required_tenants" => Ok(Self::RequiredTenants),
            other => bail!("unknown settle policy '{}', expected predicate|required-tenants", other),
        }
    }
}

/// Complete settler configuration
#[derive(Debug, Clone)]
pub struct SettlerConfig {
    /// RPC endpoint URL
    pub rpc_url: String,
    /// TenantManager proxy address
    pub contract: Address,
    /// Signing identity
    pub sign_mode: SignMode,
    /// Settlement-due policy
    pub settle_policy: SettlePolicy,
    /// Block polling interval
    pub polling_interval: Duration,
    /// Receipt polling interval used while waiting for mining
    pub receipt_poll_interval: Duration,
    /// Balance below which the account is in danger (wei)
    pub danger_threshold: U256,
    /// Drop since the last alert that re-alerts while in danger (wei)
    pub change_threshold: U256,
    /// Blocks between balance samples
    pub balance_check_interval: u64,
    /// Slack incoming webhook; alerts are only logged when unset
    pub slack_webhook_url: Option<String>,
}

impl SettlerConfig {
    /// Create a configuration with default intervals and thresholds
    pub fn new(rpc_url: impl Into<String>, contract: Address, sign_mode: SignMode) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            contract,
            sign_mode,
            settle_policy: SettlePolicy::default(),
            polling_interval: DEFAULT_POLLING_INTERVAL,
            receipt_poll_interval: DEFAULT_RECEIPT_POLL_INTERVAL,
            danger_threshold: parse_ether(DEFAULT_DANGER_BALANCE_THRESHOLD)
                .unwrap_or(U256::ZERO),
            change_threshold: parse_ether(DEFAULT_BALANCE_DECREASE_THRESHOLD)
                .unwrap_or(U256::ZERO),
            balance_check_interval: DEFAULT_BALANCE_CHECK_INTERVAL,
            slack_webhook_url: None,
        }
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| get(key).ok_or_else(|| eyre!("env {} is not set", key));

        let rpc_url = require(RPC_ENDPOINT)?;
        let contract: Address = require(PROXY_ADDRESS)?
            .trim()
            .parse()
            .with_context(|| format!("invalid {}", PROXY_ADDRESS))?;

        let sign_mode = match get(SIGN_MODE).as_deref().map(str::trim) {
            None | Some("local") => SignMode::Local {
                private_key: require(PRIVATE_KEY)?,
            },
            Some("remote") => SignMode::Remote {
                endpoint: require(KMS_ENDPOINT)?,
                key_id: require(KMS_KEY_ID)?,
                access_token: get(KMS_ACCESS_TOKEN),
            },
            Some(other) => bail!("invalid {} '{}', expected local|remote", SIGN_MODE, other),
        };

        let mut config = Self::new(rpc_url, contract, sign_mode);

        if let Some(policy) = get(SETTLE_POLICY) {
            config = config.with_settle_policy(policy.parse()?);
        }
        if let Some(secs) = get(POLLING_INTERVAL) {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("failed to parse {}", POLLING_INTERVAL))?;
            if secs == 0 {
                bail!("{} must be greater than zero", POLLING_INTERVAL);
            }
            config = config.with_polling_interval(Duration::from_secs(secs));
        }
        if let Some(ms) = get(RECEIPT_POLL_INTERVAL_MS) {
            let ms: u64 = ms
                .trim()
                .parse()
                .with_context(|| format!("failed to parse {}", RECEIPT_POLL_INTERVAL_MS))?;
            config.receipt_poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(eth) = get(DANGER_BALANCE_THRESHOLD) {
            config.danger_threshold = parse_ether(eth.trim())
                .with_context(|| format!("failed to parse {}", DANGER_BALANCE_THRESHOLD))?;
        }
        if let Some(eth) = get(BALANCE_DECREASE_THRESHOLD) {
            config.change_threshold = parse_ether(eth.trim())
                .with_context(|| format!("failed to parse {}", BALANCE_DECREASE_THRESHOLD))?;
        }
        if let Some(blocks) = get(BALANCE_CHECK_INTERVAL) {
            let blocks: u64 = blocks
                .trim()
                .parse()
                .with_context(|| format!("failed to parse {}", BALANCE_CHECK_INTERVAL))?;
            config.balance_check_interval = blocks.max(1);
        }
        if let Some(url) = get(SLACK_WEBHOOK_URL) {
            config = config.with_slack_webhook(url.trim());
        }

        Ok(config)
    }

    /// Set the settlement-due policy
    pub fn with_settle_policy(mut self, policy: SettlePolicy) -> Self {
        self.settle_policy = policy;
        self
    }

    /// Set the block polling interval
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set the Slack webhook used for balance alerts
    pub fn with_slack_webhook(mut self, url: impl Into<String>) -> Self {
        self.slack_webhook_url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_local_defaults() {
        let config = SettlerConfig::from_lookup(lookup(&[
            (RPC_ENDPOINT, "http://localhost:8545"),
            (PROXY_ADDRESS, CONTRACT),
            (PRIVATE_KEY, "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"),
        ]))
        .unwrap();

        assert!(matches!(config.sign_mode, SignMode::Local { .. }));
        assert_eq!(config.contract, CONTRACT.parse::<Address>().unwrap());
        assert_eq!(config.settle_policy, SettlePolicy::Predicate);
        assert_eq!(config.polling_interval, DEFAULT_POLLING_INTERVAL);
        assert_eq!(config.danger_threshold, U256::from(10u64).pow(U256::from(18u64)));
        assert_eq!(config.change_threshold, U256::from(10u64).pow(U256::from(15u64)));
        assert_eq!(config.balance_check_interval, 100);
        assert!(config.slack_webhook_url.is_none());
    }

    #[test]
    fn test_remote_mode() {
        let config = SettlerConfig::from_lookup(lookup(&[
            (RPC_ENDPOINT, "ws://localhost:8546"),
            (PROXY_ADDRESS, CONTRACT),
            (SIGN_MODE, "remote"),
            (KMS_ENDPOINT, "https://kms.internal"),
            (KMS_KEY_ID, "settler-key"),
            (POLLING_INTERVAL, "5"),
            (DANGER_BALANCE_THRESHOLD, "0.5"),
            (SETTLE_POLICY, "required-tenants"),
            (SLACK_WEBHOOK_URL, "https://hooks.slack.com/services/x"),
        ]))
        .unwrap();

        match &config.sign_mode {
            SignMode::Remote {
                endpoint,
                key_id,
                access_token,
            } => {
                assert_eq!(endpoint, "https://kms.internal");
                assert_eq!(key_id, "settler-key");
                assert!(access_token.is_none());
            }
            other => panic!("unexpected sign mode {:?}", other),
        }
        assert_eq!(config.polling_interval, Duration::from_secs(5));
        assert_eq!(config.danger_threshold, U256::from(500_000_000_000_000_000u64));
        assert_eq!(config.settle_policy, SettlePolicy::RequiredTenants);
        assert!(config.slack_webhook_url.is_some());
    }

    #[test]
    fn test_builder_setters() {
        let sign_mode = SignMode::Local {
            private_key: "0x01".to_string(),
        };
        let config = SettlerConfig::new("http://localhost:8545", Address::ZERO, sign_mode)
            .with_settle_policy(SettlePolicy::RequiredTenants)
            .with_polling_interval(Duration::from_millis(250))
            .with_slack_webhook("https://hooks.slack.com/services/y");

        assert_eq!(config.settle_policy, SettlePolicy::RequiredTenants);
        assert_eq!(config.polling_interval, Duration::from_millis(250));
        assert_eq!(
            config.slack_webhook_url.as_deref(),
            Some("https://hooks.slack.com/services/y")
        );
        assert_eq!(config.receipt_poll_interval, DEFAULT_RECEIPT_POLL_INTERVAL);
    }

    #[test]
    fn test_missing_required() {
        let err = SettlerConfig::from_lookup(lookup(&[(RPC_ENDPOINT, "http://localhost:8545")]))
            .unwrap_err();
        assert!(err.to_string().contains(PROXY_ADDRESS));

        // remote mode without a key id
        let err = SettlerConfig::from_lookup(lookup(&[
            (RPC_ENDPOINT, "http://localhost:8545"),
            (PROXY_ADDRESS, CONTRACT),
            (SIGN_MODE, "remote"),
            (KMS_ENDPOINT, "https://kms.internal"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains(KMS_KEY_ID));
    }

    #[test]
    fn test_malformed_values() {
        let base = [
            (RPC_ENDPOINT, "http://localhost:8545"),
            (PROXY_ADDRESS, CONTRACT),
            (PRIVATE_KEY, "00"),
        ];

        let mut bad_mode = base.to_vec();
        bad_mode.push((SIGN_MODE, "ledger"));
        assert!(SettlerConfig::from_lookup(lookup(&bad_mode)).is_err());

        let mut bad_interval = base.to_vec();
        bad_interval.push((POLLING_INTERVAL, "soon"));
        assert!(SettlerConfig::from_lookup(lookup(&bad_interval)).is_err());

        let mut zero_interval = base.to_vec();
        zero_interval.push((POLLING_INTERVAL, "0"));
        assert!(SettlerConfig::from_lookup(lookup(&zero_interval)).is_err());

        let mut bad_threshold = base.to_vec();
        bad_threshold.push((DANGER_BALANCE_THRESHOLD, "lots"));
        assert!(SettlerConfig::from_lookup(lookup(&bad_threshold)).is_err());
    }

    #[test]
    fn test_sign_mode_debug_hides_key() {
        let mode = SignMode::Local {
            private_key: "deadbeef".to_string(),
        };
        assert!(!format!("{:?}", mode).contains("deadbeef"));
    }
}
