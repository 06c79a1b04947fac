//! Constants and unit helpers for the settler

use alloy::primitives::{uint, U256};
use std::time::Duration;

/// secp256k1 curve order N
pub const SECP256K1_N: U256 =
    uint!(0xFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEBAAEDCE6AF48A03BBFD25E8CD0364141_U256);

/// floor(N / 2), the largest S accepted as canonical
pub const SECP256K1_HALF_N: U256 =
    uint!(0x7FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF5D576E7357A4501DDFE92F46681B20A0_U256);

/// Byte width of R and S on secp256k1
pub const SCALAR_BYTES: usize = 32;

/// Estimated gas is multiplied by this factor to absorb state drift
/// between estimation and execution
pub const GAS_LIMIT_MULTIPLIER: u64 = 2;

/// Ether has 18 decimals
pub const ETHER_DECIMALS: u8 = 18;

/// Default block polling interval
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);

/// Default receipt polling interval for the outcome checker
pub const DEFAULT_RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Default number of blocks between balance samples
pub const DEFAULT_BALANCE_CHECK_INTERVAL: u64 = 100;

/// Default danger threshold (1 ETH)
pub const DEFAULT_DANGER_BALANCE_THRESHOLD: &str = "1";

/// Default significant-decrease threshold (0.001 ETH)
pub const DEFAULT_BALANCE_DECREASE_THRESHOLD: &str = "0.001";

/// Unscale a U256 value to floating point with specified decimals
pub fn unscale_from_decimals(value: U256, decimals: u8) -> f64 {
    let divisor = 10u64.pow(decimals as u32) as f64;
    let value_u128: u128 = value.try_into().unwrap_or(u128::MAX);
    value_u128 as f64 / divisor
}

/// Format a wei amount as ether with 6 decimals, for alerts
pub fn format_balance(wei: U256) -> String {
    format!("{:.6}", unscale_from_decimals(wei, ETHER_DECIMALS))
}

/// Format a wei amount as ether with full precision, for fee logs
pub fn format_fee(wei: U256) -> String {
    alloy::primitives::utils::format_units(wei, ETHER_DECIMALS).unwrap_or_else(|_| wei.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_order() {
        assert_eq!(SECP256K1_N / U256::from(2u64), SECP256K1_HALF_N);
    }

    #[test]
    fn test_format_balance() {
        // 0.5 ETH
        assert_eq!(format_balance(U256::from(500_000_000_000_000_000u64)), "0.500000");
        // 1.234567 ETH
        assert_eq!(format_balance(U256::from(1_234_567_000_000_000_000u64)), "1.234567");
    }

    #[test]
    fn test_format_fee() {
        // 21000 gas at 1 gwei
        let fee = U256::from(21_000u64) * U256::from(1_000_000_000u64);
        assert_eq!(format_fee(fee), "0.000021000000000000");
    }
}
