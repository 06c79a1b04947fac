//! TenantManager proxy contract bindings

use alloy::sol;

sol! {
    /// Settlement surface of the TenantManager proxy
    #[sol(rpc)]
    interface ITenantManager {
        /// Raised by `settleAll` when a tenant cannot be settled
        error SettlementFailed(string reason);

        /// True when at least one tenant has a pending settlement
        function checkSettleRequired() external view returns (bool);

        /// Tenants whose payout period has elapsed
        function getSettleRequiredTenants() external view returns (address[] memory);

        /// Settle every tenant that is due
        function settleAll() external;
    }
}
