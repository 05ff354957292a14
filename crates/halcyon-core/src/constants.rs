//! Consensus constants. All monetary values in base units (1 HAL = 10^8 units).

/// One coin in base units.
pub const COIN: i64 = 100_000_000;

/// One cent in base units; outputs below this raise the fee floor.
pub const CENT: i64 = 1_000_000;

/// Largest representable amount. Amount arithmetic must stay in `[0, MAX_MONEY]`.
pub const MAX_MONEY: i64 = i64::MAX;

/// Check that an amount is within the valid money range.
pub const fn money_range(value: i64) -> bool {
    0 <= value && value <= MAX_MONEY
}

/// Maximum serialized block size after the size fork.
pub const MAX_BLOCK_SIZE: usize = 8_000_000;

/// Maximum serialized block size before the size fork.
pub const OLD_MAX_BLOCK_SIZE: usize = 1_000_000;

/// Largest transaction considered standard for relay.
pub const MAX_STANDARD_TX_SIZE: usize = OLD_MAX_BLOCK_SIZE / 5;

/// Signature-operation budget for a single block.
pub const MAX_BLOCK_SIGOPS: usize = OLD_MAX_BLOCK_SIZE / 50;

/// Maximum entries in a single `inv` message.
pub const MAX_INV_SZ: usize = 50_000;

/// Default cap on the orphan-transaction map.
pub const DEFAULT_MAX_ORPHAN_TX: usize = 100;

/// Default cap on the orphan-block map.
pub const DEFAULT_MAX_ORPHAN_BLOCKS: usize = 750;

/// Fee floor for inclusion in a mined block.
pub const MIN_TX_FEE: i64 = 10_000;

/// Fee floor for relay.
pub const MIN_RELAY_TX_FEE: i64 = 10_000;

/// `nLockTime` values below this are block heights, above are timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Annual proof-of-stake reward: 10%.
pub const COIN_YEAR_REWARD: i64 = 10 * CENT;

/// Target block spacing in seconds.
pub const TARGET_SPACING: u32 = 30;

/// Target block spacing before the spacing fork.
pub const OLD_TARGET_SPACING: u32 = 2 * 60;

/// Retarget timespan in seconds.
pub const TARGET_TIMESPAN: i64 = 2 * 60 * 60;

/// Number of recent blocks averaged by the V3 retarget.
pub const TARGET_AVERAGE_BLOCK_COUNT: usize = 100;

/// Minimum age before an output can stake.
pub const STAKE_MIN_AGE: u32 = 24 * 60 * 60;

/// Age beyond which stake weight stops accumulating.
pub const STAKE_MAX_AGE: u32 = 7 * 24 * 60 * 60;

/// Time between stake-modifier recomputations.
pub const MODIFIER_INTERVAL: u32 = 10 * 60;

/// Confirmations before a coinbase or coinstake output may be spent.
pub const COINBASE_MATURITY: i32 = 120;

/// Maturity before the confirmation-count fork.
pub const OLD_COINBASE_MATURITY: i32 = 30;

/// Maturity on early testnet.
pub const OLD_TESTNET_COINBASE_MATURITY: i32 = 10;

/// Clock drift tolerated into the future, in seconds.
pub const FUTURE_DRIFT: i64 = 10 * 60;

/// Clock drift tolerated into the past, in seconds.
pub const PAST_DRIFT: i64 = 10 * 60;

/// Sentinel height marking a transaction as living in the mempool.
pub const MEMPOOL_HEIGHT: u32 = 0x7FFF_FFFF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_limits() {
        assert_eq!(MAX_STANDARD_TX_SIZE, 200_000);
        assert_eq!(MAX_BLOCK_SIGOPS, 20_000);
    }

    #[test]
    fn money_range_bounds() {
        assert!(money_range(0));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(-1));
    }
}
