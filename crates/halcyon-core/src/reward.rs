//! Block subsidies: the proof-of-work schedule and the coin-age stake
//! reward.

use crate::constants::{CENT, COIN, COIN_YEAR_REWARD};
use crate::params::Params;

/// Coinbase reward for a proof-of-work block mined at `best_height`.
///
/// Height 0 carries the premine; the 2000-coin era runs through the last
/// PoW block, after which PoW blocks earn fees only.
pub fn proof_of_work_reward(best_height: i32, fees: i64, params: &Params) -> i64 {
    let subsidy = if best_height == 0 {
        124_000_000 * COIN
    } else if best_height > params.last_pow_block() {
        0
    } else {
        2_000 * COIN
    };
    subsidy + fees
}

/// Coinstake reward for `coin_age` coin-days of consumed stake.
///
/// 10% annually: `coin_age × COIN_YEAR_REWARD × 33 / (365×33 + 8)` keeps
/// the leap-year average without floating point.
pub fn proof_of_stake_reward(coin_age: u64, fees: i64) -> i64 {
    let subsidy = (coin_age as i64).saturating_mul(COIN_YEAR_REWARD) * 33 / (365 * 33 + 8);
    subsidy + fees
}

/// Accumulate one input's stake weight in cent-seconds.
pub fn cent_seconds(value: i64, age_seconds: i64) -> u128 {
    if value <= 0 || age_seconds <= 0 {
        return 0;
    }
    (value as u128) * (age_seconds as u128) / CENT as u128
}

/// Reduce accumulated cent-seconds to whole coin-days.
pub fn cent_seconds_to_coin_days(cent_secs: u128) -> u64 {
    (cent_secs * CENT as u128 / COIN as u128 / (24 * 60 * 60)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Network;

    #[test]
    fn premine_at_height_zero() {
        let params = Params::new(Network::Mainnet);
        assert_eq!(proof_of_work_reward(0, 0, &params), 124_000_000 * COIN);
    }

    #[test]
    fn era_reward_until_last_pow_block() {
        let params = Params::new(Network::Mainnet);
        assert_eq!(proof_of_work_reward(1, 0, &params), 2_000 * COIN);
        assert_eq!(proof_of_work_reward(500, 0, &params), 2_000 * COIN);
        assert_eq!(proof_of_work_reward(501, 0, &params), 0);
    }

    #[test]
    fn fees_always_added() {
        let params = Params::new(Network::Mainnet);
        assert_eq!(proof_of_work_reward(501, 1_234, &params), 1_234);
    }

    #[test]
    fn stake_reward_is_ten_percent_yearly() {
        // 365 coin-days should earn just under 10% of one coin
        let reward = proof_of_stake_reward(365, 0);
        let expected = 365i64 * COIN_YEAR_REWARD * 33 / (365 * 33 + 8);
        assert_eq!(reward, expected);
        assert!(reward < COIN / 10);
        assert!(reward > COIN / 10 - COIN / 1000);
    }

    #[test]
    fn stake_reward_zero_age() {
        assert_eq!(proof_of_stake_reward(0, 7), 7);
    }

    #[test]
    fn coin_day_accumulation() {
        // one coin held one day = one coin-day
        let cs = cent_seconds(COIN, 24 * 60 * 60);
        assert_eq!(cent_seconds_to_coin_days(cs), 1);
        // half a day rounds down
        let cs = cent_seconds(COIN, 12 * 60 * 60);
        assert_eq!(cent_seconds_to_coin_days(cs), 0);
    }

    #[test]
    fn coin_day_negative_inputs_are_zero() {
        assert_eq!(cent_seconds(-5, 100), 0);
        assert_eq!(cent_seconds(5, -100), 0);
    }
}
