//! Difficulty targets, chain trust, and the three retarget generations.
//!
//! Targets travel in the classic compact form (`nBits`). Retargeting moved
//! through three versions over the chain's history: V1 retargets every
//! block with an exponential moving average toward the target spacing, V2
//! clamps a negative measured spacing, and V3 (after the retarget
//! correction fork) averages adjacent differences of the sorted recent
//! block times before applying a tuned variant of the same filter.

use primitive_types::{U256, U512};

use crate::constants::{TARGET_AVERAGE_BLOCK_COUNT, TARGET_TIMESPAN};
use crate::hash::Hash256;
use crate::params::{NetworkFork, Params};

/// Easiest allowed proof-of-work target.
pub fn proof_of_work_limit() -> U256 {
    U256::MAX >> 1
}

/// Easiest allowed proof-of-stake target.
pub fn proof_of_stake_limit() -> U256 {
    U256::MAX >> 20
}

/// Expand compact `nBits` into a 256-bit target.
pub fn compact_to_target(bits: u32) -> U256 {
    let size = bits >> 24;
    let mantissa = U256::from(bits & 0x007f_ffff);
    if size <= 3 {
        mantissa >> (8 * (3 - size))
    } else {
        mantissa << (8 * (size - 3))
    }
}

/// Compress a 256-bit target into compact `nBits`.
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() as u32).div_ceil(8);
    let mut mantissa: u32 = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        ((target >> (8 * (size - 3))).low_u64()) as u32
    };
    // avoid setting the sign bit
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    (size << 24) | mantissa
}

/// Trust contributed by one block: `2^256 / (target + 1)`.
///
/// Computed as `~target / (target + 1) + 1` to stay inside 256 bits.
pub fn block_trust(bits: u32) -> U256 {
    let target = compact_to_target(bits);
    if target.is_zero() {
        return U256::zero();
    }
    (!target) / (target + U256::one()) + U256::one()
}

/// Check a hash against a claimed compact target.
pub fn check_proof_of_work(hash: &Hash256, bits: u32) -> bool {
    let target = compact_to_target(bits);
    if target.is_zero() || target > proof_of_work_limit() {
        return false;
    }
    U256::from_little_endian(&hash.0) <= target
}

/// Header view the retarget algorithms walk backwards over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetargetEntry {
    pub hash: Hash256,
    pub prev: Hash256,
    pub height: i32,
    pub time: i64,
    pub bits: u32,
    pub is_proof_of_stake: bool,
}

/// Read access to indexed headers, keyed by block hash.
pub trait HeaderChain {
    fn entry(&self, hash: &Hash256) -> Option<RetargetEntry>;
}

/// Walk back from `from` to the most recent block of the wanted proof type.
fn last_of_type<C: HeaderChain>(chain: &C, from: RetargetEntry, pos: bool) -> RetargetEntry {
    let mut current = from;
    while !current.prev.is_zero() && current.is_proof_of_stake != pos {
        match chain.entry(&current.prev) {
            Some(prev) => current = prev,
            None => break,
        }
    }
    current
}

fn target_limit(pos: bool) -> U256 {
    if pos { proof_of_stake_limit() } else { proof_of_work_limit() }
}

/// `target * num / den` in 512-bit intermediate space, clamped to `limit`.
fn scale_target(target: U256, num: i64, den: i64, limit: U256) -> U256 {
    if num <= 0 || den <= 0 {
        return limit;
    }
    let wide = target.full_mul(U256::from(num as u64)) / U512::from(den as u64);
    let scaled = U256::try_from(wide).unwrap_or(limit);
    if scaled.is_zero() || scaled > limit { limit } else { scaled }
}

/// The compact target required for the block following `last_hash`.
pub fn next_target_required<C: HeaderChain>(
    chain: &C,
    last_hash: &Hash256,
    proof_of_stake: bool,
    params: &Params,
) -> u32 {
    let limit = target_limit(proof_of_stake);
    let Some(last) = chain.entry(last_hash) else {
        return target_to_compact(limit);
    };
    if last.height < 2000 {
        next_target_v1(chain, last, proof_of_stake, params)
    } else if params.fork_active(NetworkFork::RetargetCorrection, last.height) {
        next_target_v3(chain, last, proof_of_stake, params)
    } else {
        next_target_v2(chain, last, proof_of_stake, params)
    }
}

/// Shared prologue: the last two same-type blocks, or the limit when the
/// chain is too short.
fn two_back<C: HeaderChain>(
    chain: &C,
    last: RetargetEntry,
    pos: bool,
) -> Result<(RetargetEntry, RetargetEntry), u32> {
    let limit = target_to_compact(target_limit(pos));
    let prev = last_of_type(chain, last, pos);
    if prev.prev.is_zero() {
        return Err(limit);
    }
    let Some(before_prev) = chain.entry(&prev.prev) else {
        return Err(limit);
    };
    let prev_prev = last_of_type(chain, before_prev, pos);
    if prev_prev.prev.is_zero() {
        return Err(limit);
    }
    Ok((prev, prev_prev))
}

fn ema_retarget(prev_bits: u32, actual_spacing: i64, spacing: i64, limit: U256) -> u32 {
    let interval = TARGET_TIMESPAN / spacing;
    let num = (interval - 1) * spacing + 2 * actual_spacing;
    let den = (interval + 1) * spacing;
    target_to_compact(scale_target(compact_to_target(prev_bits), num, den, limit))
}

fn next_target_v1<C: HeaderChain>(chain: &C, last: RetargetEntry, pos: bool, params: &Params) -> u32 {
    let limit = target_limit(pos);
    let (prev, prev_prev) = match two_back(chain, last, pos) {
        Ok(pair) => pair,
        Err(compact) => return compact,
    };
    let actual_spacing = prev.time - prev_prev.time;
    ema_retarget(prev.bits, actual_spacing, params.target_spacing(last.height) as i64, limit)
}

fn next_target_v2<C: HeaderChain>(chain: &C, last: RetargetEntry, pos: bool, params: &Params) -> u32 {
    let limit = target_limit(pos);
    let (prev, prev_prev) = match two_back(chain, last, pos) {
        Ok(pair) => pair,
        Err(compact) => return compact,
    };
    let spacing = params.target_spacing(last.height) as i64;
    let mut actual_spacing = prev.time - prev_prev.time;
    if actual_spacing < 0 {
        actual_spacing = spacing;
    }
    ema_retarget(prev.bits, actual_spacing, spacing, limit)
}

/// Average spacing for V3: sorted recent block times, adjacent differences.
fn actual_spacing_v3<C: HeaderChain>(chain: &C, last: RetargetEntry, params: &Params) -> i64 {
    let fork_block = params.fork_height(NetworkFork::RetargetCorrection);
    let mut count = (last.height as i64) - (fork_block as i64 + 1);
    count = count.clamp(2, TARGET_AVERAGE_BLOCK_COUNT as i64);

    let mut times = Vec::with_capacity(count as usize);
    let mut current = Some(last);
    for _ in 0..count {
        match current {
            Some(entry) => {
                times.push(entry.time);
                current = chain.entry(&entry.prev);
            }
            None => break,
        }
    }
    if times.len() < 2 {
        return params.target_spacing(last.height) as i64;
    }
    times.sort_unstable();
    let diffs: Vec<i64> = times.windows(2).map(|w| w[1] - w[0]).collect();
    diffs.iter().sum::<i64>() / diffs.len() as i64
}

/// Tuning constants for the V3 filter; chosen so one step moves the
/// difficulty at most a few percent in either direction.
const V3_K: i64 = 15;
const V3_L: i64 = 7;
const V3_M: i64 = 90;

fn next_target_v3<C: HeaderChain>(chain: &C, last: RetargetEntry, pos: bool, params: &Params) -> u32 {
    let limit = target_limit(pos);
    let (prev, _) = match two_back(chain, last, pos) {
        Ok(pair) => pair,
        Err(compact) => return compact,
    };
    let spacing = params.target_spacing(last.height) as i64;
    debug_assert_eq!(spacing, 30);
    debug_assert_eq!(TARGET_TIMESPAN, 2 * 60 * 60);

    let mut actual_spacing = actual_spacing_v3(chain, last, params);
    if actual_spacing < 0 {
        actual_spacing = spacing;
    }

    let interval = TARGET_TIMESPAN / spacing;
    let num = (interval - V3_L + V3_K) * spacing + (V3_M + V3_L) * actual_spacing;
    let den = (interval + V3_K) * spacing + V3_M * actual_spacing;
    target_to_compact(scale_target(compact_to_target(prev.bits), num, den, limit))
}

/// Easiest target reachable `delta_time` seconds after a base target,
/// allowing a 200% relaxation per day. Bounds the checkpoint spam gate.
fn compute_max_bits(limit: U256, base_bits: u32, mut delta_time: i64) -> u32 {
    let mut result = compact_to_target(base_bits).saturating_mul(U256::from(2u8));
    while delta_time > 0 && result < limit {
        result = result.saturating_mul(U256::from(2u8));
        delta_time -= 24 * 60 * 60;
    }
    if result > limit {
        result = limit;
    }
    target_to_compact(result)
}

/// Minimum work that could honestly be required `delta_time` after `base_bits`.
pub fn compute_min_work(base_bits: u32, delta_time: i64) -> u32 {
    compute_max_bits(proof_of_work_limit(), base_bits, delta_time)
}

/// Minimum stake difficulty reachable `delta_time` after `base_bits`.
pub fn compute_min_stake(base_bits: u32, delta_time: i64) -> u32 {
    compute_max_bits(proof_of_stake_limit(), base_bits, delta_time)
}
