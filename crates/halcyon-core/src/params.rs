//! Per-network parameters and the hard-fork schedule.
//!
//! Fork-gated consensus values (block size, spacing, maturity, the token
//! overlay switch-on) live behind getters here so call sites never embed
//! a height comparison directly.

use crate::constants::{
    COINBASE_MATURITY, MAX_BLOCK_SIZE, OLD_COINBASE_MATURITY, OLD_MAX_BLOCK_SIZE,
    OLD_TARGET_SPACING, OLD_TESTNET_COINBASE_MATURITY, TARGET_SPACING,
};
use crate::hash::Hash256;

/// Which chain this node follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

/// Scheduled consensus rule changes, in activation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetworkFork {
    /// Block size and spacing change; maturity moves to its final value.
    ConfsChanged,
    /// Token overlay enforcement and uniqueness of issued symbols.
    Tachyon,
    /// The corrected V3 difficulty filter.
    RetargetCorrection,
}

/// Expected mainnet genesis hash.
pub const GENESIS_HASH_MAINNET: &str =
    "7286972be4dbc1463d256049b7471c252e6557e222cab9be73181d359cd28bcc";

/// Chain parameters, fixed at startup.
#[derive(Clone, Debug)]
pub struct Params {
    network: Network,
    /// First four bytes of every wire message.
    message_start: [u8; 4],
    /// Height at which each fork takes effect.
    confs_changed_height: i32,
    tachyon_height: i32,
    retarget_correction_height: i32,
    /// First height at which token transactions are considered valid.
    first_valid_token_height: i32,
    /// Proof-of-work subsidies end after this height.
    last_pow_block: i32,
    /// Token ids that are ignored for symbol-uniqueness purposes.
    blacklisted_token_ids: Vec<&'static str>,
    /// Hard-coded `(height, hash)` checkpoints.
    checkpoints: Vec<(i32, &'static str)>,
}

impl Params {
    pub fn new(network: Network) -> Self {
        match network {
            Network::Mainnet => Self {
                network,
                message_start: [0x32, 0x5e, 0x6f, 0x86],
                confs_changed_height: 248_000,
                tachyon_height: 387_028,
                retarget_correction_height: 1_003_125,
                first_valid_token_height: 157_528,
                last_pow_block: 500,
                blacklisted_token_ids: vec![],
                checkpoints: vec![(
                    0,
                    "7286972be4dbc1463d256049b7471c252e6557e222cab9be73181d359cd28bcc",
                )],
            },
            Network::Testnet => Self {
                network,
                message_start: [0x1b, 0xba, 0x63, 0xc5],
                confs_changed_height: 0,
                tachyon_height: 110_100,
                retarget_correction_height: 120_000,
                first_valid_token_height: 10_313,
                last_pow_block: 1000,
                blacklisted_token_ids: vec![],
                checkpoints: vec![],
            },
        }
    }

    /// Override one fork's activation height.
    ///
    /// Regression-test support: lets a private chain activate late forks
    /// from the start.
    pub fn with_fork_height(mut self, fork: NetworkFork, height: i32) -> Self {
        match fork {
            NetworkFork::ConfsChanged => self.confs_changed_height = height,
            NetworkFork::Tachyon => self.tachyon_height = height,
            NetworkFork::RetargetCorrection => self.retarget_correction_height = height,
        }
        self
    }

    /// Override the first height at which token transactions are valid.
    pub fn with_token_activation(mut self, height: i32) -> Self {
        self.first_valid_token_height = height;
        self
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn is_testnet(&self) -> bool {
        self.network == Network::Testnet
    }

    pub fn message_start(&self) -> [u8; 4] {
        self.message_start
    }

    pub fn fork_height(&self, fork: NetworkFork) -> i32 {
        match fork {
            NetworkFork::ConfsChanged => self.confs_changed_height,
            NetworkFork::Tachyon => self.tachyon_height,
            NetworkFork::RetargetCorrection => self.retarget_correction_height,
        }
    }

    pub fn fork_active(&self, fork: NetworkFork, height: i32) -> bool {
        height >= self.fork_height(fork)
    }

    /// Maximum serialized block size at `height`.
    pub fn max_block_size(&self, height: i32) -> usize {
        if self.fork_active(NetworkFork::ConfsChanged, height) {
            MAX_BLOCK_SIZE
        } else {
            OLD_MAX_BLOCK_SIZE
        }
    }

    /// Target block spacing at `height`, in seconds.
    pub fn target_spacing(&self, height: i32) -> u32 {
        if self.fork_active(NetworkFork::ConfsChanged, height) {
            TARGET_SPACING
        } else {
            OLD_TARGET_SPACING
        }
    }

    /// Confirmations required before spending a coinbase or coinstake.
    ///
    /// Mainnet: 30 before the confirmation fork, 120 after. Testnet: 10 on
    /// the early chain, 120 after its maturity fork.
    pub fn coinbase_maturity(&self, height: i32) -> i32 {
        match self.network {
            Network::Mainnet => {
                if self.fork_active(NetworkFork::ConfsChanged, height) {
                    COINBASE_MATURITY
                } else {
                    OLD_COINBASE_MATURITY
                }
            }
            Network::Testnet => {
                if self.fork_active(NetworkFork::Tachyon, height) {
                    COINBASE_MATURITY
                } else {
                    OLD_TESTNET_COINBASE_MATURITY
                }
            }
        }
    }

    /// Whether token transactions may appear at all at `height`.
    pub fn passed_first_valid_token_tx(&self, height: i32) -> bool {
        height >= self.first_valid_token_height
    }

    /// Whether issued token symbols must be unique on the chain.
    pub fn enforce_unique_token_symbols(&self, height: i32) -> bool {
        self.fork_active(NetworkFork::Tachyon, height)
    }

    pub fn last_pow_block(&self) -> i32 {
        self.last_pow_block
    }

    pub fn is_token_blacklisted(&self, token_id: &str) -> bool {
        self.blacklisted_token_ids.contains(&token_id)
    }

    pub fn genesis_hash(&self) -> Hash256 {
        crate::genesis::genesis_hash(self.network)
    }

    /// The latest checkpoint at or below `height`, if any.
    pub fn last_checkpoint_before(&self, height: i32) -> Option<(i32, Hash256)> {
        self.checkpoints
            .iter()
            .rev()
            .find(|(h, _)| *h <= height)
            .and_then(|(h, hex)| Hash256::from_hex(hex).map(|hash| (*h, hash)))
    }

    /// Height of the highest hard-coded checkpoint; blocks below this are
    /// treated as initial download.
    pub fn total_checkpoint_height(&self) -> i32 {
        self.checkpoints.iter().map(|(h, _)| *h).max().unwrap_or(0)
    }

    /// Expected checkpoint hash at exactly `height`, if one is pinned.
    pub fn checkpoint_at(&self, height: i32) -> Option<Hash256> {
        self.checkpoints
            .iter()
            .find(|(h, _)| *h == height)
            .and_then(|(_, hex)| Hash256::from_hex(hex))
    }
}
