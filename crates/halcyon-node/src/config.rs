//! Node configuration knobs, mapped one-to-one from the CLI surface.

use serde::{Deserialize, Serialize};

use halcyon_core::constants::{
    DEFAULT_MAX_ORPHAN_BLOCKS, DEFAULT_MAX_ORPHAN_TX, MIN_TX_FEE, OLD_MAX_BLOCK_SIZE,
};

/// Tunables for one node instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// `-limitfreerelay`: thousand-bytes per minute of fee-free relay.
    pub limit_free_relay: i64,
    /// `-maxorphantx`: cap on the orphan-transaction map.
    pub max_orphan_tx: usize,
    /// `-maxorphanblocks`: cap on the orphan-block map.
    pub max_orphan_blocks: usize,
    /// `-mintxfee`: fee floor for transactions this node creates.
    pub min_tx_fee: i64,
    /// `-blockmaxsize`: largest block template this node assembles.
    pub block_max_size: usize,
    /// `-blockprioritysize`: template bytes reserved for high-priority
    /// transactions.
    pub block_priority_size: usize,
    /// `-blockminsize`: minimum template fill before fee filtering.
    pub block_min_size: usize,
    /// `-blocknotify`: command run on every new tip, `%s` replaced by the
    /// tip hash.
    pub block_notify: Option<String>,
    /// Require minimal push encodings on relayed scripts.
    pub enforce_canonical: bool,
    /// `-synctime`: adjust local clock from peer samples.
    pub sync_time: bool,
    /// `-blockversion`: header version stamped into mined blocks
    /// (regression-test chains only).
    pub block_version: i32,
    /// `-coldstaking`: accept delegated staking scripts.
    pub cold_staking: bool,
    /// `-dropmessagestest`: drop one in N peer messages when nonzero.
    pub drop_messages_test: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            limit_free_relay: 15,
            max_orphan_tx: DEFAULT_MAX_ORPHAN_TX,
            max_orphan_blocks: DEFAULT_MAX_ORPHAN_BLOCKS,
            min_tx_fee: MIN_TX_FEE,
            block_max_size: OLD_MAX_BLOCK_SIZE / 2,
            block_priority_size: 27_000,
            block_min_size: 0,
            block_notify: None,
            enforce_canonical: false,
            sync_time: true,
            block_version: 6,
            cold_staking: true,
            drop_messages_test: 0,
        }
    }
}
