//! Genesis block construction.
//!
//! The genesis block is fixed by the launch constants: the timestamp
//! message, transaction time 1500674579, nonce 8485, and the easiest
//! proof-of-work target. Every node computes the identical block; the
//! expected hash and merkle root are pinned in
//! [`params::GENESIS_HASH_MAINNET`](crate::params::GENESIS_HASH_MAINNET)
//! and [`GENESIS_MERKLE_ROOT`].

use std::sync::LazyLock;

use crate::difficulty::{proof_of_work_limit, target_to_compact};
use crate::hash::Hash256;
use crate::merkle::merkle_root;
use crate::params::Network;
use crate::script::Script;
use crate::types::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

/// Message embedded in the genesis coinbase input.
pub const GENESIS_TIMESTAMP_MESSAGE: &[u8] = b"21jul2017 - Neblio First Net Launches";

/// Timestamp of the genesis block and its transaction.
pub const GENESIS_TIME: u32 = 1_500_674_579;

/// Nonce satisfying the genesis target.
pub const GENESIS_NONCE: u32 = 8_485;

/// Expected merkle root of the genesis block.
pub const GENESIS_MERKLE_ROOT: &str =
    "203fd13214321a12b01c0d8b32c780977cf52e56ae35b7383cd389c73291aee7";

struct GenesisData {
    block: Block,
    hash: Hash256,
}

static GENESIS: LazyLock<GenesisData> = LazyLock::new(|| {
    let block = build_genesis();
    let hash = block.hash();
    GenesisData { block, hash }
});

/// The genesis block. Identical on both networks; they diverge from
/// block one onward.
pub fn genesis_block(_network: Network) -> Block {
    GENESIS.block.clone()
}

/// The cached genesis block hash.
pub fn genesis_hash(_network: Network) -> Hash256 {
    GENESIS.hash
}

fn build_genesis() -> Block {
    let mut script_sig = Script::new();
    script_sig.push_int(0);
    script_sig.push_int(42);
    script_sig.push_data(GENESIS_TIMESTAMP_MESSAGE);

    let tx = Transaction {
        version: 1,
        time: GENESIS_TIME,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::empty()],
        lock_time: 0,
    };

    let root = merkle_root(&[tx.hash()]);
    Block {
        header: BlockHeader {
            version: 1,
            hash_prev_block: Hash256::ZERO,
            hash_merkle_root: root,
            time: GENESIS_TIME,
            bits: target_to_compact(proof_of_work_limit()),
            nonce: GENESIS_NONCE,
        },
        vtx: vec![tx],
        signature: Vec::new(),
    }
}
