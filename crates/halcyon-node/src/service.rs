//! The network-facing surface of the chain state.
//!
//! Message handlers run against [`NodeInterface`]; this impl translates
//! them onto `ChainState` operations and maps validation errors to
//! misbehavior scores.

use tracing::warn;

use halcyon_core::hash::Hash256;
use halcyon_core::types::{Block, BlockHeader, Transaction};
use halcyon_network::protocol::Address;
use halcyon_network::{NodeInterface, SubmitBlockOutcome, SubmitTxOutcome};

use halcyon_core::error::TxValidationError;

use crate::chain::{BlockAction, ChainState};
use crate::error::NodeError;

impl NodeError {
    /// Misbehavior score a peer earns for relaying this failure.
    pub fn dos_score(&self) -> u32 {
        match self {
            NodeError::Tx(e) => e.dos_score(),
            NodeError::Block(e) => e.dos_score(),
            // storage and fork-replay failures are local conditions, not
            // necessarily the peer's fault
            _ => 0,
        }
    }
}

impl NodeInterface for ChainState {
    fn best_height(&self) -> i32 {
        self.best().height
    }

    fn best_hash(&self) -> Hash256 {
        self.best().hash
    }

    fn have_block(&self, hash: &Hash256) -> bool {
        ChainState::have_block(self, hash)
    }

    fn have_tx(&self, hash: &Hash256) -> bool {
        self.mempool.exists(hash) || self.txdb().contains_tx(hash).unwrap_or(false)
    }

    fn get_block(&self, hash: &Hash256) -> Option<Block> {
        self.txdb().read_block(hash).ok().flatten()
    }

    fn header_of(&self, hash: &Hash256) -> Option<BlockHeader> {
        // the index carries a full header copy; no block read needed
        self.block_index(hash).map(|index| BlockHeader {
            version: index.version,
            hash_prev_block: index.hash_prev,
            hash_merkle_root: index.hash_merkle_root,
            time: index.time,
            bits: index.bits,
            nonce: index.nonce,
        })
    }

    fn block_link(&self, hash: &Hash256) -> Option<(i32, Hash256)> {
        self.block_index(hash).map(|index| (index.height, index.hash_next))
    }

    fn main_chain_hash_at(&self, height: i32) -> Option<Hash256> {
        ChainState::main_chain_hash_at(self, height)
    }

    fn submit_block(&mut self, block: Block) -> SubmitBlockOutcome {
        match self.process_block(&block) {
            Ok(BlockAction::Accepted) => SubmitBlockOutcome::Accepted,
            Ok(BlockAction::OrphanStored { orphan_root, wanted }) => {
                SubmitBlockOutcome::Orphan { orphan_root, wanted }
            }
            Err(err) => {
                warn!(%err, "block rejected");
                SubmitBlockOutcome::Rejected { dos: err.dos_score() }
            }
        }
    }

    fn submit_tx(&mut self, tx: Transaction) -> SubmitTxOutcome {
        let hash = tx.hash();
        match self.accept_to_memory_pool(&tx, false) {
            Ok(()) => {
                let also_accepted = self.drain_orphan_txs_of(&hash);
                SubmitTxOutcome::Accepted { also_accepted }
            }
            Err(TxValidationError::MissingInputs) => {
                self.add_orphan_tx(tx);
                SubmitTxOutcome::MissingInputs
            }
            Err(err) => {
                warn!(tx = %hash, %err, "transaction rejected");
                SubmitTxOutcome::Rejected { dos: err.dos_score() }
            }
        }
    }

    fn mempool_hashes(&self) -> Vec<Hash256> {
        self.mempool.query_hashes()
    }

    fn mempool_lookup(&self, hash: &Hash256) -> Option<Transaction> {
        self.mempool.lookup(hash).cloned()
    }

    fn known_addresses(&self) -> Vec<Address> {
        // peer address management lives with the socket layer
        Vec::new()
    }

    fn is_initial_block_download(&mut self) -> bool {
        ChainState::is_initial_block_download(self)
    }

    fn adjusted_time(&self) -> i64 {
        ChainState::adjusted_time(self)
    }
}
