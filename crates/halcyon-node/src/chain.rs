//! The chain state machine: best-chain selection, block connection and
//! disconnection, reorganization, and orphan management.
//!
//! All chain and mempool mutation is funneled through one `ChainState`
//! value; the node wraps it in a single coarse mutex, so observers see
//! either the pre-state or the post-state of any operation, never an
//! intermediate. Persistent effects go through a `TxDb` transaction that
//! commits before the in-memory index is touched; a failed
//! reorganization leaves both disk and memory exactly as they were.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use primitive_types::U256;
use rand::Rng;
use tracing::{debug, error, info, warn};

use halcyon_core::constants::{FUTURE_DRIFT, MAX_BLOCK_SIGOPS, STAKE_MIN_AGE};
use halcyon_core::difficulty::{check_proof_of_work, next_target_required, HeaderChain, RetargetEntry};
use halcyon_core::error::{BlockValidationError, TxValidationError};
use halcyon_core::genesis::genesis_block;
use halcyon_core::hash::Hash256;
use halcyon_core::mempool::Mempool;
use halcyon_core::merkle::merkle_root;
use halcyon_core::params::{NetworkFork, Params};
use halcyon_core::reward::{
    cent_seconds, cent_seconds_to_coin_days, proof_of_stake_reward, proof_of_work_reward,
};
use halcyon_core::script::{Op, ScriptType};
use halcyon_core::serialize::{compact_size_len, Encodable, SerialParams};
use halcyon_core::types::{Block, DiskTxPos, OutPoint, Transaction, TxIndex};
use halcyon_core::validation::{check_transaction, is_final_tx};
use halcyon_tokens::TokenTransaction;

use crate::accept::{connect_inputs, fetch_inputs, resolve_input_tokens, RelayLimiter};
use crate::config::NodeConfig;
use crate::error::{DbError, NodeError};
use crate::fork_simulator::{ForkSpendSimulator, ViuCache, ViuError};
use crate::index::BlockIndex;
use crate::txdb::{DbEnvironment, TxDb};

/// Bound on cached fork-simulator states.
const VIU_CACHE_SIZE: usize = 20;

/// Recursion depth for mempool token resolution during block connect.
const TOKEN_RESOLUTION_DEPTH: usize = 32;

/// Snapshot of the best tip, copied out cheaply under the chain lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TipSnapshot {
    pub hash: Hash256,
    pub height: i32,
    pub trust: U256,
    /// Timestamp of the tip block itself.
    pub time: u32,
    /// Wall-clock time the tip was adopted.
    pub time_received: i64,
}

/// What `process_block` did with a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockAction {
    /// Indexed (and connected if it extended the best chain).
    Accepted,
    /// Parked as an orphan; the sender should be asked for `wanted` and
    /// the locator walk up to `orphan_root`.
    OrphanStored { orphan_root: Hash256, wanted: Hash256 },
}

/// The whole mutable chain context.
pub struct ChainState {
    params: Params,
    config: NodeConfig,
    env: Arc<DbEnvironment>,
    /// Unconfirmed transactions; may be locked under the chain lock.
    pub mempool: Mempool,
    pub relay_limiter: RelayLimiter,
    block_index: HashMap<Hash256, BlockIndex>,
    best: TipSnapshot,
    orphan_blocks: HashMap<Hash256, Block>,
    orphan_blocks_by_prev: HashMap<Hash256, Vec<Hash256>>,
    stake_seen_orphan: HashSet<(OutPoint, u32)>,
    orphan_txs: HashMap<Hash256, Transaction>,
    orphan_txs_by_prev: HashMap<Hash256, HashSet<Hash256>>,
    viu_cache: ViuCache,
    /// Set while importing blocks in bulk; forces IBD mode.
    pub importing: bool,
    /// IBD latches to false once it has been false.
    ibd_resolved: bool,
    /// Offset applied to the wall clock from peer time samples.
    time_offset: i64,
}

impl ChainState {
    /// Open the chain state over a storage environment, bootstrapping the
    /// genesis block when the store is empty.
    pub fn open(
        env: Arc<DbEnvironment>,
        params: Params,
        config: NodeConfig,
    ) -> Result<Self, NodeError> {
        let mut txdb = TxDb::new(env.clone());
        let mut block_index = HashMap::new();
        for index in txdb.read_all_block_indices()? {
            block_index.insert(index.block_hash, index);
        }

        let mut state = Self {
            params,
            config,
            env,
            mempool: Mempool::new(),
            relay_limiter: RelayLimiter::new(),
            block_index,
            best: TipSnapshot {
                hash: Hash256::ZERO,
                height: -1,
                trust: U256::zero(),
                time: 0,
                time_received: 0,
            },
            orphan_blocks: HashMap::new(),
            orphan_blocks_by_prev: HashMap::new(),
            stake_seen_orphan: HashSet::new(),
            orphan_txs: HashMap::new(),
            orphan_txs_by_prev: HashMap::new(),
            viu_cache: ViuCache::new(VIU_CACHE_SIZE),
            importing: false,
            ibd_resolved: false,
            time_offset: 0,
        };

        if state.block_index.is_empty() {
            state.bootstrap_genesis(&mut txdb)?;
        }

        let best_hash = txdb
            .read_best_chain_hash()?
            .unwrap_or_else(|| state.params.genesis_hash());
        let tip = state
            .block_index
            .get(&best_hash)
            .cloned()
            .ok_or(DbError::Engine("best chain hash has no index record".into()))?;
        state.best = TipSnapshot {
            hash: tip.block_hash,
            height: tip.height,
            trust: tip.chain_trust,
            time: tip.time,
            time_received: state.adjusted_time(),
        };
        info!(height = tip.height, tip = %tip.block_hash, "chain state loaded");
        Ok(state)
    }

    fn bootstrap_genesis(&mut self, txdb: &mut TxDb) -> Result<(), NodeError> {
        let genesis = genesis_block(self.params.network());
        let hash = genesis.hash();
        let mut index = BlockIndex::from_block(&genesis);
        index.height = 0;
        index.chain_trust = index.block_trust();
        index.set_stake_entropy_bit(genesis.stake_entropy_bit());
        index.hash_proof = hash;

        txdb.txn_begin(None)?;
        txdb.write_version(halcyon_core::serialize::SERIAL_VERSION)?;
        txdb.write_block(&hash, &genesis)?;
        txdb.write_block_index(&index)?;
        let coinbase_hash = genesis.vtx[0].hash();
        txdb.update_tx_index(
            &coinbase_hash,
            &TxIndex::new(DiskTxPos::new(hash, first_tx_offset(&genesis)), genesis.vtx[0].vout.len()),
        )?;
        txdb.write_best_chain_hash(&hash)?;
        txdb.txn_commit()?;

        self.block_index.insert(hash, index);
        info!(%hash, "genesis block written");
        Ok(())
    }

    // --- Accessors ---

    pub fn best(&self) -> TipSnapshot {
        self.best
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// A fresh storage handle over the shared environment.
    pub fn txdb(&self) -> TxDb {
        TxDb::new(self.env.clone())
    }

    pub fn block_index(&self, hash: &Hash256) -> Option<&BlockIndex> {
        self.block_index.get(hash)
    }

    pub fn have_block(&self, hash: &Hash256) -> bool {
        self.block_index.contains_key(hash) || self.orphan_blocks.contains_key(hash)
    }

    /// Wall clock plus the network-adjusted offset, in Unix seconds.
    pub fn adjusted_time(&self) -> i64 {
        chrono::Utc::now().timestamp() + self.time_offset
    }

    pub fn set_time_offset(&mut self, offset: i64) {
        self.time_offset = offset;
    }

    /// Height lookup closure for input-maturity checks.
    pub fn block_height_lookup(&self) -> impl Fn(&Hash256) -> Option<i32> + '_ {
        move |hash: &Hash256| self.block_index.get(hash).map(|index| index.height)
    }

    /// Walk back along the main chain to the block at `height`.
    pub fn main_chain_hash_at(&self, height: i32) -> Option<Hash256> {
        if height < 0 || height > self.best.height {
            return None;
        }
        let mut current = self.block_index.get(&self.best.hash)?;
        while current.height > height {
            current = self.block_index.get(&current.hash_prev)?;
        }
        Some(current.block_hash)
    }

    /// The compact target the next block after `prev_hash` must carry.
    pub fn next_target_for(&self, prev_hash: &Hash256, proof_of_stake: bool) -> u32 {
        next_target_required(&IndexView(&self.block_index), prev_hash, proof_of_stake, &self.params)
    }

    // --- Initial block download ---

    /// True while the node is catching up with the network. Latches to
    /// false the first time it is false.
    pub fn is_initial_block_download(&mut self) -> bool {
        if self.ibd_resolved {
            return false;
        }
        let now = self.adjusted_time();
        let downloading = self.best.height < self.params.total_checkpoint_height()
            || self.importing
            || (now - self.best.time_received < 15 && (self.best.time as i64) < now - 8 * 3600);
        if !downloading {
            self.ibd_resolved = true;
        }
        downloading
    }

    // --- Context-free block checks ---

    /// Context-free validation (`CheckBlock`).
    pub fn check_block(
        &self,
        block: &Block,
        check_pow: bool,
        check_merkle_root: bool,
        check_signature: bool,
    ) -> Result<(), BlockValidationError> {
        let max_size = self.params.max_block_size(self.best.height);
        let serialized = block.encoded_size(&SerialParams::network());
        if block.vtx.is_empty() || serialized > max_size {
            return Err(BlockValidationError::Oversized);
        }

        if (block.header.time as i64) > self.adjusted_time() + FUTURE_DRIFT {
            return Err(BlockValidationError::TimeFuture);
        }

        if !block.vtx[0].is_coinbase() {
            return Err(BlockValidationError::FirstTxNotCoinbase);
        }
        for tx in &block.vtx[1..] {
            if tx.is_coinbase() {
                return Err(BlockValidationError::MultipleCoinbase);
            }
        }

        if block.is_proof_of_stake() {
            // the coinbase of a stake block carries no value
            if block.vtx[0].vout.len() != 1 || !block.vtx[0].vout[0].is_empty() {
                return Err(BlockValidationError::CoinbasePaysInStakeBlock);
            }
            // exactly one coinstake, at index 1
            for tx in &block.vtx[2..] {
                if tx.is_coinstake() {
                    return Err(BlockValidationError::CoinstakeWrongPosition);
                }
            }
            if block.header.time != block.vtx[1].time {
                return Err(BlockValidationError::CoinstakeTimeViolation);
            }
        }

        if (block.vtx[0].time as i64) > block.header.time as i64 + FUTURE_DRIFT {
            return Err(BlockValidationError::CoinbaseTimeEarly);
        }

        let mut sigops = 0usize;
        let mut seen_hashes = HashSet::new();
        let mut tx_hashes = Vec::with_capacity(block.vtx.len());
        for (index, tx) in block.vtx.iter().enumerate() {
            check_transaction(tx, max_size)
                .map_err(|source| BlockValidationError::Tx { index, source })?;
            if tx.time > block.header.time {
                return Err(BlockValidationError::TxTimeAfterBlock);
            }
            let hash = tx.hash();
            if !seen_hashes.insert(hash) {
                return Err(BlockValidationError::DuplicateTx);
            }
            tx_hashes.push(hash);
            for txin in &tx.vin {
                sigops += txin.script_sig.sig_op_count(false);
            }
            for txout in &tx.vout {
                sigops += txout.script_pubkey.sig_op_count(false);
            }
        }
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(BlockValidationError::TooManySigops);
        }

        if check_merkle_root && block.header.hash_merkle_root != merkle_root(&tx_hashes) {
            return Err(BlockValidationError::MerkleRootMismatch);
        }

        if check_pow
            && block.is_proof_of_work()
            && !check_proof_of_work(&block.hash(), block.header.bits)
        {
            return Err(BlockValidationError::ProofOfWorkFailed);
        }

        if check_signature {
            self.check_block_signature(block)?;
        }

        Ok(())
    }

    /// A stake block must carry a signature by the coinstake output key;
    /// a work block must carry none.
    fn check_block_signature(&self, block: &Block) -> Result<(), BlockValidationError> {
        if block.is_proof_of_work() {
            return if block.signature.is_empty() {
                Ok(())
            } else {
                Err(BlockValidationError::BadBlockSignature)
            };
        }

        let key_output = &block.vtx[1].vout[1];
        let pubkey = match key_output.script_pubkey.classify() {
            ScriptType::PubKey => key_output
                .script_pubkey
                .ops()
                .next()
                .and_then(|op| match op {
                    Ok(Op::Push(data)) => Some(data.to_vec()),
                    _ => None,
                }),
            _ => None,
        }
        .ok_or(BlockValidationError::BadBlockSignature)?;

        let key = secp256k1::PublicKey::from_slice(&pubkey)
            .map_err(|_| BlockValidationError::BadBlockSignature)?;
        let signature = secp256k1::ecdsa::Signature::from_der(&block.signature)
            .map_err(|_| BlockValidationError::BadBlockSignature)?;
        let message = secp256k1::Message::from_digest(block.hash().0);
        secp256k1::Secp256k1::verification_only()
            .verify_ecdsa(&message, &signature, &key)
            .map_err(|_| BlockValidationError::BadBlockSignature)
    }

    // --- Block processing pipeline ---

    /// Top-level entry for a block arriving from the network or a miner.
    pub fn process_block(&mut self, block: &Block) -> Result<BlockAction, NodeError> {
        let hash = block.hash();

        if self.block_index.contains_key(&hash) || self.orphan_blocks.contains_key(&hash) {
            return Err(BlockValidationError::Duplicate.into());
        }

        // limited duplicity on stake: a flood of blocks reusing one stake
        // is cut off unless an orphan child is waiting on this very block
        let txdb = self.txdb();
        if block.is_proof_of_stake() {
            let stake = block.proof_of_stake();
            if txdb.was_stake_seen(&stake).unwrap_or(false)
                && !self.orphan_blocks_by_prev.contains_key(&hash)
            {
                return Err(BlockValidationError::DuplicateStake.into());
            }
        }

        self.check_block(block, true, true, true)?;

        // below-checkpoint difficulty spam gate
        if let Some((cp_height, cp_hash)) = self.params.last_checkpoint_before(self.best.height) {
            if block.header.hash_prev_block != self.best.hash {
                if let Some(checkpoint) = self.block_index.get(&cp_hash).cloned() {
                    self.enforce_checkpoint_min_difficulty(block, cp_height, &checkpoint)?;
                }
            }
        }

        let Some(prev_index) = self.block_index.get(&block.header.hash_prev_block).cloned() else {
            return Ok(self.store_orphan_block(block, hash));
        };

        self.accept_block(block, &prev_index)?;

        // drain orphans that were waiting on this block, recursively
        let mut work_queue = vec![hash];
        let mut cursor = 0;
        while cursor < work_queue.len() {
            let parent = work_queue[cursor];
            cursor += 1;
            let children = self.orphan_blocks_by_prev.remove(&parent).unwrap_or_default();
            for child_hash in children {
                let Some(child) = self.orphan_blocks.remove(&child_hash) else {
                    continue;
                };
                self.stake_seen_orphan.remove(&child.proof_of_stake());
                let Some(parent_index) = self.block_index.get(&parent).cloned() else {
                    error!("accepted parent lost from the block index");
                    continue;
                };
                match self.accept_block(&child, &parent_index) {
                    Ok(()) => work_queue.push(child_hash),
                    Err(err) => warn!(block = %child_hash, %err, "orphan rejected on accept"),
                }
            }
        }

        info!(block = %hash, "processed");
        Ok(BlockAction::Accepted)
    }

    fn enforce_checkpoint_min_difficulty(
        &self,
        block: &Block,
        _cp_height: i32,
        checkpoint: &BlockIndex,
    ) -> Result<(), NodeError> {
        use halcyon_core::difficulty::{compact_to_target, compute_min_stake, compute_min_work};
        let delta_time = block.header.time as i64 - checkpoint.time as i64;
        let base = self.last_index_of_type(checkpoint, block.is_proof_of_stake());
        let required = if block.is_proof_of_stake() {
            compute_min_stake(base.bits, delta_time)
        } else {
            compute_min_work(base.bits, delta_time)
        };
        if compact_to_target(block.header.bits) > compact_to_target(required) {
            return Err(BlockValidationError::Checkpoint.into());
        }
        Ok(())
    }

    /// Walk back to the most recent block of the wanted proof type.
    fn last_index_of_type(&self, from: &BlockIndex, proof_of_stake: bool) -> BlockIndex {
        let mut current = from.clone();
        while !current.hash_prev.is_zero() && current.is_proof_of_stake() != proof_of_stake {
            match self.block_index.get(&current.hash_prev) {
                Some(prev) => current = prev.clone(),
                None => break,
            }
        }
        current
    }

    fn store_orphan_block(&mut self, block: &Block, hash: Hash256) -> BlockAction {
        if block.is_proof_of_stake() {
            let stake = block.proof_of_stake();
            if self.stake_seen_orphan.contains(&stake)
                && !self.orphan_blocks_by_prev.contains_key(&hash)
            {
                // duplicate orphan stake: drop silently, asking again anyway
                debug!(block = %hash, "duplicate proof-of-stake for orphan block");
            } else {
                self.stake_seen_orphan.insert(stake);
            }
        }
        self.prune_orphan_blocks();
        self.orphan_blocks_by_prev
            .entry(block.header.hash_prev_block)
            .or_default()
            .push(hash);
        self.orphan_blocks.insert(hash, block.clone());
        info!(block = %hash, prev = %block.header.hash_prev_block, "stored orphan block");

        BlockAction::OrphanStored {
            orphan_root: self.orphan_root(&hash),
            wanted: self.wanted_by_orphan(&hash),
        }
    }

    /// Walk the orphan chain back to its first block's hash.
    fn orphan_root(&self, hash: &Hash256) -> Hash256 {
        let mut current = *hash;
        while let Some(block) = self.orphan_blocks.get(&current) {
            if !self.orphan_blocks.contains_key(&block.header.hash_prev_block) {
                return current;
            }
            current = block.header.hash_prev_block;
        }
        current
    }

    /// The missing ancestor an orphan chain is waiting for.
    fn wanted_by_orphan(&self, hash: &Hash256) -> Hash256 {
        let mut current = *hash;
        while let Some(block) = self.orphan_blocks.get(&current) {
            if !self.orphan_blocks.contains_key(&block.header.hash_prev_block) {
                return block.header.hash_prev_block;
            }
            current = block.header.hash_prev_block;
        }
        current
    }

    /// Drop one orphan chain tail when the map exceeds its cap: pick a
    /// random orphan, walk to a leaf of its descendants, and remove it.
    fn prune_orphan_blocks(&mut self) {
        if self.orphan_blocks.len() < self.config.max_orphan_blocks {
            return;
        }
        let Some(mut victim) = self
            .orphan_blocks
            .keys()
            .nth(rand::thread_rng().gen_range(0..self.orphan_blocks.len()))
            .copied()
        else {
            return;
        };
        loop {
            match self
                .orphan_blocks_by_prev
                .get(&victim)
                .and_then(|children| children.first())
            {
                Some(child) => victim = *child,
                None => break,
            }
        }
        if let Some(block) = self.orphan_blocks.remove(&victim) {
            self.stake_seen_orphan.remove(&block.proof_of_stake());
            if let Some(children) = self
                .orphan_blocks_by_prev
                .get_mut(&block.header.hash_prev_block)
            {
                children.retain(|h| *h != victim);
                if children.is_empty() {
                    self.orphan_blocks_by_prev.remove(&block.header.hash_prev_block);
                }
            }
            info!(block = %victim, "orphan map full, dropped one orphan");
        }
    }

    /// Index a checked block whose parent is known, and adopt it as the
    /// best chain when its cumulative trust wins.
    pub fn accept_block(
        &mut self,
        block: &Block,
        prev_index: &BlockIndex,
    ) -> Result<(), NodeError> {
        let hash = block.hash();
        if self.block_index.contains_key(&hash) {
            return Err(BlockValidationError::Duplicate.into());
        }
        let height = prev_index.height + 1;

        let expected_bits = self.next_target_for(&prev_index.block_hash, block.is_proof_of_stake());
        if block.header.bits != expected_bits {
            return Err(BlockValidationError::BadTarget.into());
        }

        // block times may not run backwards past the drift window
        if (block.header.time as i64) + FUTURE_DRIFT < prev_index.time as i64 {
            return Err(BlockValidationError::TimeFuture.into());
        }

        for (index, tx) in block.vtx.iter().enumerate() {
            if !is_final_tx(tx, height, block.header.time as i64) {
                return Err(BlockValidationError::Tx {
                    index,
                    source: TxValidationError::NotFinal,
                }
                .into());
            }
        }

        if let Some(expected) = self.params.checkpoint_at(height) {
            if expected != hash {
                return Err(BlockValidationError::Checkpoint.into());
            }
        }

        let mut index = BlockIndex::from_block(block);
        index.height = height;
        index.chain_trust = prev_index.chain_trust + index.block_trust();
        index.set_stake_entropy_bit(block.stake_entropy_bit());
        index.hash_proof = if block.is_proof_of_stake() {
            stake_proof_hash(block)
        } else {
            hash
        };
        let (modifier, generated) = self.next_stake_modifier(prev_index, &index);
        index.set_stake_modifier(modifier, generated);
        index.stake_modifier_checksum = (modifier ^ (modifier >> 32)) as u32;

        let mut txdb = self.txdb();
        txdb.txn_begin(None)?;
        txdb.write_block(&hash, block)?;
        txdb.write_block_index(&index)?;
        if block.is_proof_of_stake() {
            txdb.write_stake_seen(&block.proof_of_stake())?;
        }
        txdb.txn_commit()?;
        self.block_index.insert(hash, index.clone());

        if index.chain_trust > self.best.trust {
            let mut txdb = self.txdb();
            self.set_best_chain(&mut txdb, &hash)?;
        }

        Ok(())
    }

    /// Stake modifier chaining: a fresh modifier is generated whenever the
    /// modifier interval has elapsed since the previous one, folding the
    /// new block's hash and entropy bit into the running value.
    fn next_stake_modifier(&self, prev: &BlockIndex, new: &BlockIndex) -> (u64, bool) {
        let interval_elapsed = new.time / halcyon_core::constants::MODIFIER_INTERVAL
            != prev.time / halcyon_core::constants::MODIFIER_INTERVAL;
        if !interval_elapsed {
            return (prev.stake_modifier, false);
        }
        let mut seed = Vec::with_capacity(8 + 32 + 4);
        seed.extend_from_slice(&prev.stake_modifier.to_le_bytes());
        seed.extend_from_slice(new.block_hash.as_bytes());
        seed.extend_from_slice(&new.stake_entropy_bit().to_le_bytes());
        (halcyon_core::hash::hash256(&seed).low_u64(), true)
    }

    // --- Connect / disconnect ---

    /// Connect a block's transactions, mutating spend records and the
    /// token overlay through `txdb`'s open transaction.
    ///
    /// With `just_check` every validation runs but no database write and
    /// no overlay effect is queued; candidate blocks are evaluated this
    /// way before adoption.
    pub fn connect_block(
        &self,
        txdb: &mut TxDb,
        block: &Block,
        index: &mut BlockIndex,
        just_check: bool,
    ) -> Result<(), NodeError> {
        // a prior release may have let a bad block through; recheck, but
        // the signature was already verified on arrival
        self.check_block(block, !just_check, !just_check, false)?;

        let block_hash = index.block_hash;
        let mut tx_offset: u32 = if just_check { 1 } else { first_tx_offset(block) };

        let mut queued_changes: HashMap<Hash256, TxIndex> = HashMap::new();
        let mut queued_token_txs: Vec<TokenTransaction> = Vec::new();
        let mut issued_symbols_in_block: HashMap<String, Hash256> = HashMap::new();
        let mut fees: i64 = 0;
        let mut value_in_total: i64 = 0;
        let mut value_out_total: i64 = 0;
        let mut stake_reward: i64 = 0;
        let mut sigops = 0usize;
        let height_of = self.block_height_lookup();
        let enforce_tokens = self.params.fork_active(NetworkFork::Tachyon, index.height);

        for (tx_position, tx) in block.vtx.iter().enumerate() {
            let tx_hash = tx.hash();

            self.check_bip30(txdb, &tx_hash)?;

            for txin in &tx.vin {
                sigops += txin.script_sig.sig_op_count(false);
            }
            for txout in &tx.vout {
                sigops += txout.script_pubkey.sig_op_count(false);
            }
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(BlockValidationError::TooManySigops.into());
            }

            let pos_this_tx = DiskTxPos::new(block_hash, tx_offset);
            if !just_check {
                tx_offset += tx.encoded_size(&SerialParams::disk()) as u32;
            }

            if tx.is_coinbase() {
                value_out_total += tx.value_out();
            } else {
                let mut inputs = fetch_inputs(tx, txdb, &queued_changes, &self.mempool, true)
                    .map_err(|source| BlockValidationError::Tx { index: tx_position, source })?;

                // expensive-to-validate blocks are cut off by counting
                // pay-to-script-hash sigops against the same budget
                for txin in &tx.vin {
                    let prev_script = &inputs[&txin.prevout.hash].tx.vout
                        [txin.prevout.n as usize]
                        .script_pubkey;
                    sigops += prev_script.p2sh_sig_op_count(&txin.script_sig);
                }
                if sigops > MAX_BLOCK_SIGOPS {
                    return Err(BlockValidationError::TooManySigops.into());
                }

                let skip_signatures =
                    !just_check && self.best.height < self.params.total_checkpoint_height();
                let value_in = connect_inputs(
                    tx,
                    &mut inputs,
                    &mut queued_changes,
                    pos_this_tx,
                    index.height,
                    &height_of,
                    &self.params,
                    true,
                    skip_signatures,
                )
                .map_err(|source| BlockValidationError::Tx { index: tx_position, source })?;

                let value_out = tx.value_out();
                value_in_total += value_in;
                value_out_total += value_out;
                if tx.is_coinstake() {
                    stake_reward = value_out - value_in;
                } else {
                    fees += value_in - value_out;
                }

                if enforce_tokens && halcyon_tokens::script::is_token_tx(tx) {
                    let token_tx = self
                        .resolve_block_token_tx(tx, txdb, &queued_token_txs)
                        .map_err(|e| BlockValidationError::Tx {
                            index: tx_position,
                            source: TxValidationError::Token(e.to_string()),
                        })?;
                    if let Some(token_tx) = token_tx {
                        if let Some(symbol) = token_tx.symbol_if_issuance() {
                            let comparable = symbol.to_ascii_lowercase();
                            if issued_symbols_in_block.contains_key(&comparable) {
                                return Err(NodeError::Tx(TxValidationError::Token(format!(
                                    "token symbol {symbol} issued twice in block"
                                ))));
                            }
                            if self.params.enforce_unique_token_symbols(index.height) {
                                self.assert_symbol_not_in_main_chain(symbol, &tx_hash)
                                    .map_err(|e| {
                                        NodeError::Tx(TxValidationError::Token(e.to_string()))
                                    })?;
                            }
                            issued_symbols_in_block.insert(comparable, tx_hash);
                        }
                        queued_token_txs.push(token_tx);
                    }
                }
            }

            queued_changes.insert(tx_hash, TxIndex::new(pos_this_tx, tx.vout.len()));
        }

        if block.is_proof_of_work() {
            let reward = proof_of_work_reward(index.height, fees, &self.params);
            let claimed = block.vtx[0].value_out();
            if claimed > reward {
                return Err(BlockValidationError::CoinbaseRewardTooHigh {
                    actual: claimed,
                    allowed: reward,
                }
                .into());
            }
        } else {
            let coin_age = self.coinstake_coin_age(txdb, &block.vtx[1], &queued_changes)?;
            let allowed = proof_of_stake_reward(coin_age, fees);
            if stake_reward > allowed {
                return Err(BlockValidationError::StakeRewardTooHigh {
                    actual: stake_reward,
                    allowed,
                }
                .into());
            }
        }

        index.mint = value_out_total - value_in_total + fees;
        index.money_supply = self
            .block_index
            .get(&index.hash_prev)
            .map(|prev| prev.money_supply)
            .unwrap_or(0)
            + value_out_total
            - value_in_total;

        if just_check {
            return Ok(());
        }

        txdb.write_block_index(index)?;
        for (tx_hash, tx_index) in &queued_changes {
            txdb.update_tx_index(tx_hash, tx_index)?;
        }
        for token_tx in &queued_token_txs {
            txdb.write_token_tx(token_tx)?;
            if let Some(info) = &token_tx.issuance {
                if !self.params.is_token_blacklisted(&info.token_id) {
                    txdb.write_token_symbol_entry(&info.symbol, &token_tx.tx_hash)?;
                }
            }
        }

        // forward-link the parent on disk; memory follows after commit
        if let Some(prev) = self.block_index.get(&index.hash_prev) {
            let mut prev = prev.clone();
            prev.hash_next = block_hash;
            txdb.write_block_index(&prev)?;
        }

        Ok(())
    }

    /// Reject a transaction that overwrites an existing, not fully spent
    /// copy of itself.
    fn check_bip30(&self, txdb: &TxDb, tx_hash: &Hash256) -> Result<(), NodeError> {
        if let Some(existing) = txdb.read_tx_index(tx_hash)? {
            if existing.spent.iter().any(|slot| slot.is_null()) {
                return Err(BlockValidationError::Bip30Duplicate.into());
            }
        }
        Ok(())
    }

    /// Resolve one block transaction's token effect, consulting the token
    /// records queued earlier in the same block before the database.
    fn resolve_block_token_tx(
        &self,
        tx: &Transaction,
        txdb: &TxDb,
        queued: &[TokenTransaction],
    ) -> Result<Option<TokenTransaction>, halcyon_tokens::TokenError> {
        let mut input_tokens = HashMap::new();
        for txin in &tx.vin {
            let prevout = txin.prevout;
            if let Some(queued_tx) = queued.iter().find(|t| t.tx_hash == prevout.hash) {
                input_tokens.insert(prevout, queued_tx.tokens_of_output(prevout.n).to_vec());
                continue;
            }
            if let Ok(Some(stored)) = txdb.read_token_tx(&prevout.hash) {
                input_tokens.insert(prevout, stored.tokens_of_output(prevout.n).to_vec());
                continue;
            }
            // may still be an unconfirmed parent from the pool
            let from_pool =
                resolve_input_tokens(tx, txdb, &self.mempool, TOKEN_RESOLUTION_DEPTH)?;
            if let Some(tokens) = from_pool.get(&prevout) {
                input_tokens.insert(prevout, tokens.clone());
            } else {
                input_tokens.insert(prevout, Vec::new());
            }
        }
        TokenTransaction::from_tx(tx, &input_tokens)
    }

    /// An issued symbol must not exist on the main chain (blacklisted
    /// token ids excepted).
    pub(crate) fn assert_symbol_not_in_main_chain(
        &self,
        symbol: &str,
        issuing_tx: &Hash256,
    ) -> Result<(), halcyon_tokens::TokenError> {
        let txdb = self.txdb();
        let stored = txdb
            .read_token_txs_with_symbol(symbol)
            .map_err(|_| halcyon_tokens::TokenError::SymbolTaken(symbol.to_string()))?;
        for tx_hash in stored {
            if tx_hash == *issuing_tx {
                continue;
            }
            // only main-chain copies count
            if !txdb.contains_tx(&tx_hash).unwrap_or(false) {
                continue;
            }
            if let Ok(Some(token_tx)) = txdb.read_token_tx(&tx_hash) {
                if let Some(info) = &token_tx.issuance {
                    if self.params.is_token_blacklisted(&info.token_id) {
                        continue;
                    }
                    if info.symbol.eq_ignore_ascii_case(symbol) {
                        return Err(halcyon_tokens::TokenError::SymbolTaken(symbol.to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Coin-days consumed by a coinstake, from its inputs' values and ages.
    fn coinstake_coin_age(
        &self,
        txdb: &TxDb,
        coinstake: &Transaction,
        queued: &HashMap<Hash256, TxIndex>,
    ) -> Result<u64, NodeError> {
        let inputs = fetch_inputs(coinstake, txdb, queued, &self.mempool, true)
            .map_err(|_| BlockValidationError::CoinAgeUnavailable)?;
        let mut total_cent_seconds: u128 = 0;
        for txin in &coinstake.vin {
            let prev_tx = &inputs[&txin.prevout.hash].tx;
            if coinstake.time < prev_tx.time {
                return Err(BlockValidationError::CoinAgeUnavailable.into());
            }
            let age = (coinstake.time - prev_tx.time) as i64;
            if age < STAKE_MIN_AGE as i64 {
                continue; // only mature coins earn age
            }
            let value = prev_tx.vout[txin.prevout.n as usize].value;
            total_cent_seconds += cent_seconds(value, age);
        }
        Ok(cent_seconds_to_coin_days(total_cent_seconds))
    }

    /// Reverse a connected block: clear the spend marks it set and drop
    /// its transactions' spend records.
    pub fn disconnect_block(
        &self,
        txdb: &mut TxDb,
        block: &Block,
        index: &BlockIndex,
    ) -> Result<(), NodeError> {
        for tx in block.vtx.iter().rev() {
            // un-mark every consumed outpoint
            if !tx.is_coinbase() {
                for txin in &tx.vin {
                    let mut prev_index = txdb
                        .read_tx_index(&txin.prevout.hash)?
                        .ok_or(DbError::Engine("missing spend record on disconnect".into()))?;
                    let n = txin.prevout.n as usize;
                    if n >= prev_index.spent.len() {
                        return Err(DbError::Engine("spend slot out of range".into()).into());
                    }
                    prev_index.spent[n] = DiskTxPos::null();
                    txdb.update_tx_index(&txin.prevout.hash, &prev_index)?;
                }
            }
            txdb.erase_tx_index(&tx.hash())?;
        }

        // clear the parent's forward link on disk
        if let Some(prev) = self.block_index.get(&index.hash_prev) {
            let mut prev = prev.clone();
            prev.hash_next = Hash256::ZERO;
            txdb.write_block_index(&prev)?;
        }
        Ok(())
    }

    // --- Best chain selection ---

    /// Adopt `new_hash` as the best chain tip.
    ///
    /// Either a plain extension (parent is the current tip), or a
    /// reorganization through the common ancestor with postponed
    /// reconnects for the far end of long branches.
    pub fn set_best_chain(&mut self, txdb: &mut TxDb, new_hash: &Hash256) -> Result<(), NodeError> {
        let new_index = self
            .block_index
            .get(new_hash)
            .cloned()
            .ok_or(BlockValidationError::MissingPrev)?;

        txdb.txn_begin(None)?;

        if self.best.hash.is_zero() && *new_hash == self.params.genesis_hash() {
            txdb.write_best_chain_hash(new_hash)?;
            txdb.txn_commit()?;
            self.update_tip(&new_index);
        } else if new_index.hash_prev == self.best.hash {
            if let Err(err) = self.set_best_chain_inner(txdb, &new_index) {
                self.invalid_chain_found(&new_index);
                return Err(err);
            }
        } else {
            // walk back to the first block that already beats the current
            // best, postponing the rest so the reorganization transaction
            // stays small
            let mut intermediate = new_index.clone();
            let mut secondary: Vec<BlockIndex> = Vec::new();
            while let Some(prev) = self.block_index.get(&intermediate.hash_prev) {
                if prev.chain_trust <= self.best.trust {
                    break;
                }
                secondary.push(intermediate.clone());
                intermediate = prev.clone();
            }
            if !secondary.is_empty() {
                debug!(count = secondary.len(), "postponing reconnects");
            }

            if let Err(err) = self.reorganize(txdb, &intermediate) {
                if txdb.in_transaction() {
                    let _ = txdb.txn_abort();
                }
                self.invalid_chain_found(&new_index);
                error!(%err, "reorganize failed");
                return Err(err);
            }
            self.update_tip(&intermediate);

            // connect the postponed blocks; errors here are not fatal, the
            // chain already reorganized to a valid prefix
            for pindex in secondary.iter().rev() {
                let mut inner_db = self.txdb();
                if inner_db.txn_begin(None).is_err() {
                    break;
                }
                let index = pindex.clone();
                if self.set_best_chain_inner(&mut inner_db, &index).is_err() {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Attach one block to the current best branch inside the open
    /// transaction; commits on success.
    fn set_best_chain_inner(
        &mut self,
        txdb: &mut TxDb,
        new_index: &BlockIndex,
    ) -> Result<(), NodeError> {
        let block = txdb
            .read_block(&new_index.block_hash)?
            .ok_or(DbError::Engine("best-chain candidate block missing".into()))?;

        let mut index = new_index.clone();
        if let Err(err) = self
            .connect_block(txdb, &block, &mut index, false)
            .and_then(|()| Ok(txdb.write_best_chain_hash(&index.block_hash)?))
        {
            let _ = txdb.txn_abort();
            return Err(err);
        }
        txdb.txn_commit()?;

        // memory follows disk
        self.block_index.insert(index.block_hash, index.clone());
        if let Some(prev) = self.block_index.get_mut(&index.hash_prev) {
            prev.hash_next = index.block_hash;
        }
        for tx in &block.vtx {
            self.mempool.remove(tx, false);
        }
        self.update_tip(&index);
        Ok(())
    }

    /// Switch to the branch ending at `new_index`.
    ///
    /// The fork's spends are first replayed by the [`ForkSpendSimulator`];
    /// any detected double-spend aborts before a single byte of state is
    /// touched. Disconnections and connections then run inside the open
    /// transaction, which commits before memory is updated.
    fn reorganize(&mut self, txdb: &mut TxDb, new_index: &BlockIndex) -> Result<(), NodeError> {
        info!(to = %new_index.block_hash, height = new_index.height, "reorganize");

        // find the fork point
        let mut fork = self
            .block_index
            .get(&self.best.hash)
            .cloned()
            .ok_or(BlockValidationError::MissingPrev)?;
        let mut longer = new_index.clone();
        while fork.block_hash != longer.block_hash {
            while longer.height > fork.height {
                longer = self
                    .block_index
                    .get(&longer.hash_prev)
                    .cloned()
                    .ok_or(BlockValidationError::InvalidPrev)?;
            }
            if fork.block_hash == longer.block_hash {
                break;
            }
            fork = self
                .block_index
                .get(&fork.hash_prev)
                .cloned()
                .ok_or(BlockValidationError::InvalidPrev)?;
        }

        let mut to_disconnect: Vec<BlockIndex> = Vec::new();
        let mut cursor = self.block_index.get(&self.best.hash).cloned();
        while let Some(index) = cursor {
            if index.block_hash == fork.block_hash {
                break;
            }
            cursor = self.block_index.get(&index.hash_prev).cloned();
            to_disconnect.push(index);
        }

        let mut to_connect: Vec<BlockIndex> = Vec::new();
        let mut cursor = Some(new_index.clone());
        while let Some(index) = cursor {
            if index.block_hash == fork.block_hash {
                break;
            }
            cursor = self.block_index.get(&index.hash_prev).cloned();
            to_connect.push(index);
        }
        to_connect.reverse();

        info!(
            disconnect = to_disconnect.len(),
            connect = to_connect.len(),
            fork = %fork.block_hash,
            "reorganize spans"
        );

        // fake-stake gate: replay the fork's spends before touching state
        self.simulate_fork_spending(&fork, &to_connect)?;

        // disconnect the short branch
        let mut resurrect: Vec<Transaction> = Vec::new();
        for index in &to_disconnect {
            let block = txdb
                .read_block(&index.block_hash)?
                .ok_or(DbError::Engine("block to disconnect missing".into()))?;
            self.disconnect_block(txdb, &block, index)?;
            // only post-checkpoint transactions come back to the pool
            if index.height > self.params.total_checkpoint_height() {
                for tx in block.vtx.iter().rev() {
                    if !tx.is_coinbase() && !tx.is_coinstake() {
                        resurrect.insert(0, tx.clone());
                    }
                }
            }
        }

        // connect the longer branch
        let mut connected_txs: Vec<Transaction> = Vec::new();
        let mut updated_indices: Vec<BlockIndex> = Vec::new();
        for index in &to_connect {
            let block = txdb
                .read_block(&index.block_hash)?
                .ok_or(ViuError::BlockCannotBeReadFromDb)?;
            let mut index = index.clone();
            self.connect_block(txdb, &block, &mut index, false)?;
            updated_indices.push(index);
            connected_txs.extend(block.vtx.iter().cloned());
        }

        txdb.write_best_chain_hash(&new_index.block_hash)?;
        txdb.txn_commit()?;

        // disk is final; now memory
        for index in &to_disconnect {
            if let Some(prev) = self.block_index.get_mut(&index.hash_prev) {
                prev.hash_next = Hash256::ZERO;
            }
            if let Some(entry) = self.block_index.get_mut(&index.block_hash) {
                entry.hash_next = Hash256::ZERO;
            }
        }
        for index in updated_indices {
            let hash_prev = index.hash_prev;
            let block_hash = index.block_hash;
            self.block_index.insert(block_hash, index);
            if let Some(prev) = self.block_index.get_mut(&hash_prev) {
                prev.hash_next = block_hash;
            }
        }

        for tx in resurrect {
            // best-effort: conflicting or now-invalid transactions drop out
            let _ = self.accept_to_memory_pool(&tx, false);
        }
        for tx in &connected_txs {
            self.mempool.remove(tx, false);
            self.mempool.remove_conflicts(tx);
        }

        info!("reorganize done");
        Ok(())
    }

    /// Run the fork spend simulator over the branch about to connect.
    fn simulate_fork_spending(
        &mut self,
        fork: &BlockIndex,
        to_connect: &[BlockIndex],
    ) -> Result<(), NodeError> {
        if to_connect.is_empty() {
            return Ok(());
        }
        let read_db = self.txdb();

        // seed from the VIU cache when a prior attempt covered a prefix
        // of this very branch
        let mut start = 0usize;
        let mut simulator: Option<ForkSpendSimulator<'_>> = None;
        for (position, index) in to_connect.iter().enumerate().rev() {
            if let Some(cached) = self.viu_cache.get(&index.block_hash) {
                match ForkSpendSimulator::from_cache_state(&read_db, cached, &self.best.hash) {
                    Ok(restored) => {
                        debug!(tip = %index.block_hash, "fork simulator seeded from cache");
                        simulator = Some(restored);
                        start = position + 1;
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "stale cached fork state ignored");
                    }
                }
            }
        }
        let mut simulator = simulator
            .unwrap_or_else(|| ForkSpendSimulator::new(&read_db, fork.block_hash, fork.height));

        for index in &to_connect[start..] {
            let block = read_db
                .read_block(&index.block_hash)?
                .ok_or(ViuError::BlockCannotBeReadFromDb)?;
            simulator.simulate_spending_block(&block)?;
        }

        if let Some(state) = simulator.export_cache_state() {
            self.viu_cache.push(state);
        }
        Ok(())
    }

    /// Record the highest-trust invalid chain seen, for operator alerts.
    fn invalid_chain_found(&mut self, new_index: &BlockIndex) {
        let mut txdb = self.txdb();
        let stored = txdb.read_best_invalid_trust().ok().flatten().unwrap_or_default();
        if new_index.chain_trust > stored {
            let _ = txdb.write_best_invalid_trust(&new_index.chain_trust);
        }
        warn!(
            block = %new_index.block_hash,
            height = new_index.height,
            "invalid chain with higher trust rejected"
        );
    }

    fn update_tip(&mut self, index: &BlockIndex) {
        self.best = TipSnapshot {
            hash: index.block_hash,
            height: index.height,
            trust: index.chain_trust,
            time: index.time,
            time_received: self.adjusted_time(),
        };
        info!(
            best = %index.block_hash,
            height = index.height,
            trust = %index.chain_trust,
            date = %chrono::DateTime::from_timestamp(index.time as i64, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            "new best chain"
        );

        if !self.ibd_resolved {
            // latch query has side effects; keep tip adoption cheap
            let _ = self.is_initial_block_download();
        }
        if self.ibd_resolved {
            if let Some(command) = &self.config.block_notify {
                let command = command.replace("%s", &index.block_hash.to_string());
                std::thread::spawn(move || {
                    let _ = std::process::Command::new("sh").arg("-c").arg(command).status();
                });
            }
        }
    }

    // --- Orphan transactions ---

    /// Park a transaction whose inputs are not resolvable yet.
    pub fn add_orphan_tx(&mut self, tx: Transaction) {
        let hash = tx.hash();
        if self.orphan_txs.contains_key(&hash) {
            return;
        }
        self.limit_orphan_txs(self.config.max_orphan_tx);
        for txin in &tx.vin {
            self.orphan_txs_by_prev
                .entry(txin.prevout.hash)
                .or_default()
                .insert(hash);
        }
        self.orphan_txs.insert(hash, tx);
        debug!(tx = %hash, total = self.orphan_txs.len(), "stored orphan tx");
    }

    fn erase_orphan_tx(&mut self, hash: &Hash256) {
        if let Some(tx) = self.orphan_txs.remove(hash) {
            for txin in &tx.vin {
                if let Some(waiting) = self.orphan_txs_by_prev.get_mut(&txin.prevout.hash) {
                    waiting.remove(hash);
                    if waiting.is_empty() {
                        self.orphan_txs_by_prev.remove(&txin.prevout.hash);
                    }
                }
            }
        }
    }

    fn limit_orphan_txs(&mut self, max: usize) {
        while self.orphan_txs.len() >= max {
            let Some(victim) = self
                .orphan_txs
                .keys()
                .nth(rand::thread_rng().gen_range(0..self.orphan_txs.len()))
                .copied()
            else {
                break;
            };
            self.erase_orphan_tx(&victim);
        }
    }

    /// Retry orphan transactions that were waiting on `accepted`;
    /// returns the hashes that made it into the pool.
    pub fn drain_orphan_txs_of(&mut self, accepted: &Hash256) -> Vec<Hash256> {
        let mut drained = Vec::new();
        let mut queue = vec![*accepted];
        let mut cursor = 0;
        while cursor < queue.len() {
            let parent = queue[cursor];
            cursor += 1;
            let waiting: Vec<Hash256> = self
                .orphan_txs_by_prev
                .get(&parent)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for orphan_hash in waiting {
                let Some(orphan) = self.orphan_txs.get(&orphan_hash).cloned() else {
                    continue;
                };
                if self.accept_to_memory_pool(&orphan, false).is_ok() {
                    self.erase_orphan_tx(&orphan_hash);
                    queue.push(orphan_hash);
                    drained.push(orphan_hash);
                }
            }
        }
        drained
    }

    pub fn orphan_tx_count(&self) -> usize {
        self.orphan_txs.len()
    }

    pub fn orphan_block_count(&self) -> usize {
        self.orphan_blocks.len()
    }
}

/// Byte offset of the first transaction inside a stored block.
fn first_tx_offset(block: &Block) -> u32 {
    (80 + compact_size_len(block.vtx.len() as u64)) as u32
}

/// Kernel-style proof hash for a stake block: the staked outpoint and
/// time bound to the block hash.
fn stake_proof_hash(block: &Block) -> Hash256 {
    let (prevout, stake_time) = block.proof_of_stake();
    let mut seed = prevout.encode_to_vec(&SerialParams::gethash());
    seed.extend_from_slice(&stake_time.to_le_bytes());
    seed.extend_from_slice(block.hash().as_bytes());
    halcyon_core::hash::hash256(&seed)
}

/// Header view over the in-memory block index for retargeting.
struct IndexView<'a>(&'a HashMap<Hash256, BlockIndex>);

impl HeaderChain for IndexView<'_> {
    fn entry(&self, hash: &Hash256) -> Option<RetargetEntry> {
        self.0.get(hash).map(|index| RetargetEntry {
            hash: index.block_hash,
            prev: index.hash_prev,
            height: index.height,
            time: index.time as i64,
            bits: index.bits,
            is_proof_of_stake: index.is_proof_of_stake(),
        })
    }
}
