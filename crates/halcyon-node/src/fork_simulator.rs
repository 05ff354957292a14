//! Fork spend replay: verify-inputs-unspent for candidate branches.
//!
//! Before the chain state machine adopts a competing branch, every spend
//! inside that branch is replayed against the on-disk spend records plus
//! a fork-local overlay. An output consumed by the fork must either be
//! unspent on the main chain, or its existing spender must sit above the
//! common ancestor (i.e. on the branch being discarded). Anything else is
//! a double-spend, including the crafted kind where a low-work stake
//! block spends outputs that only look unspent because the node never
//! reconciled the attacker's branch.
//!
//! A failed simulation leaves the simulator's caches poisoned; callers
//! take a copy before speculating and drop the original on failure.

use std::collections::{BTreeSet, HashMap};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, error};

use halcyon_core::hash::Hash256;
use halcyon_core::types::{Block, OutPoint, TxIndex};

use crate::txdb::TxDb;

/// Rejection reasons for a simulated fork.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViuError {
    #[error("input index out of range of main-chain spend record")]
    TxInputIndexOutOfRangeInMainChain,
    #[error("input index out of range of in-fork transaction outputs")]
    TxInputIndexOutOfRangeInFork,
    #[error("output was already spent before the fork point")]
    DoublespendAttemptSpentAlreadyBeforeTheFork,
    #[error("output spent twice within the fork")]
    DoublespendAttemptWithinTheFork,
    #[error("block could not be read from the database")]
    BlockCannotBeReadFromDb,
    #[error("spent output's transaction found in neither main chain nor fork")]
    TxNonExistentOutputNotFoundInMainChainOrFork,
    #[error("spender's block index could not be read")]
    ReadSpenderBlockIndexFailed,
    #[error("block index of previous block not found")]
    BlockIndexOfPrevBlockNotFound,
    #[error("common ancestor search failed")]
    CommonAncestorSearchFailed,
    #[error("transaction appeared twice in the fork")]
    TxAppearedTwiceInFork,
    #[error("former common ancestor not found")]
    FormerCommonAncestorNotFound,
}

/// Snapshot of a simulator, keyed by the last fork block it absorbed.
///
/// Cached so that repeated reorganization attempts over nearly the same
/// branch do not re-walk the shared prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedForkState {
    pub common_ancestor: Hash256,
    pub common_ancestor_height: i32,
    /// Every transaction observed in the fork, with its output count.
    pub fork_txs: HashMap<Hash256, u32>,
    pub spent_outputs: BTreeSet<OutPoint>,
    pub last_processed_tip_block_hash: Hash256,
}

/// Replays a fork's spends without touching the database.
pub struct ForkSpendSimulator<'db> {
    txdb: &'db TxDb,
    /// Outputs consumed by fork transactions walked so far.
    spent: BTreeSet<OutPoint>,
    /// Spend records read from disk during this walk.
    tx_index_cache: HashMap<Hash256, TxIndex>,
    /// Block heights read from disk during this walk.
    height_cache: HashMap<Hash256, i32>,
    /// Transactions of this fork and their output counts, so later fork
    /// transactions may spend earlier ones.
    this_fork_txs: HashMap<Hash256, u32>,
    /// The fork block whose spends the state reflects.
    tip_block_hash: Option<Hash256>,
    common_ancestor: Hash256,
    common_ancestor_height: i32,
}

impl<'db> ForkSpendSimulator<'db> {
    pub fn new(txdb: &'db TxDb, common_ancestor: Hash256, common_ancestor_height: i32) -> Self {
        Self {
            txdb,
            spent: BTreeSet::new(),
            tx_index_cache: HashMap::new(),
            height_cache: HashMap::new(),
            this_fork_txs: HashMap::new(),
            tip_block_hash: None,
            common_ancestor,
            common_ancestor_height,
        }
    }

    /// Clone the speculative state onto a fresh handle, so a failed
    /// simulation can be thrown away.
    pub fn fork_state_copy(&self) -> ForkSpendSimulator<'db> {
        ForkSpendSimulator {
            txdb: self.txdb,
            spent: self.spent.clone(),
            tx_index_cache: self.tx_index_cache.clone(),
            height_cache: self.height_cache.clone(),
            this_fork_txs: self.this_fork_txs.clone(),
            tip_block_hash: self.tip_block_hash,
            common_ancestor: self.common_ancestor,
            common_ancestor_height: self.common_ancestor_height,
        }
    }

    pub fn common_ancestor(&self) -> &Hash256 {
        &self.common_ancestor
    }

    pub fn common_ancestor_height(&self) -> i32 {
        self.common_ancestor_height
    }

    pub fn tip_block_hash(&self) -> Option<Hash256> {
        self.tip_block_hash
    }

    fn block_height(&mut self, block_hash: &Hash256) -> Option<i32> {
        if let Some(height) = self.height_cache.get(block_hash) {
            return Some(*height);
        }
        let height = self.txdb.read_block_index(block_hash).ok()??.height;
        self.height_cache.insert(*block_hash, height);
        Some(height)
    }

    fn tx_index(&mut self, tx_hash: &Hash256) -> Option<TxIndex> {
        if let Some(index) = self.tx_index_cache.get(tx_hash) {
            return Some(index.clone());
        }
        let index = self.txdb.read_tx_index(tx_hash).ok()??;
        self.tx_index_cache.insert(*tx_hash, index.clone());
        Some(index)
    }

    /// Mark an output as consumed by the fork.
    fn spend_output_virtually(
        &mut self,
        output: &OutPoint,
        spender: &Hash256,
    ) -> Result<(), ViuError> {
        if self.spent.contains(output) {
            error!(%output, %spender, "output double-spent within the fork");
            return Err(ViuError::DoublespendAttemptWithinTheFork);
        }
        self.spent.insert(*output);
        Ok(())
    }

    /// An already-recorded spender is tolerable only above the common
    /// ancestor, where it belongs to the branch being abandoned.
    fn unspent_or_spent_above_common_ancestor(
        &mut self,
        tx_index: &TxIndex,
        spender_tx_hash: &Hash256,
        input: &OutPoint,
    ) -> Result<(), ViuError> {
        let slot = &tx_index.spent[input.n as usize];
        if slot.is_null() {
            return Ok(());
        }
        let spender_block_hash = slot.block_hash;
        let Some(spender_height) = self.block_height(&spender_block_hash) else {
            error!(
                tx = %spender_tx_hash,
                input = %input,
                block = %spender_block_hash,
                "spender's block is not in the block index"
            );
            return Err(ViuError::ReadSpenderBlockIndexFailed);
        };
        if spender_height <= self.common_ancestor_height {
            error!(
                tx = %spender_tx_hash,
                input = %input,
                "output spent before the fork point"
            );
            return Err(ViuError::DoublespendAttemptSpentAlreadyBeforeTheFork);
        }
        Ok(())
    }

    /// Replay one fork block's spends on top of the accumulated state.
    ///
    /// Blocks must be fed in fork order, starting just above the common
    /// ancestor. On any error the simulator must not be reused.
    pub fn simulate_spending_block(&mut self, block: &Block) -> Result<(), ViuError> {
        for tx in &block.vtx {
            let spender_tx_hash = tx.hash();

            if self.this_fork_txs.contains_key(&spender_tx_hash) {
                return Err(ViuError::TxAppearedTwiceInFork);
            }
            // recorded up front so inputs later in this very block can
            // reference this transaction's outputs
            self.this_fork_txs
                .insert(spender_tx_hash, tx.vout.len() as u32);

            if tx.is_coinbase() {
                continue;
            }

            for txin in &tx.vin {
                let prevout = txin.prevout;
                match self.tx_index(&prevout.hash) {
                    None => {
                        // not on the main chain; the only place left is the
                        // fork itself
                        match self.this_fork_txs.get(&prevout.hash) {
                            None => {
                                return Err(ViuError::TxNonExistentOutputNotFoundInMainChainOrFork);
                            }
                            Some(output_count) if prevout.n >= *output_count => {
                                return Err(ViuError::TxInputIndexOutOfRangeInFork);
                            }
                            Some(_) => {}
                        }
                    }
                    Some(tx_index) if (prevout.n as usize) >= tx_index.spent.len() => {
                        error!(
                            tx = %spender_tx_hash,
                            prev = %prevout.hash,
                            n = prevout.n,
                            available = tx_index.spent.len(),
                            "input index out of range of main-chain record"
                        );
                        return Err(ViuError::TxInputIndexOutOfRangeInMainChain);
                    }
                    Some(tx_index) => {
                        self.unspent_or_spent_above_common_ancestor(
                            &tx_index,
                            &spender_tx_hash,
                            &prevout,
                        )?;
                    }
                }
                self.spend_output_virtually(&prevout, &spender_tx_hash)?;
            }
        }

        self.tip_block_hash = Some(block.hash());
        Ok(())
    }

    /// Export the state for the VIU cache; `None` until a block has been
    /// absorbed.
    pub fn export_cache_state(&self) -> Option<CachedForkState> {
        self.tip_block_hash.map(|tip| CachedForkState {
            common_ancestor: self.common_ancestor,
            common_ancestor_height: self.common_ancestor_height,
            fork_txs: self.this_fork_txs.clone(),
            spent_outputs: self.spent.clone(),
            last_processed_tip_block_hash: tip,
        })
    }

    /// Rebuild a simulator from a cached state under a possibly different
    /// best chain.
    ///
    /// While the cached common ancestor is no longer on the main chain,
    /// its blocks now belong to the fork: their transactions join the
    /// fork-transaction map, and the ancestor walks back until it rejoins
    /// the main chain.
    pub fn from_cache_state(
        txdb: &'db TxDb,
        cached: &CachedForkState,
        current_best_hash: &Hash256,
    ) -> Result<ForkSpendSimulator<'db>, ViuError> {
        let former_ancestor = txdb
            .read_block_index(&cached.common_ancestor)
            .map_err(|_| ViuError::FormerCommonAncestorNotFound)?
            .ok_or(ViuError::FormerCommonAncestorNotFound)?;

        let mut new_fork_txs: HashMap<Hash256, u32> = HashMap::new();
        let mut current = former_ancestor;
        while !current.is_in_main_chain(current_best_hash) {
            let block = txdb
                .read_block(&current.block_hash)
                .map_err(|_| ViuError::BlockCannotBeReadFromDb)?
                .ok_or(ViuError::BlockCannotBeReadFromDb)?;
            for tx in &block.vtx {
                new_fork_txs.insert(tx.hash(), tx.vout.len() as u32);
            }
            current = txdb
                .read_block_index(&current.hash_prev)
                .map_err(|_| ViuError::BlockIndexOfPrevBlockNotFound)?
                .ok_or(ViuError::BlockIndexOfPrevBlockNotFound)?;
        }

        debug!(
            ancestor = %current.block_hash,
            height = current.height,
            upgraded = new_fork_txs.len(),
            "fork simulator restored from cache"
        );

        let mut simulator =
            ForkSpendSimulator::new(txdb, current.block_hash, current.height);
        simulator.spent = cached.spent_outputs.clone();
        simulator.this_fork_txs = cached.fork_txs.clone();
        simulator.this_fork_txs.extend(new_fork_txs);
        simulator.tip_block_hash = Some(cached.last_processed_tip_block_hash);
        Ok(simulator)
    }
}

/// Bounded cache of fork-simulator states keyed by fork tip.
pub struct ViuCache {
    max_size: usize,
    states: HashMap<Hash256, CachedForkState>,
}

impl ViuCache {
    pub fn new(max_size: usize) -> Self {
        Self { max_size, states: HashMap::new() }
    }

    /// Insert a state, evicting one random entry when full.
    pub fn push(&mut self, state: CachedForkState) {
        if self.states.len() + 1 > self.max_size {
            self.drop_one_entry();
        }
        self.states
            .insert(state.last_processed_tip_block_hash, state);
    }

    /// Insert with probability `numerator / denominator`; returns whether
    /// the state was stored.
    pub fn push_with_probability(
        &mut self,
        state: CachedForkState,
        numerator: u32,
        denominator: u32,
    ) -> bool {
        assert!(denominator > 0);
        if rand::thread_rng().gen_range(0..denominator) < numerator {
            self.push(state);
            true
        } else {
            false
        }
    }

    pub fn get(&self, tip_block_hash: &Hash256) -> Option<&CachedForkState> {
        self.states.get(tip_block_hash)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn drop_one_entry(&mut self) {
        if self.states.is_empty() {
            return;
        }
        let victim_index = rand::thread_rng().gen_range(0..self.states.len());
        if let Some(key) = self.states.keys().nth(victim_index).copied() {
            self.states.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_core::script::Script;
    use halcyon_core::types::{BlockHeader, DiskTxPos, Transaction, TxIn, TxOut};
    use tempfile::TempDir;

    use crate::index::BlockIndex;
    use crate::txdb::DbEnvironment;

    fn h(n: u8) -> Hash256 {
        Hash256([n; 32])
    }

    fn coinbase(salt: u32) -> Transaction {
        let mut tx = Transaction::default();
        tx.time = salt;
        tx.vin.push(TxIn {
            prevout: OutPoint::null(),
            script_sig: Script(vec![1, 2]),
            sequence: u32::MAX,
        });
        tx.vout.push(TxOut::new(2_000, Script(vec![0x51])));
        tx
    }

    fn spend(prevout: OutPoint, salt: u32) -> Transaction {
        let mut tx = Transaction::default();
        tx.time = salt;
        tx.vin.push(TxIn::new(prevout));
        tx.vout.push(TxOut::new(1_000, Script(vec![0x51])));
        tx
    }

    fn block_of(txs: Vec<Transaction>, prev: Hash256, time: u32) -> Block {
        Block {
            header: BlockHeader {
                hash_prev_block: prev,
                time,
                bits: 0x207fffff,
                ..BlockHeader::default()
            },
            vtx: txs,
            signature: vec![],
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: TxDb,
    }

    /// A one-block main chain whose coinbase output is recorded in the
    /// tx index; `spent_at` optionally marks output 0 as spent by a block
    /// at the given height.
    fn fixture_with_funding(spent_at: Option<i32>) -> (Fixture, Transaction, Hash256) {
        let dir = TempDir::new().unwrap();
        let env = DbEnvironment::open(dir.path()).unwrap();
        let mut db = TxDb::new(env);

        let funding = coinbase(1);
        let funding_block = block_of(vec![funding.clone()], Hash256::ZERO, 100);
        let funding_block_hash = funding_block.hash();

        let mut funding_index = BlockIndex::from_block(&funding_block);
        funding_index.height = 5;
        db.write_block_index(&funding_index).unwrap();
        db.write_block(&funding_block_hash, &funding_block).unwrap();

        let mut tx_index = TxIndex::new(DiskTxPos::new(funding_block_hash, 81), 1);
        if let Some(spender_height) = spent_at {
            // a spender block at the given height
            let spender_block = block_of(vec![coinbase(2)], funding_block_hash, 200);
            let spender_hash = spender_block.hash();
            let mut spender_index = BlockIndex::from_block(&spender_block);
            spender_index.height = spender_height;
            db.write_block_index(&spender_index).unwrap();
            tx_index.spent[0] = DiskTxPos::new(spender_hash, 123);
        }
        db.update_tx_index(&funding.hash(), &tx_index).unwrap();

        (Fixture { _dir: dir, db }, funding, funding_block_hash)
    }

    // ------------------------------------------------------------------
    // Clean forks
    // ------------------------------------------------------------------

    #[test]
    fn unspent_main_chain_output_is_fine() {
        let (fixture, funding, ancestor) = fixture_with_funding(None);
        let mut simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);

        let fork_block = block_of(
            vec![coinbase(9), spend(OutPoint::new(funding.hash(), 0), 10)],
            ancestor,
            300,
        );
        assert_eq!(simulator.simulate_spending_block(&fork_block), Ok(()));
        assert_eq!(simulator.tip_block_hash(), Some(fork_block.hash()));
    }

    #[test]
    fn fork_tx_spending_earlier_fork_tx() {
        let (fixture, funding, ancestor) = fixture_with_funding(None);
        let mut simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);

        let first_spend = spend(OutPoint::new(funding.hash(), 0), 10);
        let chained = spend(OutPoint::new(first_spend.hash(), 0), 11);
        let fork_block = block_of(vec![coinbase(9), first_spend, chained], ancestor, 300);

        assert_eq!(simulator.simulate_spending_block(&fork_block), Ok(()));
    }

    #[test]
    fn spender_above_ancestor_is_tolerated() {
        // output spent on the main chain at height 9, fork point at 5:
        // the spender is on the branch being abandoned
        let (fixture, funding, ancestor) = fixture_with_funding(Some(9));
        let mut simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);

        let fork_block = block_of(
            vec![coinbase(9), spend(OutPoint::new(funding.hash(), 0), 10)],
            ancestor,
            300,
        );
        assert_eq!(simulator.simulate_spending_block(&fork_block), Ok(()));
    }

    // ------------------------------------------------------------------
    // Rejections
    // ------------------------------------------------------------------

    #[test]
    fn pre_fork_spender_is_a_double_spend() {
        // spent at height 3, fork point at 5: a true pre-fork double-spend
        let (fixture, funding, ancestor) = fixture_with_funding(Some(3));
        let mut simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);

        let fork_block = block_of(
            vec![coinbase(9), spend(OutPoint::new(funding.hash(), 0), 10)],
            ancestor,
            300,
        );
        assert_eq!(
            simulator.simulate_spending_block(&fork_block),
            Err(ViuError::DoublespendAttemptSpentAlreadyBeforeTheFork)
        );
    }

    #[test]
    fn double_spend_within_fork_detected() {
        let (fixture, funding, ancestor) = fixture_with_funding(None);
        let mut simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);

        let prevout = OutPoint::new(funding.hash(), 0);
        let fork_block = block_of(
            vec![coinbase(9), spend(prevout, 10), spend(prevout, 11)],
            ancestor,
            300,
        );
        assert_eq!(
            simulator.simulate_spending_block(&fork_block),
            Err(ViuError::DoublespendAttemptWithinTheFork)
        );
    }

    #[test]
    fn unknown_prevout_rejected() {
        let (fixture, _funding, ancestor) = fixture_with_funding(None);
        let mut simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);

        let fork_block = block_of(
            vec![coinbase(9), spend(OutPoint::new(h(0xEE), 0), 10)],
            ancestor,
            300,
        );
        assert_eq!(
            simulator.simulate_spending_block(&fork_block),
            Err(ViuError::TxNonExistentOutputNotFoundInMainChainOrFork)
        );
    }

    #[test]
    fn out_of_range_main_chain_index_rejected() {
        let (fixture, funding, ancestor) = fixture_with_funding(None);
        let mut simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);

        let fork_block = block_of(
            vec![coinbase(9), spend(OutPoint::new(funding.hash(), 7), 10)],
            ancestor,
            300,
        );
        assert_eq!(
            simulator.simulate_spending_block(&fork_block),
            Err(ViuError::TxInputIndexOutOfRangeInMainChain)
        );
    }

    #[test]
    fn out_of_range_fork_index_rejected() {
        let (fixture, funding, ancestor) = fixture_with_funding(None);
        let mut simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);

        let first_spend = spend(OutPoint::new(funding.hash(), 0), 10);
        // references output 5 of a one-output fork tx
        let bad = spend(OutPoint::new(first_spend.hash(), 5), 11);
        let fork_block = block_of(vec![coinbase(9), first_spend, bad], ancestor, 300);

        assert_eq!(
            simulator.simulate_spending_block(&fork_block),
            Err(ViuError::TxInputIndexOutOfRangeInFork)
        );
    }

    #[test]
    fn repeated_tx_in_fork_rejected() {
        let (fixture, funding, ancestor) = fixture_with_funding(None);
        let mut simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);

        let the_spend = spend(OutPoint::new(funding.hash(), 0), 10);
        let block_a = block_of(vec![coinbase(9), the_spend.clone()], ancestor, 300);
        assert_eq!(simulator.simulate_spending_block(&block_a), Ok(()));

        let block_b = block_of(vec![coinbase(12), the_spend], block_a.hash(), 330);
        assert_eq!(
            simulator.simulate_spending_block(&block_b),
            Err(ViuError::TxAppearedTwiceInFork)
        );
    }

    // ------------------------------------------------------------------
    // Cache export / restore
    // ------------------------------------------------------------------

    #[test]
    fn export_requires_progress() {
        let (fixture, _funding, ancestor) = fixture_with_funding(None);
        let simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);
        assert!(simulator.export_cache_state().is_none());
    }

    #[test]
    fn export_and_restore_round_trip() {
        let (fixture, funding, ancestor) = fixture_with_funding(None);
        let mut simulator = ForkSpendSimulator::new(&fixture.db, ancestor, 5);

        let fork_block = block_of(
            vec![coinbase(9), spend(OutPoint::new(funding.hash(), 0), 10)],
            ancestor,
            300,
        );
        simulator.simulate_spending_block(&fork_block).unwrap();
        let cached = simulator.export_cache_state().unwrap();
        assert_eq!(cached.last_processed_tip_block_hash, fork_block.hash());
        assert_eq!(cached.common_ancestor, ancestor);
        assert!(cached.spent_outputs.contains(&OutPoint::new(funding.hash(), 0)));

        // the funding block is still on the main chain (it is the tip here),
        // so restoring keeps the same ancestor
        let restored =
            ForkSpendSimulator::from_cache_state(&fixture.db, &cached, &ancestor).unwrap();
        assert_eq!(*restored.common_ancestor(), ancestor);
        assert_eq!(restored.tip_block_hash(), Some(fork_block.hash()));
    }

    #[test]
    fn restore_with_unknown_ancestor_fails() {
        let (fixture, _funding, _ancestor) = fixture_with_funding(None);
        let cached = CachedForkState {
            common_ancestor: h(0xAA),
            common_ancestor_height: 1,
            fork_txs: HashMap::new(),
            spent_outputs: BTreeSet::new(),
            last_processed_tip_block_hash: h(0xBB),
        };
        assert!(matches!(
            ForkSpendSimulator::from_cache_state(&fixture.db, &cached, &h(0xCC)),
            Err(ViuError::FormerCommonAncestorNotFound)
        ));
    }

    // ------------------------------------------------------------------
    // VIU cache
    // ------------------------------------------------------------------

    fn dummy_state(tip: u8) -> CachedForkState {
        CachedForkState {
            common_ancestor: h(1),
            common_ancestor_height: 1,
            fork_txs: HashMap::new(),
            spent_outputs: BTreeSet::new(),
            last_processed_tip_block_hash: h(tip),
        }
    }

    #[test]
    fn cache_stores_and_fetches_by_tip() {
        let mut cache = ViuCache::new(4);
        cache.push(dummy_state(1));
        assert!(cache.get(&h(1)).is_some());
        assert!(cache.get(&h(2)).is_none());
    }

    #[test]
    fn cache_evicts_when_full() {
        let mut cache = ViuCache::new(3);
        for tip in 1..=10 {
            cache.push(dummy_state(tip));
        }
        assert!(cache.len() <= 3);
        // the newest entry always survives its own insertion
        assert!(cache.get(&h(10)).is_some());
    }

    #[test]
    fn push_with_certainty_always_stores() {
        let mut cache = ViuCache::new(4);
        assert!(cache.push_with_probability(dummy_state(1), 1, 1));
        assert!(!cache.push_with_probability(dummy_state(2), 0, 5));
        assert_eq!(cache.len(), 1);
    }
}
