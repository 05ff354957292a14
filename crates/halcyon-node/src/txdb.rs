//! The `TxDb` storage façade.
//!
//! Six named sub-databases live as column families of one RocksDB
//! environment: `MainDb` (scalar chain state), `BlockIndexDb`, `BlocksDb`,
//! `TxDb` (spend records), `Ntp1txDb` (resolved token transactions), and
//! `Ntp1NamesDb` (symbol → txids, duplicate-keyed through composed keys
//! and prefix iteration). All values are encoded with the consensus codec.
//!
//! Writes go through explicit transactions: an in-memory overlay of
//! pending puts and deletes that reads consult first and that commits as
//! a single `WriteBatch`: either the whole batch lands or none of it.
//! The environment enforces a logical map-size quota; when free space
//! falls under 10% (or an explicit reservation will not fit) the quota
//! grows by the larger of half the current size and 1.5× the reservation,
//! after waiting out live transactions and gating new ones.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rocksdb::{ColumnFamilyDescriptor, DB, Options, WriteBatch};
use tracing::{debug, info};

use halcyon_core::hash::Hash256;
use halcyon_core::serialize::{Decodable, Encodable, SerialParams};
use halcyon_core::types::{Block, OutPoint, Transaction, TxIndex};
use halcyon_tokens::TokenTransaction;
use primitive_types::U256;

use crate::error::DbError;
use crate::index::BlockIndex;

/// The named sub-databases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubDb {
    Main,
    BlockIndex,
    Blocks,
    Tx,
    TokenTx,
    TokenNames,
}

impl SubDb {
    const ALL: [SubDb; 6] = [
        SubDb::Main,
        SubDb::BlockIndex,
        SubDb::Blocks,
        SubDb::Tx,
        SubDb::TokenTx,
        SubDb::TokenNames,
    ];

    fn cf_name(self) -> &'static str {
        match self {
            SubDb::Main => "MainDb",
            SubDb::BlockIndex => "BlockIndexDb",
            SubDb::Blocks => "BlocksDb",
            SubDb::Tx => "TxDb",
            SubDb::TokenTx => "Ntp1txDb",
            SubDb::TokenNames => "Ntp1NamesDb",
        }
    }
}

// --- MainDb keys ---

const KEY_VERSION: &[u8] = b"version";
const KEY_BEST_CHAIN: &[u8] = b"hashBestChain";
const KEY_BEST_INVALID_TRUST: &[u8] = b"bnBestInvalidTrust";
const KEY_STAKE_SEEN_PREFIX: &[u8] = b"stakeSeen";

/// Initial logical map size: 1 GiB.
const DEFAULT_MAP_SIZE: u64 = 1 << 30;

/// Free-space fraction below which the map grows.
const RESIZE_FREE_FRACTION: u64 = 10;

/// Grow decision and bookkeeping for the logical map quota.
struct QuotaState {
    map_size: u64,
    used: u64,
    /// Live explicit transactions.
    active_txns: usize,
    /// Set while a resize is in progress; blocks new transactions.
    resizing: bool,
}

impl QuotaState {
    fn free(&self) -> u64 {
        self.map_size.saturating_sub(self.used)
    }

    fn needs_resize(&self, required: u64) -> bool {
        self.free() < self.map_size / RESIZE_FREE_FRACTION || required > self.free()
    }

    fn grow(&mut self, required: u64) {
        let increase = (self.map_size / 2).max(required.saturating_mul(3) / 2);
        self.map_size += increase;
    }
}

/// The shared storage environment: one per process.
pub struct DbEnvironment {
    db: DB,
    quota: Mutex<QuotaState>,
    quota_cv: Condvar,
}

impl DbEnvironment {
    /// Open or create the environment at `path` with all sub-databases.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, DbError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = SubDb::ALL
            .iter()
            .map(|sub| ColumnFamilyDescriptor::new(sub.cf_name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| DbError::Engine(e.to_string()))?;
        info!(path = %path.as_ref().display(), "storage environment opened");

        Ok(Arc::new(Self {
            db,
            quota: Mutex::new(QuotaState {
                map_size: DEFAULT_MAP_SIZE,
                used: 0,
                active_txns: 0,
                resizing: false,
            }),
            quota_cv: Condvar::new(),
        }))
    }

    fn cf(&self, sub: SubDb) -> Result<&rocksdb::ColumnFamily, DbError> {
        self.db
            .cf_handle(sub.cf_name())
            .ok_or_else(|| DbError::Engine(format!("missing column family {}", sub.cf_name())))
    }

    /// Grow the quota to fit `required` more bytes.
    ///
    /// Waits until no transactions are live, then gates new ones for the
    /// duration of the grow.
    fn resize(&self, required: u64) {
        let mut quota = self.quota.lock();
        if !quota.needs_resize(required) {
            return; // another thread already grew it
        }
        quota.resizing = true;
        while quota.active_txns > 0 {
            self.quota_cv.wait(&mut quota);
        }
        let before = quota.map_size;
        quota.grow(required);
        quota.resizing = false;
        info!(from = before, to = quota.map_size, "storage map resized");
        self.quota_cv.notify_all();
    }

    /// Register a new transaction, waiting out any in-progress resize.
    fn begin_txn(&self, required: u64) {
        {
            let mut quota = self.quota.lock();
            while quota.resizing {
                self.quota_cv.wait(&mut quota);
            }
            if !quota.needs_resize(required) {
                quota.active_txns += 1;
                return;
            }
        }
        self.resize(required);
        let mut quota = self.quota.lock();
        while quota.resizing {
            self.quota_cv.wait(&mut quota);
        }
        quota.active_txns += 1;
    }

    fn end_txn(&self, bytes_written: u64) {
        let mut quota = self.quota.lock();
        quota.active_txns = quota.active_txns.saturating_sub(1);
        quota.used += bytes_written;
        self.quota_cv.notify_all();
    }

    /// Current logical map size (for diagnostics and tests).
    pub fn map_size(&self) -> u64 {
        self.quota.lock().map_size
    }
}

/// A pending write inside an open transaction.
#[derive(Clone, Debug)]
enum PendingOp {
    Put(Vec<u8>),
    Delete,
}

struct TxnOverlay {
    ops: BTreeMap<(SubDb, Vec<u8>), PendingOp>,
}

/// A handle to the environment with optional transaction state.
///
/// Handles are cheap; each call site that needs transactional writes
/// creates its own. One writer transaction may be live per handle; the
/// environment serializes committed batches internally.
pub struct TxDb {
    env: Arc<DbEnvironment>,
    overlay: Option<TxnOverlay>,
    params: SerialParams,
}

impl TxDb {
    pub fn new(env: Arc<DbEnvironment>) -> Self {
        Self { env, overlay: None, params: SerialParams::disk() }
    }

    pub fn environment(&self) -> &Arc<DbEnvironment> {
        &self.env
    }

    // --- Generic typed access ---

    fn read_raw(&self, sub: SubDb, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        if let Some(overlay) = &self.overlay {
            match overlay.ops.get(&(sub, key.to_vec())) {
                Some(PendingOp::Put(value)) => return Ok(Some(value.clone())),
                Some(PendingOp::Delete) => return Ok(None),
                None => {}
            }
        }
        self.env
            .db
            .get_cf(self.env.cf(sub)?, key)
            .map_err(|e| DbError::Engine(e.to_string()))
    }

    fn read<V: Decodable>(&self, sub: SubDb, key: &[u8]) -> Result<Option<V>, DbError> {
        match self.read_raw(sub, key)? {
            Some(bytes) => Ok(Some(V::decode_from_slice(&bytes, &self.params)?)),
            None => Ok(None),
        }
    }

    fn exists(&self, sub: SubDb, key: &[u8]) -> Result<bool, DbError> {
        Ok(self.read_raw(sub, key)?.is_some())
    }

    fn write<V: Encodable>(&mut self, sub: SubDb, key: &[u8], value: &V) -> Result<(), DbError> {
        let bytes = value.encode_to_vec(&self.params);
        self.write_raw(sub, key, bytes)
    }

    fn write_raw(&mut self, sub: SubDb, key: &[u8], bytes: Vec<u8>) -> Result<(), DbError> {
        match &mut self.overlay {
            Some(overlay) => {
                overlay.ops.insert((sub, key.to_vec()), PendingOp::Put(bytes));
                Ok(())
            }
            None => {
                let size = (key.len() + bytes.len()) as u64;
                self.env.begin_txn(size);
                let result = self
                    .env
                    .db
                    .put_cf(self.env.cf(sub)?, key, &bytes)
                    .map_err(|e| DbError::Engine(e.to_string()));
                self.env.end_txn(if result.is_ok() { size } else { 0 });
                result
            }
        }
    }

    fn erase(&mut self, sub: SubDb, key: &[u8]) -> Result<(), DbError> {
        match &mut self.overlay {
            Some(overlay) => {
                overlay.ops.insert((sub, key.to_vec()), PendingOp::Delete);
                Ok(())
            }
            None => {
                self.env.begin_txn(0);
                let result = self
                    .env
                    .db
                    .delete_cf(self.env.cf(sub)?, key)
                    .map_err(|e| DbError::Engine(e.to_string()));
                self.env.end_txn(0);
                result
            }
        }
    }

    /// Read every value stored under keys beginning with `prefix`.
    ///
    /// With `read_all`, iterates the whole sub-database instead. Pending
    /// overlay writes are merged in; overlay deletes are skipped.
    fn read_multiple<V: Decodable>(
        &self,
        sub: SubDb,
        prefix: &[u8],
        read_all: bool,
    ) -> Result<Vec<V>, DbError> {
        let cf = self.env.cf(sub)?;
        let mut out = Vec::new();
        let mut seen_keys = Vec::new();

        let iter = if read_all {
            self.env.db.iterator_cf(cf, rocksdb::IteratorMode::Start)
        } else {
            self.env.db.iterator_cf(
                cf,
                rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward),
            )
        };
        for item in iter {
            let (key, value) = item.map_err(|e| DbError::Engine(e.to_string()))?;
            if !read_all && !key.starts_with(prefix) {
                break;
            }
            if let Some(overlay) = &self.overlay {
                match overlay.ops.get(&(sub, key.to_vec())) {
                    Some(PendingOp::Delete) => continue,
                    Some(PendingOp::Put(pending)) => {
                        out.push(V::decode_from_slice(pending, &self.params)?);
                        seen_keys.push(key.to_vec());
                        continue;
                    }
                    None => {}
                }
            }
            out.push(V::decode_from_slice(&value, &self.params)?);
            seen_keys.push(key.to_vec());
        }

        // overlay puts for keys the engine has not seen yet
        if let Some(overlay) = &self.overlay {
            for ((op_sub, key), op) in &overlay.ops {
                if *op_sub != sub || seen_keys.contains(key) {
                    continue;
                }
                if !read_all && !key.starts_with(prefix) {
                    continue;
                }
                if let PendingOp::Put(pending) = op {
                    out.push(V::decode_from_slice(pending, &self.params)?);
                }
            }
        }
        Ok(out)
    }

    // --- Transactions ---

    /// Open a transaction, reserving `required_size` bytes of map space.
    pub fn txn_begin(&mut self, required_size: Option<u64>) -> Result<(), DbError> {
        if self.overlay.is_some() {
            return Err(DbError::TransactionActive);
        }
        self.env.begin_txn(required_size.unwrap_or(0));
        self.overlay = Some(TxnOverlay { ops: BTreeMap::new() });
        Ok(())
    }

    /// Commit the open transaction as one atomic batch.
    pub fn txn_commit(&mut self) -> Result<(), DbError> {
        let overlay = self.overlay.take().ok_or(DbError::NoActiveTransaction)?;
        let mut batch = WriteBatch::default();
        let mut bytes = 0u64;
        for ((sub, key), op) in &overlay.ops {
            let cf = self.env.cf(*sub)?;
            match op {
                PendingOp::Put(value) => {
                    bytes += (key.len() + value.len()) as u64;
                    batch.put_cf(cf, key, value);
                }
                PendingOp::Delete => batch.delete_cf(cf, key),
            }
        }
        let result = self
            .env
            .db
            .write(batch)
            .map_err(|e| DbError::Engine(e.to_string()));
        self.env.end_txn(if result.is_ok() { bytes } else { 0 });
        debug!(ops = overlay.ops.len(), "transaction committed");
        result
    }

    /// Drop the open transaction without applying anything.
    pub fn txn_abort(&mut self) -> Result<(), DbError> {
        if self.overlay.take().is_none() {
            return Err(DbError::NoActiveTransaction);
        }
        self.env.end_txn(0);
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.overlay.is_some()
    }

    // --- MainDb records ---

    pub fn read_version(&self) -> Result<Option<i32>, DbError> {
        self.read(SubDb::Main, KEY_VERSION)
    }

    pub fn write_version(&mut self, version: i32) -> Result<(), DbError> {
        self.write(SubDb::Main, KEY_VERSION, &version)
    }

    pub fn read_best_chain_hash(&self) -> Result<Option<Hash256>, DbError> {
        self.read(SubDb::Main, KEY_BEST_CHAIN)
    }

    pub fn write_best_chain_hash(&mut self, hash: &Hash256) -> Result<(), DbError> {
        self.write(SubDb::Main, KEY_BEST_CHAIN, hash)
    }

    pub fn read_best_invalid_trust(&self) -> Result<Option<U256>, DbError> {
        match self.read_raw(SubDb::Main, KEY_BEST_INVALID_TRUST)? {
            Some(bytes) if bytes.len() == 32 => {
                Ok(Some(U256::from_little_endian(&bytes)))
            }
            Some(_) => Err(DbError::Engine("invalid trust record length".into())),
            None => Ok(None),
        }
    }

    pub fn write_best_invalid_trust(&mut self, trust: &U256) -> Result<(), DbError> {
        let mut bytes = [0u8; 32];
        trust.to_little_endian(&mut bytes);
        self.write_raw(SubDb::Main, KEY_BEST_INVALID_TRUST, bytes.to_vec())
    }

    fn stake_seen_key(stake: &(OutPoint, u32)) -> Vec<u8> {
        let mut key = KEY_STAKE_SEEN_PREFIX.to_vec();
        key.extend_from_slice(stake.0.encode_to_vec(&SerialParams::disk()).as_slice());
        key.extend_from_slice(&stake.1.to_le_bytes());
        key
    }

    pub fn was_stake_seen(&self, stake: &(OutPoint, u32)) -> Result<bool, DbError> {
        self.exists(SubDb::Main, &Self::stake_seen_key(stake))
    }

    pub fn write_stake_seen(&mut self, stake: &(OutPoint, u32)) -> Result<(), DbError> {
        self.write_raw(SubDb::Main, &Self::stake_seen_key(stake), vec![1])
    }

    // --- Block index ---

    pub fn read_block_index(&self, hash: &Hash256) -> Result<Option<BlockIndex>, DbError> {
        self.read(SubDb::BlockIndex, hash.as_bytes())
    }

    pub fn write_block_index(&mut self, index: &BlockIndex) -> Result<(), DbError> {
        self.write(SubDb::BlockIndex, index.block_hash.as_bytes().as_slice(), index)
    }

    /// Load the whole block index, for startup.
    pub fn read_all_block_indices(&self) -> Result<Vec<BlockIndex>, DbError> {
        self.read_multiple(SubDb::BlockIndex, &[], true)
    }

    // --- Blocks ---

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, DbError> {
        self.read(SubDb::Blocks, hash.as_bytes())
    }

    pub fn write_block(&mut self, hash: &Hash256, block: &Block) -> Result<(), DbError> {
        self.write(SubDb::Blocks, hash.as_bytes(), block)
    }

    // --- Transaction spend records ---

    pub fn read_tx_index(&self, tx_hash: &Hash256) -> Result<Option<TxIndex>, DbError> {
        self.read(SubDb::Tx, tx_hash.as_bytes())
    }

    pub fn update_tx_index(&mut self, tx_hash: &Hash256, index: &TxIndex) -> Result<(), DbError> {
        self.write(SubDb::Tx, tx_hash.as_bytes(), index)
    }

    pub fn erase_tx_index(&mut self, tx_hash: &Hash256) -> Result<(), DbError> {
        self.erase(SubDb::Tx, tx_hash.as_bytes())
    }

    pub fn contains_tx(&self, tx_hash: &Hash256) -> Result<bool, DbError> {
        self.exists(SubDb::Tx, tx_hash.as_bytes())
    }

    /// Read a stored transaction through its spend record's position.
    pub fn read_tx(&self, tx_hash: &Hash256) -> Result<Option<Transaction>, DbError> {
        let Some(index) = self.read_tx_index(tx_hash)? else {
            return Ok(None);
        };
        let Some(block) = self.read_block(&index.pos.block_hash)? else {
            return Ok(None);
        };
        Ok(block.vtx.into_iter().find(|tx| tx.hash() == *tx_hash))
    }

    // --- Token overlay records ---

    pub fn read_token_tx(&self, tx_hash: &Hash256) -> Result<Option<TokenTransaction>, DbError> {
        self.read(SubDb::TokenTx, tx_hash.as_bytes())
    }

    pub fn write_token_tx(&mut self, token_tx: &TokenTransaction) -> Result<(), DbError> {
        self.write(SubDb::TokenTx, token_tx.tx_hash.as_bytes().as_slice(), token_tx)
    }

    /// Composed duplicate key: `len(symbol) || symbol || txid`.
    fn symbol_key(symbol: &str, tx_hash: &Hash256) -> Vec<u8> {
        let mut key = Self::symbol_prefix(symbol);
        key.extend_from_slice(tx_hash.as_bytes());
        key
    }

    fn symbol_prefix(symbol: &str) -> Vec<u8> {
        let lower = symbol.to_ascii_lowercase();
        let mut key = Vec::with_capacity(1 + lower.len());
        key.push(lower.len() as u8);
        key.extend_from_slice(lower.as_bytes());
        key
    }

    /// Record that `symbol` was issued by `tx_hash` (duplicate-keyed).
    pub fn write_token_symbol_entry(
        &mut self,
        symbol: &str,
        tx_hash: &Hash256,
    ) -> Result<(), DbError> {
        self.write(SubDb::TokenNames, &Self::symbol_key(symbol, tx_hash), tx_hash)
    }

    /// All txids recorded as issuers of `symbol` (case-insensitive).
    pub fn read_token_txs_with_symbol(&self, symbol: &str) -> Result<Vec<Hash256>, DbError> {
        self.read_multiple(SubDb::TokenNames, &Self::symbol_prefix(symbol), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_core::genesis::genesis_block;
    use halcyon_core::params::Network;
    use tempfile::TempDir;

    fn open_env() -> (TempDir, Arc<DbEnvironment>) {
        let dir = TempDir::new().unwrap();
        let env = DbEnvironment::open(dir.path()).unwrap();
        (dir, env)
    }

    fn h(n: u8) -> Hash256 {
        Hash256([n; 32])
    }

    // ------------------------------------------------------------------
    // MainDb scalars
    // ------------------------------------------------------------------

    #[test]
    fn version_round_trip() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        assert_eq!(db.read_version().unwrap(), None);
        db.write_version(60320).unwrap();
        assert_eq!(db.read_version().unwrap(), Some(60320));
    }

    #[test]
    fn best_chain_hash_round_trip() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        db.write_best_chain_hash(&h(7)).unwrap();
        assert_eq!(db.read_best_chain_hash().unwrap(), Some(h(7)));
    }

    #[test]
    fn best_invalid_trust_round_trip() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        assert_eq!(db.read_best_invalid_trust().unwrap(), None);
        db.write_best_invalid_trust(&U256::from(123456u64)).unwrap();
        assert_eq!(db.read_best_invalid_trust().unwrap(), Some(U256::from(123456u64)));
    }

    #[test]
    fn stake_seen_marks() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        let stake = (OutPoint::new(h(1), 3), 777u32);
        assert!(!db.was_stake_seen(&stake).unwrap());
        db.write_stake_seen(&stake).unwrap();
        assert!(db.was_stake_seen(&stake).unwrap());
        // a different stake time is a different mark
        assert!(!db.was_stake_seen(&(stake.0, 778)).unwrap());
    }

    // ------------------------------------------------------------------
    // Blocks and indices
    // ------------------------------------------------------------------

    #[test]
    fn block_round_trip() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        let block = genesis_block(Network::Mainnet);
        let hash = block.hash();
        assert_eq!(db.read_block(&hash).unwrap(), None);
        db.write_block(&hash, &block).unwrap();
        assert_eq!(db.read_block(&hash).unwrap(), Some(block));
    }

    #[test]
    fn block_index_round_trip() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        let block = genesis_block(Network::Mainnet);
        let mut index = BlockIndex::from_block(&block);
        index.height = 0;
        index.chain_trust = U256::from(2u8);
        db.write_block_index(&index).unwrap();
        assert_eq!(db.read_block_index(&index.block_hash).unwrap(), Some(index.clone()));

        let all = db.read_all_block_indices().unwrap();
        assert_eq!(all, vec![index]);
    }

    #[test]
    fn tx_index_round_trip() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        let block = genesis_block(Network::Mainnet);
        let tx_hash = block.vtx[0].hash();
        let index = TxIndex::new(
            halcyon_core::types::DiskTxPos::new(block.hash(), 81),
            block.vtx[0].vout.len(),
        );
        db.update_tx_index(&tx_hash, &index).unwrap();
        assert!(db.contains_tx(&tx_hash).unwrap());
        assert_eq!(db.read_tx_index(&tx_hash).unwrap(), Some(index));

        // read_tx resolves through the stored block
        db.write_block(&block.hash(), &block).unwrap();
        assert_eq!(db.read_tx(&tx_hash).unwrap(), Some(block.vtx[0].clone()));

        db.erase_tx_index(&tx_hash).unwrap();
        assert!(!db.contains_tx(&tx_hash).unwrap());
    }

    // ------------------------------------------------------------------
    // Duplicate-keyed symbol index
    // ------------------------------------------------------------------

    #[test]
    fn symbol_entries_accumulate() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        db.write_token_symbol_entry("ABCDE", &h(1)).unwrap();
        db.write_token_symbol_entry("abcde", &h(2)).unwrap();
        db.write_token_symbol_entry("OTHER", &h(3)).unwrap();

        let mut txids = db.read_token_txs_with_symbol("AbCdE").unwrap();
        txids.sort();
        assert_eq!(txids, vec![h(1), h(2)]);
        assert_eq!(db.read_token_txs_with_symbol("other").unwrap(), vec![h(3)]);
        assert!(db.read_token_txs_with_symbol("none").unwrap().is_empty());
    }

    #[test]
    fn symbol_prefix_does_not_bleed() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        // "ab" must not match entries for "abc"
        db.write_token_symbol_entry("abc", &h(1)).unwrap();
        assert!(db.read_token_txs_with_symbol("ab").unwrap().is_empty());
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    #[test]
    fn committed_txn_is_atomic_and_visible() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env.clone());
        db.txn_begin(None).unwrap();
        db.write_best_chain_hash(&h(5)).unwrap();
        db.write_version(1).unwrap();

        // another handle does not see pending writes
        let other = TxDb::new(env);
        assert_eq!(other.read_best_chain_hash().unwrap(), None);

        // the writing handle reads through its overlay
        assert_eq!(db.read_best_chain_hash().unwrap(), Some(h(5)));

        db.txn_commit().unwrap();
        assert_eq!(other.read_best_chain_hash().unwrap(), Some(h(5)));
        assert_eq!(other.read_version().unwrap(), Some(1));
    }

    #[test]
    fn aborted_txn_leaves_no_trace() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        db.write_version(1).unwrap();

        db.txn_begin(None).unwrap();
        db.write_version(2).unwrap();
        db.erase(SubDb::Main, KEY_BEST_CHAIN).unwrap();
        db.txn_abort().unwrap();

        assert_eq!(db.read_version().unwrap(), Some(1));
    }

    #[test]
    fn overlay_delete_shadows_disk() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        db.write_version(9).unwrap();

        db.txn_begin(None).unwrap();
        db.erase(SubDb::Main, KEY_VERSION).unwrap();
        assert_eq!(db.read_version().unwrap(), None);
        db.txn_commit().unwrap();
        assert_eq!(db.read_version().unwrap(), None);
    }

    #[test]
    fn double_begin_rejected() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        db.txn_begin(None).unwrap();
        assert_eq!(db.txn_begin(None), Err(DbError::TransactionActive));
        db.txn_abort().unwrap();
        assert_eq!(db.txn_abort(), Err(DbError::NoActiveTransaction));
    }

    #[test]
    fn read_multiple_sees_overlay_puts() {
        let (_dir, env) = open_env();
        let mut db = TxDb::new(env);
        db.write_token_symbol_entry("tok", &h(1)).unwrap();
        db.txn_begin(None).unwrap();
        db.write_token_symbol_entry("tok", &h(2)).unwrap();
        let mut txids = db.read_token_txs_with_symbol("tok").unwrap();
        txids.sort();
        assert_eq!(txids, vec![h(1), h(2)]);
        db.txn_abort().unwrap();
        assert_eq!(db.read_token_txs_with_symbol("tok").unwrap(), vec![h(1)]);
    }

    // ------------------------------------------------------------------
    // Map-size governor
    // ------------------------------------------------------------------

    #[test]
    fn huge_reservation_grows_map() {
        let (_dir, env) = open_env();
        let before = env.map_size();
        let mut db = TxDb::new(env.clone());
        db.txn_begin(Some(before * 2)).unwrap();
        db.write_version(1).unwrap();
        db.txn_commit().unwrap();
        assert!(env.map_size() > before);
        // the write that needed the space survived
        assert_eq!(db.read_version().unwrap(), Some(1));
    }
}
