//! The pool of validated, unconfirmed transactions.
//!
//! Three indices are kept in lockstep: the transaction map, the spender
//! index (`OutPoint → InPoint`) used for conflict detection, and the
//! bidirectional issuance-symbol index that caps each token symbol to one
//! in-flight issuance. The pool performs no validation of its own;
//! admission runs through the acceptance pipeline before
//! [`Mempool::add_unchecked`] is called.

use std::collections::HashMap;

use crate::hash::Hash256;
use crate::types::{InPoint, OutPoint, Transaction};

/// Lowercased comparable form of a token symbol.
pub fn comparable_symbol(symbol: &str) -> String {
    symbol.to_ascii_lowercase()
}

/// In-memory pool of unconfirmed transactions.
///
/// Not internally synchronized; the node wraps it in the chain-wide lock
/// hierarchy (the pool lock may be taken under the chain lock, never the
/// reverse).
#[derive(Default)]
pub struct Mempool {
    /// Primary storage, keyed by transaction hash.
    map_tx: HashMap<Hash256, Transaction>,
    /// Which pooled transaction spends each outpoint.
    map_next_tx: HashMap<OutPoint, InPoint>,
    /// txid → comparable issuance symbol for pooled issuances.
    issued_symbol_by_txid: HashMap<Hash256, String>,
    /// Comparable issuance symbol → txid.
    txid_by_issued_symbol: HashMap<String, Hash256>,
    /// Bumped on every mutation; lets peers cheaply poll for changes.
    transactions_updated: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully validated transaction.
    ///
    /// `issuance_symbol` is the token symbol if the transaction issues
    /// one, as extracted by the token overlay during acceptance.
    pub fn add_unchecked(
        &mut self,
        hash: Hash256,
        tx: Transaction,
        issuance_symbol: Option<&str>,
    ) {
        if let Some(symbol) = issuance_symbol {
            let comparable = comparable_symbol(symbol);
            self.issued_symbol_by_txid.insert(hash, comparable.clone());
            self.txid_by_issued_symbol.insert(comparable, hash);
        }
        for (n, txin) in tx.vin.iter().enumerate() {
            self.map_next_tx
                .insert(txin.prevout, InPoint { tx_hash: hash, n: n as u32 });
        }
        self.map_tx.insert(hash, tx);
        self.transactions_updated += 1;
    }

    /// Remove a transaction; with `recursive`, also remove every pooled
    /// transaction spending one of its outputs.
    pub fn remove(&mut self, tx: &Transaction, recursive: bool) {
        let hash = tx.hash();
        if self.map_tx.contains_key(&hash) {
            if recursive {
                for n in 0..tx.vout.len() as u32 {
                    let child = self
                        .map_next_tx
                        .get(&OutPoint::new(hash, n))
                        .and_then(|ip| self.map_tx.get(&ip.tx_hash))
                        .cloned();
                    if let Some(child_tx) = child {
                        self.remove(&child_tx, true);
                    }
                }
            }
            for txin in &tx.vin {
                self.map_next_tx.remove(&txin.prevout);
            }
            self.map_tx.remove(&hash);
            self.transactions_updated += 1;
        }
        if let Some(symbol) = self.issued_symbol_by_txid.remove(&hash) {
            self.txid_by_issued_symbol.remove(&symbol);
        }
    }

    /// Remove every pooled transaction that conflicts with `tx`'s spends.
    pub fn remove_conflicts(&mut self, tx: &Transaction) {
        let tx_hash = tx.hash();
        for txin in &tx.vin {
            let conflict = self
                .map_next_tx
                .get(&txin.prevout)
                .filter(|ip| ip.tx_hash != tx_hash)
                .and_then(|ip| self.map_tx.get(&ip.tx_hash))
                .cloned();
            if let Some(conflict_tx) = conflict {
                self.remove(&conflict_tx, true);
            }
        }
    }

    pub fn clear(&mut self) {
        self.map_tx.clear();
        self.map_next_tx.clear();
        self.issued_symbol_by_txid.clear();
        self.txid_by_issued_symbol.clear();
        self.transactions_updated += 1;
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<&Transaction> {
        self.map_tx.get(hash)
    }

    pub fn exists(&self, hash: &Hash256) -> bool {
        self.map_tx.contains_key(hash)
    }

    /// Whether an outpoint is already spent by a pooled transaction.
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.map_next_tx.contains_key(outpoint)
    }

    /// The pooled spender of an outpoint, if any.
    pub fn spender(&self, outpoint: &OutPoint) -> Option<InPoint> {
        self.map_next_tx.get(outpoint).copied()
    }

    /// Whether a (case-insensitive) issuance symbol is already in flight.
    pub fn is_issuance_symbol_in_mempool(&self, symbol: &str) -> bool {
        self.txid_by_issued_symbol
            .contains_key(&comparable_symbol(symbol))
    }

    /// All pooled transaction hashes, in arbitrary order.
    pub fn query_hashes(&self) -> Vec<Hash256> {
        self.map_tx.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.map_tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map_tx.is_empty()
    }

    pub fn transactions_updated(&self) -> u64 {
        self.transactions_updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use crate::types::{TxIn, TxOut};

    fn outpoint(seed: u8, n: u32) -> OutPoint {
        OutPoint::new(Hash256([seed; 32]), n)
    }

    fn make_tx(spends: &[OutPoint], outputs: usize, salt: u32) -> Transaction {
        Transaction {
            version: 1,
            time: salt,
            vin: spends.iter().map(|op| TxIn::new(*op)).collect(),
            vout: (0..outputs)
                .map(|i| TxOut::new(1_000 + i as i64, Script(vec![0x51])))
                .collect(),
            lock_time: 0,
        }
    }

    // ------------------------------------------------------------------
    // Basic operations
    // ------------------------------------------------------------------

    #[test]
    fn new_pool_is_empty() {
        let pool = Mempool::new();
        assert!(pool.is_empty());
        assert_eq!(pool.len(), 0);
        assert!(pool.query_hashes().is_empty());
    }

    #[test]
    fn add_and_lookup() {
        let mut pool = Mempool::new();
        let tx = make_tx(&[outpoint(1, 0)], 1, 0);
        let hash = tx.hash();
        pool.add_unchecked(hash, tx.clone(), None);

        assert!(pool.exists(&hash));
        assert_eq!(pool.lookup(&hash), Some(&tx));
        assert_eq!(pool.len(), 1);
        assert!(pool.is_spent(&outpoint(1, 0)));
        assert_eq!(pool.spender(&outpoint(1, 0)).unwrap().tx_hash, hash);
    }

    #[test]
    fn update_counter_moves() {
        let mut pool = Mempool::new();
        let before = pool.transactions_updated();
        let tx = make_tx(&[outpoint(1, 0)], 1, 0);
        pool.add_unchecked(tx.hash(), tx.clone(), None);
        assert!(pool.transactions_updated() > before);
        pool.remove(&tx, false);
        assert!(pool.transactions_updated() > before + 1);
    }

    #[test]
    fn remove_clears_spender_index() {
        let mut pool = Mempool::new();
        let tx = make_tx(&[outpoint(1, 0), outpoint(2, 1)], 1, 0);
        pool.add_unchecked(tx.hash(), tx.clone(), None);
        pool.remove(&tx, false);

        assert!(pool.is_empty());
        assert!(!pool.is_spent(&outpoint(1, 0)));
        assert!(!pool.is_spent(&outpoint(2, 1)));
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut pool = Mempool::new();
        let tx = make_tx(&[outpoint(1, 0)], 1, 0);
        pool.remove(&tx, true);
        assert!(pool.is_empty());
    }

    // ------------------------------------------------------------------
    // Recursive removal
    // ------------------------------------------------------------------

    #[test]
    fn recursive_remove_takes_descendants() {
        let mut pool = Mempool::new();
        let parent = make_tx(&[outpoint(1, 0)], 2, 0);
        let parent_hash = parent.hash();
        let child = make_tx(&[OutPoint::new(parent_hash, 0)], 1, 1);
        let child_hash = child.hash();
        let grandchild = make_tx(&[OutPoint::new(child_hash, 0)], 1, 2);
        let grandchild_hash = grandchild.hash();

        pool.add_unchecked(parent_hash, parent.clone(), None);
        pool.add_unchecked(child_hash, child, None);
        pool.add_unchecked(grandchild_hash, grandchild, None);

        pool.remove(&parent, true);
        assert!(pool.is_empty());
    }

    #[test]
    fn non_recursive_remove_keeps_descendants() {
        let mut pool = Mempool::new();
        let parent = make_tx(&[outpoint(1, 0)], 1, 0);
        let parent_hash = parent.hash();
        let child = make_tx(&[OutPoint::new(parent_hash, 0)], 1, 1);

        pool.add_unchecked(parent_hash, parent.clone(), None);
        pool.add_unchecked(child.hash(), child.clone(), None);

        pool.remove(&parent, false);
        assert!(!pool.exists(&parent_hash));
        assert!(pool.exists(&child.hash()));
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    #[test]
    fn remove_conflicts_evicts_double_spenders() {
        let mut pool = Mempool::new();
        let pooled = make_tx(&[outpoint(1, 0)], 2, 0);
        let pooled_hash = pooled.hash();
        let dependent = make_tx(&[OutPoint::new(pooled_hash, 1)], 1, 1);

        pool.add_unchecked(pooled_hash, pooled, None);
        pool.add_unchecked(dependent.hash(), dependent.clone(), None);

        // a confirmed tx spending the same outpoint evicts both
        let confirmed = make_tx(&[outpoint(1, 0)], 1, 99);
        pool.remove_conflicts(&confirmed);

        assert!(pool.is_empty());
    }

    #[test]
    fn remove_conflicts_ignores_self() {
        let mut pool = Mempool::new();
        let tx = make_tx(&[outpoint(1, 0)], 1, 0);
        pool.add_unchecked(tx.hash(), tx.clone(), None);
        pool.remove_conflicts(&tx);
        assert!(pool.exists(&tx.hash()));
    }

    // ------------------------------------------------------------------
    // Issuance symbol index
    // ------------------------------------------------------------------

    #[test]
    fn symbol_index_is_case_insensitive() {
        let mut pool = Mempool::new();
        let tx = make_tx(&[outpoint(1, 0)], 1, 0);
        pool.add_unchecked(tx.hash(), tx, Some("ABCDE"));

        assert!(pool.is_issuance_symbol_in_mempool("ABCDE"));
        assert!(pool.is_issuance_symbol_in_mempool("abcde"));
        assert!(pool.is_issuance_symbol_in_mempool("AbCdE"));
        assert!(!pool.is_issuance_symbol_in_mempool("OTHER"));
    }

    #[test]
    fn symbol_freed_on_removal() {
        let mut pool = Mempool::new();
        let tx = make_tx(&[outpoint(1, 0)], 1, 0);
        pool.add_unchecked(tx.hash(), tx.clone(), Some("TOKEN"));
        assert!(pool.is_issuance_symbol_in_mempool("token"));

        pool.remove(&tx, false);
        assert!(!pool.is_issuance_symbol_in_mempool("token"));
    }

    #[test]
    fn clear_resets_everything() {
        let mut pool = Mempool::new();
        let tx = make_tx(&[outpoint(1, 0)], 1, 0);
        pool.add_unchecked(tx.hash(), tx, Some("TOK"));
        pool.clear();

        assert!(pool.is_empty());
        assert!(!pool.is_spent(&outpoint(1, 0)));
        assert!(!pool.is_issuance_symbol_in_mempool("tok"));
    }

    #[test]
    fn query_hashes_returns_all() {
        let mut pool = Mempool::new();
        let a = make_tx(&[outpoint(1, 0)], 1, 0);
        let b = make_tx(&[outpoint(2, 0)], 1, 1);
        pool.add_unchecked(a.hash(), a.clone(), None);
        pool.add_unchecked(b.hash(), b.clone(), None);

        let mut hashes = pool.query_hashes();
        hashes.sort();
        let mut expected = vec![a.hash(), b.hash()];
        expected.sort();
        assert_eq!(hashes, expected);
    }
}
