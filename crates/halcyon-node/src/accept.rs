//! Transaction acceptance: input resolution, input connection, and the
//! mempool admission pipeline.
//!
//! `fetch_inputs` and `connect_inputs` are shared between loose-transaction
//! admission and block connection; the block path layers BIP30, sigop and
//! reward checks on top (see `chain`).

use std::collections::HashMap;

use tracing::{debug, info};

use halcyon_core::constants::{MIN_RELAY_TX_FEE, money_range};
use halcyon_core::error::TxValidationError;
use halcyon_core::hash::Hash256;
use halcyon_core::mempool::Mempool;
use halcyon_core::params::{Network, NetworkFork, Params};
use halcyon_core::script::verify_script;
use halcyon_core::serialize::{Encodable, SerialParams};
use halcyon_core::types::{DiskTxPos, Transaction, TxIndex};
use halcyon_core::validation::{
    FeeMode, check_transaction, is_final_tx, is_standard_tx, min_fee,
};
use halcyon_tokens::transaction::token_symbol_if_issuance;
use halcyon_tokens::{TokenAmount, TokenError, TokenTransaction};

use crate::chain::ChainState;
use crate::txdb::TxDb;

/// Limit on resolution depth when chasing token data through the pool.
const MAX_TOKEN_RESOLUTION_DEPTH: usize = 32;

/// One resolved input: the spend record and the funding transaction.
#[derive(Clone, Debug)]
pub struct FetchedInput {
    pub index: TxIndex,
    pub tx: Transaction,
}

/// Resolved inputs keyed by funding transaction hash.
pub type FetchedInputs = HashMap<Hash256, FetchedInput>;

/// Resolve every input of `tx`.
///
/// Lookup order: the caller's queued-change overlay (`test_pool`), then
/// the spend-record database, then the mempool. A missing input is an
/// orphan candidate ([`TxValidationError::MissingInputs`]); a reference
/// past the funding transaction's outputs is definitely invalid.
pub fn fetch_inputs(
    tx: &Transaction,
    txdb: &TxDb,
    test_pool: &HashMap<Hash256, TxIndex>,
    mempool: &Mempool,
    in_block: bool,
) -> Result<FetchedInputs, TxValidationError> {
    let mut fetched = FetchedInputs::new();
    if tx.is_coinbase() {
        return Ok(fetched);
    }

    for txin in &tx.vin {
        let prev_hash = txin.prevout.hash;
        if fetched.contains_key(&prev_hash) {
            continue;
        }

        let (mut index, found) = if in_block && test_pool.contains_key(&prev_hash) {
            (test_pool[&prev_hash].clone(), true)
        } else {
            match txdb
                .read_tx_index(&prev_hash)
                .map_err(|_| TxValidationError::MissingInputs)?
            {
                Some(index) => (index, true),
                None => (TxIndex::new(DiskTxPos::null(), 0), false),
            }
        };

        if !found && in_block {
            return Err(TxValidationError::MissingInputs);
        }

        let prev_tx = if !found || index.pos == DiskTxPos::mempool_sentinel() {
            let Some(pooled) = mempool.lookup(&prev_hash) else {
                return Err(TxValidationError::MissingInputs);
            };
            if !found {
                index.spent = vec![DiskTxPos::null(); pooled.vout.len()];
            }
            pooled.clone()
        } else {
            match txdb.read_tx(&prev_hash) {
                Ok(Some(prev_tx)) => prev_tx,
                _ => return Err(TxValidationError::MissingInputs),
            }
        };

        fetched.insert(prev_hash, FetchedInput { index, tx: prev_tx });
    }

    // all prevout indexes must be inside both the transaction and its
    // spend record
    for txin in &tx.vin {
        let entry = &fetched[&txin.prevout.hash];
        let n = txin.prevout.n as usize;
        if n >= entry.tx.vout.len() || n >= entry.index.spent.len() {
            return Err(TxValidationError::InvalidInputs);
        }
    }

    Ok(fetched)
}

/// Value claimed by one input.
fn output_value(inputs: &FetchedInputs, txin_prevout: &halcyon_core::types::OutPoint) -> i64 {
    inputs[&txin_prevout.hash].tx.vout[txin_prevout.n as usize].value
}

/// Connect a transaction's inputs: maturity, timestamps, value ranges,
/// double-spend marks, and script verification.
///
/// Marks each consumed slot with `pos_this_tx` and, when `in_block`,
/// publishes the updated spend records into `test_pool` so later
/// transactions of the same block see them. Returns the total input
/// value.
#[allow(clippy::too_many_arguments)]
pub fn connect_inputs(
    tx: &Transaction,
    inputs: &mut FetchedInputs,
    test_pool: &mut HashMap<Hash256, TxIndex>,
    pos_this_tx: DiskTxPos,
    spender_height: i32,
    block_height_of: &dyn Fn(&Hash256) -> Option<i32>,
    params: &Params,
    in_block: bool,
    skip_signature_checks: bool,
) -> Result<i64, TxValidationError> {
    if tx.is_coinbase() {
        return Ok(0);
    }

    let mut value_in: i64 = 0;
    // all the cheap checks run before any signature verification
    for txin in &tx.vin {
        let entry = inputs
            .get(&txin.prevout.hash)
            .ok_or(TxValidationError::MissingInputs)?;
        let n = txin.prevout.n as usize;
        if n >= entry.tx.vout.len() || n >= entry.index.spent.len() {
            return Err(TxValidationError::PrevoutOutOfRange);
        }

        let prev_tx = &entry.tx;
        if prev_tx.is_coinbase() || prev_tx.is_coinstake() {
            let maturity = params.coinbase_maturity(spender_height);
            let funding_height = block_height_of(&entry.index.pos.block_hash)
                .unwrap_or(spender_height); // unresolved funding blocks count as fresh
            if spender_height - funding_height < maturity {
                return Err(TxValidationError::PrematureSpend(if prev_tx.is_coinbase() {
                    "coinbase"
                } else {
                    "coinstake"
                }));
            }
        }

        if prev_tx.time > tx.time {
            return Err(TxValidationError::TimeEarlierThanInput);
        }

        let claimed = prev_tx.vout[n].value;
        value_in = value_in.saturating_add(claimed);
        if !money_range(claimed) || !money_range(value_in) {
            return Err(TxValidationError::InputValueOutOfRange);
        }
    }

    for (input_index, txin) in tx.vin.iter().enumerate() {
        let entry = inputs
            .get_mut(&txin.prevout.hash)
            .ok_or(TxValidationError::MissingInputs)?;
        let n = txin.prevout.n as usize;

        // double-spend detection happens before the expensive signature
        // check and never carries a DoS score, so a split network cannot
        // be widened by it
        if !entry.index.spent[n].is_null() {
            return Err(TxValidationError::AlreadySpent);
        }

        if !skip_signature_checks {
            let script_pubkey = &entry.tx.vout[n].script_pubkey;
            verify_script(&txin.script_sig, script_pubkey, tx, input_index)
                .map_err(TxValidationError::ScriptFailed)?;
        }

        entry.index.spent[n] = pos_this_tx;
        if in_block {
            test_pool.insert(txin.prevout.hash, entry.index.clone());
        }
    }

    if !tx.is_coinstake() {
        let value_out = tx.value_out();
        if value_in < value_out {
            return Err(TxValidationError::ValueInBelowOut);
        }
        let fee = value_in - value_out;
        if in_block {
            let tx_bytes = tx.encoded_size(&SerialParams::network());
            let required = min_fee(
                tx,
                1,
                FeeMode::Block,
                tx_bytes,
                params.max_block_size(spender_height),
            );
            if fee < required {
                return Err(TxValidationError::InsufficientFee { paid: fee, required });
            }
        }
    }

    Ok(value_in)
}

/// Exponentially-decaying byte budget for fee-free transactions.
///
/// The window decays with a 600-second time constant; the budget is
/// `-limitfreerelay` thousand-bytes per minute. Guarded by the pool lock
/// in the owning chain state.
pub struct RelayLimiter {
    free_bytes: f64,
    last_time: i64,
}

impl RelayLimiter {
    pub fn new() -> Self {
        Self { free_bytes: 0.0, last_time: 0 }
    }

    /// Account `bytes` of free relay at `now`; `false` means reject.
    /// Wallet-local transactions bypass the limit but still consume it.
    pub fn allow(&mut self, bytes: usize, limit_kb_per_minute: i64, now: i64, from_me: bool) -> bool {
        let elapsed = (now - self.last_time).max(0) as f64;
        self.free_bytes *= (1.0 - 1.0 / 600.0f64).powf(elapsed);
        self.last_time = now;
        if self.free_bytes > (limit_kb_per_minute * 10 * 1000) as f64 && !from_me {
            return false;
        }
        debug!(count = self.free_bytes, added = bytes, "free relay accounted");
        self.free_bytes += bytes as f64;
        true
    }
}

impl Default for RelayLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Token amounts carried into `tx` by each of its prevouts, resolved
/// through the database first and recursively through the mempool for
/// unconfirmed parents.
pub fn resolve_input_tokens(
    tx: &Transaction,
    txdb: &TxDb,
    mempool: &Mempool,
    depth: usize,
) -> Result<HashMap<halcyon_core::types::OutPoint, Vec<TokenAmount>>, TokenError> {
    let mut resolved = HashMap::new();
    for txin in &tx.vin {
        let prevout = txin.prevout;
        if let Ok(Some(token_tx)) = txdb.read_token_tx(&prevout.hash) {
            resolved.insert(prevout, token_tx.tokens_of_output(prevout.n).to_vec());
            continue;
        }
        // unconfirmed parent: resolve its overlay effect on the fly
        if let Some(parent) = mempool.lookup(&prevout.hash) {
            if halcyon_tokens::script::is_token_tx(parent) {
                if depth == 0 {
                    return Err(TokenError::MissingInputTokenData(prevout.to_string()));
                }
                let parent_inputs = resolve_input_tokens(parent, txdb, mempool, depth - 1)?;
                let parent_token_tx = TokenTransaction::from_tx(parent, &parent_inputs)?
                    .expect("marker presence was just checked");
                resolved.insert(prevout, parent_token_tx.tokens_of_output(prevout.n).to_vec());
                continue;
            }
        }
        // plain coins carry no tokens
        resolved.insert(prevout, Vec::new());
    }
    Ok(resolved)
}

impl ChainState {
    /// Admit a loose transaction to the mempool.
    ///
    /// Runs the full ordered pipeline: structural checks, loose-coinbase
    /// rejection, standardness, finality, duplicate and conflict
    /// detection, input resolution, fee policy, free-relay limiting,
    /// script connection, and the token overlay gates. On success the
    /// transaction is inserted unchecked.
    pub fn accept_to_memory_pool(
        &mut self,
        tx: &Transaction,
        from_me: bool,
    ) -> Result<(), TxValidationError> {
        let best_height = self.best().height;
        let max_block_size = self.params().max_block_size(best_height);
        check_transaction(tx, max_block_size)?;

        if tx.is_coinbase() {
            return Err(TxValidationError::CoinbaseAsLooseTx);
        }
        if tx.is_coinstake() {
            return Err(TxValidationError::CoinstakeAsLooseTx);
        }

        let now = self.adjusted_time();
        if self.params().network() == Network::Mainnet {
            is_standard_tx(tx, now, self.config().enforce_canonical)?;
        }

        if !is_final_tx(tx, best_height + 1, now) {
            return Err(TxValidationError::NotFinal);
        }

        let hash = tx.hash();
        if self.mempool.exists(&hash) {
            return Err(TxValidationError::AlreadyInPool);
        }

        let txdb = self.txdb();
        if txdb
            .contains_tx(&hash)
            .map_err(|_| TxValidationError::InvalidInputs)?
        {
            return Err(TxValidationError::AlreadyOnChain);
        }

        // conflicting spends are rejected outright; replacement is not
        // supported
        for txin in &tx.vin {
            if self.mempool.is_spent(&txin.prevout) {
                return Err(TxValidationError::Conflict);
            }
        }

        let empty_pool = HashMap::new();
        let mut inputs = fetch_inputs(tx, &txdb, &empty_pool, &self.mempool, false)?;

        if self.params().network() == Network::Mainnet && !self.are_inputs_standard(tx, &inputs) {
            return Err(TxValidationError::NonStandardInput);
        }

        let value_in: i64 = tx
            .vin
            .iter()
            .map(|txin| output_value(&inputs, &txin.prevout))
            .sum();
        let fee = value_in - tx.value_out();
        let tx_bytes = tx.encoded_size(&SerialParams::network());
        let required = min_fee(tx, 1000, FeeMode::Relay, tx_bytes, max_block_size);
        if fee < required {
            return Err(TxValidationError::InsufficientFee { paid: fee, required });
        }

        // penny-flood mitigation for transactions below the relay floor
        if fee < MIN_RELAY_TX_FEE {
            let limit = self.config().limit_free_relay;
            if !self.relay_limiter.allow(tx_bytes, limit, now, from_me) {
                return Err(TxValidationError::RateLimited);
            }
        }

        // done last to keep signature work off the cheap rejection paths
        let mut unused_pool = HashMap::new();
        let height_of = self.block_height_lookup();
        connect_inputs(
            tx,
            &mut inputs,
            &mut unused_pool,
            DiskTxPos::mempool_sentinel(),
            best_height + 1,
            &height_of,
            self.params(),
            false,
            false,
        )?;
        drop(height_of);

        // token overlay gates
        let mut issuance_symbol = None;
        if self.params().passed_first_valid_token_tx(best_height)
            && self
                .params()
                .fork_active(NetworkFork::Tachyon, best_height)
            && halcyon_tokens::script::is_token_tx(tx)
        {
            let input_tokens =
                resolve_input_tokens(tx, &txdb, &self.mempool, MAX_TOKEN_RESOLUTION_DEPTH)
                    .map_err(|e| TxValidationError::Token(e.to_string()))?;
            let token_tx = TokenTransaction::from_tx(tx, &input_tokens)
                .map_err(|e| TxValidationError::Token(e.to_string()))?;
            if let Some(token_tx) = token_tx {
                if let Some(symbol) = token_tx.symbol_if_issuance() {
                    if self.mempool.is_issuance_symbol_in_mempool(symbol) {
                        return Err(TxValidationError::Token(format!(
                            "issuance symbol {symbol} already pending"
                        )));
                    }
                    if self.params().enforce_unique_token_symbols(best_height) {
                        self.assert_symbol_not_in_main_chain(symbol, &hash)
                            .map_err(|e| TxValidationError::Token(e.to_string()))?;
                    }
                    issuance_symbol = Some(symbol.to_string());
                }
            }
        } else if halcyon_tokens::script::is_token_tx(tx) {
            // markers are inert before the overlay activates, but the
            // symbol still parks in the pool index to stop races
            issuance_symbol = token_symbol_if_issuance(tx);
        }

        self.mempool
            .add_unchecked(hash, tx.clone(), issuance_symbol.as_deref());
        info!(tx = %hash, pool_size = self.mempool.len(), "accepted to memory pool");
        Ok(())
    }

    /// Standardness of the scripts being spent: every funding output must
    /// match a standard template, and P2SH redeem scripts stay within the
    /// standard sigop budget.
    fn are_inputs_standard(&self, tx: &Transaction, inputs: &FetchedInputs) -> bool {
        use halcyon_core::script::ScriptType;
        for txin in &tx.vin {
            let entry = &inputs[&txin.prevout.hash];
            let script_pubkey = &entry.tx.vout[txin.prevout.n as usize].script_pubkey;
            match script_pubkey.classify() {
                ScriptType::NonStandard => return false,
                ScriptType::ScriptHash => {
                    if script_pubkey.p2sh_sig_op_count(&txin.script_sig) > 15 {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }
}
