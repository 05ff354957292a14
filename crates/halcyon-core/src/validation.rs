//! Context-free transaction checks and relay policy.
//!
//! Everything here is computable from the transaction alone plus a few
//! chain-tip scalars (height, adjusted time, block fill). Input fetching
//! and script execution live with the chain state, which owns the
//! storage handles.

use std::collections::HashSet;

use crate::constants::{
    CENT, FUTURE_DRIFT, LOCKTIME_THRESHOLD, MAX_MONEY, MAX_STANDARD_TX_SIZE, MIN_RELAY_TX_FEE,
    MIN_TX_FEE, money_range,
};
use crate::error::TxValidationError;
use crate::script::ScriptType;
use crate::serialize::{Encodable, SerialParams};
use crate::types::{TX_CURRENT_VERSION, Transaction};

/// Which fee floor applies: inclusion in a block or relay to peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeeMode {
    Block,
    Relay,
}

/// Context-free structural checks; the first gate every transaction
/// passes, loose or in a block.
pub fn check_transaction(
    tx: &Transaction,
    max_block_size: usize,
) -> Result<(), TxValidationError> {
    if tx.vin.is_empty() {
        return Err(TxValidationError::EmptyVin);
    }
    if tx.vout.is_empty() {
        return Err(TxValidationError::EmptyVout);
    }
    if tx.encoded_size(&SerialParams::network()) > max_block_size {
        return Err(TxValidationError::Oversized);
    }

    let is_coinbase = tx.is_coinbase();
    let is_coinstake = tx.is_coinstake();
    let mut value_out: i64 = 0;
    for txout in &tx.vout {
        if txout.is_empty() && !is_coinbase && !is_coinstake {
            return Err(TxValidationError::EmptyUserTxOut);
        }
        if txout.value < 0 {
            return Err(TxValidationError::NegativeValue);
        }
        if txout.value > MAX_MONEY {
            return Err(TxValidationError::ValueTooHigh);
        }
        value_out = value_out.saturating_add(txout.value);
        if !money_range(value_out) {
            return Err(TxValidationError::ValueOutOfRange);
        }
    }

    let mut seen = HashSet::new();
    for txin in &tx.vin {
        if !seen.insert(txin.prevout) {
            return Err(TxValidationError::DuplicateInputs);
        }
    }

    if is_coinbase {
        let len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(TxValidationError::BadCoinbaseScriptLen);
        }
    } else {
        for txin in &tx.vin {
            if txin.prevout.is_null() {
                return Err(TxValidationError::NullPrevout);
            }
        }
    }

    Ok(())
}

/// Lock-time finality at a prospective block height and time.
pub fn is_final_tx(tx: &Transaction, block_height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD {
        block_height as i64
    } else {
        block_time
    };
    if (tx.lock_time as i64) < cutoff {
        return true;
    }
    tx.vin.iter().all(|txin| txin.is_final())
}

/// Standardness policy for relay on mainnet.
///
/// `enforce_canonical` additionally requires minimal push encodings on
/// both script sides.
pub fn is_standard_tx(
    tx: &Transaction,
    adjusted_time: i64,
    enforce_canonical: bool,
) -> Result<(), TxValidationError> {
    if tx.version > TX_CURRENT_VERSION {
        return Err(TxValidationError::NonStandard("version"));
    }

    // nTime has a different purpose from nLockTime but can be used in
    // similar attacks
    if tx.time as i64 > adjusted_time + FUTURE_DRIFT {
        return Err(TxValidationError::NonStandard("time-too-new"));
    }

    if tx.encoded_size(&SerialParams::network()) >= MAX_STANDARD_TX_SIZE {
        return Err(TxValidationError::NonStandard("tx-size"));
    }

    for txin in &tx.vin {
        // the biggest standard scriptSig is a 3-of-3 multisig P2SH spend
        if txin.script_sig.len() > 500 {
            return Err(TxValidationError::NonStandard("scriptsig-size"));
        }
        if !txin.script_sig.is_push_only() {
            return Err(TxValidationError::NonStandard("scriptsig-not-pushonly"));
        }
        if enforce_canonical && !txin.script_sig.has_canonical_pushes() {
            return Err(TxValidationError::NonStandard("scriptsig-non-canonical-push"));
        }
    }

    let mut data_outputs = 0usize;
    for txout in &tx.vout {
        let kind = txout.script_pubkey.classify();
        if kind == ScriptType::NonStandard {
            return Err(TxValidationError::NonStandard("scriptpubkey"));
        }
        if kind == ScriptType::NullData {
            data_outputs += 1;
        } else if txout.value == 0 {
            return Err(TxValidationError::NonStandard("dust"));
        }
        if enforce_canonical && !txout.script_pubkey.has_canonical_pushes() {
            return Err(TxValidationError::NonStandard("scriptpubkey-non-canonical-push"));
        }
    }

    if data_outputs > 1 {
        return Err(TxValidationError::NonStandard("multi-op-return"));
    }

    Ok(())
}

/// The fee floor for a transaction of `tx_bytes` serialized bytes.
///
/// `block_size` is the running size of the block template being filled
/// (1 disables the fill scaling, as for plain relay). Any output below
/// one cent raises the floor to the base fee; a template past half full
/// scales the fee toward infinity at the size limit.
pub fn min_fee(
    tx: &Transaction,
    block_size: usize,
    mode: FeeMode,
    tx_bytes: usize,
    max_block_size: usize,
) -> i64 {
    let base_fee = match mode {
        FeeMode::Block => MIN_TX_FEE,
        FeeMode::Relay => MIN_RELAY_TX_FEE,
    };
    let new_block_size = block_size + tx_bytes;
    let mut fee = (1 + tx_bytes as i64 / 1000) * base_fee;

    if fee < base_fee && tx.vout.iter().any(|o| o.value < CENT) {
        fee = base_fee;
    }

    if block_size != 1 && new_block_size >= max_block_size / 2 {
        if new_block_size >= max_block_size {
            return MAX_MONEY;
        }
        fee *= (max_block_size / (max_block_size - new_block_size)) as i64;
    }

    if !money_range(fee) {
        fee = MAX_MONEY;
    }
    fee
}
