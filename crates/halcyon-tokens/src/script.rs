//! Token marker parsing.
//!
//! A token transaction carries exactly one `OP_RETURN` output whose push
//! payload starts with the marker header `"NT" 0x01` (protocol 1),
//! followed by a type tag and the type-specific body:
//!
//! ```text
//! issuance: 0x01 | sym_len | symbol | amount u64 LE | flags | instructions
//! transfer: 0x0a | instructions
//! burn:     0x14 | instructions
//! instructions: count u8, then per entry: output_index u8 | amount u64 LE
//! ```
//!
//! Symbols are 1–5 characters from `A–Z0–9` and compared
//! case-insensitively. An issuance's token id is derived from the first
//! input's outpoint, which makes it unforgeable without owning that
//! output.

use halcyon_core::hash::hash256;
use halcyon_core::script::{OP_RETURN, Op, Script, ScriptType};
use halcyon_core::serialize::{Encodable, SerialParams};
use halcyon_core::types::{OutPoint, Transaction};

use crate::error::TokenError;

/// Marker header: "NT" plus protocol version 1.
pub const TOKEN_MARKER: [u8; 3] = [0x4e, 0x54, 0x01];

/// Type tag for an issuance.
const TYPE_ISSUANCE: u8 = 0x01;
/// Type tag for a transfer.
const TYPE_TRANSFER: u8 = 0x0a;
/// Type tag for a burn.
const TYPE_BURN: u8 = 0x14;

/// Output index that burns the carried amount instead of assigning it.
pub const BURN_OUTPUT_INDEX: u8 = 0x1f;

/// Longest permitted token symbol.
pub const MAX_SYMBOL_LEN: usize = 5;

/// One amount-routing entry of a marker script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferInstruction {
    /// Target output of the carrying transaction;
    /// [`BURN_OUTPUT_INDEX`] destroys the amount (burn scripts only).
    pub output_index: u8,
    pub amount: u64,
}

/// A parsed token marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenScript {
    Issuance {
        symbol: String,
        amount: u64,
        /// A locked token can never be issued again.
        locked: bool,
        instructions: Vec<TransferInstruction>,
    },
    Transfer {
        instructions: Vec<TransferInstruction>,
    },
    Burn {
        instructions: Vec<TransferInstruction>,
    },
}

impl TokenScript {
    pub fn issuance_symbol(&self) -> Option<&str> {
        match self {
            TokenScript::Issuance { symbol, .. } => Some(symbol),
            _ => None,
        }
    }

    pub fn instructions(&self) -> &[TransferInstruction] {
        match self {
            TokenScript::Issuance { instructions, .. }
            | TokenScript::Transfer { instructions }
            | TokenScript::Burn { instructions } => instructions,
        }
    }

    /// Whether burn instructions are legal for this script type.
    pub fn allows_burn(&self) -> bool {
        matches!(self, TokenScript::Burn { .. })
    }

    /// Serialize back to the marker payload form.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = TOKEN_MARKER.to_vec();
        match self {
            TokenScript::Issuance { symbol, amount, locked, instructions } => {
                out.push(TYPE_ISSUANCE);
                out.push(symbol.len() as u8);
                out.extend_from_slice(symbol.as_bytes());
                out.extend_from_slice(&amount.to_le_bytes());
                out.push(*locked as u8);
                push_instructions(&mut out, instructions);
            }
            TokenScript::Transfer { instructions } => {
                out.push(TYPE_TRANSFER);
                push_instructions(&mut out, instructions);
            }
            TokenScript::Burn { instructions } => {
                out.push(TYPE_BURN);
                push_instructions(&mut out, instructions);
            }
        }
        out
    }

    /// Wrap the payload into a full `OP_RETURN` output script.
    pub fn to_script(&self) -> Script {
        let mut script = Script::new();
        script.push_opcode(OP_RETURN);
        script.push_data(&self.to_payload());
        script
    }
}

fn push_instructions(out: &mut Vec<u8>, instructions: &[TransferInstruction]) {
    out.push(instructions.len() as u8);
    for instruction in instructions {
        out.push(instruction.output_index);
        out.extend_from_slice(&instruction.amount.to_le_bytes());
    }
}

/// A valid symbol is 1–5 characters of `A–Z0–9` (either case on input).
pub fn validate_symbol(symbol: &str) -> Result<(), TokenError> {
    let ok = !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol.chars().all(|c| c.is_ascii_alphanumeric());
    if ok {
        Ok(())
    } else {
        Err(TokenError::InvalidSymbol(symbol.to_string()))
    }
}

/// Derive the token id of an issuance from its first input's outpoint.
pub fn token_id_for_issuance(prevout: &OutPoint) -> String {
    let bytes = prevout.encode_to_vec(&SerialParams::gethash());
    hash256(&bytes).to_string()
}

/// Extract the marker payload from an output script, if it carries one.
pub fn marker_payload(script: &Script) -> Option<Vec<u8>> {
    if script.classify() != ScriptType::NullData {
        return None;
    }
    let mut ops = script.ops();
    match (ops.next(), ops.next(), ops.next()) {
        (Some(Ok(Op::Code(OP_RETURN))), Some(Ok(Op::Push(data))), None)
            if data.starts_with(&TOKEN_MARKER) =>
        {
            Some(data.to_vec())
        }
        _ => None,
    }
}

/// Find the single marker payload of a transaction.
///
/// `Ok(None)` when the transaction carries no marker; an error when more
/// than one output carries one.
pub fn tx_marker_payload(tx: &Transaction) -> Result<Option<Vec<u8>>, TokenError> {
    let mut found = None;
    for txout in &tx.vout {
        if let Some(payload) = marker_payload(&txout.script_pubkey) {
            if found.is_some() {
                return Err(TokenError::MultipleMarkers);
            }
            found = Some(payload);
        }
    }
    Ok(found)
}

/// Whether a transaction carries a token marker at all.
pub fn is_token_tx(tx: &Transaction) -> bool {
    matches!(tx_marker_payload(tx), Ok(Some(_)))
}

/// Parse a marker payload into a [`TokenScript`].
pub fn parse_payload(payload: &[u8]) -> Result<TokenScript, TokenError> {
    if !payload.starts_with(&TOKEN_MARKER) {
        return Err(TokenError::NotTokenScript);
    }
    let mut cursor = &payload[TOKEN_MARKER.len()..];
    let type_tag = take_u8(&mut cursor)?;
    match type_tag {
        TYPE_ISSUANCE => {
            let sym_len = take_u8(&mut cursor)? as usize;
            if sym_len == 0 || sym_len > MAX_SYMBOL_LEN {
                return Err(TokenError::InvalidSymbol(format!("<len {sym_len}>")));
            }
            let raw = take_bytes(&mut cursor, sym_len)?;
            let symbol = String::from_utf8(raw.to_vec())
                .map_err(|_| TokenError::InvalidSymbol(hex::encode(raw)))?;
            validate_symbol(&symbol)?;
            let amount = take_u64(&mut cursor)?;
            if amount == 0 {
                return Err(TokenError::ZeroAmount);
            }
            let locked = take_u8(&mut cursor)? != 0;
            let instructions = take_instructions(&mut cursor)?;
            Ok(TokenScript::Issuance { symbol: symbol.to_ascii_uppercase(), amount, locked, instructions })
        }
        TYPE_TRANSFER => Ok(TokenScript::Transfer { instructions: take_instructions(&mut cursor)? }),
        TYPE_BURN => Ok(TokenScript::Burn { instructions: take_instructions(&mut cursor)? }),
        other => Err(TokenError::UnknownType(other)),
    }
}

/// Parse the marker of a whole transaction.
pub fn parse_tx(tx: &Transaction) -> Result<Option<TokenScript>, TokenError> {
    match tx_marker_payload(tx)? {
        Some(payload) => Ok(Some(parse_payload(&payload)?)),
        None => Ok(None),
    }
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8, TokenError> {
    let (&first, rest) = cursor.split_first().ok_or(TokenError::Truncated)?;
    *cursor = rest;
    Ok(first)
}

fn take_bytes<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8], TokenError> {
    if cursor.len() < n {
        return Err(TokenError::Truncated);
    }
    let (taken, rest) = cursor.split_at(n);
    *cursor = rest;
    Ok(taken)
}

fn take_u64(cursor: &mut &[u8]) -> Result<u64, TokenError> {
    let raw = take_bytes(cursor, 8)?;
    Ok(u64::from_le_bytes(raw.try_into().expect("slice of 8")))
}

fn take_instructions(cursor: &mut &[u8]) -> Result<Vec<TransferInstruction>, TokenError> {
    let count = take_u8(cursor)? as usize;
    let mut instructions = Vec::with_capacity(count);
    for _ in 0..count {
        let output_index = take_u8(cursor)?;
        let amount = take_u64(cursor)?;
        if amount == 0 {
            return Err(TokenError::ZeroAmount);
        }
        instructions.push(TransferInstruction { output_index, amount });
    }
    Ok(instructions)
}
