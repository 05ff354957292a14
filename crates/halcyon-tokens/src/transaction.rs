//! Resolved token transactions.
//!
//! A [`TokenTransaction`] is the overlay view of one ordinary transaction:
//! which token amounts each input carried in, and which amounts each
//! output carries onward. Resolution walks the marker's routing
//! instructions against the inputs' token contents; amounts never appear
//! or vanish except through an issuance or an explicit burn. Unrouted
//! leftovers flow to the last non-marker output as change.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::{Read, Write};

use halcyon_core::error::CodecError;
use halcyon_core::hash::Hash256;
use halcyon_core::serialize::{
    Decodable, Encodable, SerialParams, read_var_bytes, write_var_bytes,
};
use halcyon_core::types::{OutPoint, Transaction};

use crate::error::TokenError;
use crate::script::{
    BURN_OUTPUT_INDEX, TokenScript, marker_payload, parse_tx, token_id_for_issuance,
};

/// The three overlay operation kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenTxType {
    Issuance,
    Transfer,
    Burn,
}

/// An amount of one token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenAmount {
    /// Token id: the digest of the issuing transaction's first outpoint.
    pub token_id: String,
    pub amount: u64,
}

/// Metadata of a token created by an issuance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuanceInfo {
    pub token_id: String,
    /// Symbol in canonical (uppercase) form.
    pub symbol: String,
    pub amount: u64,
    /// Locked tokens can never be issued again.
    pub locked: bool,
}

/// The fully resolved overlay view of one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenTransaction {
    pub tx_hash: Hash256,
    pub tx_type: TokenTxType,
    pub issuance: Option<IssuanceInfo>,
    /// Token amounts carried by each input, parallel to `vin`.
    pub inputs: Vec<Vec<TokenAmount>>,
    /// Token amounts assigned to each output, parallel to `vout`.
    pub outputs: Vec<Vec<TokenAmount>>,
}

impl TokenTransaction {
    /// The issued symbol, when this transaction is an issuance.
    pub fn symbol_if_issuance(&self) -> Option<&str> {
        self.issuance.as_ref().map(|i| i.symbol.as_str())
    }

    /// Token amounts sitting on output `n`.
    pub fn tokens_of_output(&self, n: u32) -> &[TokenAmount] {
        self.outputs
            .get(n as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolve a transaction's overlay effect.
    ///
    /// `input_tokens` maps every prevout of `tx` to the token amounts that
    /// output carries (empty for plain coins). Returns `Ok(None)` for a
    /// transaction without a marker.
    pub fn from_tx(
        tx: &Transaction,
        input_tokens: &HashMap<OutPoint, Vec<TokenAmount>>,
    ) -> Result<Option<TokenTransaction>, TokenError> {
        let Some(script) = parse_tx(tx)? else {
            return Ok(None);
        };
        if tx.vin.is_empty() {
            return Err(TokenError::NoInputs);
        }

        let mut inputs = Vec::with_capacity(tx.vin.len());
        for txin in &tx.vin {
            let carried = input_tokens
                .get(&txin.prevout)
                .ok_or_else(|| TokenError::MissingInputTokenData(txin.prevout.to_string()))?;
            inputs.push(carried.clone());
        }

        // amounts available for routing, consumed front to back: the
        // freshly issued tokens (if any) followed by the inputs in order
        let mut available: VecDeque<TokenAmount> = VecDeque::new();
        let (tx_type, issuance) = match &script {
            TokenScript::Issuance { symbol, amount, locked, .. } => {
                let token_id = token_id_for_issuance(&tx.vin[0].prevout);
                available.push_back(TokenAmount { token_id: token_id.clone(), amount: *amount });
                (
                    TokenTxType::Issuance,
                    Some(IssuanceInfo {
                        token_id,
                        symbol: symbol.clone(),
                        amount: *amount,
                        locked: *locked,
                    }),
                )
            }
            TokenScript::Transfer { .. } => (TokenTxType::Transfer, None),
            TokenScript::Burn { .. } => (TokenTxType::Burn, None),
        };
        for carried in &inputs {
            for token in carried {
                available.push_back(token.clone());
            }
        }

        let mut outputs: Vec<Vec<TokenAmount>> = vec![Vec::new(); tx.vout.len()];
        for instruction in script.instructions() {
            let taken = take_front(&mut available, instruction.amount)?;
            if instruction.output_index == BURN_OUTPUT_INDEX {
                if !script.allows_burn() {
                    return Err(TokenError::OutputIndexOutOfRange(BURN_OUTPUT_INDEX));
                }
                continue; // burned
            }
            let index = instruction.output_index as usize;
            if index >= tx.vout.len() {
                return Err(TokenError::OutputIndexOutOfRange(instruction.output_index));
            }
            merge_amount(&mut outputs[index], taken);
        }

        // change: whatever was not routed lands on the last non-marker output
        if !available.is_empty() {
            let change_index = tx
                .vout
                .iter()
                .rposition(|o| marker_payload(&o.script_pubkey).is_none())
                .ok_or(TokenError::NoChangeOutput)?;
            for token in available.drain(..) {
                merge_amount(&mut outputs[change_index], token);
            }
        }

        Ok(Some(TokenTransaction {
            tx_hash: tx.hash(),
            tx_type,
            issuance,
            inputs,
            outputs,
        }))
    }
}

/// Take exactly `amount` from the front token of the queue.
///
/// An instruction never crosses a token boundary; asking for more than
/// the front entry holds is a resolution failure.
fn take_front(
    available: &mut VecDeque<TokenAmount>,
    amount: u64,
) -> Result<TokenAmount, TokenError> {
    let front = available
        .front_mut()
        .ok_or(TokenError::InsufficientTokenInputs { available: 0, wanted: amount })?;
    if front.amount < amount {
        return Err(TokenError::InsufficientTokenInputs {
            available: front.amount,
            wanted: amount,
        });
    }
    let token_id = front.token_id.clone();
    front.amount -= amount;
    if front.amount == 0 {
        available.pop_front();
    }
    Ok(TokenAmount { token_id, amount })
}

/// Merge an amount into a per-output list, combining same-token entries.
fn merge_amount(list: &mut Vec<TokenAmount>, token: TokenAmount) {
    if let Some(existing) = list.iter_mut().find(|t| t.token_id == token.token_id) {
        existing.amount += token.amount;
    } else {
        list.push(token);
    }
}

/// The symbol a transaction issues, if its marker is an issuance.
pub fn token_symbol_if_issuance(tx: &Transaction) -> Option<String> {
    parse_tx(tx)
        .ok()
        .flatten()
        .and_then(|script| script.issuance_symbol().map(str::to_string))
}

// --- Storage codec ---

impl Encodable for TokenAmount {
    fn encode<W: Write>(&self, w: &mut W, _p: &SerialParams) -> Result<(), CodecError> {
        write_var_bytes(w, self.token_id.as_bytes())?;
        w.write_all(&self.amount.to_le_bytes())?;
        Ok(())
    }
}

impl Decodable for TokenAmount {
    fn decode<R: Read>(r: &mut R, _p: &SerialParams) -> Result<Self, CodecError> {
        let token_id = String::from_utf8(read_var_bytes(r)?).map_err(|_| CodecError::InvalidTag(0))?;
        let mut raw = [0u8; 8];
        r.read_exact(&mut raw)?;
        Ok(Self { token_id, amount: u64::from_le_bytes(raw) })
    }
}

impl Encodable for TokenTransaction {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.tx_hash.encode(w, p)?;
        let tag: u8 = match self.tx_type {
            TokenTxType::Issuance => 0,
            TokenTxType::Transfer => 1,
            TokenTxType::Burn => 2,
        };
        tag.encode(w, p)?;
        match &self.issuance {
            Some(info) => {
                true.encode(w, p)?;
                write_var_bytes(w, info.token_id.as_bytes())?;
                write_var_bytes(w, info.symbol.as_bytes())?;
                info.amount.encode(w, p)?;
                info.locked.encode(w, p)?;
            }
            None => false.encode(w, p)?,
        }
        self.inputs.encode(w, p)?;
        self.outputs.encode(w, p)
    }
}

impl Decodable for TokenTransaction {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        let tx_hash = Hash256::decode(r, p)?;
        let tx_type = match u8::decode(r, p)? {
            0 => TokenTxType::Issuance,
            1 => TokenTxType::Transfer,
            2 => TokenTxType::Burn,
            other => return Err(CodecError::InvalidTag(other)),
        };
        let issuance = if bool::decode(r, p)? {
            let token_id =
                String::from_utf8(read_var_bytes(r)?).map_err(|_| CodecError::InvalidTag(0))?;
            let symbol =
                String::from_utf8(read_var_bytes(r)?).map_err(|_| CodecError::InvalidTag(0))?;
            let amount = u64::decode(r, p)?;
            let locked = bool::decode(r, p)?;
            Some(IssuanceInfo { token_id, symbol, amount, locked })
        } else {
            None
        };
        Ok(Self {
            tx_hash,
            tx_type,
            issuance,
            inputs: Vec::decode(r, p)?,
            outputs: Vec::decode(r, p)?,
        })
    }
}
