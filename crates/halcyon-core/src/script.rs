//! Script machinery: parsing, standard templates, sigop counting, and the
//! signature-verification interpreter.
//!
//! Scripts are opaque byte strings executed by a small stack machine. Only
//! the opcode subset reachable from the standard templates (pay-to-pubkey,
//! pay-to-pubkey-hash, pay-to-script-hash, bare multisig, null-data) is
//! evaluated; anything else fails validation and is rejected as
//! nonstandard upstream.

use std::fmt;
use std::io::{Read, Write};

use ripemd::Ripemd160;
use secp256k1::{Message, PublicKey, Secp256k1, ecdsa::Signature};
use sha2::{Digest, Sha256};

use crate::error::{CodecError, ScriptError};
use crate::hash::Hash256;
use crate::serialize::{Decodable, Encodable, SerialParams, read_var_bytes, write_var_bytes};

// --- Opcodes (the subset this node understands) ---

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_NOP: u8 = 0x61;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Signature hash type covering the whole transaction.
pub const SIGHASH_ALL: u8 = 0x01;

/// Largest data push considered standard.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// A single parsed script operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op<'a> {
    /// A data push (including `OP_0`, which pushes the empty vector).
    Push(&'a [u8]),
    /// A small-number opcode `OP_1..=OP_16` or `OP_1NEGATE`.
    Num(i64),
    /// Any other opcode, by byte.
    Code(u8),
}

/// Standard output script shapes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptType {
    /// `<pubkey> OP_CHECKSIG`
    PubKey,
    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    PubKeyHash,
    /// `OP_HASH160 <20> OP_EQUAL`
    ScriptHash,
    /// `m <pubkeys..> n OP_CHECKMULTISIG`
    Multisig,
    /// `OP_RETURN <data>`, the provably unspendable data carrier.
    NullData,
    NonStandard,
}

/// An opaque script byte string.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Script(pub Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a minimally-encoded data push.
    pub fn push_data(&mut self, data: &[u8]) -> &mut Self {
        match data.len() {
            n if n < OP_PUSHDATA1 as usize => self.0.push(n as u8),
            n if n <= 0xFF => {
                self.0.push(OP_PUSHDATA1);
                self.0.push(n as u8);
            }
            n if n <= 0xFFFF => {
                self.0.push(OP_PUSHDATA2);
                self.0.extend_from_slice(&(n as u16).to_le_bytes());
            }
            n => {
                self.0.push(OP_PUSHDATA4);
                self.0.extend_from_slice(&(n as u32).to_le_bytes());
            }
        }
        self.0.extend_from_slice(data);
        self
    }

    /// Append an integer the way script numbers are pushed: small values
    /// use the dedicated opcodes, others a minimal little-endian push.
    pub fn push_int(&mut self, n: i64) -> &mut Self {
        match n {
            0 => {
                self.0.push(OP_0);
            }
            -1 => {
                self.0.push(OP_1NEGATE);
            }
            1..=16 => {
                self.0.push(OP_1 + (n as u8) - 1);
            }
            _ => {
                let bytes = script_num_encode(n);
                self.push_data(&bytes);
            }
        }
        self
    }

    pub fn push_opcode(&mut self, op: u8) -> &mut Self {
        self.0.push(op);
        self
    }

    /// Iterate over parsed operations.
    pub fn ops(&self) -> OpIter<'_> {
        OpIter { bytes: &self.0, pos: 0 }
    }

    /// True iff the script consists solely of data pushes.
    pub fn is_push_only(&self) -> bool {
        for op in self.ops() {
            match op {
                Ok(Op::Push(_)) | Ok(Op::Num(_)) => {}
                _ => return false,
            }
        }
        true
    }

    /// True iff every push uses its minimal encoding form.
    pub fn has_canonical_pushes(&self) -> bool {
        let mut pos = 0usize;
        while pos < self.0.len() {
            let opcode = self.0[pos];
            match parse_push(&self.0, pos) {
                Some((data, next)) => {
                    let n = data.len();
                    let canonical = match opcode {
                        0x01..=0x4b => true,
                        OP_PUSHDATA1 => n >= OP_PUSHDATA1 as usize,
                        OP_PUSHDATA2 => n > 0xFF,
                        OP_PUSHDATA4 => n > 0xFFFF,
                        _ => true,
                    };
                    if !canonical {
                        return false;
                    }
                    pos = next;
                }
                None if matches!(self.0[pos], 0x01..=0x4e) => return false,
                None => pos += 1,
            }
        }
        true
    }

    /// Classify against the standard templates.
    pub fn classify(&self) -> ScriptType {
        let b = &self.0;
        // pay-to-script-hash has a fixed 23-byte shape
        if self.is_pay_to_script_hash() {
            return ScriptType::ScriptHash;
        }
        // pay-to-pubkey-hash: DUP HASH160 <20> EQUALVERIFY CHECKSIG
        if b.len() == 25
            && b[0] == OP_DUP
            && b[1] == OP_HASH160
            && b[2] == 0x14
            && b[23] == OP_EQUALVERIFY
            && b[24] == OP_CHECKSIG
        {
            return ScriptType::PubKeyHash;
        }
        // pay-to-pubkey: <33|65> CHECKSIG
        if (b.len() == 35 && b[0] == 33 && b[34] == OP_CHECKSIG)
            || (b.len() == 67 && b[0] == 65 && b[66] == OP_CHECKSIG)
        {
            return ScriptType::PubKey;
        }
        // null data: OP_RETURN followed by at most one standard-size push
        if !b.is_empty() && b[0] == OP_RETURN {
            let rest = Script(b[1..].to_vec());
            let pushes: Vec<_> = rest.ops().collect();
            let ok = match pushes.as_slice() {
                [] => true,
                [Ok(Op::Push(data))] => data.len() <= MAX_SCRIPT_ELEMENT_SIZE,
                _ => false,
            };
            return if ok { ScriptType::NullData } else { ScriptType::NonStandard };
        }
        if self.parse_multisig().is_some() {
            return ScriptType::Multisig;
        }
        ScriptType::NonStandard
    }

    pub fn is_pay_to_script_hash(&self) -> bool {
        let b = &self.0;
        b.len() == 23 && b[0] == OP_HASH160 && b[1] == 0x14 && b[22] == OP_EQUAL
    }

    /// `Some((required, pubkeys))` when the script is `m <keys..> n CHECKMULTISIG`.
    fn parse_multisig(&self) -> Option<(usize, Vec<&[u8]>)> {
        let ops: Result<Vec<_>, _> = self.ops().collect();
        let ops = ops.ok()?;
        if ops.len() < 4 || *ops.last()? != Op::Code(OP_CHECKMULTISIG) {
            return None;
        }
        let m = match ops[0] {
            Op::Num(n) if (1..=16).contains(&n) => n as usize,
            _ => return None,
        };
        let n = match ops[ops.len() - 2] {
            Op::Num(k) if (1..=16).contains(&k) => k as usize,
            _ => return None,
        };
        let keys: Vec<&[u8]> = ops[1..ops.len() - 2]
            .iter()
            .filter_map(|op| match op {
                Op::Push(data) if data.len() == 33 || data.len() == 65 => Some(*data),
                _ => None,
            })
            .collect();
        if keys.len() != n || m > n {
            return None;
        }
        Some((m, keys))
    }

    /// Count signature operations.
    ///
    /// With `accurate` set, `OP_CHECKMULTISIG` preceded by a small-number
    /// opcode counts that many; otherwise it counts the worst-case 20.
    pub fn sig_op_count(&self, accurate: bool) -> usize {
        let mut count = 0usize;
        let mut last: Option<Op<'_>> = None;
        for op in self.ops() {
            let Ok(op) = op else { break };
            match op {
                Op::Code(OP_CHECKSIG) | Op::Code(OP_CHECKSIGVERIFY) => count += 1,
                Op::Code(OP_CHECKMULTISIG) | Op::Code(OP_CHECKMULTISIGVERIFY) => {
                    count += match (accurate, &last) {
                        (true, Some(Op::Num(n))) if (1..=16).contains(n) => *n as usize,
                        _ => 20,
                    };
                }
                _ => {}
            }
            last = Some(op);
        }
        count
    }

    /// Sigops contributed by the redeem script of a P2SH spend.
    ///
    /// `script_sig` must be push-only; its final push is the redeem script.
    pub fn p2sh_sig_op_count(&self, script_sig: &Script) -> usize {
        if !self.is_pay_to_script_hash() {
            return 0;
        }
        let mut redeem: Option<Vec<u8>> = None;
        for op in script_sig.ops() {
            match op {
                Ok(Op::Push(data)) => redeem = Some(data.to_vec()),
                Ok(Op::Num(_)) => redeem = Some(Vec::new()),
                _ => return 0,
            }
        }
        redeem.map_or(0, |r| Script(r).sig_op_count(true))
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}

impl Encodable for Script {
    fn encode<W: Write>(&self, w: &mut W, _p: &SerialParams) -> Result<(), CodecError> {
        write_var_bytes(w, &self.0)
    }
}

impl Decodable for Script {
    fn decode<R: Read>(r: &mut R, _p: &SerialParams) -> Result<Self, CodecError> {
        Ok(Script(read_var_bytes(r)?))
    }
}

/// Iterator over a script's parsed operations.
pub struct OpIter<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for OpIter<'a> {
    type Item = Result<Op<'a>, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let opcode = self.bytes[self.pos];
        match opcode {
            OP_0 => {
                self.pos += 1;
                Some(Ok(Op::Push(&[])))
            }
            0x01..=0x4e => match parse_push(self.bytes, self.pos) {
                Some((data, next)) => {
                    self.pos = next;
                    Some(Ok(Op::Push(data)))
                }
                None => {
                    self.pos = self.bytes.len();
                    Some(Err(ScriptError::TruncatedPush))
                }
            },
            OP_1NEGATE => {
                self.pos += 1;
                Some(Ok(Op::Num(-1)))
            }
            OP_1..=OP_16 => {
                self.pos += 1;
                Some(Ok(Op::Num((opcode - OP_1 + 1) as i64)))
            }
            other => {
                self.pos += 1;
                Some(Ok(Op::Code(other)))
            }
        }
    }
}

/// Decode a push starting at `pos`; returns the payload and next offset.
fn parse_push(bytes: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let opcode = bytes[pos];
    let (len, data_start) = match opcode {
        n @ 0x01..=0x4b => (n as usize, pos + 1),
        OP_PUSHDATA1 => (*bytes.get(pos + 1)? as usize, pos + 2),
        OP_PUSHDATA2 => {
            let raw = bytes.get(pos + 1..pos + 3)?;
            (u16::from_le_bytes([raw[0], raw[1]]) as usize, pos + 3)
        }
        OP_PUSHDATA4 => {
            let raw = bytes.get(pos + 1..pos + 5)?;
            (u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize, pos + 5)
        }
        _ => return None,
    };
    let data = bytes.get(data_start..data_start + len)?;
    Some((data, data_start + len))
}

/// Minimal script-number encoding: little-endian magnitude with sign bit.
fn script_num_encode(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let mut result = Vec::new();
    let neg = n < 0;
    let mut abs = n.unsigned_abs();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if result.last().is_some_and(|b| b & 0x80 != 0) {
        result.push(if neg { 0x80 } else { 0x00 });
    } else if neg {
        let last = result.last_mut().expect("nonzero value has bytes");
        *last |= 0x80;
    }
    result
}

/// RIPEMD160(SHA256(data)), the address form of keys and scripts.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

// --- Interpreter ---

/// A context able to produce the signature digest for one input.
///
/// Implemented by `Transaction` in `types`; kept as a trait so the
/// interpreter has no circular dependency on the data model.
pub trait SignatureHasher {
    /// Classic one-input signature digest over the transaction with
    /// `script_code` substituted at `input_index`, plus the hash type.
    fn signature_hash(&self, input_index: usize, script_code: &Script, hash_type: u8) -> Hash256;
}

/// Verify that `script_sig` satisfies `script_pubkey` for one input.
///
/// Strict pay-to-script-hash is always enforced when the output script
/// has the P2SH shape: the final push of `script_sig` is re-evaluated as
/// the redeem script against the remaining stack.
pub fn verify_script<H: SignatureHasher>(
    script_sig: &Script,
    script_pubkey: &Script,
    tx: &H,
    input_index: usize,
) -> Result<(), ScriptError> {
    if !script_sig.is_push_only() {
        return Err(ScriptError::NotPushOnly);
    }

    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval(script_sig, &mut stack, tx, input_index, script_sig)?;
    let stack_after_sig = stack.clone();

    eval(script_pubkey, &mut stack, tx, input_index, script_pubkey)?;
    if !truthy(stack.last().ok_or(ScriptError::StackUnderflow)?) {
        return Err(ScriptError::EvalFalse);
    }

    if script_pubkey.is_pay_to_script_hash() {
        let mut stack = stack_after_sig;
        let redeem_bytes = stack.pop().ok_or(ScriptError::BadRedeemScript)?;
        let redeem = Script(redeem_bytes);
        eval(&redeem, &mut stack, tx, input_index, &redeem)?;
        if !truthy(stack.last().ok_or(ScriptError::StackUnderflow)?) {
            return Err(ScriptError::EvalFalse);
        }
    }
    Ok(())
}

fn truthy(item: &[u8]) -> bool {
    item.iter().enumerate().any(|(i, b)| {
        // negative zero is false
        *b != 0 && !(i == item.len() - 1 && *b == 0x80)
    })
}

fn eval<H: SignatureHasher>(
    script: &Script,
    stack: &mut Vec<Vec<u8>>,
    tx: &H,
    input_index: usize,
    script_code: &Script,
) -> Result<(), ScriptError> {
    for op in script.ops() {
        match op? {
            Op::Push(data) => stack.push(data.to_vec()),
            Op::Num(n) => stack.push(script_num_encode(n)),
            Op::Code(OP_NOP) => {}
            Op::Code(OP_DUP) => {
                let top = stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                stack.push(top);
            }
            Op::Code(OP_HASH160) => {
                let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                stack.push(hash160(&top).to_vec());
            }
            Op::Code(op @ (OP_EQUAL | OP_EQUALVERIFY)) => {
                let b = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                let a = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                let eq = a == b;
                if op == OP_EQUALVERIFY {
                    if !eq {
                        return Err(ScriptError::VerifyFailed);
                    }
                } else {
                    stack.push(vec![eq as u8]);
                }
            }
            Op::Code(op @ (OP_CHECKSIG | OP_CHECKSIGVERIFY)) => {
                let pubkey = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                let sig = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                let ok = check_sig(&sig, &pubkey, tx, input_index, script_code);
                if op == OP_CHECKSIGVERIFY {
                    if !ok {
                        return Err(ScriptError::VerifyFailed);
                    }
                } else {
                    stack.push(vec![ok as u8]);
                }
            }
            Op::Code(ms_op @ (OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY)) => {
                let n = pop_small_int(stack)?;
                let mut keys = Vec::with_capacity(n);
                for _ in 0..n {
                    keys.push(stack.pop().ok_or(ScriptError::StackUnderflow)?);
                }
                let m = pop_small_int(stack)?;
                let mut sigs = Vec::with_capacity(m);
                for _ in 0..m {
                    sigs.push(stack.pop().ok_or(ScriptError::StackUnderflow)?);
                }
                // historical off-by-one: an extra element is consumed
                stack.pop().ok_or(ScriptError::StackUnderflow)?;

                let mut ok = true;
                let mut key_idx = 0usize;
                for sig in sigs.iter().rev() {
                    let mut matched = false;
                    while key_idx < keys.len() {
                        let key = &keys[keys.len() - 1 - key_idx];
                        key_idx += 1;
                        if check_sig(sig, key, tx, input_index, script_code) {
                            matched = true;
                            break;
                        }
                    }
                    if !matched {
                        ok = false;
                        break;
                    }
                }
                if ms_op == OP_CHECKMULTISIGVERIFY {
                    if !ok {
                        return Err(ScriptError::VerifyFailed);
                    }
                } else {
                    stack.push(vec![ok as u8]);
                }
            }
            Op::Code(OP_RETURN) => return Err(ScriptError::EvalFalse),
            Op::Code(other) => return Err(ScriptError::UnknownOpcode(other)),
        }
    }
    Ok(())
}

fn pop_small_int(stack: &mut Vec<Vec<u8>>) -> Result<usize, ScriptError> {
    let raw = stack.pop().ok_or(ScriptError::StackUnderflow)?;
    match raw.as_slice() {
        [] => Ok(0),
        [n] if *n <= 16 => Ok(*n as usize),
        _ => Err(ScriptError::StackUnderflow),
    }
}

/// Check one ECDSA signature (DER || hash-type byte) against a pubkey.
fn check_sig<H: SignatureHasher>(
    sig_with_type: &[u8],
    pubkey: &[u8],
    tx: &H,
    input_index: usize,
    script_code: &Script,
) -> bool {
    let Some((&hash_type, der)) = sig_with_type.split_last() else {
        return false;
    };
    if hash_type != SIGHASH_ALL {
        return false;
    }
    let Ok(signature) = Signature::from_der(der) else {
        return false;
    };
    let Ok(key) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let digest = tx.signature_hash(input_index, script_code, hash_type);
    let message = Message::from_digest(digest.0);
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&message, &signature, &key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHasher;

    impl SignatureHasher for NullHasher {
        fn signature_hash(&self, _i: usize, _s: &Script, _t: u8) -> Hash256 {
            Hash256::ZERO
        }
    }

    fn p2pkh(hash: [u8; 20]) -> Script {
        let mut s = Script::new();
        s.push_opcode(OP_DUP).push_opcode(OP_HASH160);
        s.push_data(&hash);
        s.push_opcode(OP_EQUALVERIFY).push_opcode(OP_CHECKSIG);
        s.clone()
    }

    // ------------------------------------------------------------------
    // Push encoding
    // ------------------------------------------------------------------

    #[test]
    fn push_small_data_direct() {
        let mut s = Script::new();
        s.push_data(&[0xAA, 0xBB]);
        assert_eq!(s.as_bytes(), &[0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn push_uses_pushdata1_at_76() {
        let mut s = Script::new();
        s.push_data(&[0u8; 76]);
        assert_eq!(s.as_bytes()[0], OP_PUSHDATA1);
        assert_eq!(s.as_bytes()[1], 76);
    }

    #[test]
    fn push_uses_pushdata2_above_255() {
        let mut s = Script::new();
        s.push_data(&[0u8; 300]);
        assert_eq!(s.as_bytes()[0], OP_PUSHDATA2);
    }

    #[test]
    fn push_int_forms() {
        let mut s = Script::new();
        s.push_int(0).push_int(5).push_int(42);
        assert_eq!(s.as_bytes(), &[OP_0, OP_1 + 4, 0x01, 0x2a]);
    }

    #[test]
    fn ops_round_trip_pushes() {
        let mut s = Script::new();
        s.push_data(&[1, 2, 3]);
        s.push_int(7);
        let ops: Vec<_> = s.ops().map(Result::unwrap).collect();
        assert_eq!(ops, vec![Op::Push(&[1, 2, 3]), Op::Num(7)]);
    }

    #[test]
    fn truncated_push_is_error() {
        let s = Script(vec![0x05, 0x01]); // declares 5 bytes, has 1
        assert!(s.ops().any(|op| op == Err(ScriptError::TruncatedPush)));
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    #[test]
    fn push_only_detection() {
        let mut s = Script::new();
        s.push_data(&[1]).push_int(3);
        assert!(s.is_push_only());

        s.push_opcode(OP_DUP);
        assert!(!s.is_push_only());
    }

    #[test]
    fn canonical_pushes_accept_minimal() {
        let mut s = Script::new();
        s.push_data(&[9; 10]);
        s.push_data(&[9; 100]);
        assert!(s.has_canonical_pushes());
    }

    #[test]
    fn canonical_pushes_reject_padded() {
        // 2 bytes carried by PUSHDATA1 is non-minimal
        let s = Script(vec![OP_PUSHDATA1, 0x02, 0xAA, 0xBB]);
        assert!(!s.has_canonical_pushes());
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    #[test]
    fn classify_p2pkh() {
        assert_eq!(p2pkh([0x11; 20]).classify(), ScriptType::PubKeyHash);
    }

    #[test]
    fn classify_p2sh() {
        let mut s = Script::new();
        s.push_opcode(OP_HASH160);
        s.push_data(&[0x22; 20]);
        s.push_opcode(OP_EQUAL);
        assert!(s.is_pay_to_script_hash());
        assert_eq!(s.classify(), ScriptType::ScriptHash);
    }

    #[test]
    fn classify_p2pk() {
        let mut s = Script::new();
        s.push_data(&[0x02; 33]);
        s.push_opcode(OP_CHECKSIG);
        assert_eq!(s.classify(), ScriptType::PubKey);
    }

    #[test]
    fn classify_null_data() {
        let mut s = Script::new();
        s.push_opcode(OP_RETURN);
        s.push_data(b"token marker payload");
        assert_eq!(s.classify(), ScriptType::NullData);
    }

    #[test]
    fn classify_bare_op_return() {
        let mut s = Script::new();
        s.push_opcode(OP_RETURN);
        assert_eq!(s.classify(), ScriptType::NullData);
    }

    #[test]
    fn classify_multisig() {
        let mut s = Script::new();
        s.push_int(1);
        s.push_data(&[0x02; 33]);
        s.push_data(&[0x03; 33]);
        s.push_int(2);
        s.push_opcode(OP_CHECKMULTISIG);
        assert_eq!(s.classify(), ScriptType::Multisig);
    }

    #[test]
    fn classify_garbage() {
        assert_eq!(Script(vec![0xFE, 0x01]).classify(), ScriptType::NonStandard);
    }

    // ------------------------------------------------------------------
    // Sigop counting
    // ------------------------------------------------------------------

    #[test]
    fn sigops_single_checksig() {
        assert_eq!(p2pkh([0; 20]).sig_op_count(false), 1);
    }

    #[test]
    fn sigops_multisig_legacy_counts_twenty() {
        let mut s = Script::new();
        s.push_int(1);
        s.push_data(&[0x02; 33]);
        s.push_int(1);
        s.push_opcode(OP_CHECKMULTISIG);
        assert_eq!(s.sig_op_count(false), 20);
        assert_eq!(s.sig_op_count(true), 1);
    }

    #[test]
    fn p2sh_sigops_from_redeem_script() {
        let mut redeem = Script::new();
        redeem.push_int(2);
        redeem.push_data(&[0x02; 33]);
        redeem.push_data(&[0x03; 33]);
        redeem.push_int(2);
        redeem.push_opcode(OP_CHECKMULTISIG);

        let mut outer = Script::new();
        outer.push_opcode(OP_HASH160);
        outer.push_data(&hash160(redeem.as_bytes()));
        outer.push_opcode(OP_EQUAL);

        let mut sig = Script::new();
        sig.push_data(&[0u8; 70]);
        sig.push_data(redeem.as_bytes());

        assert_eq!(outer.p2sh_sig_op_count(&sig), 2);
    }

    // ------------------------------------------------------------------
    // Interpreter basics (no real signatures)
    // ------------------------------------------------------------------

    #[test]
    fn p2sh_hash_mismatch_fails() {
        let mut outer = Script::new();
        outer.push_opcode(OP_HASH160);
        outer.push_data(&[0x99; 20]); // wrong hash
        outer.push_opcode(OP_EQUAL);

        let mut redeem = Script::new();
        redeem.push_int(1);

        let mut sig = Script::new();
        sig.push_data(redeem.as_bytes());

        assert_eq!(
            verify_script(&sig, &outer, &NullHasher, 0),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn p2sh_matching_redeem_succeeds() {
        let mut redeem = Script::new();
        redeem.push_int(1); // trivially true redeem script

        let mut outer = Script::new();
        outer.push_opcode(OP_HASH160);
        outer.push_data(&hash160(redeem.as_bytes()));
        outer.push_opcode(OP_EQUAL);

        let mut sig = Script::new();
        sig.push_data(redeem.as_bytes());

        assert_eq!(verify_script(&sig, &outer, &NullHasher, 0), Ok(()));
    }

    #[test]
    fn non_push_scriptsig_rejected() {
        let mut sig = Script::new();
        sig.push_opcode(OP_DUP);
        let out = Script::new();
        assert_eq!(
            verify_script(&sig, &out, &NullHasher, 0),
            Err(ScriptError::NotPushOnly)
        );
    }

    #[test]
    fn bad_signature_evaluates_false() {
        let mut out = Script::new();
        out.push_data(&[0x02; 33]);
        out.push_opcode(OP_CHECKSIG);

        let mut sig = Script::new();
        sig.push_data(&[0xde, 0xad, SIGHASH_ALL]);

        assert_eq!(
            verify_script(&sig, &out, &NullHasher, 0),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn hash160_known_shape() {
        assert_eq!(hash160(&[]).len(), 20);
        assert_ne!(hash160(b"a"), hash160(b"b"));
    }
}
