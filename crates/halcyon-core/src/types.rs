//! Core data model: transactions, blocks, indices, and wire addresses.
//!
//! Serialization layouts here are consensus-critical and byte-exact; every
//! struct documents its layout next to its codec impl. Two different hashes
//! are in play: [`Transaction::hash`] is double SHA-256 of the canonical
//! bytes, while [`Block::hash`] is the scrypt header digest.

use std::fmt;
use std::io::{Read, Write};

use crate::error::CodecError;
use crate::hash::{Hash256, scrypt_block_hash};
use crate::script::{Script, SignatureHasher};
use crate::serialize::{
    Decodable, Encodable, SER_BLOCKHEADER_ONLY, SER_GETHASH, SerialParams, read_var_bytes,
    serialize_hash, write_var_bytes,
};

/// Transaction format version this node produces.
pub const TX_CURRENT_VERSION: i32 = 1;

/// Block format version this node produces.
pub const BLOCK_CURRENT_VERSION: i32 = 6;

/// Reference to an output of a previous transaction.
///
/// Layout: `hash (32) || n (u32 LE)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub hash: Hash256,
    pub n: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, n: u32) -> Self {
        Self { hash, n }
    }

    /// The null outpoint marking coinbase inputs.
    pub fn null() -> Self {
        Self { hash: Hash256::ZERO, n: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.hash.is_zero() && self.n == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.n)
    }
}

impl Encodable for OutPoint {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.hash.encode(w, p)?;
        self.n.encode(w, p)
    }
}

impl Decodable for OutPoint {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        Ok(Self { hash: Hash256::decode(r, p)?, n: u32::decode(r, p)? })
    }
}

/// A transaction input.
///
/// Layout: `prevout || varstr(script_sig) || sequence (u32 LE)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint) -> Self {
        Self { prevout, script_sig: Script::new(), sequence: u32::MAX }
    }

    /// An input is final when its sequence is saturated.
    pub fn is_final(&self) -> bool {
        self.sequence == u32::MAX
    }
}

impl Encodable for TxIn {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.prevout.encode(w, p)?;
        self.script_sig.encode(w, p)?;
        self.sequence.encode(w, p)
    }
}

impl Decodable for TxIn {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        Ok(Self {
            prevout: OutPoint::decode(r, p)?,
            script_sig: Script::decode(r, p)?,
            sequence: u32::decode(r, p)?,
        })
    }
}

/// A transaction output.
///
/// Layout: `value (i64 LE) || varstr(script_pubkey)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: i64, script_pubkey: Script) -> Self {
        Self { value, script_pubkey }
    }

    /// The empty output that marks the head of a coinstake.
    pub fn empty() -> Self {
        Self { value: 0, script_pubkey: Script::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encodable for TxOut {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.value.encode(w, p)?;
        self.script_pubkey.encode(w, p)
    }
}

impl Decodable for TxOut {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        Ok(Self { value: i64::decode(r, p)?, script_pubkey: Script::decode(r, p)? })
    }
}

/// A transaction.
///
/// Layout: `version (i32) || time (u32) || varvec(vin) || varvec(vout) ||
/// lock_time (u32)`. The hash of these canonical bytes identifies the
/// transaction everywhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Self { version: TX_CURRENT_VERSION, time: 0, vin: Vec::new(), vout: Vec::new(), lock_time: 0 }
    }
}

impl Transaction {
    /// Double SHA-256 of the canonical serialization.
    pub fn hash(&self) -> Hash256 {
        serialize_hash(self)
    }

    /// Coinbase: a single null-prevout input and at least one output.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null() && !self.vout.is_empty()
    }

    /// Coinstake: non-null first input, at least two outputs, and an empty
    /// first output.
    pub fn is_coinstake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
    }

    /// Sum of output values. Callers bound-check via `check_transaction`.
    pub fn value_out(&self) -> i64 {
        self.vout.iter().map(|o| o.value).sum()
    }
}

impl Encodable for Transaction {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.version.encode(w, p)?;
        self.time.encode(w, p)?;
        self.vin.encode(w, p)?;
        self.vout.encode(w, p)?;
        self.lock_time.encode(w, p)
    }
}

impl Decodable for Transaction {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        Ok(Self {
            version: i32::decode(r, p)?,
            time: u32::decode(r, p)?,
            vin: Vec::decode(r, p)?,
            vout: Vec::decode(r, p)?,
            lock_time: u32::decode(r, p)?,
        })
    }
}

impl SignatureHasher for Transaction {
    fn signature_hash(&self, input_index: usize, script_code: &Script, hash_type: u8) -> Hash256 {
        if input_index >= self.vin.len() {
            // out-of-range index hashes to the sentinel "one" value so a
            // forged signature can never match it
            let mut one = [0u8; 32];
            one[0] = 1;
            return Hash256(one);
        }
        let mut copy = self.clone();
        for input in &mut copy.vin {
            input.script_sig = Script::new();
        }
        copy.vin[input_index].script_sig = script_code.clone();

        let p = SerialParams::gethash();
        let mut bytes = copy.encode_to_vec(&p);
        bytes.extend_from_slice(&(hash_type as u32).to_le_bytes());
        crate::hash::hash256(&bytes)
    }
}

/// Block header fields, hashed with scrypt for proof of work.
///
/// Layout: `version (i32) || prev (32) || merkle_root (32) || time (u32) ||
/// bits (u32) || nonce (u32)`, 80 bytes in total.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub hash_prev_block: Hash256,
    pub hash_merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            version: BLOCK_CURRENT_VERSION,
            hash_prev_block: Hash256::ZERO,
            hash_merkle_root: Hash256::ZERO,
            time: 0,
            bits: 0,
            nonce: 0,
        }
    }
}

impl BlockHeader {
    /// The scrypt proof-of-work digest of the 80 header bytes.
    ///
    /// This is the block's identifying hash; it is NOT double SHA-256.
    pub fn hash(&self) -> Hash256 {
        scrypt_block_hash(&self.encode_to_vec(&SerialParams::gethash()))
    }
}

impl Encodable for BlockHeader {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.version.encode(w, p)?;
        self.hash_prev_block.encode(w, p)?;
        self.hash_merkle_root.encode(w, p)?;
        self.time.encode(w, p)?;
        self.bits.encode(w, p)?;
        self.nonce.encode(w, p)
    }
}

impl Decodable for BlockHeader {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        Ok(Self {
            version: i32::decode(r, p)?,
            hash_prev_block: Hash256::decode(r, p)?,
            hash_merkle_root: Hash256::decode(r, p)?,
            time: u32::decode(r, p)?,
            bits: u32::decode(r, p)?,
            nonce: u32::decode(r, p)?,
        })
    }
}

/// A block: header, transactions, and the stake signature.
///
/// Layout: `header || varvec(vtx) || varstr(signature)`; the transaction
/// and signature parts are skipped under `SER_BLOCKHEADER_ONLY`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Block {
    pub header: BlockHeader,
    pub vtx: Vec<Transaction>,
    /// Signature over the block hash by the coinstake output key. Empty
    /// for proof-of-work blocks.
    pub signature: Vec<u8>,
}

impl Block {
    /// The block's identifying hash: the scrypt header digest.
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Proof-of-stake iff the second transaction is a coinstake.
    pub fn is_proof_of_stake(&self) -> bool {
        self.vtx.len() > 1 && self.vtx[1].is_coinstake()
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.is_proof_of_stake()
    }

    /// The staked outpoint and stake time, or the null pair for PoW.
    pub fn proof_of_stake(&self) -> (OutPoint, u32) {
        if self.is_proof_of_stake() {
            (self.vtx[1].vin[0].prevout, self.vtx[1].time)
        } else {
            (OutPoint::null(), 0)
        }
    }

    /// Last bit of the block hash, mixed into the stake modifier.
    pub fn stake_entropy_bit(&self) -> u32 {
        (self.hash().low_u64() & 1) as u32
    }

    /// Latest transaction timestamp in the block.
    pub fn max_transaction_time(&self) -> u32 {
        self.vtx.iter().map(|tx| tx.time).max().unwrap_or(0)
    }
}

impl Encodable for Block {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.header.encode(w, p)?;
        if !p.has(SER_BLOCKHEADER_ONLY) {
            self.vtx.encode(w, p)?;
            write_var_bytes(w, &self.signature)?;
        }
        Ok(())
    }
}

impl Decodable for Block {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(r, p)?;
        if p.has(SER_BLOCKHEADER_ONLY) {
            return Ok(Self { header, vtx: Vec::new(), signature: Vec::new() });
        }
        Ok(Self { header, vtx: Vec::decode(r, p)?, signature: read_var_bytes(r)? })
    }
}

/// Disk locator for one transaction: the containing block's hash and the
/// byte offset of the transaction within the stored block.
///
/// Layout (flat): `block_hash (32) || tx_offset (u32 LE)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskTxPos {
    pub block_hash: Hash256,
    pub tx_offset: u32,
}

impl DiskTxPos {
    pub fn new(block_hash: Hash256, tx_offset: u32) -> Self {
        Self { block_hash, tx_offset }
    }

    /// The null position: an unspent `TxIndex` slot.
    pub fn null() -> Self {
        Self { block_hash: Hash256::ZERO, tx_offset: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.tx_offset == u32::MAX
    }

    /// Sentinel meaning "the referenced transaction lives in the mempool".
    pub fn mempool_sentinel() -> Self {
        let mut one = [0u8; 32];
        one[0] = 1;
        Self { block_hash: Hash256(one), tx_offset: 1 }
    }
}

impl Encodable for DiskTxPos {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.block_hash.encode(w, p)?;
        self.tx_offset.encode(w, p)
    }
}

impl Decodable for DiskTxPos {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        Ok(Self { block_hash: Hash256::decode(r, p)?, tx_offset: u32::decode(r, p)? })
    }
}

/// Per-transaction spend record: where the transaction lives, and for each
/// of its outputs, which position spent it (null = unspent).
///
/// Layout: `version (i32, omitted under SER_GETHASH) || pos ||
/// varvec(spent)`. Invariant: `spent.len() == tx.vout.len()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIndex {
    pub pos: DiskTxPos,
    pub spent: Vec<DiskTxPos>,
}

impl TxIndex {
    /// A fresh record with all outputs unspent.
    pub fn new(pos: DiskTxPos, outputs: usize) -> Self {
        Self { pos, spent: vec![DiskTxPos::null(); outputs] }
    }

    pub fn is_output_spent(&self, n: u32) -> bool {
        self.spent.get(n as usize).is_some_and(|p| !p.is_null())
    }
}

impl Encodable for TxIndex {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        if !p.has(SER_GETHASH) {
            p.version.encode(w, p)?;
        }
        self.pos.encode(w, p)?;
        self.spent.encode(w, p)
    }
}

impl Decodable for TxIndex {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        if !p.has(SER_GETHASH) {
            let _version = i32::decode(r, p)?;
        }
        Ok(Self { pos: DiskTxPos::decode(r, p)?, spent: Vec::decode(r, p)? })
    }
}

/// A spend reference inside the mempool: which pooled transaction consumes
/// an outpoint, and through which of its inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InPoint {
    pub tx_hash: Hash256,
    pub n: u32,
}

/// A peer network address: 16 raw bytes, IPv4 stored IPv6-mapped.
///
/// Layout: the 16 address bytes verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetAddr {
    pub ip: [u8; 16],
}

impl NetAddr {
    /// Build from raw IPv4 octets in address order.
    pub fn from_ipv4_octets(octets: [u8; 4]) -> Self {
        let mut ip = [0u8; 16];
        ip[10] = 0xFF;
        ip[11] = 0xFF;
        ip[12..16].copy_from_slice(&octets);
        Self { ip }
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip[..10] == [0u8; 10] && self.ip[10] == 0xFF && self.ip[11] == 0xFF
    }
}

impl Encodable for NetAddr {
    fn encode<W: Write>(&self, w: &mut W, _p: &SerialParams) -> Result<(), CodecError> {
        w.write_all(&self.ip)?;
        Ok(())
    }
}

impl Decodable for NetAddr {
    fn decode<R: Read>(r: &mut R, _p: &SerialParams) -> Result<Self, CodecError> {
        let mut ip = [0u8; 16];
        r.read_exact(&mut ip)?;
        Ok(Self { ip })
    }
}

/// A network endpoint: address plus port.
///
/// Layout: `addr (16) || port (u16 BIG-endian)`; the port is the one
/// big-endian field in the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Service {
    pub addr: NetAddr,
    pub port: u16,
}

impl Encodable for Service {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.addr.encode(w, p)?;
        w.write_all(&self.port.to_be_bytes())?;
        Ok(())
    }
}

impl Decodable for Service {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        let addr = NetAddr::decode(r, p)?;
        let mut port = [0u8; 2];
        r.read_exact(&mut port)?;
        Ok(Self { addr, port: u16::from_be_bytes(port) })
    }
}
