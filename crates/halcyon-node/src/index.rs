//! The block index: one record per known block, persisted and kept in an
//! in-memory map keyed by hash.
//!
//! Parent/child links are stored as hashes, not pointers: `hash_prev` is
//! immutable once written, `hash_next` is the forward link of the main
//! chain and is rewritten only under the chain lock during connect,
//! disconnect, and reorganization.

use std::io::{Read, Write};

use primitive_types::U256;

use halcyon_core::difficulty::block_trust;
use halcyon_core::error::CodecError;
use halcyon_core::hash::Hash256;
use halcyon_core::serialize::{Decodable, Encodable, SER_GETHASH, SerialParams};
use halcyon_core::types::{Block, OutPoint};

/// Flag: the block is proof-of-stake.
pub const BLOCK_PROOF_OF_STAKE: u32 = 1 << 0;
/// Flag: the stake entropy bit of this block is set.
pub const BLOCK_STAKE_ENTROPY: u32 = 1 << 1;
/// Flag: a new stake modifier was generated at this block.
pub const BLOCK_STAKE_MODIFIER: u32 = 1 << 2;

/// Chain-node record for one block.
///
/// Persisted layout: `serial version (i32) || block_hash || hash_prev ||
/// hash_next || height || chain_trust (32 LE) || mint || money_supply ||
/// flags || stake_modifier || stake_modifier_checksum || prevout_stake ||
/// stake_time || hash_proof || header fields`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndex {
    pub block_hash: Hash256,
    /// Parent hash; zero only for genesis.
    pub hash_prev: Hash256,
    /// Main-chain successor; zero when this block is not on the main chain
    /// or is the tip.
    pub hash_next: Hash256,
    pub height: i32,
    /// Cumulative trust up to and including this block.
    pub chain_trust: U256,
    /// Coins created by this block (subsidy plus fee recirculation).
    pub mint: i64,
    /// Total supply after this block.
    pub money_supply: i64,
    pub flags: u32,
    pub stake_modifier: u64,
    pub stake_modifier_checksum: u32,
    /// The staked outpoint for proof-of-stake blocks, null otherwise.
    pub prevout_stake: OutPoint,
    pub stake_time: u32,
    /// Proof hash: the stake kernel hash for PoS, the block hash for PoW.
    pub hash_proof: Hash256,
    // header copy
    pub version: i32,
    pub hash_merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockIndex {
    /// Build an index record from a block; linkage, height, and trust are
    /// filled in by the chain state machine.
    pub fn from_block(block: &Block) -> Self {
        let (prevout_stake, stake_time) = if block.is_proof_of_stake() {
            block.proof_of_stake()
        } else {
            (OutPoint::null(), 0)
        };
        let mut flags = 0;
        if block.is_proof_of_stake() {
            flags |= BLOCK_PROOF_OF_STAKE;
        }
        Self {
            block_hash: block.hash(),
            hash_prev: block.header.hash_prev_block,
            hash_next: Hash256::ZERO,
            height: 0,
            chain_trust: U256::zero(),
            mint: 0,
            money_supply: 0,
            flags,
            stake_modifier: 0,
            stake_modifier_checksum: 0,
            prevout_stake,
            stake_time,
            hash_proof: Hash256::ZERO,
            version: block.header.version,
            hash_merkle_root: block.header.hash_merkle_root,
            time: block.header.time,
            bits: block.header.bits,
            nonce: block.header.nonce,
        }
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.flags & BLOCK_PROOF_OF_STAKE != 0
    }

    pub fn stake_entropy_bit(&self) -> u32 {
        ((self.flags & BLOCK_STAKE_ENTROPY) != 0) as u32
    }

    pub fn set_stake_entropy_bit(&mut self, bit: u32) {
        if bit != 0 {
            self.flags |= BLOCK_STAKE_ENTROPY;
        } else {
            self.flags &= !BLOCK_STAKE_ENTROPY;
        }
    }

    pub fn generated_stake_modifier(&self) -> bool {
        self.flags & BLOCK_STAKE_MODIFIER != 0
    }

    pub fn set_stake_modifier(&mut self, modifier: u64, generated: bool) {
        self.stake_modifier = modifier;
        if generated {
            self.flags |= BLOCK_STAKE_MODIFIER;
        }
    }

    /// Trust contributed by this single block.
    pub fn block_trust(&self) -> U256 {
        block_trust(self.bits)
    }

    /// On the main chain iff a successor links to it or it is the tip.
    pub fn is_in_main_chain(&self, best_hash: &Hash256) -> bool {
        !self.hash_next.is_zero() || self.block_hash == *best_hash
    }

    pub fn is_genesis(&self) -> bool {
        self.hash_prev.is_zero()
    }
}

fn encode_u256<W: Write>(value: &U256, w: &mut W) -> Result<(), CodecError> {
    let mut bytes = [0u8; 32];
    value.to_little_endian(&mut bytes);
    w.write_all(&bytes)?;
    Ok(())
}

fn decode_u256<R: Read>(r: &mut R) -> Result<U256, CodecError> {
    let mut bytes = [0u8; 32];
    r.read_exact(&mut bytes)?;
    Ok(U256::from_little_endian(&bytes))
}

impl Encodable for BlockIndex {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        if !p.has(SER_GETHASH) {
            p.version.encode(w, p)?;
        }
        self.block_hash.encode(w, p)?;
        self.hash_prev.encode(w, p)?;
        self.hash_next.encode(w, p)?;
        self.height.encode(w, p)?;
        encode_u256(&self.chain_trust, w)?;
        self.mint.encode(w, p)?;
        self.money_supply.encode(w, p)?;
        self.flags.encode(w, p)?;
        self.stake_modifier.encode(w, p)?;
        self.stake_modifier_checksum.encode(w, p)?;
        self.prevout_stake.encode(w, p)?;
        self.stake_time.encode(w, p)?;
        self.hash_proof.encode(w, p)?;
        self.version.encode(w, p)?;
        self.hash_merkle_root.encode(w, p)?;
        self.time.encode(w, p)?;
        self.bits.encode(w, p)?;
        self.nonce.encode(w, p)
    }
}

impl Decodable for BlockIndex {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        if !p.has(SER_GETHASH) {
            let _serial_version = i32::decode(r, p)?;
        }
        Ok(Self {
            block_hash: Hash256::decode(r, p)?,
            hash_prev: Hash256::decode(r, p)?,
            hash_next: Hash256::decode(r, p)?,
            height: i32::decode(r, p)?,
            chain_trust: decode_u256(r)?,
            mint: i64::decode(r, p)?,
            money_supply: i64::decode(r, p)?,
            flags: u32::decode(r, p)?,
            stake_modifier: u64::decode(r, p)?,
            stake_modifier_checksum: u32::decode(r, p)?,
            prevout_stake: OutPoint::decode(r, p)?,
            stake_time: u32::decode(r, p)?,
            hash_proof: Hash256::decode(r, p)?,
            version: i32::decode(r, p)?,
            hash_merkle_root: Hash256::decode(r, p)?,
            time: u32::decode(r, p)?,
            bits: u32::decode(r, p)?,
            nonce: u32::decode(r, p)?,
        })
    }
}
