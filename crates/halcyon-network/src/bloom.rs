//! Connection bloom filters for SPV-style transaction filtering.
//!
//! Peers load a filter with `filterload` and extend it with `filteradd`;
//! `mempool` replies and transaction relay are then restricted to
//! matching transactions. Size and hash-function counts are capped; a
//! violation costs the peer its connection.

use halcyon_core::hash::Hash256;
use halcyon_core::script::Op;
use halcyon_core::types::Transaction;

/// Maximum serialized filter size in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions.
pub const MAX_HASH_FUNCS: u32 = 50;

/// Maximum size of one inserted element.
pub const MAX_FILTER_ELEMENT_SIZE: usize = 520;

const LN2_SQUARED: f64 = 0.480_453_013_918_201_4;
const LN2: f64 = 0.693_147_180_559_945_3;

/// A murmur3-based bloom filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
}

impl BloomFilter {
    /// Size a filter for `elements` entries at the given false-positive
    /// rate.
    pub fn new(elements: usize, fp_rate: f64, tweak: u32) -> Self {
        let bits = (-1.0 / LN2_SQUARED * elements as f64 * fp_rate.ln()).ceil();
        let bytes = ((bits / 8.0) as usize).clamp(1, MAX_BLOOM_FILTER_SIZE);
        let funcs = ((bytes * 8) as f64 / elements.max(1) as f64 * LN2) as u32;
        Self {
            data: vec![0u8; bytes],
            hash_funcs: funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
        }
    }

    /// Wrap received filter parts, validating the caps.
    pub fn from_parts(data: Vec<u8>, hash_funcs: u32, tweak: u32) -> Option<Self> {
        if data.is_empty() || data.len() > MAX_BLOOM_FILTER_SIZE {
            return None;
        }
        if hash_funcs == 0 || hash_funcs > MAX_HASH_FUNCS {
            return None;
        }
        Some(Self { data, hash_funcs, tweak })
    }

    fn bit_index(&self, n: u32, element: &[u8]) -> usize {
        let seed = n.wrapping_mul(0xFBA4_C795).wrapping_add(self.tweak);
        murmur3(element, seed) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, element: &[u8]) {
        for n in 0..self.hash_funcs {
            let index = self.bit_index(n, element);
            self.data[index >> 3] |= 1 << (index & 7);
        }
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        (0..self.hash_funcs).all(|n| {
            let index = self.bit_index(n, element);
            self.data[index >> 3] & (1 << (index & 7)) != 0
        })
    }

    /// Whether a transaction matches the filter: its hash, any data push
    /// of its output scripts, or any spent outpoint. Matching outputs are
    /// inserted back so chained payments keep matching.
    pub fn is_relevant_and_update(&mut self, tx: &Transaction, tx_hash: &Hash256) -> bool {
        let mut found = self.contains(tx_hash.as_bytes());

        for (n, txout) in tx.vout.iter().enumerate() {
            let pushes: Vec<Vec<u8>> = txout
                .script_pubkey
                .ops()
                .filter_map(|op| match op {
                    Ok(Op::Push(data)) if !data.is_empty() => Some(data.to_vec()),
                    _ => None,
                })
                .collect();
            if pushes.iter().any(|data| self.contains(data)) {
                found = true;
                let mut outpoint = tx_hash.as_bytes().to_vec();
                outpoint.extend_from_slice(&(n as u32).to_le_bytes());
                self.insert(&outpoint);
            }
        }
        if found {
            return true;
        }

        tx.vin.iter().any(|txin| {
            let mut outpoint = txin.prevout.hash.as_bytes().to_vec();
            outpoint.extend_from_slice(&txin.prevout.n.to_le_bytes());
            self.contains(&outpoint)
        })
    }
}

/// Murmur3 32-bit, as used by the classic filter implementation.
fn murmur3(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes(chunk.try_into().expect("chunk of 4"));
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 = (h1 ^ k1).rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k1 |= (*byte as u32) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^ (h1 >> 16)
}
