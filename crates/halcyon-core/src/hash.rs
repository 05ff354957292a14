//! Hash primitives: the 256-bit id type and the two consensus digests.
//!
//! Transaction ids and merkle nodes use double SHA-256 over canonical
//! bytes. Block hashes use the scrypt header digest (N=1024, r=1, p=1)
//! inherited from the launch client; the two are never interchangeable.

use std::fmt;

use sha2::{Digest, Sha256};

/// A 256-bit opaque identifier.
///
/// Stored little-endian; displayed byte-reversed as is conventional for
/// chain ids, so the hex string reads as a big-endian number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used for null prevouts and the genesis parent.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Low 64 bits, little-endian. The stake entropy bit is `low_u64() & 1`.
    pub fn low_u64(&self) -> u64 {
        u64::from_le_bytes(self.0[0..8].try_into().expect("slice of 8 from 32"))
    }

    /// Parse from the conventional big-endian display form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let raw = hex::decode(s).ok()?;
        if raw.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, b) in raw.iter().rev().enumerate() {
            bytes[i] = *b;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Double SHA-256 of one byte range.
pub fn hash256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// Double SHA-256 of two concatenated byte ranges.
///
/// Used by the merkle tree to combine children without an intermediate
/// allocation.
pub fn hash256_concat(a: &[u8], b: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    let first = hasher.finalize();
    Hash256(Sha256::digest(first).into())
}

/// Scrypt digest of an 80-byte serialized block header.
///
/// Parameters N=1024, r=1, p=1, with the header doubling as its own salt.
pub fn scrypt_block_hash(header: &[u8]) -> Hash256 {
    let params = scrypt::Params::new(10, 1, 1, 32).expect("fixed scrypt parameters are valid");
    let mut out = [0u8; 32];
    scrypt::scrypt(header, header, &params, &mut out)
        .expect("output length is a valid scrypt dk length");
    Hash256(out)
}
