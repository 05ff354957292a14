//! Consensus serialization codec.
//!
//! Every byte that reaches disk or wire goes through this module:
//! fixed-width integers little-endian, compact-size prefixed containers,
//! identical layout in both directions. Implementations may branch on the
//! serialization flags (`SER_DISK`, `SER_NETWORK`, `SER_GETHASH`,
//! `SER_BLOCKHEADER_ONLY`) and the version carried by [`SerialParams`].

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::CodecError;
use crate::hash::{Hash256, hash256};

/// Serializing for persistent storage.
pub const SER_DISK: u32 = 1 << 0;
/// Serializing for the peer-to-peer wire.
pub const SER_NETWORK: u32 = 1 << 1;
/// Serializing to compute an identifying hash.
pub const SER_GETHASH: u32 = 1 << 2;
/// Serializing only the header portion of a block.
pub const SER_BLOCKHEADER_ONLY: u32 = 1 << 3;

/// Current codec version stamped into versioned records.
pub const SERIAL_VERSION: i32 = 60320;

/// Upper bound on any declared container length.
pub const MAX_SERIALIZED_SIZE: u64 = 0x0200_0000;

/// Context handed to every encode/decode call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerialParams {
    /// Bitmask of `SER_*` flags.
    pub flags: u32,
    /// Format version custom serializers may branch on.
    pub version: i32,
}

impl SerialParams {
    pub const fn new(flags: u32, version: i32) -> Self {
        Self { flags, version }
    }

    pub const fn disk() -> Self {
        Self::new(SER_DISK, SERIAL_VERSION)
    }

    pub const fn network() -> Self {
        Self::new(SER_NETWORK, SERIAL_VERSION)
    }

    pub const fn gethash() -> Self {
        Self::new(SER_GETHASH, SERIAL_VERSION)
    }

    pub const fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// The same parameters with an extra flag set.
    pub const fn with(&self, flag: u32) -> Self {
        Self::new(self.flags | flag, self.version)
    }
}

/// A type with a canonical byte encoding.
pub trait Encodable {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError>;

    fn encode_to_vec(&self, p: &SerialParams) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out, p)
            .expect("writing to a Vec cannot fail");
        out
    }

    /// Serialized size in bytes, computed without allocating the encoding.
    fn encoded_size(&self, p: &SerialParams) -> usize {
        let mut counter = CountWriter::default();
        self.encode(&mut counter, p)
            .expect("counting writer cannot fail");
        counter.count
    }
}

/// A type decodable from its canonical byte encoding.
pub trait Decodable: Sized {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError>;

    fn decode_from_slice(bytes: &[u8], p: &SerialParams) -> Result<Self, CodecError> {
        let mut cursor = bytes;
        Self::decode(&mut cursor, p)
    }
}

/// Double SHA-256 of a value's canonical encoding under `SER_GETHASH`.
pub fn serialize_hash<T: Encodable>(value: &T) -> Hash256 {
    hash256(&value.encode_to_vec(&SerialParams::gethash()))
}

/// `io::Write` sink that only counts bytes.
#[derive(Default)]
struct CountWriter {
    count: usize,
}

impl Write for CountWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.count += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// --- Compact size ---

/// Write a compact-size length: 1 byte below 0xFD, else a tag byte
/// (0xFD/0xFE/0xFF) followed by the LE u16/u32/u64.
pub fn write_compact_size<W: Write>(w: &mut W, n: u64) -> Result<(), CodecError> {
    if n < 0xFD {
        w.write_u8(n as u8)?;
    } else if n <= u16::MAX as u64 {
        w.write_u8(0xFD)?;
        w.write_u16::<LittleEndian>(n as u16)?;
    } else if n <= u32::MAX as u64 {
        w.write_u8(0xFE)?;
        w.write_u32::<LittleEndian>(n as u32)?;
    } else {
        w.write_u8(0xFF)?;
        w.write_u64::<LittleEndian>(n)?;
    }
    Ok(())
}

/// Read a compact-size length, rejecting anything above
/// [`MAX_SERIALIZED_SIZE`].
pub fn read_compact_size<R: Read>(r: &mut R) -> Result<u64, CodecError> {
    let tag = r.read_u8()?;
    let n = match tag {
        0xFD => r.read_u16::<LittleEndian>()? as u64,
        0xFE => r.read_u32::<LittleEndian>()? as u64,
        0xFF => r.read_u64::<LittleEndian>()?,
        small => small as u64,
    };
    if n > MAX_SERIALIZED_SIZE {
        return Err(CodecError::Oversize { size: n, max: MAX_SERIALIZED_SIZE });
    }
    Ok(n)
}

/// Encoded width of a compact size for `n`.
pub const fn compact_size_len(n: u64) -> usize {
    if n < 0xFD {
        1
    } else if n <= u16::MAX as u64 {
        3
    } else if n <= u32::MAX as u64 {
        5
    } else {
        9
    }
}

// --- Byte strings ---

/// Write a compact-size length followed by the raw bytes.
pub fn write_var_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<(), CodecError> {
    write_compact_size(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Read a compact-size length followed by that many raw bytes.
pub fn read_var_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, CodecError> {
    let len = read_compact_size(r)? as usize;
    let mut buf = vec![0u8; len.min(4096)];
    let mut out = Vec::with_capacity(len.min(4096));
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(buf.len());
        r.read_exact(&mut buf[..chunk])?;
        out.extend_from_slice(&buf[..chunk]);
        remaining -= chunk;
    }
    Ok(out)
}

// --- Primitive impls ---

macro_rules! impl_int_codec {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Encodable for $ty {
            fn encode<W: Write>(&self, w: &mut W, _p: &SerialParams) -> Result<(), CodecError> {
                w.$write::<LittleEndian>(*self)?;
                Ok(())
            }
        }

        impl Decodable for $ty {
            fn decode<R: Read>(r: &mut R, _p: &SerialParams) -> Result<Self, CodecError> {
                Ok(r.$read::<LittleEndian>()?)
            }
        }
    };
}

impl_int_codec!(u16, write_u16, read_u16);
impl_int_codec!(u32, write_u32, read_u32);
impl_int_codec!(u64, write_u64, read_u64);
impl_int_codec!(i32, write_i32, read_i32);
impl_int_codec!(i64, write_i64, read_i64);

impl Encodable for u8 {
    fn encode<W: Write>(&self, w: &mut W, _p: &SerialParams) -> Result<(), CodecError> {
        w.write_u8(*self)?;
        Ok(())
    }
}

impl Decodable for u8 {
    fn decode<R: Read>(r: &mut R, _p: &SerialParams) -> Result<Self, CodecError> {
        Ok(r.read_u8()?)
    }
}

impl Encodable for bool {
    fn encode<W: Write>(&self, w: &mut W, _p: &SerialParams) -> Result<(), CodecError> {
        w.write_u8(*self as u8)?;
        Ok(())
    }
}

impl Decodable for bool {
    fn decode<R: Read>(r: &mut R, _p: &SerialParams) -> Result<Self, CodecError> {
        Ok(r.read_u8()? != 0)
    }
}

impl Encodable for Hash256 {
    fn encode<W: Write>(&self, w: &mut W, _p: &SerialParams) -> Result<(), CodecError> {
        w.write_all(self.as_bytes())?;
        Ok(())
    }
}

impl Decodable for Hash256 {
    fn decode<R: Read>(r: &mut R, _p: &SerialParams) -> Result<Self, CodecError> {
        let mut bytes = [0u8; 32];
        r.read_exact(&mut bytes)?;
        Ok(Hash256(bytes))
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        write_compact_size(w, self.len() as u64)?;
        for item in self {
            item.encode(w, p)?;
        }
        Ok(())
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        let len = read_compact_size(r)? as usize;
        let mut out = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            out.push(T::decode(r, p)?);
        }
        Ok(out)
    }
}

/// A string serializes as compact-size length plus raw bytes.
impl Encodable for String {
    fn encode<W: Write>(&self, w: &mut W, _p: &SerialParams) -> Result<(), CodecError> {
        write_var_bytes(w, self.as_bytes())
    }
}

impl Decodable for String {
    fn decode<R: Read>(r: &mut R, _p: &SerialParams) -> Result<Self, CodecError> {
        let bytes = read_var_bytes(r)?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidTag(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc<T: Encodable>(v: &T) -> String {
        hex::encode(v.encode_to_vec(&SerialParams::disk()))
    }

    // ------------------------------------------------------------------
    // Fixed-width fixtures (byte-exact contracts)
    // ------------------------------------------------------------------

    #[test]
    fn u8_fixture() {
        assert_eq!(enc(&0x12u8), "12");
    }

    #[test]
    fn u16_fixture() {
        assert_eq!(enc(&0x1234u16), "3412");
    }

    #[test]
    fn u32_fixture() {
        assert_eq!(enc(&0x12345678u32), "78563412");
        assert_eq!(enc(&0x12345678i32), "78563412");
    }

    #[test]
    fn u64_fixture() {
        assert_eq!(enc(&0x1234567813572468u64), "6824571378563412");
        assert_eq!(enc(&0x1234567824681357i64), "5713682478563412");
        assert_eq!(enc(&0x12345678u64), "7856341200000000");
    }

    #[test]
    fn int_round_trips() {
        let p = SerialParams::disk();
        for v in [0u64, 1, 0xFC, 0xFD, 0xFFFF, 0x10000, u64::MAX] {
            let bytes = v.encode_to_vec(&p);
            assert_eq!(u64::decode_from_slice(&bytes, &p).unwrap(), v);
        }
    }

    // ------------------------------------------------------------------
    // Compact size
    // ------------------------------------------------------------------

    #[test]
    fn compact_size_thresholds() {
        let mut buf = Vec::new();
        write_compact_size(&mut buf, 0xFC).unwrap();
        assert_eq!(buf, vec![0xFC]);

        buf.clear();
        write_compact_size(&mut buf, 0xFD).unwrap();
        assert_eq!(buf, vec![0xFD, 0xFD, 0x00]);

        buf.clear();
        write_compact_size(&mut buf, 0x10000).unwrap();
        assert_eq!(buf, vec![0xFE, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn compact_size_round_trip() {
        for n in [0u64, 1, 0xFC, 0xFD, 0xFFFF, 0x10000, MAX_SERIALIZED_SIZE] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, n).unwrap();
            assert_eq!(buf.len(), compact_size_len(n));
            assert_eq!(read_compact_size(&mut buf.as_slice()).unwrap(), n);
        }
    }

    #[test]
    fn compact_size_rejects_oversize() {
        let mut buf = Vec::new();
        write_compact_size(&mut buf, MAX_SERIALIZED_SIZE + 1).unwrap();
        assert!(matches!(
            read_compact_size(&mut buf.as_slice()),
            Err(CodecError::Oversize { .. })
        ));
    }

    #[test]
    fn truncated_input_reports_truncated() {
        let p = SerialParams::disk();
        assert_eq!(u32::decode_from_slice(&[0x01, 0x02], &p), Err(CodecError::Truncated));
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    #[test]
    fn var_bytes_round_trip() {
        let data = vec![7u8; 300];
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, &data).unwrap();
        assert_eq!(buf[0], 0xFD); // 300 needs the u16 form
        assert_eq!(read_var_bytes(&mut buf.as_slice()).unwrap(), data);
    }

    #[test]
    fn vec_of_u32_layout() {
        // length prefix then each element LE
        let v = vec![1u32, 2];
        assert_eq!(enc(&v), "020100000002000000");
    }

    #[test]
    fn string_round_trip() {
        let p = SerialParams::disk();
        let s = "halcyon".to_string();
        let bytes = s.encode_to_vec(&p);
        assert_eq!(bytes[0] as usize, s.len());
        assert_eq!(String::decode_from_slice(&bytes, &p).unwrap(), s);
    }

    #[test]
    fn hash256_raw_layout() {
        let h = Hash256([0xAB; 32]);
        let bytes = h.encode_to_vec(&SerialParams::disk());
        assert_eq!(bytes, vec![0xAB; 32]);
    }

    // ------------------------------------------------------------------
    // Params
    // ------------------------------------------------------------------

    #[test]
    fn params_flags() {
        let p = SerialParams::disk();
        assert!(p.has(SER_DISK));
        assert!(!p.has(SER_NETWORK));
        assert!(p.with(SER_BLOCKHEADER_ONLY).has(SER_BLOCKHEADER_ONLY));
    }

    #[test]
    fn encoded_size_matches_encoding() {
        let v = vec![1u32, 2, 3];
        let p = SerialParams::disk();
        assert_eq!(v.encoded_size(&p), v.encode_to_vec(&p).len());
    }
}
