//! Wire message framing.
//!
//! Every message starts with a 24-byte header: the 4 network magic bytes,
//! a 12-byte zero-padded ASCII command, the payload size, and the first
//! four bytes of the payload's double SHA-256 as a checksum.

use std::io::{Read, Write};

use halcyon_core::error::CodecError;
use halcyon_core::hash::hash256;
use halcyon_core::serialize::{Decodable, Encodable, SerialParams};

use crate::error::NetError;

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 24;

/// Command field width.
pub const COMMAND_SIZE: usize = 12;

/// Hard cap on a single message payload.
pub const MAX_MESSAGE_PAYLOAD: usize = 32 * 1024 * 1024;

/// The 24-byte envelope in front of every payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; COMMAND_SIZE],
    pub length: u32,
    pub checksum: u32,
}

impl MessageHeader {
    /// Build a header for `payload` under the given network magic.
    pub fn for_payload(magic: [u8; 4], command: &str, payload: &[u8]) -> Self {
        let mut cmd = [0u8; COMMAND_SIZE];
        cmd[..command.len()].copy_from_slice(command.as_bytes());
        Self {
            magic,
            command: cmd,
            length: payload.len() as u32,
            checksum: payload_checksum(payload),
        }
    }

    /// The command as a string, trailing zeros stripped.
    pub fn command_str(&self) -> Result<&str, NetError> {
        let end = self
            .command
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(COMMAND_SIZE);
        // the padding after the command must be all zeros
        if self.command[end..].iter().any(|b| *b != 0) {
            return Err(NetError::BadHeader("nonzero command padding"));
        }
        let name = std::str::from_utf8(&self.command[..end])
            .map_err(|_| NetError::BadHeader("command not ascii"))?;
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(NetError::BadHeader("command not printable"));
        }
        Ok(name)
    }

    /// Validate the header against the expected magic and size cap.
    pub fn validate(&self, expected_magic: [u8; 4]) -> Result<(), NetError> {
        if self.magic != expected_magic {
            return Err(NetError::BadHeader("wrong network magic"));
        }
        self.command_str()?;
        if self.length as usize > MAX_MESSAGE_PAYLOAD {
            return Err(NetError::Oversized {
                size: self.length as usize,
                max: MAX_MESSAGE_PAYLOAD,
            });
        }
        Ok(())
    }

    /// Verify a payload against the stored checksum and length.
    pub fn check_payload(&self, payload: &[u8]) -> Result<(), NetError> {
        if payload.len() != self.length as usize {
            return Err(NetError::BadHeader("length mismatch"));
        }
        if payload_checksum(payload) != self.checksum {
            return Err(NetError::ChecksumMismatch);
        }
        Ok(())
    }
}

/// First four bytes of the payload's double SHA-256, little-endian.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let digest = hash256(payload);
    u32::from_le_bytes(digest.0[0..4].try_into().expect("digest has 32 bytes"))
}

impl Encodable for MessageHeader {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        w.write_all(&self.magic)?;
        w.write_all(&self.command)?;
        self.length.encode(w, p)?;
        self.checksum.encode(w, p)
    }
}

impl Decodable for MessageHeader {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        let mut command = [0u8; COMMAND_SIZE];
        r.read_exact(&mut command)?;
        Ok(Self {
            magic,
            command,
            length: u32::decode(r, p)?,
            checksum: u32::decode(r, p)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0x32, 0x5e, 0x6f, 0x86];

    #[test]
    fn header_is_24_bytes() {
        let header = MessageHeader::for_payload(MAGIC, "ping", &[1, 2, 3]);
        assert_eq!(header.encode_to_vec(&SerialParams::network()).len(), HEADER_SIZE);
    }

    #[test]
    fn round_trip() {
        let header = MessageHeader::for_payload(MAGIC, "getblocks", b"payload");
        let p = SerialParams::network();
        let bytes = header.encode_to_vec(&p);
        let decoded = MessageHeader::decode_from_slice(&bytes, &p).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.command_str().unwrap(), "getblocks");
    }

    #[test]
    fn checksum_covers_payload() {
        let header = MessageHeader::for_payload(MAGIC, "tx", b"data");
        assert_eq!(header.check_payload(b"data"), Ok(()));
        assert_eq!(header.check_payload(b"datA"), Err(NetError::ChecksumMismatch));
        assert_eq!(
            header.check_payload(b"data-too-long"),
            Err(NetError::BadHeader("length mismatch"))
        );
    }

    #[test]
    fn empty_payload_checksum_is_defined() {
        // double-SHA256 of the empty string starts 5d f6 e0 e2
        assert_eq!(payload_checksum(&[]), u32::from_le_bytes([0x5d, 0xf6, 0xe0, 0xe2]));
    }

    #[test]
    fn validate_rejects_wrong_magic() {
        let header = MessageHeader::for_payload(MAGIC, "ping", &[]);
        assert!(header.validate(MAGIC).is_ok());
        assert_eq!(
            header.validate([0x1b, 0xba, 0x63, 0xc5]),
            Err(NetError::BadHeader("wrong network magic"))
        );
    }

    #[test]
    fn nonzero_padding_rejected() {
        let mut header = MessageHeader::for_payload(MAGIC, "ping", &[]);
        header.command[COMMAND_SIZE - 1] = 7;
        assert!(header.command_str().is_err());
    }

    #[test]
    fn oversized_length_rejected() {
        let mut header = MessageHeader::for_payload(MAGIC, "block", &[]);
        header.length = (MAX_MESSAGE_PAYLOAD + 1) as u32;
        assert!(matches!(header.validate(MAGIC), Err(NetError::Oversized { .. })));
    }
}
