//! Protocol payload types.

use std::io::{Read, Write};

use halcyon_core::error::CodecError;
use halcyon_core::hash::Hash256;
use halcyon_core::serialize::{
    Decodable, Encodable, SerialParams, read_var_bytes, write_var_bytes,
};
use halcyon_core::types::Service;

/// Protocol version spoken by this node.
pub const PROTOCOL_VERSION: i32 = 60320;

/// Oldest protocol version accepted from peers.
pub const MIN_PEER_PROTO_VERSION: i32 = 60210;

/// Maximum entries in one `inv` message.
pub const MAX_INV_SZ: usize = 50_000;

/// Maximum hashes in a block locator.
pub const MAX_LOCATOR_SZ: usize = 500;

/// `getblocks` emits at most this many inventory entries per request.
pub const GETBLOCKS_LIMIT: usize = 500;

/// `getheaders` emits at most this many headers per request.
pub const GETHEADERS_LIMIT: usize = 2000;

/// Maximum serialized alert size relayed.
pub const MAX_ALERT_SIZE: usize = 10_000;

/// Inventory item kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvKind {
    Tx,
    Block,
}

/// One inventory entry: a typed hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inv {
    pub fn tx(hash: Hash256) -> Self {
        Self { kind: InvKind::Tx, hash }
    }

    pub fn block(hash: Hash256) -> Self {
        Self { kind: InvKind::Block, hash }
    }
}

impl Encodable for Inv {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        let kind: u32 = match self.kind {
            InvKind::Tx => 1,
            InvKind::Block => 2,
        };
        kind.encode(w, p)?;
        self.hash.encode(w, p)
    }
}

impl Decodable for Inv {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        let kind = match u32::decode(r, p)? {
            1 => InvKind::Tx,
            2 => InvKind::Block,
            other => return Err(CodecError::InvalidTag(other as u8)),
        };
        Ok(Self { kind, hash: Hash256::decode(r, p)? })
    }
}

/// A peer address as relayed in `addr` messages.
///
/// Layout: `time (u32) || services (u64) || service`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Address {
    /// Last-seen time, for address manager aging.
    pub time: u32,
    pub services: u64,
    pub service: Service,
}

impl Encodable for Address {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.time.encode(w, p)?;
        self.services.encode(w, p)?;
        self.service.encode(w, p)
    }
}

impl Decodable for Address {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        Ok(Self {
            time: u32::decode(r, p)?,
            services: u64::decode(r, p)?,
            service: Service::decode(r, p)?,
        })
    }
}

/// The `version` handshake payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: Service,
    pub addr_from: Service,
    /// Self-connection detection nonce.
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
}

impl Encodable for VersionPayload {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.version.encode(w, p)?;
        self.services.encode(w, p)?;
        self.timestamp.encode(w, p)?;
        self.addr_recv.encode(w, p)?;
        self.addr_from.encode(w, p)?;
        self.nonce.encode(w, p)?;
        write_var_bytes(w, self.user_agent.as_bytes())?;
        self.start_height.encode(w, p)
    }
}

impl Decodable for VersionPayload {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        Ok(Self {
            version: i32::decode(r, p)?,
            services: u64::decode(r, p)?,
            timestamp: i64::decode(r, p)?,
            addr_recv: Service::decode(r, p)?,
            addr_from: Service::decode(r, p)?,
            nonce: u64::decode(r, p)?,
            user_agent: String::from_utf8(read_var_bytes(r)?)
                .map_err(|_| CodecError::InvalidTag(0))?,
            start_height: i32::decode(r, p)?,
        })
    }
}

/// A block locator: hashes of our chain, dense near the tip and
/// exponentially sparser toward genesis.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockLocator {
    pub have: Vec<Hash256>,
}

impl BlockLocator {
    /// Build a locator for the chain ending at `tip_height`.
    ///
    /// `hash_at` resolves a main-chain height to its block hash.
    pub fn from_tip(tip_height: i32, hash_at: impl Fn(i32) -> Option<Hash256>) -> Self {
        let mut have = Vec::new();
        let mut step = 1i32;
        let mut height = tip_height;
        while height > 0 {
            if let Some(hash) = hash_at(height) {
                have.push(hash);
            }
            if have.len() >= 10 {
                step *= 2;
            }
            height -= step;
            if have.len() >= MAX_LOCATOR_SZ {
                break;
            }
        }
        if let Some(genesis) = hash_at(0) {
            have.push(genesis);
        }
        Self { have }
    }
}

impl Encodable for BlockLocator {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        // a version stamp precedes the hashes, as in the classic format
        p.version.encode(w, p)?;
        self.have.encode(w, p)
    }
}

impl Decodable for BlockLocator {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        let _version = i32::decode(r, p)?;
        Ok(Self { have: Vec::decode(r, p)? })
    }
}

/// `getblocks` / `getheaders` request body: a locator plus a stop hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetBlocksPayload {
    pub locator: BlockLocator,
    pub hash_stop: Hash256,
}

impl Encodable for GetBlocksPayload {
    fn encode<W: Write>(&self, w: &mut W, p: &SerialParams) -> Result<(), CodecError> {
        self.locator.encode(w, p)?;
        self.hash_stop.encode(w, p)
    }
}

impl Decodable for GetBlocksPayload {
    fn decode<R: Read>(r: &mut R, p: &SerialParams) -> Result<Self, CodecError> {
        Ok(Self {
            locator: BlockLocator::decode(r, p)?,
            hash_stop: Hash256::decode(r, p)?,
        })
    }
}
