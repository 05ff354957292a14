//! Per-connection peer state and misbehavior scoring.

use std::collections::HashSet;

use tracing::{info, warn};

use halcyon_core::hash::Hash256;

use crate::bloom::BloomFilter;
use crate::protocol::Inv;

/// Misbehavior score at which a peer is banned and dropped.
pub const BAN_SCORE: u32 = 100;

/// Idle interval after which a keep-alive ping goes out: 30 minutes.
pub const PING_INTERVAL: i64 = 30 * 60;

/// Everything the node tracks about one connection.
#[derive(Debug, Default)]
pub struct PeerState {
    /// Negotiated protocol version; zero until `version` arrives.
    pub version: i32,
    pub services: u64,
    pub start_height: i32,
    pub user_agent: String,
    pub got_verack: bool,
    /// Whether this peer was asked for initial blocks.
    pub asked_for_blocks: bool,
    /// Cumulative misbehavior; at [`BAN_SCORE`] the peer is banned.
    misbehavior: u32,
    banned: bool,
    /// Inventory this peer is known to have; suppresses re-relay.
    pub known_inventory: HashSet<Hash256>,
    /// Items we want from this peer.
    pub ask_for: Vec<Inv>,
    /// Optional transaction filter loaded by the peer.
    pub filter: Option<BloomFilter>,
    /// Last time either side sent anything, for keep-alive pings.
    pub last_activity: i64,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_version(&self) -> bool {
        self.version != 0
    }

    /// Charge misbehavior; returns true when this charge banned the peer.
    pub fn misbehaving(&mut self, score: u32) -> bool {
        if score == 0 || self.banned {
            return false;
        }
        self.misbehavior += score;
        if self.misbehavior >= BAN_SCORE {
            self.banned = true;
            info!(score = self.misbehavior, "peer banned for misbehavior");
            return true;
        }
        warn!(added = score, total = self.misbehavior, "peer misbehaving");
        false
    }

    pub fn misbehavior(&self) -> u32 {
        self.misbehavior
    }

    pub fn is_banned(&self) -> bool {
        self.banned
    }

    /// Record that the peer knows an item, returning whether it was new.
    pub fn push_known(&mut self, hash: Hash256) -> bool {
        self.known_inventory.insert(hash)
    }

    /// Whether a keep-alive ping is due at `now`.
    pub fn ping_due(&self, now: i64) -> bool {
        self.got_verack && now - self.last_activity >= PING_INTERVAL
    }
}
