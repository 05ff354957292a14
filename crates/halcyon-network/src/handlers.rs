//! Peer message handlers.
//!
//! Each handler is a pure function over the connection state, the decoded
//! payload, and the node behind [`NodeInterface`]; outgoing traffic is
//! returned as a list of [`Reply`] actions for the socket layer to
//! render. Misbehavior is charged on the peer state; a handler error
//! means the connection should be dropped.

use tracing::{debug, info, warn};

use halcyon_core::hash::Hash256;
use halcyon_core::serialize::{Decodable, Encodable, SerialParams};
use halcyon_core::types::{Block, BlockHeader, Transaction};

use crate::bloom::{BloomFilter, MAX_FILTER_ELEMENT_SIZE};
use crate::error::NetError;
use crate::peer::PeerState;
use crate::protocol::{
    Address, BlockLocator, GETBLOCKS_LIMIT, GETHEADERS_LIMIT, GetBlocksPayload, Inv, InvKind,
    MAX_ALERT_SIZE, MAX_INV_SZ, PROTOCOL_VERSION, VersionPayload,
};

/// Handler configuration fixed per connection.
#[derive(Clone, Copy, Debug)]
pub struct HandlerConfig {
    /// Oldest protocol version still served.
    pub min_peer_version: i32,
    /// Drop one in `drop_messages_test` messages when nonzero (the
    /// `-dropmessagestest` debugging aid).
    pub drop_messages_test: u32,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self { min_peer_version: crate::protocol::MIN_PEER_PROTO_VERSION, drop_messages_test: 0 }
    }
}

/// What `process_block` style submission did, as seen by the handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitBlockOutcome {
    Accepted,
    /// Parked as an orphan; ask the sender for its history.
    Orphan { orphan_root: Hash256, wanted: Hash256 },
    /// Rejected, with the misbehavior score to charge.
    Rejected { dos: u32 },
}

/// Result of submitting a loose transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitTxOutcome {
    /// Accepted; hashes of any orphan descendants accepted with it.
    Accepted { also_accepted: Vec<Hash256> },
    /// Inputs unknown; parked as an orphan transaction.
    MissingInputs,
    Rejected { dos: u32 },
}

/// The chain-state surface the handlers run against.
pub trait NodeInterface {
    fn best_height(&self) -> i32;
    fn best_hash(&self) -> Hash256;
    fn have_block(&self, hash: &Hash256) -> bool;
    /// Known anywhere: mempool, orphan pool, or chain.
    fn have_tx(&self, hash: &Hash256) -> bool;
    fn get_block(&self, hash: &Hash256) -> Option<Block>;
    fn header_of(&self, hash: &Hash256) -> Option<BlockHeader>;
    /// `(height, next-main-chain-hash)` of an indexed block.
    fn block_link(&self, hash: &Hash256) -> Option<(i32, Hash256)>;
    fn main_chain_hash_at(&self, height: i32) -> Option<Hash256>;
    fn submit_block(&mut self, block: Block) -> SubmitBlockOutcome;
    fn submit_tx(&mut self, tx: Transaction) -> SubmitTxOutcome;
    fn mempool_hashes(&self) -> Vec<Hash256>;
    fn mempool_lookup(&self, hash: &Hash256) -> Option<Transaction>;
    fn known_addresses(&self) -> Vec<Address>;
    fn is_initial_block_download(&mut self) -> bool;
    fn adjusted_time(&self) -> i64;
}

/// Outgoing actions a handler may produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Verack,
    Version(Box<VersionPayload>),
    Addr(Vec<Address>),
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
    GetBlocks { locator: BlockLocator, hash_stop: Hash256 },
    Block(Box<Block>),
    Headers(Vec<BlockHeader>),
    Tx(Box<Transaction>),
    Pong(u64),
    /// Relay an inventory entry to every other connection.
    RelayInv(Inv),
    /// Relay a raw alert payload to every other connection.
    RelayAlert(Vec<u8>),
}

/// Resolve a locator to the best main-chain block it names.
fn locator_fork_point<N: NodeInterface>(node: &N, locator: &BlockLocator) -> Option<(i32, Hash256)> {
    for hash in &locator.have {
        if let Some((height, _)) = node.block_link(hash) {
            // only main-chain entries anchor the walk
            if node.main_chain_hash_at(height) == Some(*hash) {
                return Some((height, *hash));
            }
        }
    }
    None
}

/// Dispatch one message. The first message on a connection must be
/// `version`; anything else costs a point and the connection.
pub fn process_message<N: NodeInterface>(
    peer: &mut PeerState,
    node: &mut N,
    config: &HandlerConfig,
    command: &str,
    payload: &[u8],
) -> Result<Vec<Reply>, NetError> {
    let p = SerialParams::network();
    peer.last_activity = node.adjusted_time();

    // the -dropmessagestest debugging aid randomly swallows messages
    if config.drop_messages_test > 0
        && rand::random::<u32>() % config.drop_messages_test == 0
    {
        debug!(command, "dropping message for test");
        return Ok(vec![]);
    }

    if !peer.has_version() && command != "version" {
        peer.misbehaving(1);
        return Err(NetError::OutOfOrder("expected version first"));
    }

    match command {
        "version" => handle_version(peer, node, config, payload, &p),
        "verack" => {
            peer.got_verack = true;
            Ok(vec![])
        }
        "addr" => handle_addr(peer, payload, &p),
        "inv" => handle_inv(peer, node, payload, &p),
        "getdata" => handle_getdata(peer, node, payload, &p),
        "getblocks" => handle_getblocks(node, payload, &p),
        "getheaders" => handle_getheaders(node, payload, &p),
        "tx" => handle_tx(peer, node, payload, &p),
        "block" => handle_block(peer, node, payload, &p),
        "getaddr" => Ok(vec![Reply::Addr(node.known_addresses())]),
        "mempool" => handle_mempool(peer, node),
        "ping" => {
            let nonce = u64::decode_from_slice(payload, &p)?;
            Ok(vec![Reply::Pong(nonce)])
        }
        "alert" => handle_alert(peer, payload),
        "filterload" => handle_filterload(peer, payload, &p),
        "filteradd" => handle_filteradd(peer, payload),
        "filterclear" => {
            peer.filter = None;
            Ok(vec![])
        }
        other => {
            // unknown commands are ignored for upgrade compatibility
            debug!(command = other, "ignoring unknown message");
            Ok(vec![])
        }
    }
}

fn handle_version<N: NodeInterface>(
    peer: &mut PeerState,
    node: &mut N,
    config: &HandlerConfig,
    payload: &[u8],
    p: &SerialParams,
) -> Result<Vec<Reply>, NetError> {
    if peer.has_version() {
        peer.misbehaving(1);
        return Err(NetError::OutOfOrder("duplicate version"));
    }
    let version = VersionPayload::decode_from_slice(payload, p)?;
    if version.version < config.min_peer_version {
        return Err(NetError::Disconnect("obsolete peer version"));
    }

    peer.version = version.version.min(PROTOCOL_VERSION);
    peer.services = version.services;
    peer.start_height = version.start_height;
    peer.user_agent = version.user_agent.clone();
    info!(
        version = peer.version,
        height = peer.start_height,
        agent = %peer.user_agent,
        "peer connected"
    );

    let mut replies = vec![Reply::Verack];
    // ask one fresh peer for the chain
    if !peer.asked_for_blocks && !node.is_initial_block_download() {
        peer.asked_for_blocks = true;
        let locator = BlockLocator::from_tip(node.best_height(), |height| {
            node.main_chain_hash_at(height)
        });
        replies.push(Reply::GetBlocks { locator, hash_stop: Hash256::ZERO });
    }
    Ok(replies)
}

fn handle_addr(
    peer: &mut PeerState,
    payload: &[u8],
    p: &SerialParams,
) -> Result<Vec<Reply>, NetError> {
    let addresses: Vec<Address> = Vec::decode_from_slice(payload, p)?;
    if addresses.len() > 1000 {
        peer.misbehaving(20);
        return Err(NetError::Disconnect("oversized addr message"));
    }
    // address-manager bookkeeping is the socket layer's concern; the
    // handler only validates
    Ok(vec![])
}

fn handle_inv<N: NodeInterface>(
    peer: &mut PeerState,
    node: &mut N,
    payload: &[u8],
    p: &SerialParams,
) -> Result<Vec<Reply>, NetError> {
    let inventory: Vec<Inv> = Vec::decode_from_slice(payload, p)?;
    if inventory.len() > MAX_INV_SZ {
        peer.misbehaving(20);
        return Err(NetError::Disconnect("oversized inv message"));
    }

    let mut wanted = Vec::new();
    let mut replies = Vec::new();
    let last_block_inv = inventory
        .iter()
        .rev()
        .find(|inv| inv.kind == InvKind::Block)
        .copied();

    for inv in &inventory {
        peer.push_known(inv.hash);
        let already_have = match inv.kind {
            InvKind::Tx => node.have_tx(&inv.hash),
            InvKind::Block => node.have_block(&inv.hash),
        };
        if !already_have {
            wanted.push(*inv);
        } else if inv.kind == InvKind::Block && Some(*inv) == last_block_inv {
            // the tail of an inv bundle answering getblocks: ask for the
            // next batch
            replies.push(Reply::GetBlocks {
                locator: BlockLocator::from_tip(node.best_height(), |height| {
                    node.main_chain_hash_at(height)
                }),
                hash_stop: inv.hash,
            });
        }
    }

    if !wanted.is_empty() {
        replies.push(Reply::GetData(wanted));
    }
    Ok(replies)
}

fn handle_getdata<N: NodeInterface>(
    peer: &mut PeerState,
    node: &mut N,
    payload: &[u8],
    p: &SerialParams,
) -> Result<Vec<Reply>, NetError> {
    let requests: Vec<Inv> = Vec::decode_from_slice(payload, p)?;
    if requests.len() > MAX_INV_SZ {
        peer.misbehaving(20);
        return Err(NetError::Disconnect("oversized getdata message"));
    }

    let mut replies = Vec::new();
    for request in requests {
        match request.kind {
            InvKind::Block => {
                if let Some(block) = node.get_block(&request.hash) {
                    replies.push(Reply::Block(Box::new(block)));
                }
            }
            InvKind::Tx => {
                if let Some(tx) = node.mempool_lookup(&request.hash) {
                    replies.push(Reply::Tx(Box::new(tx)));
                }
            }
        }
    }
    Ok(replies)
}

fn handle_getblocks<N: NodeInterface>(
    node: &mut N,
    payload: &[u8],
    p: &SerialParams,
) -> Result<Vec<Reply>, NetError> {
    let request = GetBlocksPayload::decode_from_slice(payload, p)?;
    let start = locator_fork_point(node, &request.locator);
    debug!(
        from = start.map(|(h, _)| h).unwrap_or(-1),
        stop = %request.hash_stop,
        "getblocks"
    );

    let mut inventory = Vec::new();
    let mut cursor = match start {
        Some((_, hash)) => node.block_link(&hash).map(|(_, next)| next),
        None => node.main_chain_hash_at(0),
    };
    while let Some(hash) = cursor {
        if hash.is_zero() {
            break;
        }
        if hash == request.hash_stop {
            break;
        }
        inventory.push(Inv::block(hash));
        if inventory.len() >= GETBLOCKS_LIMIT {
            // the peer continues with another getblocks from here
            break;
        }
        cursor = node.block_link(&hash).map(|(_, next)| next);
    }

    Ok(if inventory.is_empty() { vec![] } else { vec![Reply::Inv(inventory)] })
}

fn handle_getheaders<N: NodeInterface>(
    node: &mut N,
    payload: &[u8],
    p: &SerialParams,
) -> Result<Vec<Reply>, NetError> {
    let request = GetBlocksPayload::decode_from_slice(payload, p)?;

    let mut cursor = if request.locator.have.is_empty() {
        // a bare stop hash asks for that single header
        node.block_link(&request.hash_stop).map(|_| request.hash_stop)
    } else {
        match locator_fork_point(node, &request.locator) {
            Some((_, hash)) => node.block_link(&hash).map(|(_, next)| next),
            None => node.main_chain_hash_at(0),
        }
    };

    let mut headers = Vec::new();
    while let Some(hash) = cursor {
        if hash.is_zero() {
            break;
        }
        if let Some(header) = node.header_of(&hash) {
            headers.push(header);
        }
        if headers.len() >= GETHEADERS_LIMIT || hash == request.hash_stop {
            break;
        }
        cursor = node.block_link(&hash).map(|(_, next)| next);
    }

    Ok(vec![Reply::Headers(headers)])
}

fn handle_tx<N: NodeInterface>(
    peer: &mut PeerState,
    node: &mut N,
    payload: &[u8],
    p: &SerialParams,
) -> Result<Vec<Reply>, NetError> {
    let tx = Transaction::decode_from_slice(payload, p)?;
    let hash = tx.hash();
    peer.push_known(hash);

    match node.submit_tx(tx) {
        SubmitTxOutcome::Accepted { also_accepted } => {
            let mut replies = vec![Reply::RelayInv(Inv::tx(hash))];
            for accepted in also_accepted {
                replies.push(Reply::RelayInv(Inv::tx(accepted)));
            }
            Ok(replies)
        }
        SubmitTxOutcome::MissingInputs => Ok(vec![]),
        SubmitTxOutcome::Rejected { dos } => {
            if peer.misbehaving(dos) {
                return Err(NetError::Disconnect("banned for invalid transaction"));
            }
            Ok(vec![])
        }
    }
}

fn handle_block<N: NodeInterface>(
    peer: &mut PeerState,
    node: &mut N,
    payload: &[u8],
    p: &SerialParams,
) -> Result<Vec<Reply>, NetError> {
    let block = Block::decode_from_slice(payload, p)?;
    let hash = block.hash();
    debug!(block = %hash, "received block");
    peer.push_known(hash);

    match node.submit_block(block) {
        SubmitBlockOutcome::Accepted => Ok(vec![Reply::RelayInv(Inv::block(hash))]),
        SubmitBlockOutcome::Orphan { orphan_root, wanted } => {
            // fill the gap: walk toward the orphan root, and fetch the
            // missing ancestor directly in case getblocks cannot reach it
            let locator = BlockLocator::from_tip(node.best_height(), |height| {
                node.main_chain_hash_at(height)
            });
            Ok(vec![
                Reply::GetBlocks { locator, hash_stop: orphan_root },
                Reply::GetData(vec![Inv::block(wanted)]),
            ])
        }
        SubmitBlockOutcome::Rejected { dos } => {
            if peer.misbehaving(dos) {
                return Err(NetError::Disconnect("banned for invalid block"));
            }
            Ok(vec![])
        }
    }
}

fn handle_mempool<N: NodeInterface>(
    peer: &mut PeerState,
    node: &mut N,
) -> Result<Vec<Reply>, NetError> {
    let mut inventory = Vec::new();
    for hash in node.mempool_hashes() {
        let matches = match &mut peer.filter {
            Some(filter) => node
                .mempool_lookup(&hash)
                .is_some_and(|tx| filter.is_relevant_and_update(&tx, &hash)),
            None => true,
        };
        if matches {
            inventory.push(Inv::tx(hash));
        }
        if inventory.len() >= MAX_INV_SZ {
            break;
        }
    }
    Ok(if inventory.is_empty() { vec![] } else { vec![Reply::Inv(inventory)] })
}

fn handle_alert(peer: &mut PeerState, payload: &[u8]) -> Result<Vec<Reply>, NetError> {
    if payload.is_empty() || payload.len() > MAX_ALERT_SIZE {
        // an unverifiable alert is a mild offense
        peer.misbehaving(10);
        return Ok(vec![]);
    }
    warn!(bytes = payload.len(), "relaying alert");
    Ok(vec![Reply::RelayAlert(payload.to_vec())])
}

fn handle_filterload(
    peer: &mut PeerState,
    payload: &[u8],
    p: &SerialParams,
) -> Result<Vec<Reply>, NetError> {
    let mut cursor = payload;
    let data = halcyon_core::serialize::read_var_bytes(&mut cursor)?;
    let hash_funcs = u32::decode(&mut cursor, p)?;
    let tweak = u32::decode(&mut cursor, p)?;

    match BloomFilter::from_parts(data, hash_funcs, tweak) {
        Some(filter) => {
            peer.filter = Some(filter);
            Ok(vec![])
        }
        None => {
            peer.misbehaving(100);
            Err(NetError::Disconnect("invalid filterload"))
        }
    }
}

fn handle_filteradd(peer: &mut PeerState, payload: &[u8]) -> Result<Vec<Reply>, NetError> {
    let mut cursor = payload;
    let data = halcyon_core::serialize::read_var_bytes(&mut cursor)?;
    if data.len() > MAX_FILTER_ELEMENT_SIZE {
        peer.misbehaving(100);
        return Err(NetError::Disconnect("oversized filter element"));
    }
    match &mut peer.filter {
        Some(filter) => {
            filter.insert(&data);
            Ok(vec![])
        }
        None => {
            peer.misbehaving(100);
            Err(NetError::Disconnect("filteradd without filterload"))
        }
    }
}
