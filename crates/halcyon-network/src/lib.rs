//! # halcyon-network
//! The peer-to-peer protocol: message framing, payload types, bloom
//! filters, per-peer state, and the message handlers. Socket I/O lives
//! outside; handlers are pure functions from `(peer, payload, node)` to
//! reply actions.

pub mod bloom;
pub mod error;
pub mod handlers;
pub mod message;
pub mod peer;
pub mod protocol;

pub use error::NetError;
pub use handlers::{HandlerConfig, NodeInterface, Reply, SubmitBlockOutcome, SubmitTxOutcome};
pub use message::MessageHeader;
pub use peer::PeerState;
