//! Network-layer errors.
use thiserror::Error;

use halcyon_core::error::CodecError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("malformed payload: {0}")] Malformed(CodecError),
    #[error("bad message header: {0}")] BadHeader(&'static str),
    #[error("checksum mismatch")] ChecksumMismatch,
    #[error("oversized message: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("message out of order: {0}")] OutOfOrder(&'static str),
    #[error("peer must be disconnected: {0}")] Disconnect(&'static str),
}

impl From<CodecError> for NetError {
    fn from(e: CodecError) -> Self {
        NetError::Malformed(e)
    }
}
