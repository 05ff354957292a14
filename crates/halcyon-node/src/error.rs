//! Node-level error types.
use thiserror::Error;

use halcyon_core::error::{BlockValidationError, CodecError, TxValidationError};
use halcyon_tokens::TokenError;

use crate::fork_simulator::ViuError;

/// Storage failures. A failed batch is dropped whole; the store never
/// applies a partial write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("storage engine: {0}")] Engine(String),
    #[error("record decode failed: {0}")] Decode(CodecError),
    #[error("write attempted on a read-only handle")] ReadOnly,
    #[error("no transaction is active")] NoActiveTransaction,
    #[error("a transaction is already active")] TransactionActive,
    #[error("environment shutting down")] ShuttingDown,
}

impl From<CodecError> for DbError {
    fn from(e: CodecError) -> Self {
        DbError::Decode(e)
    }
}

/// Umbrella error for node operations.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)] Db(#[from] DbError),
    #[error(transparent)] Tx(#[from] TxValidationError),
    #[error(transparent)] Block(#[from] BlockValidationError),
    #[error(transparent)] Viu(#[from] ViuError),
    #[error(transparent)] Token(#[from] TokenError),
    #[error(transparent)] Codec(#[from] CodecError),
}
