//! # halcyon-tokens
//! The colored-coin overlay: token issuance, transfer, and burn records
//! carried in `OP_RETURN` marker outputs of ordinary transactions.

pub mod error;
pub mod script;
pub mod transaction;

pub use error::TokenError;
pub use script::{TokenScript, TransferInstruction, token_id_for_issuance};
pub use transaction::{TokenAmount, TokenTransaction, TokenTxType};
