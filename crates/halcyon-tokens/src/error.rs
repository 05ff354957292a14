//! Token overlay errors.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("script carries no token marker")] NotTokenScript,
    #[error("unsupported marker protocol {0}")] UnsupportedProtocol(u8),
    #[error("unknown token script type {0:#04x}")] UnknownType(u8),
    #[error("truncated token payload")] Truncated,
    #[error("invalid token symbol {0:?}")] InvalidSymbol(String),
    #[error("zero-amount instruction")] ZeroAmount,
    #[error("instruction targets missing output {0}")] OutputIndexOutOfRange(u8),
    #[error("transaction has no inputs to derive a token id from")] NoInputs,
    #[error("more than one marker output")] MultipleMarkers,
    #[error("instructions move {wanted} but inputs carry {available}")]
    InsufficientTokenInputs { available: u64, wanted: u64 },
    #[error("issuance amount overflows")] AmountOverflow,
    #[error("token symbol {0} already issued")] SymbolTaken(String),
    #[error("input token data missing for {0}")] MissingInputTokenData(String),
    #[error("leftover tokens have no change output")] NoChangeOutput,
}
