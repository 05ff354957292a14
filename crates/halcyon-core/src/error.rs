//! Error types for the Halcyon consensus core.
use thiserror::Error;

/// Serialization failures. Never DoS-scored by themselves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("integer overflow while encoding length {0}")] Overflow(u64),
    #[error("unexpected end of input")] Truncated,
    #[error("declared size {size} exceeds limit {max}")] Oversize { size: u64, max: u64 },
    #[error("invalid tag byte {0:#04x}")] InvalidTag(u8),
    #[error("io: {0}")] Io(String),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io(e.to_string())
        }
    }
}

/// Script parsing and execution failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("truncated push in script")] TruncatedPush,
    #[error("unknown opcode {0:#04x}")] UnknownOpcode(u8),
    #[error("script is not push-only")] NotPushOnly,
    #[error("stack underflow")] StackUnderflow,
    #[error("signature encoding invalid")] BadSignatureEncoding,
    #[error("public key encoding invalid")] BadPubkeyEncoding,
    #[error("signature check failed")] VerifyFailed,
    #[error("script evaluated to false")] EvalFalse,
    #[error("redeem script rejected")] BadRedeemScript,
}

/// Why a loose transaction was rejected. `dos` is the misbehavior score
/// charged to the relaying peer (0 for policy-only rejections).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxValidationError {
    #[error("empty vin")] EmptyVin,
    #[error("empty vout")] EmptyVout,
    #[error("size limits failed")] Oversized,
    #[error("txout value negative")] NegativeValue,
    #[error("txout value too high")] ValueTooHigh,
    #[error("txout total out of range")] ValueOutOfRange,
    #[error("empty txout in user transaction")] EmptyUserTxOut,
    #[error("duplicate inputs")] DuplicateInputs,
    #[error("coinbase script size invalid")] BadCoinbaseScriptLen,
    #[error("prevout is null")] NullPrevout,
    #[error("coinbase as individual tx")] CoinbaseAsLooseTx,
    #[error("coinstake as individual tx")] CoinstakeAsLooseTx,
    #[error("nonstandard transaction: {0}")] NonStandard(&'static str),
    #[error("not final")] NotFinal,
    #[error("already in mempool")] AlreadyInPool,
    #[error("already in chain")] AlreadyOnChain,
    #[error("conflicts with mempool transaction")] Conflict,
    #[error("inputs missing")] MissingInputs,
    #[error("inputs invalid")] InvalidInputs,
    #[error("nonstandard transaction input")] NonStandardInput,
    #[error("not enough fees: paid {paid}, required {required}")] InsufficientFee { paid: i64, required: i64 },
    #[error("free transaction rejected by rate limiter")] RateLimited,
    #[error("prevout out of range")] PrevoutOutOfRange,
    #[error("tried to spend immature {0} output")] PrematureSpend(&'static str),
    #[error("timestamp earlier than input transaction")] TimeEarlierThanInput,
    #[error("input values out of range")] InputValueOutOfRange,
    #[error("value in below value out")] ValueInBelowOut,
    #[error("prev output already spent")] AlreadySpent,
    #[error("script verification failed: {0}")] ScriptFailed(ScriptError),
    #[error("token overlay rejected transaction: {0}")] Token(String),
}

impl TxValidationError {
    /// Misbehavior score this rejection charges to the sending peer.
    pub fn dos_score(&self) -> u32 {
        use TxValidationError::*;
        match self {
            EmptyVin | EmptyVout | NullPrevout => 10,
            Oversized | NegativeValue | ValueTooHigh | ValueOutOfRange | EmptyUserTxOut
            | BadCoinbaseScriptLen | CoinbaseAsLooseTx | CoinstakeAsLooseTx | InvalidInputs
            | PrevoutOutOfRange | TimeEarlierThanInput | InputValueOutOfRange | ValueInBelowOut => 100,
            ScriptFailed(_) => 100,
            _ => 0,
        }
    }
}

/// Why a block was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockValidationError {
    #[error("size limits failed")] Oversized,
    #[error("block timestamp too far in the future")] TimeFuture,
    #[error("first tx is not coinbase")] FirstTxNotCoinbase,
    #[error("more than one coinbase")] MultipleCoinbase,
    #[error("coinstake in wrong position")] CoinstakeWrongPosition,
    #[error("coinbase timestamp is too early")] CoinbaseTimeEarly,
    #[error("coinstake timestamp violation")] CoinstakeTimeViolation,
    #[error("coinbase pays out in a proof-of-stake block")] CoinbasePaysInStakeBlock,
    #[error("transaction timestamp after block timestamp")] TxTimeAfterBlock,
    #[error("duplicate transaction in block")] DuplicateTx,
    #[error("transaction {index} invalid: {source}")] Tx { index: usize, source: TxValidationError },
    #[error("hashMerkleRoot mismatch")] MerkleRootMismatch,
    #[error("too many sigops")] TooManySigops,
    #[error("proof of work failed")] ProofOfWorkFailed,
    #[error("block signature verification failed")] BadBlockSignature,
    #[error("duplicate transaction overwrite (BIP30)")] Bip30Duplicate,
    #[error("coinbase reward exceeded: actual {actual}, allowed {allowed}")] CoinbaseRewardTooHigh { actual: i64, allowed: i64 },
    #[error("coinstake pays too much: actual {actual}, allowed {allowed}")] StakeRewardTooHigh { actual: i64, allowed: i64 },
    #[error("previous block not found")] MissingPrev,
    #[error("previous block index invalid")] InvalidPrev,
    #[error("block with too little proof below checkpoint")] Checkpoint,
    #[error("duplicate proof of stake")] DuplicateStake,
    #[error("incorrect difficulty target")] BadTarget,
    #[error("already have block")] Duplicate,
    #[error("block was previously found invalid")] CachedInvalid,
    #[error("coin age lookup failed for coinstake")] CoinAgeUnavailable,
    #[error("storage error: {0}")] Db(String),
}

impl BlockValidationError {
    /// Misbehavior score this rejection charges to the sending peer.
    pub fn dos_score(&self) -> u32 {
        use BlockValidationError::*;
        match self {
            Oversized | FirstTxNotCoinbase | MultipleCoinbase | CoinstakeWrongPosition
            | MerkleRootMismatch | TooManySigops | BadBlockSignature | StakeRewardTooHigh { .. }
            | Checkpoint | CoinbasePaysInStakeBlock | DuplicateTx => 100,
            TimeFuture | CoinbaseTimeEarly | CoinstakeTimeViolation | ProofOfWorkFailed
            | CoinbaseRewardTooHigh { .. } | BadTarget => 50,
            Tx { source, .. } => source.dos_score(),
            _ => 0,
        }
    }
}
