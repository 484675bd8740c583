//! Normalization of transaction send errors across RPC server implementations.
//!
//! Every client family phrases the same failure differently ("nonce too low",
//! "OldNonce", "Pool(Stale)", ...). The tables below map each [`SendErrorKind`] to the
//! patterns a given client is known to emit. Patterns are compiled once, on first use,
//! and matched case-insensitively.
//!
//! On top of the kinds, [`SendTxReturnCode`] folds a send outcome into the action a
//! broadcaster should take, and [`aggregate_tx_results`] reduces the replies of many
//! endpoints into a single answer.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::{Regex, RegexBuilder};
use thiserror::Error;

use super::errors::NodeError;

/// Normalized category of a send error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SendErrorKind {
    NonceTooLow,
    NonceTooHigh,
    ReplacementTransactionUnderpriced,
    LimitReached,
    TransactionAlreadyInMempool,
    TerminallyUnderpriced,
    InsufficientEth,
    TxFeeExceedsCap,
    L2FeeTooLow,
    L2FeeTooHigh,
    L2Full,
    TransactionAlreadyMined,
    Fatal,
    ServiceUnavailable,
    TerminallyStuck,
}

impl SendErrorKind {
    /// Order in which kinds are tried by [`classify`]. Fatal wins over everything.
    pub const PRECEDENCE: [Self; 15] = [
        Self::Fatal,
        Self::NonceTooLow,
        Self::TransactionAlreadyMined,
        Self::NonceTooHigh,
        Self::ReplacementTransactionUnderpriced,
        Self::TransactionAlreadyInMempool,
        Self::TerminallyUnderpriced,
        Self::InsufficientEth,
        Self::TxFeeExceedsCap,
        Self::L2FeeTooLow,
        Self::L2FeeTooHigh,
        Self::L2Full,
        Self::LimitReached,
        Self::TerminallyStuck,
        Self::ServiceUnavailable,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonceTooLow => "nonce_too_low",
            Self::NonceTooHigh => "nonce_too_high",
            Self::ReplacementTransactionUnderpriced => "replacement_underpriced",
            Self::LimitReached => "limit_reached",
            Self::TransactionAlreadyInMempool => "already_in_mempool",
            Self::TerminallyUnderpriced => "terminally_underpriced",
            Self::InsufficientEth => "insufficient_eth",
            Self::TxFeeExceedsCap => "tx_fee_exceeds_cap",
            Self::L2FeeTooLow => "l2_fee_too_low",
            Self::L2FeeTooHigh => "l2_fee_too_high",
            Self::L2Full => "l2_full",
            Self::TransactionAlreadyMined => "already_mined",
            Self::Fatal => "fatal",
            Self::ServiceUnavailable => "service_unavailable",
            Self::TerminallyStuck => "terminally_stuck",
        }
    }
}

type Table = &'static [(SendErrorKind, &'static str)];

const GETH_FATAL: &str = r"(: |^)(exceeds block gas limit|invalid sender|negative value|oversized data|gas uint64 overflow|intrinsic gas too low)$";

const PARITY: Table = &[
    (SendErrorKind::NonceTooLow, r"^Transaction nonce is too low\. Try incrementing the nonce\."),
    (
        SendErrorKind::ReplacementTransactionUnderpriced,
        r"^Transaction gas price .+is too low\. There is another transaction with same nonce in the queue",
    ),
    (
        SendErrorKind::LimitReached,
        r"There are too many transactions in the queue\. Your transaction was dropped due to limit\. Try increasing the fee\.",
    ),
    (
        SendErrorKind::TransactionAlreadyInMempool,
        r"Transaction with the same hash was already imported\.",
    ),
    (
        SendErrorKind::TerminallyUnderpriced,
        r"^Transaction gas price is too low\. It does not satisfy your node's minimal gas price",
    ),
    (
        SendErrorKind::InsufficientEth,
        r"^(Insufficient funds\. The account you tried to send transaction from does not have enough funds\.|Insufficient balance for transaction\.)",
    ),
    (
        SendErrorKind::Fatal,
        r"^Transaction gas is too low\. There is not enough gas to cover minimal cost of the transaction|^Transaction cost exceeds current gas limit\. Limit:|^Invalid signature|Recipient is banned in local queue\.|Supplied gas is beyond limit|Sender is banned in local queue|Code is banned in local queue|Transaction is not permitted|Transaction is too big, see chain specification for the limit|^Invalid RLP data",
    ),
];

const GETH: Table = &[
    (SendErrorKind::NonceTooLow, r"(: |^)nonce too low"),
    (SendErrorKind::NonceTooHigh, r"(: |^)nonce too high"),
    (SendErrorKind::ReplacementTransactionUnderpriced, r"(: |^)replacement transaction underpriced$"),
    (SendErrorKind::TransactionAlreadyInMempool, r"(: |^)(known transaction|already known)"),
    (SendErrorKind::TerminallyUnderpriced, r"(: |^)transaction underpriced$"),
    (
        SendErrorKind::InsufficientEth,
        r"(: |^)(insufficient funds for transfer|insufficient funds for gas \* price \+ value|insufficient balance for transfer)$",
    ),
    (
        SendErrorKind::TxFeeExceedsCap,
        r"(: |^)tx fee \([0-9\.]+ [a-zA-Z]+\) exceeds the configured cap \([0-9\.]+ [a-zA-Z]+\)$",
    ),
    (SendErrorKind::Fatal, GETH_FATAL),
];

const ARBITRUM: Table = &[
    (SendErrorKind::NonceTooLow, r"(: |^)invalid transaction nonce$|(: |^)nonce too low(:|$)"),
    (SendErrorKind::NonceTooHigh, r"(: |^)nonce too high(:|$)"),
    (SendErrorKind::TerminallyUnderpriced, r"(: |^)gas price too low$"),
    (
        SendErrorKind::InsufficientEth,
        r"(: |^)(not enough funds for gas|insufficient funds for gas \* price \+ value)",
    ),
    (
        SendErrorKind::Fatal,
        r"(: |^)(invalid message format|forbidden sender address)$|(: |^)(execution reverted)(:|$)",
    ),
    (SendErrorKind::L2FeeTooLow, r"(: |^)max fee per gas less than block base fee(:|$)"),
    (
        SendErrorKind::L2Full,
        r"(: |^)(queue full|sequencer pending tx pool full, please try again)(:|$)",
    ),
    (
        SendErrorKind::ServiceUnavailable,
        r"(: |^)502 Bad Gateway: [\s\S]*$|network is unreachable|i/o timeout",
    ),
];

const METIS: Table = &[(
    SendErrorKind::L2FeeTooLow,
    r"(: |^)gas price too low: \d+ wei, use at least tx\.gasPrice = \d+ wei$",
)];

const SUBSTRATE: Table = &[
    (SendErrorKind::NonceTooLow, r"(: |^)Pool\(Stale\)$"),
    (SendErrorKind::TransactionAlreadyInMempool, r"(: |^)(Pool\(AlreadyImported\)|already known)$"),
];

const AVALANCHE: Table = &[(
    SendErrorKind::NonceTooLow,
    r"(: |^)nonce too low: address 0x[0-9a-fA-F]{40} current nonce \([\d]+\) > tx nonce \([\d]+\)$",
)];

const NETHERMIND: Table = &[
    (SendErrorKind::NonceTooLow, r"(: |^)OldNonce(, Current nonce: \d+, nonce of rejected tx: \d+)?$"),
    (SendErrorKind::NonceTooHigh, r"(: |^)NonceGap(, Future nonce\. Expected nonce: \d+)?$"),
    (SendErrorKind::TransactionAlreadyInMempool, r"(: |^)(AlreadyKnown|OwnNonceAlreadyUsed)$"),
    (
        SendErrorKind::InsufficientEth,
        r"(: |^)InsufficientFunds(, Account balance: \d+, cumulative cost: \d+|, Balance is \d+ less than sending value \+ gas \d+)?$",
    ),
    (SendErrorKind::ServiceUnavailable, r"(: |^)503 Service Unavailable: [\s\S]*$"),
    (
        SendErrorKind::Fatal,
        r"(: |^)(SenderIsContract|Invalid(, transaction Hash is null)?|Int256Overflow|FailedToResolveSender|GasLimitExceeded(, Gas limit: \d+, gas limit of rejected tx: \d+)?)$",
    ),
];

const HARMONY: Table = &[(SendErrorKind::Fatal, r"(: |^)(invalid shard)$")];

const BESU: Table = &[
    (SendErrorKind::NonceTooLow, r"^Nonce too low$"),
    (SendErrorKind::ReplacementTransactionUnderpriced, r"^Replacement transaction underpriced$"),
    (SendErrorKind::TransactionAlreadyInMempool, r"^Known transaction$"),
    (SendErrorKind::TerminallyUnderpriced, r"^Gas price below configured minimum gas price$"),
    (SendErrorKind::InsufficientEth, r"^Upfront cost exceeds account balance$"),
    (SendErrorKind::TxFeeExceedsCap, r"^Transaction fee cap exceeded$"),
    (
        SendErrorKind::Fatal,
        r"^(Intrinsic gas exceeds gas limit|Transaction gas limit exceeds block gas limit|Invalid signature)$",
    ),
];

const ERIGON: Table = &[
    (SendErrorKind::NonceTooLow, r"(: |^)nonce too low$"),
    (SendErrorKind::NonceTooHigh, r"(: |^)nonce too high$"),
    (SendErrorKind::ReplacementTransactionUnderpriced, r"(: |^)replacement transaction underpriced$"),
    (SendErrorKind::TransactionAlreadyInMempool, r"(: |^)(block already known|already known)"),
    (SendErrorKind::TerminallyUnderpriced, r"(: |^)underpriced$"),
    (
        SendErrorKind::InsufficientEth,
        r"(: |^)(insufficient funds for transfer|insufficient funds for gas \* price \+ value|insufficient balance for transfer)$",
    ),
    (
        SendErrorKind::TxFeeExceedsCap,
        r"(: |^)tx fee \([0-9\.]+ [a-zA-Z]+\) exceeds the configured cap \([0-9\.]+ [a-zA-Z]+\)$",
    ),
    (SendErrorKind::Fatal, GETH_FATAL),
];

const KLAYTN: Table = &[
    (SendErrorKind::NonceTooLow, r"(: |^)nonce too low$"),
    (SendErrorKind::ReplacementTransactionUnderpriced, r"(: |^)replacement transaction underpriced$"),
    (SendErrorKind::TransactionAlreadyInMempool, r"(: |^)(known transaction)"),
    (
        SendErrorKind::TerminallyUnderpriced,
        r"(: |^)(transaction underpriced|there is another tx which has the same nonce in the tx pool)$",
    ),
    (SendErrorKind::InsufficientEth, r"(: |^)insufficient funds"),
    (SendErrorKind::TxFeeExceedsCap, r"(: |^)(invalid gas fee cap|invalid gas tip cap)"),
    (SendErrorKind::Fatal, GETH_FATAL),
];

const OPTIMISM: Table = &[
    (
        SendErrorKind::L2FeeTooLow,
        r"(: |^)fee too low: \d+, use at least tx\.gasLimit = \d+ and tx\.gasPrice = \d+$",
    ),
    (SendErrorKind::L2FeeTooHigh, r"(: |^)fee too high: \d+, use less than \d+ \* [0-9\.]+$"),
    (
        SendErrorKind::Fatal,
        r"(: |^)transaction rejected: bad nonce, wrong chain id or signature invalid",
    ),
];

const ZKSYNC: Table = &[
    (SendErrorKind::NonceTooLow, r"(?:: |^)nonce too low\..+actual: \d*$"),
    (SendErrorKind::NonceTooHigh, r"(?:: |^)nonce too high\..+actual: \d*$"),
    (
        SendErrorKind::TerminallyUnderpriced,
        r"(?:: |^)(max fee per gas less than block base fee|virtual machine entered unexpected state\. please contact developers and provide transaction details that caused this error\. Error description: The operator included transaction with an unacceptable gas price)$",
    ),
    (
        SendErrorKind::InsufficientEth,
        r"(?:: |^)(?:insufficient balance for transfer$|insufficient funds for gas \+ value)",
    ),
    (SendErrorKind::TxFeeExceedsCap, r"(?:: |^)max priority fee per gas higher than max fee per gas$"),
    (
        SendErrorKind::Fatal,
        r"(?:: |^)(?:exceeds block gas limit|intrinsic gas too low|Not enough gas for transaction validation|Failed to pay the fee to the operator|Error function_selector = 0x, data = 0x|invalid sender\. can't start a transaction from a non-account|max(?: priority)? fee per (?:gas|pubdata byte) higher than 2\^64-1|oversized data\. max: \d+; actual: \d+)$",
    ),
    (
        SendErrorKind::TransactionAlreadyInMempool,
        r"known transaction\. transaction with hash .* is already in the system",
    ),
];

const CELO: Table = &[
    (
        SendErrorKind::TxFeeExceedsCap,
        r"(: |^)tx fee \([0-9\.]+ of currency celo\) exceeds the configured cap \([0-9\.]+ [a-zA-Z]+\)$",
    ),
    (SendErrorKind::TerminallyUnderpriced, r"(: |^)gasprice is less than gas price minimum floor"),
    (
        SendErrorKind::InsufficientEth,
        r"(: |^)insufficient funds for gas \* price \+ value \+ gatewayFee$",
    ),
];

const MANTLE: Table = &[
    (SendErrorKind::InsufficientEth, r"(: |^)'*insufficient funds for gas \* price \+ value"),
    (SendErrorKind::Fatal, r"(: |^)'*invalid sender"),
    (SendErrorKind::NonceTooLow, r"(: |^)'*nonce too low"),
];

const GNOSIS: Table = &[(SendErrorKind::TransactionAlreadyInMempool, r"(: |^)(alreadyknown)")];

const ZKEVM: Table = &[
    (
        SendErrorKind::TerminallyStuck,
        r"(?:: |^)not enough .* counters to continue the execution$",
    ),
    (SendErrorKind::TransactionAlreadyMined, r"(: |^)transaction already finalized"),
];

const CLIENT_TABLES: &[(&str, Table)] = &[
    ("parity", PARITY),
    ("geth", GETH),
    ("arbitrum", ARBITRUM),
    ("metis", METIS),
    ("substrate", SUBSTRATE),
    ("avalanche", AVALANCHE),
    ("nethermind", NETHERMIND),
    ("harmony", HARMONY),
    ("besu", BESU),
    ("erigon", ERIGON),
    ("klaytn", KLAYTN),
    ("optimism", OPTIMISM),
    ("zksync", ZKSYNC),
    ("celo", CELO),
    ("mantle", MANTLE),
    ("gnosis", GNOSIS),
    ("zkevm", ZKEVM),
];

struct CompiledClient {
    entries: Vec<(SendErrorKind, Regex)>,
}

static COMPILED: LazyLock<Vec<CompiledClient>> = LazyLock::new(|| {
    CLIENT_TABLES
        .iter()
        .map(|(client, table)| CompiledClient {
            entries: table
                .iter()
                .filter_map(|(kind, pattern)| {
                    match RegexBuilder::new(pattern).case_insensitive(true).build() {
                        Ok(re) => Some((*kind, re)),
                        Err(e) => {
                            tracing::error!(client, kind = kind.as_str(), error = %e, "invalid send error pattern");
                            None
                        }
                    }
                })
                .collect(),
        })
        .collect()
});

/// Returns `true` if any client table maps `message` to `kind`.
#[must_use]
pub fn matches_kind(message: &str, kind: SendErrorKind) -> bool {
    COMPILED.iter().any(|client| {
        client.entries.iter().any(|(k, re)| *k == kind && re.is_match(message))
    })
}

/// Maps a raw error message to its kind, trying kinds in [`SendErrorKind::PRECEDENCE`].
#[must_use]
pub fn classify(message: &str) -> Option<SendErrorKind> {
    SendErrorKind::PRECEDENCE.into_iter().find(|kind| matches_kind(message, *kind))
}

/// Returns `true` if any client considers `message` a permanent rejection.
#[must_use]
pub fn is_fatal(message: &str) -> bool {
    matches_kind(message, SendErrorKind::Fatal)
}

/// A send error with its classification inputs.
///
/// `fatal` is computed once when the error is built; the finer-grained kind is
/// recomputed on demand.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SendError {
    message: String,
    fatal: bool,
    timeout: bool,
}

impl SendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let fatal = is_fatal(&message);
        Self { message, fatal, timeout: false }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn fatal(&self) -> bool {
        self.fatal
    }

    /// `true` only when the error was built from an elapsed deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.timeout
    }

    #[must_use]
    pub fn kind(&self) -> Option<SendErrorKind> {
        if self.fatal {
            return Some(SendErrorKind::Fatal);
        }
        classify(&self.message)
    }

    #[must_use]
    pub fn is(&self, kind: SendErrorKind) -> bool {
        match kind {
            SendErrorKind::Fatal => self.fatal,
            other => matches_kind(&self.message, other),
        }
    }

    #[must_use]
    pub fn is_nonce_too_low_error(&self) -> bool {
        self.is(SendErrorKind::NonceTooLow)
    }

    #[must_use]
    pub fn is_nonce_too_high_error(&self) -> bool {
        self.is(SendErrorKind::NonceTooHigh)
    }

    #[must_use]
    pub fn is_replacement_underpriced(&self) -> bool {
        self.is(SendErrorKind::ReplacementTransactionUnderpriced)
    }

    #[must_use]
    pub fn is_transaction_already_in_mempool(&self) -> bool {
        self.is(SendErrorKind::TransactionAlreadyInMempool)
    }

    #[must_use]
    pub fn is_transaction_already_mined(&self) -> bool {
        self.is(SendErrorKind::TransactionAlreadyMined)
    }

    #[must_use]
    pub fn is_terminally_underpriced(&self) -> bool {
        self.is(SendErrorKind::TerminallyUnderpriced)
    }

    #[must_use]
    pub fn is_insufficient_eth(&self) -> bool {
        self.is(SendErrorKind::InsufficientEth)
    }

    #[must_use]
    pub fn is_tx_fee_exceeds_cap(&self) -> bool {
        self.is(SendErrorKind::TxFeeExceedsCap)
    }

    #[must_use]
    pub fn is_l2_fee_too_low(&self) -> bool {
        self.is(SendErrorKind::L2FeeTooLow)
    }

    #[must_use]
    pub fn is_l2_fee_too_high(&self) -> bool {
        self.is(SendErrorKind::L2FeeTooHigh)
    }

    #[must_use]
    pub fn is_l2_full(&self) -> bool {
        self.is(SendErrorKind::L2Full)
    }

    #[must_use]
    pub fn is_temporarily_underpriced(&self) -> bool {
        self.is(SendErrorKind::LimitReached)
    }

    #[must_use]
    pub fn is_service_unavailable(&self) -> bool {
        self.is(SendErrorKind::ServiceUnavailable)
    }

    #[must_use]
    pub fn is_terminally_stuck(&self) -> bool {
        self.is(SendErrorKind::TerminallyStuck)
    }

    /// `true` when the endpoint already has (or has mined) this transaction.
    #[must_use]
    pub fn is_already_known(&self) -> bool {
        self.is_transaction_already_in_mempool() || self.is_transaction_already_mined()
    }
}

impl From<&NodeError> for SendError {
    fn from(err: &NodeError) -> Self {
        let mut send_err = Self::new(err.raw_message());
        send_err.timeout = err.is_timeout();
        send_err
    }
}

impl From<NodeError> for SendError {
    fn from(err: NodeError) -> Self {
        Self::from(&err)
    }
}

/// What a broadcaster should do with a send outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SendTxReturnCode {
    Successful,
    Fatal,
    Retryable,
    Underpriced,
    Unknown,
    Unsupported,
    TransactionAlreadyKnown,
    InsufficientFunds,
    ExceedsMaxFee,
    FeeOutOfValidRange,
    TerminallyStuck,
}

impl SendTxReturnCode {
    /// Codes that indicate the transaction will never be accepted as sent.
    pub const SEVERE: [Self; 6] = [
        Self::Fatal,
        Self::Underpriced,
        Self::Unsupported,
        Self::ExceedsMaxFee,
        Self::FeeOutOfValidRange,
        Self::Unknown,
    ];

    /// Codes that mean at least one endpoint holds the transaction.
    pub const SUCCESS: [Self; 2] = [Self::Successful, Self::TransactionAlreadyKnown];

    #[must_use]
    pub fn is_severe(&self) -> bool {
        Self::SEVERE.contains(self)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        Self::SUCCESS.contains(self)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Successful => "successful",
            Self::Fatal => "fatal",
            Self::Retryable => "retryable",
            Self::Underpriced => "underpriced",
            Self::Unknown => "unknown",
            Self::Unsupported => "unsupported",
            Self::TransactionAlreadyKnown => "already_known",
            Self::InsufficientFunds => "insufficient_funds",
            Self::ExceedsMaxFee => "exceeds_max_fee",
            Self::FeeOutOfValidRange => "fee_out_of_valid_range",
            Self::TerminallyStuck => "terminally_stuck",
        }
    }
}

/// Folds a send outcome into a [`SendTxReturnCode`].
#[must_use]
pub fn classify_send_error(outcome: Result<(), &SendError>) -> SendTxReturnCode {
    let Err(err) = outcome else {
        return SendTxReturnCode::Successful;
    };
    if err.fatal() {
        return SendTxReturnCode::Fatal;
    }
    if err.is_timeout() {
        return SendTxReturnCode::Retryable;
    }
    match err.kind() {
        Some(
            SendErrorKind::NonceTooLow |
            SendErrorKind::TransactionAlreadyInMempool |
            SendErrorKind::TransactionAlreadyMined,
        ) => SendTxReturnCode::TransactionAlreadyKnown,
        Some(
            SendErrorKind::ReplacementTransactionUnderpriced |
            SendErrorKind::TerminallyUnderpriced |
            SendErrorKind::L2FeeTooLow,
        ) => SendTxReturnCode::Underpriced,
        Some(SendErrorKind::InsufficientEth) => SendTxReturnCode::InsufficientFunds,
        Some(SendErrorKind::TxFeeExceedsCap) => SendTxReturnCode::ExceedsMaxFee,
        Some(SendErrorKind::L2FeeTooHigh) => SendTxReturnCode::FeeOutOfValidRange,
        Some(
            SendErrorKind::NonceTooHigh |
            SendErrorKind::LimitReached |
            SendErrorKind::L2Full |
            SendErrorKind::ServiceUnavailable,
        ) => SendTxReturnCode::Retryable,
        Some(SendErrorKind::TerminallyStuck) => SendTxReturnCode::TerminallyStuck,
        Some(SendErrorKind::Fatal) => SendTxReturnCode::Fatal,
        None => SendTxReturnCode::Unknown,
    }
}

/// One endpoint's reply to a broadcast.
pub type TxOutcome = Result<(), SendError>;

/// Result of folding broadcast replies together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedTxResult {
    /// The outcome to report to the caller.
    pub outcome: TxOutcome,
    /// Set when endpoints disagreed in a way that should never happen.
    pub violation: Option<String>,
}

const CONTRADICTION: &str =
    "found contradictions in nodes replies on SendTransaction: got success and severe error";
const NO_RESPONSES: &str = "expected at least one response on SendTransaction";

/// Reduces per-code broadcast replies into a single outcome.
///
/// Success beats every error, severe errors beat temporary ones. A success alongside a
/// severe error is still reported as success, with a violation attached.
#[must_use]
pub fn aggregate_tx_results(
    results: &BTreeMap<SendTxReturnCode, Vec<TxOutcome>>,
) -> AggregatedTxResult {
    let first_in = |codes: &[SendTxReturnCode]| {
        codes.iter().find_map(|code| results.get(code).and_then(|v| v.first()).cloned())
    };

    let severe = first_in(&SendTxReturnCode::SEVERE);
    if let Some(success) = first_in(&SendTxReturnCode::SUCCESS) {
        let violation = severe.map(|_| CONTRADICTION.to_string());
        return AggregatedTxResult { outcome: success, violation };
    }
    if let Some(severe) = severe {
        return AggregatedTxResult { outcome: severe, violation: None };
    }
    if let Some(temporary) = results.values().find_map(|v| v.first()).cloned() {
        return AggregatedTxResult { outcome: temporary, violation: None };
    }
    AggregatedTxResult {
        outcome: Err(SendError::new(NO_RESPONSES)),
        violation: Some(NO_RESPONSES.to_string()),
    }
}
