use bitcoin::bip32::Fingerprint;

/// Confirmation engine error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transaction descriptor could not be decoded or is incomplete
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// PSBT could not be decoded
    #[error("invalid psbt: {0}")]
    InvalidPsbt(String),

    /// Path segment could not be parsed or needs hardened public derivation
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Extended key could not be decoded or used
    #[error("invalid extended key: {0}")]
    InvalidKey(String),

    /// Caller expected a multisig transaction and got a single-sig one (or the reverse)
    #[error("multisig flag mismatch (expected multisig: {expected_multisig})")]
    MultisigMismatch { expected_multisig: bool },

    /// A PSBT input lists a different cosigner set than the first input
    #[error("input {input} does not carry the cosigner set of the first input")]
    InconsistentCosigners { input: usize },

    /// No input carries a key of this device
    #[error("no input belongs to this device (root fingerprint {device})")]
    WatchWalletMismatch { device: Fingerprint },

    /// No stored multisig wallet has the observed cosigner set
    #[error("no multisig wallet matches cosigner digest {digest} ({threshold}-of-{total})")]
    NoMatchedMultisigWallet {
        digest: String,
        threshold: u8,
        total: u8,
    },

    /// More than one stored multisig wallet has the observed cosigner set
    #[error("cosigner set matches several multisig wallets: {candidates:?}")]
    AmbiguousMultisigWallet { candidates: Vec<String> },

    /// No input can be signed by the device account
    #[error("no input can be signed by {device} under {account}")]
    NoSignableInput { device: Fingerprint, account: String },

    /// Casa input without this device's root fingerprint
    #[error("no casa key for root fingerprint {device}")]
    NoMatchingCasaKey { device: Fingerprint },

    /// Wallet import does not include this device
    #[error("cosigner fingerprints {observed:?} do not include {expected}")]
    XfpMismatch {
        expected: String,
        observed: Vec<String>,
    },

    /// No single-sig account registered for the path
    #[error("no account registered for {0}")]
    UnknownAccount(String),

    /// Wallet descriptor or wallet file is malformed
    #[error("invalid multisig wallet: {0}")]
    InvalidWallet(String),

    /// Re-derived address differs from the one in the proposal
    #[error("address at {path} does not derive to {claimed} (expected {expected:?})")]
    InvalidChangeAddress {
        path: String,
        claimed: String,
        expected: Option<String>,
    },

    /// Outputs equal a previous transaction's outputs
    #[error("outputs match a previous transaction")]
    SameOutputsWarning,

    /// Inputs and outputs equal a previous transaction
    #[error("transaction duplicates a previous one (already signed: {already_signed})")]
    DuplicateTransaction { already_signed: bool },

    /// Session already holds a signing attempt or an unconsumed result
    #[error("a signing attempt is already in flight")]
    SigningInProgress,

    /// Authorization token missing or rejected
    #[error("authorization rejected")]
    Unauthorized,

    /// Secure signer reported failure
    #[error("signing failed")]
    SignFail,

    /// Repository failure
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON encoding failure
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a configuration or wallet file failed
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad error categories, used by callers to pick a remediation path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedInput,
    IdentityMismatch,
    Integrity,
    Advisory,
    Signing,
    Storage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidTransaction(_)
            | Error::InvalidPsbt(_)
            | Error::InvalidPath { .. }
            | Error::InvalidKey(_)
            | Error::MultisigMismatch { .. }
            | Error::InconsistentCosigners { .. }
            | Error::InvalidWallet(_)
            | Error::Json(_) => ErrorKind::MalformedInput,
            Error::WatchWalletMismatch { .. }
            | Error::NoMatchedMultisigWallet { .. }
            | Error::AmbiguousMultisigWallet { .. }
            | Error::NoSignableInput { .. }
            | Error::NoMatchingCasaKey { .. }
            | Error::XfpMismatch { .. }
            | Error::UnknownAccount(_) => ErrorKind::IdentityMismatch,
            Error::InvalidChangeAddress { .. } => ErrorKind::Integrity,
            Error::SameOutputsWarning | Error::DuplicateTransaction { .. } => ErrorKind::Advisory,
            Error::SigningInProgress | Error::Unauthorized | Error::SignFail => ErrorKind::Signing,
            Error::Storage(_) | Error::Io(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
