//! Signing requests and the contract of the secure signer.

use bitcoin::psbt::Psbt;
use std::fmt;

use crate::store::KeyStore;
use crate::transaction::Transaction;

pub mod assembler;
pub mod session;

pub use assembler::assemble_signers;
pub use session::{SignOutcome, SignResult, SigningSession};

/// Single-use authorization handed out by the key store. Not `Clone`: the
/// value moves into exactly one signing attempt.
#[derive(PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        AuthToken(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

/// Invalidates the held token when dropped, whichever way the signing
/// attempt ends.
pub(crate) struct TokenGuard<'a, K: KeyStore + ?Sized> {
    keys: &'a K,
    token: AuthToken,
}

impl<'a, K: KeyStore + ?Sized> TokenGuard<'a, K> {
    pub(crate) fn new(keys: &'a K, token: AuthToken) -> Self {
        TokenGuard { keys, token }
    }

    pub(crate) fn token(&self) -> &AuthToken {
        &self.token
    }
}

impl<K: KeyStore + ?Sized> Drop for TokenGuard<'_, K> {
    fn drop(&mut self) {
        self.keys.invalidate_auth_token(&self.token);
    }
}

/// One key the secure signer must use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerDescriptor {
    /// Lower-case BIP32 path.
    pub path: String,
    /// Hex public key the signer must find at `path`.
    pub public_key: String,
}

#[derive(Debug)]
pub struct SignRequest<'a> {
    pub transaction: &'a Transaction,
    pub psbt: Option<&'a Psbt>,
    pub signers: &'a [SignerDescriptor],
    pub token: &'a AuthToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignEvent {
    Started,
    Progress(u8),
    Success {
        txid: Option<String>,
        signed_payload: String,
    },
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignState {
    None,
    Signing,
    SignSuccess,
    SignFail,
}

/// The component that holds private keys and produces signatures.
pub trait SecureSigner {
    /// Signs `request`, reporting through `events`. Exactly one of
    /// `Success` or `Failed` ends the attempt; returning without either
    /// counts as failure.
    fn sign(&self, request: &SignRequest<'_>, events: &mut dyn FnMut(SignEvent));
}
