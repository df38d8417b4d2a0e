//! Finds the stored multisig wallet behind a PSBT's cosigner set.

use bitcoin::Network;
use bitcoin::bip32::Fingerprint;
use tracing::{Level, event};

use super::MultisigWallet;
use crate::error::{Error, Result};
use crate::path::HdPath;

#[derive(Debug, Clone)]
pub struct ResolveQuery<'a> {
    /// `fingerprints_hash` of the fingerprints listed by the first input.
    pub digest: &'a str,
    pub threshold: u8,
    pub total: u8,
    /// This device's path in the PSBT, when it is listed by root fingerprint.
    pub device_path: Option<&'a HdPath>,
    pub owner: Fingerprint,
    pub network: Network,
}

/// A candidate matches when its key-fingerprint digest equals the query
/// digest, or its root-fingerprint digest does and the device path lives
/// under the candidate's base path. Exactly one distinct candidate may match.
pub fn resolve_wallet(wallets: &[MultisigWallet], query: &ResolveQuery<'_>) -> Result<MultisigWallet> {
    let mut matched: Vec<&MultisigWallet> = Vec::new();
    for wallet in wallets {
        if wallet.threshold != query.threshold
            || wallet.total != query.total
            || !wallet.belongs_to(query.owner)
            || !wallet.is_on(query.network)
        {
            continue;
        }
        let by_key = wallet
            .xpub_fingerprint_digest()
            .eq_ignore_ascii_case(query.digest);
        let by_root = wallet
            .root_fingerprint_digest()
            .eq_ignore_ascii_case(query.digest)
            && query
                .device_path
                .is_some_and(|path| path.starts_with(&wallet.base_path));
        if (by_key || by_root) && !matched.iter().any(|m| m.fingerprint == wallet.fingerprint) {
            matched.push(wallet);
        }
    }

    match matched.as_slice() {
        [] => {
            event!(
                Level::WARN,
                digest = query.digest,
                threshold = query.threshold,
                total = query.total,
                "no multisig wallet matches"
            );
            Err(Error::NoMatchedMultisigWallet {
                digest: query.digest.to_string(),
                threshold: query.threshold,
                total: query.total,
            })
        }
        [wallet] => {
            event!(Level::INFO, wallet = %wallet.fingerprint, "resolved multisig wallet");
            Ok((*wallet).clone())
        }
        several => Err(Error::AmbiguousMultisigWallet {
            candidates: several.iter().map(|w| w.fingerprint.clone()).collect(),
        }),
    }
}
