//! Cosigner-set digests.
//!
//! A multisig wallet and a PSBT input name the same signer set iff the digests
//! of their fingerprints are equal. Fingerprints are upper-cased and sorted
//! before hashing so neither order nor case matters.

use bitcoin::bip32::Fingerprint;
use sha2::{Digest, Sha256};

pub fn fingerprints_hash<I, S>(fingerprints: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = fingerprints
        .into_iter()
        .map(|fp| fp.as_ref().trim().to_ascii_uppercase())
        .collect();
    normalized.sort();
    hex::encode(Sha256::digest(normalized.concat().as_bytes()))
}

/// Fingerprint comparison that also accepts the byte-reversed form some watch
/// wallets emit.
pub fn fingerprint_matches(observed: Fingerprint, expected: Fingerprint) -> bool {
    if observed == expected {
        return true;
    }
    let mut reversed = observed.to_bytes();
    reversed.reverse();
    Fingerprint::from(reversed) == expected
}
