//! Signing confirmation for a cold wallet.
//!
//! Proposals from an untrusted watch wallet (JSON descriptors or PSBTs) are
//! normalized, matched against this device's keys and registered multisig
//! wallets, and checked address by address before anything is signed.

pub mod config;
pub mod context;
pub mod derive;
pub mod engine;
pub mod error;
pub mod fee_attack;
pub mod fingerprint;
pub mod path;
pub mod psbt;
pub mod signing;
pub mod software;
pub mod store;
pub mod transaction;
pub mod verify;
pub mod wallet;

pub use config::{EngineConfig, MultisigMode};
pub use engine::{ConfirmEngine, PendingRecord, Proposal};
pub use error::{Error, ErrorKind, Result};
pub use fee_attack::FeeAttackVerdict;
pub use path::HdPath;
pub use signing::{AuthToken, SecureSigner, SignOutcome, SignResult, SignState, SigningSession};
pub use software::{DeviceKeyFile, SoftwareKeyStore};
pub use store::{KeyStore, MemoryRepository, Repository};
pub use transaction::{Coin, SignStatus, Transaction, TxKind};
pub use wallet::{MultisigWallet, WalletDescriptor};

/// Human-readable wallet overview, one fact per line.
pub fn wallet_info(wallet: &MultisigWallet) -> Vec<String> {
    let mut lines = vec![
        format!("Name: {}", wallet.name),
        format!("Network: {:?}", wallet.network),
        format!("Policy: {}-of-{}", wallet.threshold, wallet.total),
        format!("Derivation: {}", wallet.base_path),
        format!("Verify code: {}", wallet.verify_code),
    ];
    for (i, cosigner) in wallet.cosigners.iter().enumerate() {
        let encoded = cosigner.xpub.to_string();
        lines.push(format!(
            "Cosigner {}: [{}] {}",
            i + 1,
            cosigner.xfp,
            &encoded[..encoded.len().min(24)]
        ));
    }
    for index in 0..3 {
        if let Ok(address) = wallet.derive_address(0, index) {
            lines.push(format!("Address {index}: {address}"));
        }
    }
    lines
}
