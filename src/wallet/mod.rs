//! Multisig wallets registered on the device.

use bitcoin::bip32::{Fingerprint, Xpub};
use bitcoin::{Address, Network, NetworkKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::derive::{MultisigScript, derive_multisig_address};
use crate::error::{Error, Result};
use crate::fingerprint::fingerprints_hash;
use crate::path::{HdPath, normal_indices};

pub mod addresses;
pub mod import;
pub mod resolver;

pub use addresses::{AddressGenerator, MultisigAddress};
pub use import::{
    WalletDescriptor, decode_caravan, decode_coldcard, decode_wallet_file, export_caravan, export_coldcard,
};
pub use resolver::{ResolveQuery, resolve_wallet};

pub const MAX_COSIGNERS: u8 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cosigner {
    /// Root fingerprint as announced by the cosigner.
    pub xfp: String,
    pub xpub: Xpub,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<HdPath>,
}

impl Cosigner {
    pub fn xpub_fingerprint(&self) -> Fingerprint {
        self.xpub.fingerprint()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigWallet {
    pub fingerprint: String,
    pub name: String,
    pub threshold: u8,
    pub total: u8,
    pub base_path: HdPath,
    pub cosigners: Vec<Cosigner>,
    pub creator: String,
    pub network: Network,
    /// Root fingerprint of the device that imported the wallet.
    pub belong_to: String,
    pub verify_code: String,
}

impl MultisigWallet {
    pub fn script(&self) -> Result<MultisigScript> {
        MultisigScript::from_path(&self.base_path).ok_or_else(|| {
            Error::InvalidWallet(format!("no multisig script for {}", self.base_path))
        })
    }

    pub fn xpubs(&self) -> Vec<Xpub> {
        self.cosigners.iter().map(|c| c.xpub).collect()
    }

    pub fn belongs_to(&self, device: Fingerprint) -> bool {
        self.belong_to.eq_ignore_ascii_case(&device.to_string())
    }

    pub fn is_on(&self, network: Network) -> bool {
        NetworkKind::from(self.network) == NetworkKind::from(network)
    }

    pub fn xpub_fingerprint_digest(&self) -> String {
        fingerprints_hash(self.cosigners.iter().map(|c| c.xpub_fingerprint().to_string()))
    }

    pub fn root_fingerprint_digest(&self) -> String {
        fingerprints_hash(self.cosigners.iter().map(|c| c.xfp.as_str()))
    }

    /// The cosigner slot registered for the owning device.
    pub fn device_cosigner(&self) -> Option<&Cosigner> {
        self.cosigners
            .iter()
            .find(|c| c.xfp.eq_ignore_ascii_case(&self.belong_to))
    }

    /// `(change, index)` of a path that sits exactly two levels below the
    /// base path.
    pub fn address_indices(&self, path: &HdPath) -> Result<(u32, u32)> {
        let tail = path.strip_prefix(&self.base_path).ok_or_else(|| {
            Error::invalid_path(path.to_string(), format!("not under {}", self.base_path))
        })?;
        match normal_indices(tail, path)?.as_slice() {
            [change, index] => Ok((*change, *index)),
            _ => Err(Error::invalid_path(path.to_string(), "expected change/index below base path")),
        }
    }

    pub fn derive_address(&self, change: u32, index: u32) -> Result<Address> {
        derive_multisig_address(
            usize::from(self.threshold),
            &self.xpubs(),
            &[change, index],
            self.script()?,
            self.network,
        )
    }

    pub fn derive_address_at(&self, path: &HdPath) -> Result<Address> {
        let (change, index) = self.address_indices(path)?;
        self.derive_address(change, index)
    }

    pub fn is_external(&self, path: &HdPath) -> bool {
        matches!(self.address_indices(path), Ok((0, _)))
    }
}

/// First eight upper-case hex digits of
/// `sha256(sorted xpubs joined by spaces || "<t>of<n>" || base path)`.
pub fn verify_code(threshold: u8, xpubs: &[Xpub], base_path: &HdPath) -> String {
    let mut encoded: Vec<String> = xpubs.iter().map(Xpub::to_string).collect();
    encoded.sort();
    let info = format!(
        "{}{}of{}{}",
        encoded.join(" "),
        threshold,
        xpubs.len(),
        base_path
    );
    let digest = hex::encode(Sha256::digest(info.as_bytes()));
    digest[..8].to_ascii_uppercase()
}

pub fn validate_policy(threshold: u8, total: u8, cosigners: usize) -> Result<()> {
    if threshold == 0 || threshold > total || total > MAX_COSIGNERS {
        return Err(Error::InvalidWallet(format!(
            "policy {threshold} of {total} out of range"
        )));
    }
    if cosigners != usize::from(total) {
        return Err(Error::InvalidWallet(format!(
            "policy needs {total} cosigners, found {cosigners}"
        )));
    }
    Ok(())
}
