//! Key derivation: child public keys and the addresses they pay to.
//!
//! Everything here is a pure function of the extended keys handed in. Only
//! non-hardened children can be reached, the device never hands out private
//! key material to this layer.

use bitcoin::bip32::{ChildNumber, Fingerprint, Xpub};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::{Address, CompressedPublicKey, Network};
use miniscript::descriptor::{DefiniteDescriptorKey, Descriptor, DescriptorPublicKey};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::path::HdPath;

/// Single-signature address flavours, one per BIP44-style purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
}

impl ScriptType {
    pub fn purpose(self) -> u32 {
        match self {
            ScriptType::P2pkh => 44,
            ScriptType::P2shP2wpkh => 49,
            ScriptType::P2wpkh => 84,
        }
    }

    /// `m/<purpose>'/<coin>'/0'`
    pub fn account_path(self, network: Network) -> HdPath {
        HdPath::from(vec![
            hardened(self.purpose()),
            hardened(coin_type(network)),
            hardened(0),
        ])
    }

    pub fn from_path(path: &HdPath) -> Option<Self> {
        match path.components().first()? {
            ChildNumber::Hardened { index: 44 } => Some(ScriptType::P2pkh),
            ChildNumber::Hardened { index: 49 } => Some(ScriptType::P2shP2wpkh),
            ChildNumber::Hardened { index: 84 } => Some(ScriptType::P2wpkh),
            _ => None,
        }
    }
}

/// Multisig script flavours and their registered derivation paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MultisigScript {
    P2sh,
    P2shP2wsh,
    P2wsh,
}

impl MultisigScript {
    pub fn base_path(self, network: Network) -> HdPath {
        match self {
            MultisigScript::P2sh => HdPath::from(vec![hardened(45)]),
            MultisigScript::P2shP2wsh => HdPath::from(vec![
                hardened(48),
                hardened(coin_type(network)),
                hardened(0),
                hardened(1),
            ]),
            MultisigScript::P2wsh => HdPath::from(vec![
                hardened(48),
                hardened(coin_type(network)),
                hardened(0),
                hardened(2),
            ]),
        }
    }

    pub fn from_path(path: &HdPath) -> Option<Self> {
        match path.components() {
            [ChildNumber::Hardened { index: 45 }, ..] => Some(MultisigScript::P2sh),
            [ChildNumber::Hardened { index: 48 }, _, _, ChildNumber::Hardened { index: 1 }, ..] => {
                Some(MultisigScript::P2shP2wsh)
            }
            [ChildNumber::Hardened { index: 48 }, _, _, ChildNumber::Hardened { index: 2 }, ..] => {
                Some(MultisigScript::P2wsh)
            }
            _ => None,
        }
    }

    /// Name used by wallet setup files.
    pub fn format(self) -> &'static str {
        match self {
            MultisigScript::P2sh => "P2SH",
            MultisigScript::P2shP2wsh => "P2SH-P2WSH",
            MultisigScript::P2wsh => "P2WSH",
        }
    }

    pub fn from_format(format: &str) -> Option<Self> {
        match format.trim().to_ascii_uppercase().as_str() {
            "P2SH" => Some(MultisigScript::P2sh),
            "P2SH-P2WSH" | "P2WSH-P2SH" => Some(MultisigScript::P2shP2wsh),
            "P2WSH" => Some(MultisigScript::P2wsh),
            _ => None,
        }
    }
}

fn hardened(index: u32) -> ChildNumber {
    ChildNumber::Hardened { index }
}

pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

const MAINNET_VERSIONS: [[u8; 4]; 5] = [
    [0x04, 0x88, 0xb2, 0x1e], // xpub
    [0x04, 0x9d, 0x7c, 0xb2], // ypub
    [0x04, 0xb2, 0x47, 0x46], // zpub
    [0x02, 0x95, 0xb4, 0x3f], // Ypub
    [0x02, 0xaa, 0x7e, 0xd3], // Zpub
];

const TESTNET_VERSIONS: [[u8; 4]; 5] = [
    [0x04, 0x35, 0x87, 0xcf], // tpub
    [0x04, 0x4a, 0x52, 0x62], // upub
    [0x04, 0x5f, 0x1c, 0xf6], // vpub
    [0x02, 0x42, 0x89, 0xef], // Upub
    [0x02, 0x57, 0x54, 0x83], // Vpub
];

/// Parses an extended public key in any of the SLIP-132 encodings, returning
/// it re-versioned as plain `xpub`/`tpub`.
pub fn parse_xpub(encoded: &str) -> Result<Xpub> {
    let mut data = bitcoin::base58::decode_check(encoded.trim())
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    if data.len() != 78 {
        return Err(Error::InvalidKey(format!(
            "extended key is {} bytes, expected 78",
            data.len()
        )));
    }
    let version: [u8; 4] = [data[0], data[1], data[2], data[3]];
    if MAINNET_VERSIONS.contains(&version) {
        data[..4].copy_from_slice(&MAINNET_VERSIONS[0]);
    } else if TESTNET_VERSIONS.contains(&version) {
        data[..4].copy_from_slice(&TESTNET_VERSIONS[0]);
    } else {
        return Err(Error::InvalidKey(format!(
            "unknown extended key version {}",
            hex::encode(version)
        )));
    }
    Xpub::decode(&data).map_err(|e| Error::InvalidKey(e.to_string()))
}

/// True when both keys are the same node, whatever their version prefix.
pub fn same_key(a: &Xpub, b: &Xpub) -> bool {
    a.public_key == b.public_key && a.chain_code == b.chain_code
}

pub fn xpub_fingerprint(xpub: &Xpub) -> Fingerprint {
    xpub.fingerprint()
}

fn children(indices: &[u32]) -> Result<Vec<ChildNumber>> {
    indices
        .iter()
        .map(|index| {
            ChildNumber::from_normal_idx(*index).map_err(|_| {
                Error::invalid_path(
                    format!("{indices:?}"),
                    "hardened step cannot be derived from a public key",
                )
            })
        })
        .collect()
}

pub fn derive_xpub(xpub: &Xpub, indices: &[u32]) -> Result<Xpub> {
    let secp = Secp256k1::verification_only();
    let path = children(indices)?;
    xpub.derive_pub(&secp, &path)
        .map_err(|e| Error::invalid_path(format!("{indices:?}"), e.to_string()))
}

pub fn derive_public_key(xpub: &Xpub, indices: &[u32]) -> Result<PublicKey> {
    Ok(derive_xpub(xpub, indices)?.public_key)
}

pub fn derive_address(
    xpub: &Xpub,
    indices: &[u32],
    script: ScriptType,
    network: Network,
) -> Result<Address> {
    let key = CompressedPublicKey(derive_public_key(xpub, indices)?);
    Ok(match script {
        ScriptType::P2pkh => Address::p2pkh(key.pubkey_hash(), network),
        ScriptType::P2shP2wpkh => Address::p2shwpkh(&key, network),
        ScriptType::P2wpkh => Address::p2wpkh(&key, network),
    })
}

/// `sortedmulti` descriptor over every cosigner key at `indices`.
pub fn multisig_descriptor(
    threshold: usize,
    xpubs: &[Xpub],
    indices: &[u32],
    script: MultisigScript,
) -> Result<Descriptor<DefiniteDescriptorKey>> {
    if threshold == 0 || threshold > xpubs.len() {
        return Err(Error::InvalidKey(format!(
            "threshold {threshold} out of range for {} keys",
            xpubs.len()
        )));
    }
    // rejects hardened steps before miniscript sees them
    children(indices)?;

    let suffix: String = indices.iter().map(|i| format!("/{i}")).collect();
    let keys: Vec<String> = xpubs.iter().map(|x| format!("{x}{suffix}")).collect();
    let inner = format!("sortedmulti({},{})", threshold, keys.join(","));
    let descriptor_str = match script {
        MultisigScript::P2sh => format!("sh({inner})"),
        MultisigScript::P2shP2wsh => format!("sh(wsh({inner}))"),
        MultisigScript::P2wsh => format!("wsh({inner})"),
    };
    let descriptor = Descriptor::<DescriptorPublicKey>::from_str(&descriptor_str)
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    descriptor
        .at_derivation_index(0)
        .map_err(|e| Error::InvalidKey(e.to_string()))
}

pub fn derive_multisig_address(
    threshold: usize,
    xpubs: &[Xpub],
    indices: &[u32],
    script: MultisigScript,
    network: Network,
) -> Result<Address> {
    let derived = multisig_descriptor(threshold, xpubs, indices, script)?;
    let script_pubkey = derived.script_pubkey();
    Address::from_script(&script_pubkey, network).map_err(|e| Error::InvalidKey(e.to_string()))
}
