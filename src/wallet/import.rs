//! Wallet setup files and turning an imported descriptor into a stored wallet.
//!
//! Two layouts are understood:
//!
//! * Coldcard-style text: `Name:`, `Policy: <t> of <n>`, `Derivation:`,
//!   `Format:` headers followed by one `<xfp>: <xpub>` line per cosigner.
//! * Caravan JSON: `quorum`, `addressType`, `network` and
//!   `extendedPublicKeys`.

use bitcoin::bip32::{Fingerprint, Xpub};
use bitcoin::{Network, NetworkKind};
use serde::{Deserialize, Serialize};

use super::{Cosigner, MultisigWallet, validate_policy, verify_code};
use crate::derive::{MultisigScript, parse_xpub, same_key};
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint_matches;
use crate::path::HdPath;

/// A wallet as described by a setup file, before the device accepts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletDescriptor {
    pub name: Option<String>,
    pub threshold: u8,
    pub total: u8,
    pub script: MultisigScript,
    pub network: NetworkKind,
    pub cosigners: Vec<Cosigner>,
    pub creator: String,
}

impl WalletDescriptor {
    pub fn base_path(&self, network: Network) -> HdPath {
        self.script.base_path(network)
    }
}

/// Picks the decoder from the content: JSON objects go to Caravan, anything
/// else is read as a Coldcard text file.
pub fn decode_wallet_file(content: &str) -> Result<WalletDescriptor> {
    if content.trim_start().starts_with('{') {
        decode_caravan(content)
    } else {
        decode_coldcard(content)
    }
}

fn network_of(xpub: &Xpub) -> NetworkKind {
    xpub.network
}

fn read_cosigner(xfp: &str, encoded: &str, path: Option<HdPath>) -> Result<Cosigner> {
    let xpub = parse_xpub(encoded)?;
    let xfp = if xfp.trim().is_empty() {
        xpub.fingerprint().to_string()
    } else {
        let trimmed = xfp.trim();
        trimmed
            .parse::<Fingerprint>()
            .map_err(|_| Error::InvalidWallet(format!("bad fingerprint `{trimmed}`")))?;
        trimmed.to_string()
    };
    Ok(Cosigner { xfp, xpub, path })
}

pub fn decode_coldcard(content: &str) -> Result<WalletDescriptor> {
    let mut name = None;
    let mut policy = None;
    let mut derivation = None;
    let mut format = None;
    let mut cosigners = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let (label, value) = (label.trim(), value.trim());
        match label {
            "Name" => name = Some(value.to_string()),
            "Policy" => {
                let (t, n) = value
                    .split_once(" of ")
                    .ok_or_else(|| Error::InvalidWallet(format!("bad policy `{value}`")))?;
                let parse = |v: &str| {
                    v.trim()
                        .parse::<u8>()
                        .map_err(|_| Error::InvalidWallet(format!("bad policy `{value}`")))
                };
                policy = Some((parse(t)?, parse(n)?));
            }
            "Derivation" => derivation = Some(value.parse::<HdPath>()?),
            "Format" => {
                format = Some(MultisigScript::from_format(value).ok_or_else(|| {
                    Error::InvalidWallet(format!("unknown format `{value}`"))
                })?)
            }
            xfp if xfp.len() == 8 => cosigners.push(read_cosigner(xfp, value, derivation.clone())?),
            _ => {}
        }
    }

    let (threshold, total) =
        policy.ok_or_else(|| Error::InvalidWallet("missing Policy line".into()))?;
    let script = format
        .or_else(|| derivation.as_ref().and_then(MultisigScript::from_path))
        .unwrap_or(MultisigScript::P2sh);
    finish(name, threshold, total, script, cosigners, "Coldcard")
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaravanFile {
    name: String,
    address_type: String,
    network: String,
    quorum: CaravanQuorum,
    extended_public_keys: Vec<CaravanKey>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaravanQuorum {
    required_signers: u8,
    total_signers: u8,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaravanKey {
    xpub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bip32_path: Option<String>,
    #[serde(default)]
    xfp: String,
}

pub fn decode_caravan(content: &str) -> Result<WalletDescriptor> {
    let file: CaravanFile = serde_json::from_str(content)
        .map_err(|e| Error::InvalidWallet(format!("undecodable caravan file: {e}")))?;
    let script = MultisigScript::from_format(&file.address_type).ok_or_else(|| {
        Error::InvalidWallet(format!("unknown address type `{}`", file.address_type))
    })?;
    let declared = if file.network == "testnet" {
        NetworkKind::Test
    } else {
        NetworkKind::Main
    };
    let cosigners = file
        .extended_public_keys
        .iter()
        .map(|key| {
            // Caravan writes "Unknown" for keys without a known origin
            let path = key
                .bip32_path
                .as_deref()
                .and_then(|p| p.parse::<HdPath>().ok());
            read_cosigner(&key.xfp, &key.xpub, path)
        })
        .collect::<Result<Vec<_>>>()?;
    let descriptor = finish(
        Some(file.name),
        file.quorum.required_signers,
        file.quorum.total_signers,
        script,
        cosigners,
        "Caravan",
    )?;
    if descriptor.network != declared {
        return Err(Error::InvalidWallet(format!(
            "keys do not belong to {}",
            file.network
        )));
    }
    Ok(descriptor)
}

fn finish(
    name: Option<String>,
    threshold: u8,
    total: u8,
    script: MultisigScript,
    cosigners: Vec<Cosigner>,
    creator: &str,
) -> Result<WalletDescriptor> {
    validate_policy(threshold, total, cosigners.len())?;
    let network = network_of(&cosigners[0].xpub);
    if cosigners.iter().any(|c| network_of(&c.xpub) != network) {
        return Err(Error::InvalidWallet("cosigners mix mainnet and testnet keys".into()));
    }
    Ok(WalletDescriptor {
        name: name.filter(|n| !n.is_empty()),
        threshold,
        total,
        script,
        network,
        cosigners,
        creator: creator.to_string(),
    })
}

/// Accepts `descriptor` for the device with root fingerprint `device` whose
/// key at the wallet's base path is `device_xpub`.
pub fn create_wallet(
    descriptor: WalletDescriptor,
    device: Fingerprint,
    device_xpub: &Xpub,
    network: Network,
) -> Result<MultisigWallet> {
    validate_policy(
        descriptor.threshold,
        descriptor.total,
        descriptor.cosigners.len(),
    )?;
    if descriptor.network != NetworkKind::from(network) {
        return Err(Error::InvalidWallet(format!(
            "wallet keys are not for {network}"
        )));
    }

    let device_fp = device.to_string();
    let mut cosigners = descriptor.cosigners;
    let mut member = false;
    for cosigner in cosigners.iter_mut() {
        let by_root = cosigner
            .xfp
            .parse::<Fingerprint>()
            .is_ok_and(|fp| fingerprint_matches(fp, device));
        let by_key = cosigner
            .xfp
            .parse::<Fingerprint>()
            .is_ok_and(|fp| fingerprint_matches(fp, device_xpub.fingerprint()));
        if (by_root || by_key) && same_key(device_xpub, &cosigner.xpub) {
            // store the slot under the canonical root fingerprint
            cosigner.xfp = device_fp.clone();
            member = true;
        }
    }
    if !member {
        return Err(Error::XfpMismatch {
            expected: device_fp,
            observed: cosigners.iter().map(|c| c.xfp.clone()).collect(),
        });
    }

    let base_path = descriptor.script.base_path(network);
    let xpubs: Vec<Xpub> = cosigners.iter().map(|c| c.xpub).collect();
    let code = verify_code(descriptor.threshold, &xpubs, &base_path);
    let name = descriptor.name.unwrap_or_else(|| {
        format!("KT_{code}_{}-{}", descriptor.threshold, descriptor.total)
    });
    Ok(MultisigWallet {
        fingerprint: format!("{code}{device_fp}"),
        name,
        threshold: descriptor.threshold,
        total: descriptor.total,
        base_path,
        cosigners,
        creator: descriptor.creator,
        network,
        belong_to: device_fp,
        verify_code: code,
    })
}

/// Coldcard-style text export of a stored wallet.
pub fn export_coldcard(wallet: &MultisigWallet) -> Result<String> {
    let script = wallet.script()?;
    let mut out = format!(
        "# Multisig setup file (exported by {})\n#\nName: {}\nPolicy: {} of {}\nDerivation: {}\nFormat: {}\n\n",
        wallet.belong_to,
        wallet.name,
        wallet.threshold,
        wallet.total,
        wallet.base_path,
        script.format(),
    );
    for cosigner in &wallet.cosigners {
        out.push_str(&format!(
            "{}: {}\n",
            cosigner.xfp.to_ascii_uppercase(),
            cosigner.xpub
        ));
    }
    Ok(out)
}

/// Caravan JSON export of a stored wallet.
pub fn export_caravan(wallet: &MultisigWallet) -> Result<String> {
    let script = wallet.script()?;
    let file = CaravanFile {
        name: wallet.name.clone(),
        address_type: script.format().to_string(),
        network: match wallet.network {
            Network::Bitcoin => "mainnet".to_string(),
            _ => "testnet".to_string(),
        },
        quorum: CaravanQuorum {
            required_signers: wallet.threshold,
            total_signers: wallet.total,
        },
        extended_public_keys: wallet
            .cosigners
            .iter()
            .map(|cosigner| CaravanKey {
                xpub: cosigner.xpub.to_string(),
                bip32_path: Some(
                    cosigner
                        .path
                        .as_ref()
                        .unwrap_or(&wallet.base_path)
                        .to_string(),
                ),
                xfp: cosigner.xfp.to_ascii_lowercase(),
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&file)?)
}
