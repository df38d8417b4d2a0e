use bitcoin::Network;
use bitcoin::bip32::{ChildNumber, Fingerprint};
use tracing::{Level, event};

use super::PsbtSummary;
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint_matches;
use crate::path::HdPath;
use crate::transaction::{InputBody, OutputBody, UtxoBody, UtxoTxBody};

/// `m/45'`
pub fn casa_prefix() -> HdPath {
    HdPath::from(vec![ChildNumber::Hardened { index: 45 }])
}

/// Casa paths carry the coin in their second step; `1'` means testnet.
pub fn casa_network(path: &HdPath) -> Network {
    match path.components().get(1) {
        Some(ChildNumber::Hardened { index: 1 }) => Network::Testnet,
        _ => Network::Bitcoin,
    }
}

/// Adapts a Casa PSBT. No stored wallet is consulted: every input must list
/// this device's root fingerprint. Returns the body and the network read off
/// the paths.
pub fn adapt_casa(summary: &PsbtSummary, device: Fingerprint) -> Result<(UtxoTxBody, Network)> {
    let first = summary
        .inputs
        .first()
        .ok_or_else(|| Error::InvalidPsbt("no inputs".into()))?;
    let sign_status = first.sign_status().map_err(|_| Error::MultisigMismatch {
        expected_multisig: true,
    })?;

    let mut network = Network::Bitcoin;
    let mut inputs = Vec::with_capacity(summary.inputs.len());
    for (index, input) in summary.inputs.iter().enumerate() {
        let origin = input
            .derivations
            .iter()
            .find(|o| fingerprint_matches(o.fingerprint, device))
            .ok_or(Error::NoMatchingCasaKey { device })?;
        let path = origin.path.rebase_onto(&casa_prefix());
        if index == 0 {
            network = casa_network(&path);
        }
        inputs.push(InputBody {
            hash: input.txid.to_string(),
            index: input.vout,
            utxo: UtxoBody {
                public_key: Some(origin.public_key.to_string()),
                value: input.value,
                address: None,
            },
            owner_key_path: path.to_string(),
            master_fingerprint: Some(device.to_string()),
        });
    }

    let outputs = summary
        .outputs
        .iter()
        .map(|output| OutputBody {
            address: output.address(network),
            value: output.value,
            is_change: false,
            change_address_path: None,
        })
        .collect();

    event!(Level::INFO, %network, status = %sign_status, "adapted casa psbt");

    let body = UtxoTxBody {
        fee: summary.fee()?,
        memo: String::new(),
        inputs,
        outputs,
        multisig: true,
        wallet_fingerprint: None,
        sign_status: Some(sign_status.to_string()),
        casa: true,
    };
    Ok((body, network))
}
