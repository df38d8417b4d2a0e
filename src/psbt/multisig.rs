use bitcoin::Network;
use bitcoin::bip32::Fingerprint;
use tracing::{Level, event};

use super::{KeyOrigin, PsbtInput, PsbtSummary};
use crate::error::{Error, Result};
use crate::fingerprint::{fingerprint_matches, fingerprints_hash};
use crate::path::HdPath;
use crate::transaction::{InputBody, OutputBody, SignStatus, UtxoBody, UtxoTxBody};
use crate::wallet::{MultisigWallet, ResolveQuery, resolve_wallet};

/// Adapts a PSBT spending from a registered multisig wallet.
///
/// Every input has to list the full cosigner set of the first input; the set
/// is checked across all inputs before any wallet lookup happens. Returns the
/// transaction body together with the wallet it was resolved against.
pub fn adapt_multisig(
    summary: &PsbtSummary,
    device: Fingerprint,
    wallets: &[MultisigWallet],
    network: Network,
) -> Result<(UtxoTxBody, MultisigWallet)> {
    let first = summary
        .inputs
        .first()
        .ok_or_else(|| Error::InvalidPsbt("no inputs".into()))?;
    let sign_status = match first.sign_status() {
        Ok(status) => status,
        Err(_) => {
            return Err(Error::MultisigMismatch {
                expected_multisig: true,
            });
        }
    };
    let digest = cosigner_digest(summary, sign_status)?;

    let device_path = first
        .derivations
        .iter()
        .find(|o| fingerprint_matches(o.fingerprint, device))
        .map(|o| &o.path);
    let wallet = resolve_wallet(
        wallets,
        &ResolveQuery {
            digest: &digest,
            threshold: sign_status.threshold(),
            total: sign_status.total(),
            device_path,
            owner: device,
            network,
        },
    )?;

    let slot_fingerprint = wallet.device_cosigner().map(|c| c.xpub_fingerprint());
    let is_mine = |origin: &KeyOrigin| {
        fingerprint_matches(origin.fingerprint, device)
            || slot_fingerprint.is_some_and(|fp| fingerprint_matches(origin.fingerprint, fp))
    };

    let inputs: Vec<InputBody> = summary
        .inputs
        .iter()
        .filter_map(|input| {
            let origin = input.derivations.iter().find(|o| is_mine(o))?;
            let key = slot_key(input, slot_fingerprint).unwrap_or(origin);
            Some(InputBody {
                hash: input.txid.to_string(),
                index: input.vout,
                utxo: UtxoBody {
                    public_key: Some(key.public_key.to_string()),
                    value: input.value,
                    address: input.address.clone(),
                },
                owner_key_path: rebase(&origin.path, &wallet).to_string(),
                master_fingerprint: Some(wallet.belong_to.clone()),
            })
        })
        .collect();

    if inputs.is_empty() {
        return Err(Error::WatchWalletMismatch { device });
    }

    let outputs = summary
        .outputs
        .iter()
        .map(|output| {
            let change_path = output
                .derivations
                .iter()
                .find(|o| is_mine(o))
                .map(|o| rebase(&o.path, &wallet));
            OutputBody {
                address: output.address(network),
                value: output.value,
                is_change: change_path.is_some(),
                change_address_path: change_path.map(|p| p.to_string()),
            }
        })
        .collect();

    event!(
        Level::INFO,
        wallet = %wallet.fingerprint,
        status = %sign_status,
        inputs = inputs.len(),
        "adapted multisig psbt"
    );

    let body = UtxoTxBody {
        fee: summary.fee()?,
        memo: String::new(),
        inputs,
        outputs,
        multisig: true,
        wallet_fingerprint: Some(wallet.fingerprint.clone()),
        sign_status: Some(sign_status.to_string()),
        casa: false,
    };
    Ok((body, wallet))
}

/// Digest of the first input's fingerprints, after checking every input
/// lists `total` keys with the same digest.
fn cosigner_digest(summary: &PsbtSummary, status: SignStatus) -> Result<String> {
    let mut canonical: Option<String> = None;
    for (index, input) in summary.inputs.iter().enumerate() {
        if input.derivations.len() != usize::from(status.total()) {
            return Err(Error::InconsistentCosigners { input: index });
        }
        let digest = fingerprints_hash(input.fingerprints());
        match &canonical {
            None => canonical = Some(digest),
            Some(expected) if *expected != digest => {
                event!(Level::WARN, input = index, "cosigner set differs from first input");
                return Err(Error::InconsistentCosigners { input: index });
            }
            Some(_) => {}
        }
    }
    canonical.ok_or_else(|| Error::InvalidPsbt("no inputs".into()))
}

/// The entry listed under the xpub fingerprint of this device's slot.
fn slot_key(input: &PsbtInput, slot: Option<Fingerprint>) -> Option<&KeyOrigin> {
    let slot = slot?;
    input
        .derivations
        .iter()
        .find(|o| fingerprint_matches(o.fingerprint, slot))
}

fn rebase(path: &HdPath, wallet: &MultisigWallet) -> HdPath {
    path.rebase_onto(&wallet.base_path)
}
