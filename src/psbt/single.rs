use bitcoin::Network;
use bitcoin::bip32::Fingerprint;
use tracing::{Level, event};

use super::{KeyOrigin, PsbtSummary};
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint_matches;
use crate::path::HdPath;
use crate::store::Account;
use crate::transaction::{InputBody, OutputBody, UtxoBody, UtxoTxBody};

/// What the device knows about its own single-sig account.
#[derive(Debug, Clone, Copy)]
pub struct SingleSigKeys<'a> {
    pub root: Fingerprint,
    pub account: &'a Account,
}

impl SingleSigKeys<'_> {
    /// The device path of `origin`, if the entry names one of this device's
    /// keys. Entries keyed by the account xpub carry paths relative to it.
    fn claim(&self, origin: &KeyOrigin) -> Option<HdPath> {
        if fingerprint_matches(origin.fingerprint, self.root)
            && origin.path.starts_with(&self.account.path)
        {
            return Some(origin.path.clone());
        }
        fingerprint_matches(origin.fingerprint, self.account.xpub.fingerprint())
            .then(|| origin.path.rebase_onto(&self.account.path))
    }
}

pub fn adapt_single(
    summary: &PsbtSummary,
    keys: &SingleSigKeys<'_>,
    network: Network,
) -> Result<UtxoTxBody> {
    if summary.is_multisig() {
        return Err(Error::MultisigMismatch {
            expected_multisig: false,
        });
    }

    let inputs: Vec<InputBody> = summary
        .inputs
        .iter()
        .filter_map(|input| {
            let (origin, path) = input
                .derivations
                .iter()
                .find_map(|origin| keys.claim(origin).map(|path| (origin, path)))?;
            Some(InputBody {
                hash: input.txid.to_string(),
                index: input.vout,
                utxo: UtxoBody {
                    public_key: Some(origin.public_key.to_string()),
                    value: input.value,
                    address: input.address.clone(),
                },
                owner_key_path: path.to_string(),
                master_fingerprint: Some(origin.fingerprint.to_string()),
            })
        })
        .collect();

    if inputs.is_empty() {
        return Err(Error::NoSignableInput {
            device: keys.root,
            account: keys.account.path.to_string(),
        });
    }

    let outputs = summary
        .outputs
        .iter()
        .map(|output| {
            let change_path = output.derivations.iter().find_map(|o| keys.claim(o));
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
        inputs = inputs.len(),
        of = summary.inputs.len(),
        "adapted single-sig psbt"
    );

    Ok(UtxoTxBody {
        fee: summary.fee()?,
        memo: String::new(),
        inputs,
        outputs,
        multisig: false,
        wallet_fingerprint: None,
        sign_status: None,
        casa: false,
    })
}
