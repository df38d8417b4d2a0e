//! Re-derivation of every address a proposal claims belongs to this device.
//!
//! Expected addresses always come from local key material in the
//! [`ResolutionContext`]; the addresses written in the proposal are only ever
//! compared against, never trusted.

use bitcoin::Network;
use serde::Serialize;
use tracing::{Level, event};

use crate::context::ResolutionContext;
use crate::derive::derive_address;
use crate::error::{Error, Result};
use crate::path::HdPath;
use crate::transaction::Transaction;

/// Address the device itself derives for `path`.
pub fn expected_address(ctx: &ResolutionContext, path: &HdPath, network: Network) -> Result<String> {
    match ctx {
        ResolutionContext::SingleSig { .. } => {
            let account = ctx
                .account_for(path)
                .ok_or_else(|| Error::UnknownAccount(path.to_string()))?;
            let (change, index) = path.change_and_index()?;
            Ok(derive_address(&account.xpub, &[change, index], account.script, network)?.to_string())
        }
        ResolutionContext::LegacyMultisig { wallet } => {
            Ok(wallet.derive_address_at(path)?.to_string())
        }
        ResolutionContext::Casa { .. } => Err(Error::invalid_path(
            path.to_string(),
            "no local key material for casa addresses",
        )),
    }
}

fn check(ctx: &ResolutionContext, path: Option<&HdPath>, claimed: &str, network: Network) -> Result<()> {
    let Some(path) = path else {
        return Err(Error::InvalidChangeAddress {
            path: String::new(),
            claimed: claimed.to_string(),
            expected: None,
        });
    };
    match expected_address(ctx, path, network) {
        Ok(expected) if expected == claimed => Ok(()),
        outcome => {
            let expected = outcome.ok();
            event!(
                Level::WARN,
                %path,
                claimed,
                expected = expected.as_deref().unwrap_or("<underivable>"),
                "address does not re-derive"
            );
            Err(Error::InvalidChangeAddress {
                path: path.to_string(),
                claimed: claimed.to_string(),
                expected,
            })
        }
    }
}

/// Checks every change output and every input that names the address it
/// spends from. Casa proposals carry nothing that can be checked locally.
pub fn verify_addresses(tx: &Transaction, ctx: &ResolutionContext, network: Network) -> Result<()> {
    if let ResolutionContext::Casa { .. } = ctx {
        return Ok(());
    }
    for output in tx.outputs.iter().filter(|o| o.is_change) {
        check(ctx, output.change_path.as_ref(), &output.address, network)?;
    }
    for input in &tx.inputs {
        if let Some(claimed) = &input.address {
            check(ctx, Some(&input.path), claimed, network)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressValue {
    pub value: u64,
    pub address: String,
}

/// Input addresses as this device derives them, in input order.
pub fn local_input_addresses(
    tx: &Transaction,
    ctx: &ResolutionContext,
    network: Network,
) -> Result<Vec<AddressValue>> {
    if let ResolutionContext::Casa { .. } = ctx {
        return Ok(Vec::new());
    }
    tx.inputs
        .iter()
        .map(|input| {
            Ok(AddressValue {
                value: input.value,
                address: expected_address(ctx, &input.path, network)?,
            })
        })
        .collect()
}
