//! Reading PSBTs into the shape the adapters work on.
//!
//! The adapters turn a [`PsbtSummary`] into the transaction body the
//! normalizer understands, keeping only what concerns this device:
//! [`single`] for one-key accounts, [`multisig`] for registered wallets and
//! [`casa`] for Casa-coordinated vaults.

use base64::{Engine, engine::general_purpose::STANDARD};
use bitcoin::bip32::{Fingerprint, KeySource};
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::psbt::{Input, Psbt};
use bitcoin::script::Instruction;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Network, Script, ScriptBuf, Txid};

use crate::error::{Error, Result};
use crate::path::HdPath;
use crate::transaction::SignStatus;

pub mod casa;
pub mod multisig;
pub mod single;

pub use casa::adapt_casa;
pub use multisig::adapt_multisig;
pub use single::{SingleSigKeys, adapt_single};

const PSBT_MAGIC: &[u8] = b"psbt\xff";

/// Accepts a serialized PSBT either raw or as base64 text.
pub fn decode_psbt(data: &[u8]) -> Result<Psbt> {
    let raw = if data.starts_with(PSBT_MAGIC) {
        data.to_vec()
    } else {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidPsbt("neither binary nor base64".into()))?;
        STANDARD
            .decode(text.trim())
            .map_err(|e| Error::InvalidPsbt(e.to_string()))?
    };
    Psbt::deserialize(&raw).map_err(|e| Error::InvalidPsbt(e.to_string()))
}

/// One bip32 derivation entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOrigin {
    pub fingerprint: Fingerprint,
    pub path: HdPath,
    pub public_key: PublicKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultisigPolicy {
    pub threshold: u8,
    pub total: u8,
}

#[derive(Debug, Clone)]
pub struct PsbtInput {
    pub txid: Txid,
    pub vout: u32,
    /// Value of the spent output.
    pub value: u64,
    /// Address of the spent output, as the PSBT describes it.
    pub address: Option<String>,
    pub derivations: Vec<KeyOrigin>,
    pub policy: Option<MultisigPolicy>,
    pub partial_sigs: usize,
}

impl PsbtInput {
    pub fn fingerprints(&self) -> Vec<String> {
        self.derivations
            .iter()
            .map(|d| d.fingerprint.to_string())
            .collect()
    }

    /// `<partial sigs>-<threshold>-<total>`
    pub fn sign_status(&self) -> Result<SignStatus> {
        let policy = self
            .policy
            .ok_or_else(|| Error::InvalidPsbt("input has no multisig script".into()))?;
        let signed = u8::try_from(self.partial_sigs)
            .unwrap_or(u8::MAX)
            .min(policy.total);
        SignStatus::new(signed, policy.threshold, policy.total)
    }
}

#[derive(Debug, Clone)]
pub struct PsbtOutput {
    pub script_pubkey: ScriptBuf,
    pub value: u64,
    pub derivations: Vec<KeyOrigin>,
}

impl PsbtOutput {
    /// Address for `network`, or the script hex for outputs without one.
    pub fn address(&self, network: Network) -> String {
        Address::from_script(&self.script_pubkey, network)
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.script_pubkey.to_hex_string())
    }
}

#[derive(Debug, Clone)]
pub struct PsbtSummary {
    pub inputs: Vec<PsbtInput>,
    pub outputs: Vec<PsbtOutput>,
}

impl PsbtSummary {
    pub fn from_psbt(psbt: &Psbt, network: Network) -> Result<Self> {
        let tx = &psbt.unsigned_tx;
        if tx.input.is_empty() || tx.output.is_empty() {
            return Err(Error::InvalidPsbt("transaction has no inputs or outputs".into()));
        }

        let inputs = tx
            .input
            .iter()
            .zip(&psbt.inputs)
            .enumerate()
            .map(|(index, (txin, input))| {
                let prevout = spent_output(input, txin.previous_output.vout).ok_or_else(|| {
                    Error::InvalidPsbt(format!("input {index}: spent output is missing"))
                })?;
                Ok(PsbtInput {
                    txid: txin.previous_output.txid,
                    vout: txin.previous_output.vout,
                    value: prevout.value.to_sat(),
                    address: Address::from_script(&prevout.script_pubkey, network)
                        .ok()
                        .map(|a| a.to_string()),
                    derivations: origins(input.bip32_derivation.iter()),
                    policy: input
                        .witness_script
                        .as_deref()
                        .or(input.redeem_script.as_deref())
                        .and_then(multisig_policy),
                    partial_sigs: input.partial_sigs.len(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let outputs = tx
            .output
            .iter()
            .zip(&psbt.outputs)
            .map(|(txout, output)| PsbtOutput {
                script_pubkey: txout.script_pubkey.clone(),
                value: txout.value.to_sat(),
                derivations: origins(output.bip32_derivation.iter()),
            })
            .collect();

        Ok(PsbtSummary { inputs, outputs })
    }

    /// Whether the first input spends a multisig script.
    pub fn is_multisig(&self) -> bool {
        self.inputs.first().is_some_and(|i| i.policy.is_some())
    }

    /// Inputs minus outputs. Spending more than is funded is malformed.
    pub fn fee(&self) -> Result<u64> {
        let overflow = || Error::InvalidPsbt("amounts overflow".into());
        let funded = self
            .inputs
            .iter()
            .try_fold(0u64, |acc, i| acc.checked_add(i.value))
            .ok_or_else(overflow)?;
        let spent = self
            .outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
            .ok_or_else(overflow)?;
        funded.checked_sub(spent).ok_or_else(|| {
            Error::InvalidPsbt(format!("outputs spend {spent} sats but inputs fund {funded}"))
        })
    }
}

fn spent_output(input: &Input, vout: u32) -> Option<&bitcoin::TxOut> {
    input.witness_utxo.as_ref().or_else(|| {
        input
            .non_witness_utxo
            .as_ref()
            .and_then(|tx| tx.output.get(vout as usize))
    })
}

fn origins<'a>(
    entries: impl Iterator<Item = (&'a PublicKey, &'a KeySource)>,
) -> Vec<KeyOrigin> {
    entries
        .map(|(public_key, (fingerprint, path))| KeyOrigin {
            fingerprint: *fingerprint,
            path: HdPath::from(path),
            public_key: *public_key,
        })
        .collect()
}

/// Reads `OP_k <key>... OP_n OP_CHECKMULTISIG`.
pub fn multisig_policy(script: &Script) -> Option<MultisigPolicy> {
    let instructions: Vec<Instruction<'_>> = script.instructions().collect::<Result<_, _>>().ok()?;
    let [Instruction::Op(first), keys @ .., Instruction::Op(count), Instruction::Op(check)] =
        instructions.as_slice()
    else {
        return None;
    };
    if *check != OP_CHECKMULTISIG {
        return None;
    }
    let threshold = pushnum(first.to_u8())?;
    let total = pushnum(count.to_u8())?;
    let well_formed = keys.iter().all(|k| {
        matches!(k, Instruction::PushBytes(bytes) if bytes.len() == 33 || bytes.len() == 65)
    });
    if !well_formed || keys.len() != usize::from(total) || threshold > total {
        return None;
    }
    Some(MultisigPolicy { threshold, total })
}

fn pushnum(op: u8) -> Option<u8> {
    (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8())
        .contains(&op)
        .then(|| op - OP_PUSHNUM_1.to_u8() + 1)
}
