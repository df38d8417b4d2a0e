//! Deterministic devices and PSBTs shared by the integration tests.

#![allow(dead_code)]

use bitcoin::bip32::{Fingerprint, Xpub};
use bitcoin::psbt::Psbt;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness, absolute, transaction,
};
use miniscript::Descriptor;
use miniscript::descriptor::DefiniteDescriptorKey;
use std::str::FromStr;

use cold_confirm::derive::{MultisigScript, ScriptType, derive_address, derive_public_key, multisig_descriptor};
use cold_confirm::psbt::casa::casa_prefix;
use cold_confirm::{
    ConfirmEngine, EngineConfig, HdPath, KeyStore, MemoryRepository, MultisigMode,
    SoftwareKeyStore,
};

pub const PASSWORD: &str = "1234";
pub const NETWORK: Network = Network::Testnet;
/// BIP173 testnet example, owned by nobody in these tests.
pub const DESTINATION: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

pub type TestEngine = ConfirmEngine<SoftwareKeyStore, MemoryRepository>;

pub fn device(seed: u8) -> SoftwareKeyStore {
    SoftwareKeyStore::from_seed(&[seed; 32], NETWORK, PASSWORD).unwrap()
}

pub fn config(mode: MultisigMode) -> EngineConfig {
    EngineConfig {
        network: NETWORK,
        account: ScriptType::P2wpkh,
        multisig_mode: mode,
        sign_id: "PSBT".into(),
        max_address_gap: 25,
    }
}

pub fn engine(seed: u8) -> TestEngine {
    ConfirmEngine::new(device(seed), MemoryRepository::new(), config(MultisigMode::Legacy))
}

pub fn casa_engine(seed: u8) -> TestEngine {
    ConfirmEngine::new(device(seed), MemoryRepository::new(), config(MultisigMode::Casa))
}

pub fn destination() -> ScriptBuf {
    Address::from_str(DESTINATION)
        .unwrap()
        .require_network(NETWORK)
        .unwrap()
        .script_pubkey()
}

fn unsigned_psbt(prevouts: &[(u8, u32)], outputs: Vec<TxOut>) -> Psbt {
    let input = prevouts
        .iter()
        .map(|(tag, vout)| TxIn {
            previous_output: OutPoint {
                txid: Txid::from_str(&format!("{:064x}", u64::from(*tag) + 1)).unwrap(),
                vout: *vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        })
        .collect();
    let tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input,
        output: outputs,
    };
    Psbt::from_unsigned_tx(tx).unwrap()
}

pub fn to_base64(psbt: &Psbt) -> Vec<u8> {
    use base64::{Engine, engine::general_purpose::STANDARD};
    STANDARD.encode(psbt.serialize()).into_bytes()
}

/// An input spending `value` from `(change, index)`. `claimed` replaces the
/// address the spent output pays to.
#[derive(Debug, Clone, Copy)]
pub struct Spend {
    pub change: u32,
    pub index: u32,
    pub value: u64,
    pub claimed: Option<(u32, u32)>,
}

impl Spend {
    pub fn new(change: u32, index: u32, value: u64) -> Self {
        Spend {
            change,
            index,
            value,
            claimed: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Pay {
    /// To the shared foreign destination.
    External(u64),
    /// Back to the wallet, derivations included.
    Change { change: u32, index: u32, value: u64 },
    /// Pays to `actual` while the derivations claim `claimed`.
    ForgedChange {
        claimed: (u32, u32),
        actual: (u32, u32),
        value: u64,
    },
}

/// A single-sig P2WPKH account on the device with `seed`.
pub struct SingleSig {
    pub device: SoftwareKeyStore,
    pub root: Fingerprint,
    pub account_path: HdPath,
    pub xpub: Xpub,
}

impl SingleSig {
    pub fn new(seed: u8) -> Self {
        let device = device(seed);
        let account_path = ScriptType::P2wpkh.account_path(NETWORK);
        let xpub = device.extended_public_key(&account_path).unwrap();
        SingleSig {
            root: device.master_fingerprint(),
            device,
            account_path,
            xpub,
        }
    }

    pub fn address(&self, change: u32, index: u32) -> Address {
        derive_address(&self.xpub, &[change, index], ScriptType::P2wpkh, NETWORK).unwrap()
    }

    fn origin(&self, change: u32, index: u32) -> (bitcoin::secp256k1::PublicKey, (Fingerprint, bitcoin::bip32::DerivationPath)) {
        let key = derive_public_key(&self.xpub, &[change, index]).unwrap();
        let path = HdPath::from_str(&format!("{}/{change}/{index}", self.account_path)).unwrap();
        (key, (self.root, path.to_derivation_path()))
    }

    pub fn psbt(&self, spends: &[Spend], pays: &[Pay]) -> Psbt {
        let prevouts: Vec<(u8, u32)> = spends.iter().map(|s| (s.index as u8, s.change)).collect();
        let outputs = pays
            .iter()
            .map(|pay| match *pay {
                Pay::External(value) => TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: destination(),
                },
                Pay::Change { change, index, value } => TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: self.address(change, index).script_pubkey(),
                },
                Pay::ForgedChange { actual, value, .. } => TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: self.address(actual.0, actual.1).script_pubkey(),
                },
            })
            .collect();
        let mut psbt = unsigned_psbt(&prevouts, outputs);
        for (i, spend) in spends.iter().enumerate() {
            let (paid_change, paid_index) = spend.claimed.unwrap_or((spend.change, spend.index));
            psbt.inputs[i].witness_utxo = Some(TxOut {
                value: Amount::from_sat(spend.value),
                script_pubkey: self.address(paid_change, paid_index).script_pubkey(),
            });
            let (key, source) = self.origin(spend.change, spend.index);
            psbt.inputs[i].bip32_derivation.insert(key, source);
        }
        for (i, pay) in pays.iter().enumerate() {
            let claimed = match *pay {
                Pay::External(_) => continue,
                Pay::Change { change, index, .. } => (change, index),
                Pay::ForgedChange { claimed, .. } => claimed,
            };
            let (key, source) = self.origin(claimed.0, claimed.1);
            psbt.outputs[i].bip32_derivation.insert(key, source);
        }
        psbt
    }
}

/// A P2WSH multisig wallet across the devices with `seeds`.
pub struct Multisig {
    pub devices: Vec<SoftwareKeyStore>,
    pub roots: Vec<Fingerprint>,
    pub xpubs: Vec<Xpub>,
    pub threshold: u8,
    pub base_path: HdPath,
    pub script: MultisigScript,
}

impl Multisig {
    pub fn new(seeds: &[u8], threshold: u8) -> Self {
        Self::with_base(seeds, threshold, MultisigScript::P2wsh.base_path(NETWORK))
    }

    /// Casa vaults: keys at `m/45'/1'/0'`, no stored wallet.
    pub fn casa(seeds: &[u8], threshold: u8) -> Self {
        let base = HdPath::from_str(&format!("{}/1'/0'", casa_prefix())).unwrap();
        Self::with_base(seeds, threshold, base)
    }

    fn with_base(seeds: &[u8], threshold: u8, base_path: HdPath) -> Self {
        let devices: Vec<SoftwareKeyStore> = seeds.iter().map(|s| device(*s)).collect();
        let roots = devices.iter().map(|d| d.master_fingerprint()).collect();
        let xpubs = devices
            .iter()
            .map(|d| d.extended_public_key(&base_path).unwrap())
            .collect();
        Multisig {
            devices,
            roots,
            xpubs,
            threshold,
            base_path,
            script: MultisigScript::P2wsh,
        }
    }

    /// Coldcard text setup file.
    pub fn setup_file(&self, name: &str) -> String {
        let mut text = format!(
            "# Coldcard Multisig setup file\nName: {name}\nPolicy: {} of {}\nDerivation: {}\nFormat: P2WSH\n\n",
            self.threshold,
            self.xpubs.len(),
            self.base_path
        );
        for (root, xpub) in self.roots.iter().zip(&self.xpubs) {
            text.push_str(&format!("{}: {}\n", root.to_string().to_uppercase(), xpub));
        }
        text
    }

    fn descriptor(&self, change: u32, index: u32) -> Descriptor<DefiniteDescriptorKey> {
        multisig_descriptor(usize::from(self.threshold), &self.xpubs, &[change, index], self.script)
            .unwrap()
    }

    pub fn address(&self, change: u32, index: u32) -> Address {
        Address::from_script(&self.descriptor(change, index).script_pubkey(), NETWORK).unwrap()
    }

    fn witness_script(&self, change: u32, index: u32) -> ScriptBuf {
        match self.descriptor(change, index) {
            Descriptor::Wsh(wsh) => wsh.inner_script(),
            other => panic!("expected wsh descriptor, got {other}"),
        }
    }

    fn origins(&self, change: u32, index: u32) -> Vec<(bitcoin::secp256k1::PublicKey, (Fingerprint, bitcoin::bip32::DerivationPath))> {
        let path = HdPath::from_str(&format!("{}/{change}/{index}", self.base_path)).unwrap();
        self.roots
            .iter()
            .zip(&self.xpubs)
            .map(|(root, xpub)| {
                let key = derive_public_key(xpub, &[change, index]).unwrap();
                (key, (*root, path.to_derivation_path()))
            })
            .collect()
    }

    pub fn psbt(&self, spends: &[Spend], pays: &[Pay]) -> Psbt {
        let prevouts: Vec<(u8, u32)> = spends
            .iter()
            .map(|s| (s.index as u8 + 100, s.change))
            .collect();
        let outputs = pays
            .iter()
            .map(|pay| match *pay {
                Pay::External(value) => TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: destination(),
                },
                Pay::Change { change, index, value } => TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: self.address(change, index).script_pubkey(),
                },
                Pay::ForgedChange { actual, value, .. } => TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: self.address(actual.0, actual.1).script_pubkey(),
                },
            })
            .collect();
        let mut psbt = unsigned_psbt(&prevouts, outputs);
        for (i, spend) in spends.iter().enumerate() {
            let (paid_change, paid_index) = spend.claimed.unwrap_or((spend.change, spend.index));
            psbt.inputs[i].witness_utxo = Some(TxOut {
                value: Amount::from_sat(spend.value),
                script_pubkey: self.address(paid_change, paid_index).script_pubkey(),
            });
            psbt.inputs[i].witness_script = Some(self.witness_script(spend.change, spend.index));
            psbt.inputs[i]
                .bip32_derivation
                .extend(self.origins(spend.change, spend.index));
        }
        for (i, pay) in pays.iter().enumerate() {
            let claimed = match *pay {
                Pay::External(_) => continue,
                Pay::Change { change, index, .. } => (change, index),
                Pay::ForgedChange { claimed, .. } => claimed,
            };
            psbt.outputs[i]
                .bip32_derivation
                .extend(self.origins(claimed.0, claimed.1));
        }
        psbt
    }
}
