//! Internal transaction model and the JSON descriptor it is normalized from.

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::path::HdPath;
use crate::wallet::MAX_COSIGNERS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coin {
    Btc,
    Xtn,
}

impl Coin {
    pub fn code(self) -> &'static str {
        match self {
            Coin::Btc => "BTC",
            Coin::Xtn => "XTN",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "BTC" => Some(Coin::Btc),
            "XTN" => Some(Coin::Xtn),
            _ => None,
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Bitcoin => Coin::Btc,
            _ => Coin::Xtn,
        }
    }

    pub fn network(self) -> Network {
        match self {
            Coin::Btc => Network::Bitcoin,
            Coin::Xtn => Network::Testnet,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Coin::Btc => "BTC",
            Coin::Xtn => "tBTC",
        }
    }
}

/// Multisig progress counter, `<signed>-<threshold>-<total>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignStatus {
    signed: u8,
    threshold: u8,
    total: u8,
}

impl SignStatus {
    pub fn new(signed: u8, threshold: u8, total: u8) -> Result<Self> {
        if threshold == 0 || threshold > total || signed > total || total > MAX_COSIGNERS {
            return Err(Error::InvalidTransaction(format!(
                "sign status {signed}-{threshold}-{total} out of range"
            )));
        }
        Ok(SignStatus {
            signed,
            threshold,
            total,
        })
    }

    pub fn signed(&self) -> u8 {
        self.signed
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn total(&self) -> u8 {
        self.total
    }

    /// Every cosigner has signed, nothing left for this device to add.
    pub fn is_complete(&self) -> bool {
        self.signed >= self.total
    }

    /// One more signature. Never goes past `total`.
    pub fn increment(self) -> Result<Self> {
        if self.is_complete() {
            return Err(Error::InvalidTransaction(format!(
                "sign status {self} already complete"
            )));
        }
        Ok(SignStatus {
            signed: self.signed + 1,
            ..self
        })
    }
}

impl FromStr for SignStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('-').collect();
        let [signed, threshold, total] = parts.as_slice() else {
            return Err(Error::InvalidTransaction(format!("malformed sign status `{s}`")));
        };
        let parse = |v: &str| {
            v.parse::<u8>()
                .map_err(|_| Error::InvalidTransaction(format!("malformed sign status `{s}`")))
        };
        SignStatus::new(parse(signed)?, parse(threshold)?, parse(total)?)
    }
}

impl fmt::Display for SignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.signed, self.threshold, self.total)
    }
}

/// Signing mode of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxKind {
    SingleSig,
    LegacyMultisig {
        wallet_fingerprint: String,
        sign_status: SignStatus,
    },
    Casa {
        sign_status: SignStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoRef {
    pub hash: String,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub value: u64,
    pub path: HdPath,
    pub utxo: Option<UtxoRef>,
    pub public_key: Option<String>,
    /// Address the watch wallet says this input spends from.
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub address: String,
    pub value: u64,
    pub is_change: bool,
    pub change_path: Option<HdPath>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub coin: Coin,
    pub sign_id: String,
    pub timestamp: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub fee: u64,
    pub memo: String,
    pub kind: TxKind,
}

impl Transaction {
    pub fn is_multisig(&self) -> bool {
        !matches!(self.kind, TxKind::SingleSig)
    }

    pub fn sign_status(&self) -> Option<SignStatus> {
        match &self.kind {
            TxKind::SingleSig => None,
            TxKind::LegacyMultisig { sign_status, .. } | TxKind::Casa { sign_status } => {
                Some(*sign_status)
            }
        }
    }

    /// One path per input, repeats included.
    pub fn hd_paths(&self) -> Vec<&HdPath> {
        self.inputs.iter().map(|input| &input.path).collect()
    }

    /// Input paths in first-seen order, each once.
    pub fn distinct_paths(&self) -> Vec<&HdPath> {
        let mut seen = BTreeSet::new();
        self.inputs
            .iter()
            .map(|input| &input.path)
            .filter(|path| seen.insert(*path))
            .collect()
    }

    /// Value leaving the wallet, change excluded.
    pub fn amount(&self) -> u64 {
        self.outputs
            .iter()
            .filter(|o| !o.is_change)
            .map(|o| o.value)
            .sum()
    }

    pub fn formatted_amount(&self) -> String {
        format!("{} {}", format_amount(self.amount()), self.coin.unit())
    }

    pub fn formatted_fee(&self) -> String {
        format!("{} {}", format_amount(self.fee), self.coin.unit())
    }

    pub fn to_descriptor(&self) -> TxDescriptor {
        let (multisig, wallet_fingerprint, sign_status, casa) = match &self.kind {
            TxKind::SingleSig => (false, None, None, false),
            TxKind::LegacyMultisig {
                wallet_fingerprint,
                sign_status,
            } => (true, Some(wallet_fingerprint.clone()), Some(sign_status.to_string()), false),
            TxKind::Casa { sign_status } => (true, None, Some(sign_status.to_string()), true),
        };
        let body = UtxoTxBody {
            fee: self.fee,
            memo: self.memo.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|input| InputBody {
                    hash: input.utxo.as_ref().map(|u| u.hash.clone()).unwrap_or_default(),
                    index: input.utxo.as_ref().map(|u| u.index).unwrap_or_default(),
                    utxo: UtxoBody {
                        public_key: input.public_key.clone(),
                        value: input.value,
                        address: input.address.clone(),
                    },
                    owner_key_path: input.path.to_string(),
                    master_fingerprint: None,
                })
                .collect(),
            outputs: self
                .outputs
                .iter()
                .map(|output| OutputBody {
                    address: output.address.clone(),
                    value: output.value,
                    is_change: output.is_change,
                    change_address_path: output.change_path.as_ref().map(HdPath::to_string),
                })
                .collect(),
            multisig,
            wallet_fingerprint,
            sign_status,
            casa,
        };
        let (btc_tx, xtn_tx) = match self.coin {
            Coin::Btc => (Some(body), None),
            Coin::Xtn => (None, Some(body)),
        };
        TxDescriptor {
            coin_code: self.coin.code().to_string(),
            sign_id: self.sign_id.clone(),
            timestamp: self.timestamp,
            decimal: 8,
            btc_tx,
            xtn_tx,
        }
    }
}

/// Fixed-precision amount formatting: eight decimals, trailing zeros trimmed.
pub fn format_amount(sats: u64) -> String {
    let whole = sats / 100_000_000;
    let frac = sats % 100_000_000;
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{frac:08}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDescriptor {
    pub coin_code: String,
    pub sign_id: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default = "default_decimal")]
    pub decimal: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btc_tx: Option<UtxoTxBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xtn_tx: Option<UtxoTxBody>,
}

fn default_decimal() -> u8 {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoTxBody {
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub memo: String,
    pub inputs: Vec<InputBody>,
    pub outputs: Vec<OutputBody>,
    #[serde(default)]
    pub multisig: bool,
    #[serde(rename = "wallet_fingerprint", default, skip_serializing_if = "Option::is_none")]
    pub wallet_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_status: Option<String>,
    #[serde(default)]
    pub casa: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputBody {
    pub hash: String,
    pub index: u32,
    pub utxo: UtxoBody,
    pub owner_key_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputBody {
    pub address: String,
    pub value: u64,
    #[serde(default)]
    pub is_change: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_address_path: Option<String>,
}

/// Parses a JSON transaction descriptor.
pub fn normalize_transaction(json: &str) -> Result<Transaction> {
    let descriptor: TxDescriptor = serde_json::from_str(json)
        .map_err(|e| Error::InvalidTransaction(format!("undecodable descriptor: {e}")))?;
    normalize_descriptor(descriptor)
}

pub fn normalize_descriptor(descriptor: TxDescriptor) -> Result<Transaction> {
    let coin = Coin::from_code(&descriptor.coin_code).ok_or_else(|| {
        Error::InvalidTransaction(format!("unsupported coin `{}`", descriptor.coin_code))
    })?;
    let body = match coin {
        Coin::Btc => descriptor.btc_tx,
        Coin::Xtn => descriptor.xtn_tx,
    }
    .ok_or_else(|| {
        Error::InvalidTransaction(format!("missing transaction body for {}", coin.code()))
    })?;

    if body.inputs.is_empty() {
        return Err(Error::InvalidTransaction("no inputs".into()));
    }
    if body.outputs.is_empty() {
        return Err(Error::InvalidTransaction("no outputs".into()));
    }

    let inputs = body
        .inputs
        .into_iter()
        .map(|input| {
            Ok(TxInput {
                value: input.utxo.value,
                path: input.owner_key_path.parse()?,
                utxo: (!input.hash.is_empty()).then(|| UtxoRef {
                    hash: input.hash,
                    index: input.index,
                }),
                public_key: input.utxo.public_key,
                address: input.utxo.address,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let outputs = body
        .outputs
        .into_iter()
        .map(|output| {
            let change_path = output
                .change_address_path
                .as_deref()
                .map(HdPath::from_str)
                .transpose()?;
            Ok(TxOutput {
                address: output.address,
                value: output.value,
                is_change: output.is_change,
                change_path,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let kind = if body.multisig {
        let sign_status: SignStatus = body
            .sign_status
            .as_deref()
            .ok_or_else(|| Error::InvalidTransaction("multisig without signStatus".into()))?
            .parse()?;
        if body.casa {
            TxKind::Casa { sign_status }
        } else {
            let wallet_fingerprint = body.wallet_fingerprint.ok_or_else(|| {
                Error::InvalidTransaction("multisig without wallet_fingerprint".into())
            })?;
            TxKind::LegacyMultisig {
                wallet_fingerprint,
                sign_status,
            }
        }
    } else {
        TxKind::SingleSig
    };

    Ok(Transaction {
        coin,
        sign_id: descriptor.sign_id,
        timestamp: descriptor.timestamp,
        inputs,
        outputs,
        fee: body.fee,
        memo: body.memo,
        kind,
    })
}
