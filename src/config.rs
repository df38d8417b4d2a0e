//! Engine settings, read from a JSON file or left at their defaults.

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::derive::ScriptType;
use crate::error::Result;
use crate::path::HdPath;
use crate::transaction::Coin;

/// Which coordinator multisig PSBTs are expected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MultisigMode {
    #[default]
    Legacy,
    Casa,
}

pub const DEFAULT_ADDRESS_GAP: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub network: Network,
    /// Single-sig account the watch wallet is paired with.
    pub account: ScriptType,
    pub multisig_mode: MultisigMode,
    /// Sign id stamped on single-sig PSBT proposals.
    pub sign_id: String,
    /// How many unseen receive addresses one proposal may make the engine
    /// derive and store.
    pub max_address_gap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            network: Network::Bitcoin,
            account: ScriptType::P2shP2wpkh,
            multisig_mode: MultisigMode::Legacy,
            sign_id: "PSBT".to_string(),
            max_address_gap: DEFAULT_ADDRESS_GAP,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn account_path(&self) -> HdPath {
        self.account.account_path(self.network)
    }

    pub fn coin(&self) -> Coin {
        Coin::for_network(self.network)
    }
}
