//! Cached multisig addresses, generated lazily per wallet and branch.

use bitcoin::bip32::ChildNumber;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{Level, event};

use super::MultisigWallet;
use crate::error::{Error, Result};
use crate::path::HdPath;
use crate::store::Repository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigAddress {
    pub wallet_fingerprint: String,
    /// 0 receive, 1 change
    pub change: u32,
    pub index: u32,
    pub path: HdPath,
    pub address: String,
    pub name: String,
}

/// Serializes address generation per wallet. Callers for the same wallet
/// wait for each other; different wallets proceed in parallel.
#[derive(Debug, Default)]
pub struct AddressGenerator {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AddressGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn wallet_lock(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(fingerprint.to_string()).or_default().clone()
    }

    /// Appends `count` addresses after the highest stored index of `change`.
    pub fn generate<R: Repository + ?Sized>(
        &self,
        repo: &R,
        wallet: &MultisigWallet,
        change: u32,
        count: u32,
    ) -> Result<Vec<MultisigAddress>> {
        let lock = self.wallet_lock(&wallet.fingerprint);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = next_index(repo, wallet, change)?;
        self.write_batch(repo, wallet, change, next, count)
    }

    /// Makes sure every index up to and including `up_to` exists on the
    /// `change` branch. Needing more than `max_gap` new addresses is an
    /// `InvalidPath`; nothing is written then.
    pub fn ensure<R: Repository + ?Sized>(
        &self,
        repo: &R,
        wallet: &MultisigWallet,
        change: u32,
        up_to: u32,
        max_gap: u32,
    ) -> Result<Vec<MultisigAddress>> {
        let lock = self.wallet_lock(&wallet.fingerprint);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = next_index(repo, wallet, change)?;
        if next > up_to {
            return Ok(Vec::new());
        }
        let missing = up_to - next + 1;
        if missing > max_gap {
            let path = wallet.base_path.extend(&[
                ChildNumber::Normal { index: change },
                ChildNumber::Normal { index: up_to },
            ]);
            return Err(Error::invalid_path(
                path.to_string(),
                format!("{missing} addresses past the last known index, limit is {max_gap}"),
            ));
        }
        self.write_batch(repo, wallet, change, next, missing)
    }

    fn write_batch<R: Repository + ?Sized>(
        &self,
        repo: &R,
        wallet: &MultisigWallet,
        change: u32,
        start: u32,
        count: u32,
    ) -> Result<Vec<MultisigAddress>> {
        let batch = (start..start.saturating_add(count))
            .map(|index| {
                let address = wallet.derive_address(change, index)?;
                Ok(MultisigAddress {
                    wallet_fingerprint: wallet.fingerprint.clone(),
                    change,
                    index,
                    path: wallet
                        .base_path
                        .extend(&[ChildNumber::Normal { index: change }, ChildNumber::Normal { index }]),
                    address: address.to_string(),
                    name: format!("BTC-{index}"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        repo.insert_multisig_addresses(batch.clone())?;
        event!(
            Level::DEBUG,
            wallet = %wallet.fingerprint,
            change,
            start,
            count,
            "generated multisig addresses"
        );
        Ok(batch)
    }
}

fn next_index<R: Repository + ?Sized>(
    repo: &R,
    wallet: &MultisigWallet,
    change: u32,
) -> Result<u32> {
    Ok(repo
        .load_multisig_addresses(&wallet.fingerprint)?
        .iter()
        .filter(|a| a.change == change)
        .map(|a| a.index + 1)
        .max()
        .unwrap_or(0))
}
