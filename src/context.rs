//! Key material a proposal was resolved against.
//!
//! Produced once by adaptation (or by looking up what a JSON descriptor
//! refers to) and handed explicitly to verification and signer assembly.

use bitcoin::Network;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::path::HdPath;
use crate::store::{Account, KeyStore, Repository};
use crate::transaction::{Transaction, TxKind};
use crate::wallet::MultisigWallet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionContext {
    SingleSig {
        /// Accounts by account path.
        accounts: BTreeMap<HdPath, Account>,
    },
    LegacyMultisig {
        wallet: MultisigWallet,
    },
    Casa {
        network: Network,
    },
}

impl ResolutionContext {
    pub fn single(account: Account) -> Self {
        let mut accounts = BTreeMap::new();
        accounts.insert(account.path.clone(), account);
        ResolutionContext::SingleSig { accounts }
    }

    /// The account owning an address path, found by the path's account prefix.
    pub fn account_for(&self, path: &HdPath) -> Option<&Account> {
        match self {
            ResolutionContext::SingleSig { accounts } => accounts.get(&path.account().ok()?),
            _ => None,
        }
    }

    pub fn wallet(&self) -> Option<&MultisigWallet> {
        match self {
            ResolutionContext::LegacyMultisig { wallet } => Some(wallet),
            _ => None,
        }
    }

    /// Looks up what a normalized JSON transaction refers to. Single-sig
    /// accounts come from the repository, falling back to `default_account`
    /// (the configured account, read from the key store). Accounts that
    /// cannot be found are left out and surface later as verification or
    /// assembly errors.
    pub fn for_transaction<K, R>(
        tx: &Transaction,
        keys: &K,
        repo: &R,
        default_account: &Account,
    ) -> Result<Self>
    where
        K: KeyStore + ?Sized,
        R: Repository + ?Sized,
    {
        match &tx.kind {
            TxKind::SingleSig => {
                let mut accounts = BTreeMap::new();
                for path in tx.distinct_paths() {
                    let Ok(account_path) = path.account() else {
                        continue;
                    };
                    if accounts.contains_key(&account_path) {
                        continue;
                    }
                    let account = match repo.load_account_by_path(&account_path)? {
                        Some(account) => Some(account),
                        None if account_path == default_account.path => Some(default_account.clone()),
                        None => None,
                    };
                    if let Some(account) = account {
                        accounts.insert(account_path, account);
                    }
                }
                Ok(ResolutionContext::SingleSig { accounts })
            }
            TxKind::LegacyMultisig {
                wallet_fingerprint,
                sign_status,
            } => {
                let wallet = repo
                    .load_multisig_wallet(wallet_fingerprint)?
                    .filter(|w| w.belongs_to(keys.master_fingerprint()))
                    .ok_or_else(|| Error::NoMatchedMultisigWallet {
                        digest: wallet_fingerprint.clone(),
                        threshold: sign_status.threshold(),
                        total: sign_status.total(),
                    })?;
                Ok(ResolutionContext::LegacyMultisig { wallet })
            }
            TxKind::Casa { .. } => Ok(ResolutionContext::Casa {
                network: tx.coin.network(),
            }),
        }
    }
}
