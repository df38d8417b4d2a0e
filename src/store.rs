//! Contracts of the collaborators the engine talks to, plus the records it
//! persists through them.

use bitcoin::bip32::{Fingerprint, Xpub};
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::derive::{ScriptType, derive_public_key};
use crate::error::{Error, Result};
use crate::path::HdPath;
use crate::signing::AuthToken;
use crate::transaction::Coin;
use crate::wallet::{MultisigAddress, MultisigWallet};

/// Device key material. Private keys never leave the implementation.
pub trait KeyStore {
    fn master_fingerprint(&self) -> Fingerprint;

    /// Extended public key at a (usually hardened) account path.
    fn extended_public_key(&self, path: &HdPath) -> Result<Xpub>;

    fn public_key_at(&self, path: &HdPath, indices: &[u32]) -> Result<PublicKey> {
        derive_public_key(&self.extended_public_key(path)?, indices)
    }

    /// Exchanges a user credential for a single-use signing token.
    fn auth_token(&self, credential: &str) -> Option<AuthToken>;

    fn invalidate_auth_token(&self, token: &AuthToken);
}

/// A registered single-sig account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub path: HdPath,
    pub xpub: Xpub,
    pub script: ScriptType,
}

/// Which slice of history a duplicate check compares against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryScope {
    Coin(Coin),
    Wallet(String),
}

/// One confirmed (or pending) transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_id: String,
    pub sign_id: String,
    pub coin: Coin,
    pub timestamp: u64,
    /// JSON array of `{address, value}`, derived locally.
    pub from: String,
    /// JSON array of `{address, value, isChange}`.
    pub to: String,
    pub amount: String,
    pub fee: String,
    pub memo: String,
    /// Root fingerprint for single-sig, wallet fingerprint for multisig.
    pub belong_to: String,
    pub sign_status: Option<String>,
    pub signed_payload: Option<String>,
}

impl TxRecord {
    pub fn is_signed(&self) -> bool {
        self.signed_payload.is_some()
    }

    /// Digest of everything but the identifier and the signed payload.
    pub fn content_digest(&self) -> Result<String> {
        let content = TxRecord {
            tx_id: String::new(),
            signed_payload: None,
            ..self.clone()
        };
        content_digest(&content)
    }

    pub fn matches(&self, scope: &HistoryScope) -> bool {
        match scope {
            HistoryScope::Coin(coin) => self.coin == *coin,
            HistoryScope::Wallet(fingerprint) => self.belong_to.eq_ignore_ascii_case(fingerprint),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasaSignature {
    pub id: Option<u64>,
    pub tx_id: String,
    pub signed_payload: Option<String>,
    pub sign_status: String,
    pub amount: String,
    pub from: String,
    pub to: String,
    pub fee: String,
    pub memo: String,
}

impl CasaSignature {
    pub fn content_digest(&self) -> Result<String> {
        let content = CasaSignature {
            id: None,
            tx_id: String::new(),
            signed_payload: None,
            ..self.clone()
        };
        content_digest(&content)
    }
}

fn content_digest<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

/// Persistence contract. Implementations must be safe to share between
/// validation threads.
pub trait Repository: Send + Sync {
    fn load_multisig_wallet(&self, fingerprint: &str) -> Result<Option<MultisigWallet>>;
    fn load_all_multisig_wallets(&self) -> Result<Vec<MultisigWallet>>;
    /// Inserts or replaces; returns true when the wallet was not stored before.
    fn save_multisig_wallet(&self, wallet: &MultisigWallet) -> Result<bool>;
    fn load_account_by_path(&self, path: &HdPath) -> Result<Option<Account>>;
    fn load_transaction_history(&self, scope: &HistoryScope) -> Result<Vec<TxRecord>>;
    fn insert_transaction(&self, record: TxRecord) -> Result<()>;
    fn insert_casa_signature(&self, signature: CasaSignature) -> Result<u64>;
    fn load_multisig_addresses(&self, wallet_fingerprint: &str) -> Result<Vec<MultisigAddress>>;
    fn insert_multisig_addresses(&self, batch: Vec<MultisigAddress>) -> Result<()>;
    fn delete_wallet(&self, fingerprint: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct Tables {
    wallets: BTreeMap<String, MultisigWallet>,
    accounts: BTreeMap<HdPath, Account>,
    history: Vec<TxRecord>,
    casa: Vec<CasaSignature>,
    addresses: Vec<MultisigAddress>,
}

/// Volatile repository, used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(self, account: Account) -> Self {
        self.tables().accounts.insert(account.path.clone(), account);
        self
    }

    pub fn add_account(&self, account: Account) {
        self.tables().accounts.insert(account.path.clone(), account);
    }

    pub fn casa_signatures(&self) -> Vec<CasaSignature> {
        self.tables().casa.clone()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Repository for MemoryRepository {
    fn load_multisig_wallet(&self, fingerprint: &str) -> Result<Option<MultisigWallet>> {
        Ok(self.tables().wallets.get(fingerprint).cloned())
    }

    fn load_all_multisig_wallets(&self) -> Result<Vec<MultisigWallet>> {
        Ok(self.tables().wallets.values().cloned().collect())
    }

    fn save_multisig_wallet(&self, wallet: &MultisigWallet) -> Result<bool> {
        let previous = self
            .tables()
            .wallets
            .insert(wallet.fingerprint.clone(), wallet.clone());
        Ok(previous.is_none())
    }

    fn load_account_by_path(&self, path: &HdPath) -> Result<Option<Account>> {
        Ok(self.tables().accounts.get(path).cloned())
    }

    fn load_transaction_history(&self, scope: &HistoryScope) -> Result<Vec<TxRecord>> {
        Ok(self
            .tables()
            .history
            .iter()
            .filter(|record| record.matches(scope))
            .cloned()
            .collect())
    }

    fn insert_transaction(&self, record: TxRecord) -> Result<()> {
        let mut tables = self.tables();
        if tables.history.iter().any(|r| r.tx_id == record.tx_id && r.belong_to == record.belong_to) {
            return Err(Error::Storage(format!("transaction {} already stored", record.tx_id)));
        }
        tables.history.push(record);
        Ok(())
    }

    fn insert_casa_signature(&self, mut signature: CasaSignature) -> Result<u64> {
        let mut tables = self.tables();
        let id = tables.casa.len() as u64 + 1;
        signature.id = Some(id);
        tables.casa.push(signature);
        Ok(id)
    }

    fn load_multisig_addresses(&self, wallet_fingerprint: &str) -> Result<Vec<MultisigAddress>> {
        Ok(self
            .tables()
            .addresses
            .iter()
            .filter(|a| a.wallet_fingerprint == wallet_fingerprint)
            .cloned()
            .collect())
    }

    fn insert_multisig_addresses(&self, batch: Vec<MultisigAddress>) -> Result<()> {
        let mut tables = self.tables();
        for address in batch {
            let exists = tables.addresses.iter().any(|a| {
                a.wallet_fingerprint == address.wallet_fingerprint
                    && a.change == address.change
                    && a.index == address.index
            });
            if exists {
                return Err(Error::Storage(format!("address {} already stored", address.path)));
            }
            tables.addresses.push(address);
        }
        Ok(())
    }

    fn delete_wallet(&self, fingerprint: &str) -> Result<()> {
        let mut tables = self.tables();
        tables.wallets.remove(fingerprint);
        tables.addresses.retain(|a| a.wallet_fingerprint != fingerprint);
        tables.history.retain(|r| !r.belong_to.eq_ignore_ascii_case(fingerprint));
        Ok(())
    }
}
