//! The confirmation pipeline as one facade.
//!
//! A proposal enters through [`ConfirmEngine::normalize_transaction`] or
//! [`ConfirmEngine::adapt_psbt`], and either way comes out verified: every
//! change and input address it names has been re-derived from local key
//! material. [`ConfirmEngine::confirm`] then runs the duplicate check and
//! opens the [`SigningSession`] that drives the secure signer.

use bitcoin::Network;
use bitcoin::psbt::Psbt;
use serde::Serialize;
use tracing::{Level, event};

use crate::config::{EngineConfig, MultisigMode};
use crate::context::ResolutionContext;
use crate::error::{Error, Result};
use crate::fee_attack::{FeeAttackVerdict, check_fee_attack};
use crate::psbt::{PsbtSummary, SingleSigKeys, adapt_casa, adapt_multisig, adapt_single, decode_psbt};
use crate::signing::{AuthToken, SecureSigner, SignResult, SigningSession};
use crate::store::{Account, CasaSignature, HistoryScope, KeyStore, Repository, TxRecord};
use crate::transaction::{
    Coin, Transaction, TxDescriptor, TxKind, UtxoTxBody, normalize_descriptor,
};
use crate::verify::{local_input_addresses, verify_addresses};
use crate::wallet::{
    AddressGenerator, MultisigAddress, MultisigWallet, WalletDescriptor, decode_wallet_file,
    import::create_wallet,
};

/// A transaction that passed address verification, together with the key
/// material it was checked against.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub transaction: Transaction,
    pub context: ResolutionContext,
    /// Present when the proposal arrived as a PSBT.
    pub psbt: Option<Psbt>,
    /// Network addresses were rendered and verified for.
    pub network: Network,
}

/// What gets persisted once the signer succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRecord {
    Tx(TxRecord),
    Casa(CasaSignature),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Destination<'a> {
    address: &'a str,
    value: u64,
    is_change: bool,
}

pub struct ConfirmEngine<K, R> {
    keys: K,
    repo: R,
    config: EngineConfig,
    addresses: AddressGenerator,
}

impl<K: KeyStore, R: Repository> ConfirmEngine<K, R> {
    pub fn new(keys: K, repo: R, config: EngineConfig) -> Self {
        ConfirmEngine {
            keys,
            repo,
            config,
            addresses: AddressGenerator::new(),
        }
    }

    pub fn keys(&self) -> &K {
        &self.keys
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn addresses(&self) -> &AddressGenerator {
        &self.addresses
    }

    /// Exchanges a user credential for a signing token.
    pub fn authorize(&self, credential: &str) -> Result<AuthToken> {
        self.keys.auth_token(credential).ok_or(Error::Unauthorized)
    }

    /// The configured single-sig account, as registered or as the key store
    /// derives it.
    pub fn single_sig_account(&self) -> Result<Account> {
        let path = self.config.account_path();
        if let Some(account) = self.repo.load_account_by_path(&path)? {
            return Ok(account);
        }
        Ok(Account {
            xpub: self.keys.extended_public_key(&path)?,
            path,
            script: self.config.account,
        })
    }

    /// Parses and verifies a native JSON transaction descriptor.
    pub fn normalize_transaction(&self, json: &str) -> Result<Proposal> {
        let transaction = crate::transaction::normalize_transaction(json)?;
        let default_account = self.single_sig_account()?;
        let context =
            ResolutionContext::for_transaction(&transaction, &self.keys, &self.repo, &default_account)?;
        let network = self.network_for(transaction.coin);
        verify_addresses(&transaction, &context, network)?;
        Ok(Proposal {
            transaction,
            context,
            psbt: None,
            network,
        })
    }

    /// Adapts and verifies a PSBT, raw or base64. `expect_multisig` is what
    /// the caller scanned it as; a PSBT of the other kind is rejected.
    pub fn adapt_psbt(&self, data: &[u8], expect_multisig: bool) -> Result<Proposal> {
        let psbt = decode_psbt(data)?;
        let network = self.config.network;
        let summary = PsbtSummary::from_psbt(&psbt, network)?;
        if summary.is_multisig() != expect_multisig {
            return Err(Error::MultisigMismatch {
                expected_multisig: expect_multisig,
            });
        }
        let device = self.keys.master_fingerprint();

        let (body, context, network, scope) = if !expect_multisig {
            let account = self.single_sig_account()?;
            let body = adapt_single(
                &summary,
                &SingleSigKeys {
                    root: device,
                    account: &account,
                },
                network,
            )?;
            let scope = HistoryScope::Coin(self.config.coin());
            (body, ResolutionContext::single(account), network, scope)
        } else {
            match self.config.multisig_mode {
                MultisigMode::Legacy => {
                    let wallets = self.repo.load_all_multisig_wallets()?;
                    let (body, wallet) = adapt_multisig(&summary, device, &wallets, network)?;
                    let scope = HistoryScope::Wallet(wallet.fingerprint.clone());
                    (body, ResolutionContext::LegacyMultisig { wallet }, network, scope)
                }
                MultisigMode::Casa => {
                    let (body, network) = adapt_casa(&summary, device)?;
                    let scope = HistoryScope::Coin(Coin::for_network(network));
                    (body, ResolutionContext::Casa { network }, network, scope)
                }
            }
        };

        let coin = Coin::for_network(network);
        let descriptor = self.descriptor_for(body, coin, expect_multisig, &scope)?;
        let transaction = normalize_descriptor(descriptor)?;
        verify_addresses(&transaction, &context, network)?;
        let proposal = Proposal {
            transaction,
            context,
            psbt: Some(psbt),
            network,
        };
        event!(
            Level::INFO,
            coin = proposal.transaction.coin.code(),
            inputs = proposal.transaction.inputs.len(),
            amount = %proposal.transaction.formatted_amount(),
            fee = %proposal.transaction.formatted_fee(),
            "psbt proposal verified"
        );
        Ok(proposal)
    }

    /// The configured network when it carries `coin`, so regtest setups
    /// keep their own address encoding.
    fn network_for(&self, coin: Coin) -> Network {
        if self.config.coin() == coin {
            self.config.network
        } else {
            coin.network()
        }
    }

    fn descriptor_for(
        &self,
        body: UtxoTxBody,
        coin: Coin,
        multisig: bool,
        scope: &HistoryScope,
    ) -> Result<TxDescriptor> {
        let timestamp = self
            .repo
            .load_transaction_history(scope)?
            .iter()
            .map(|record| record.timestamp)
            .max()
            .map_or(0, |latest| latest + 1);
        let sign_id = if multisig {
            "PSBT_MULTISIG".to_string()
        } else {
            self.config.sign_id.clone()
        };
        let (btc_tx, xtn_tx) = match coin {
            Coin::Btc => (Some(body), None),
            Coin::Xtn => (None, Some(body)),
        };
        Ok(TxDescriptor {
            coin_code: coin.code().to_string(),
            sign_id,
            timestamp,
            decimal: 8,
            btc_tx,
            xtn_tx,
        })
    }

    /// Compares the proposal with earlier transactions of the same coin
    /// (single-sig) or wallet (multisig). Casa proposals are never flagged.
    pub fn check_duplicate_or_fee_attack(&self, proposal: &Proposal) -> Result<FeeAttackVerdict> {
        let (_, verdict) = self.assess(proposal)?;
        Ok(verdict)
    }

    fn assess(&self, proposal: &Proposal) -> Result<(PendingRecord, FeeAttackVerdict)> {
        let record = self.pending_record(proposal)?;
        let verdict = match &record {
            PendingRecord::Casa(_) => FeeAttackVerdict::Normal,
            PendingRecord::Tx(candidate) => {
                let scope = match &proposal.transaction.kind {
                    TxKind::SingleSig => HistoryScope::Coin(candidate.coin),
                    _ => HistoryScope::Wallet(candidate.belong_to.clone()),
                };
                let history = self.repo.load_transaction_history(&scope)?;
                check_fee_attack(candidate, &history)
            }
        };
        Ok((record, verdict))
    }

    fn pending_record(&self, proposal: &Proposal) -> Result<PendingRecord> {
        let tx = &proposal.transaction;
        if let Some(wallet) = proposal.context.wallet() {
            self.cache_input_addresses(wallet, tx)?;
        }
        let from = serde_json::to_string(&local_input_addresses(
            tx,
            &proposal.context,
            proposal.network,
        )?)?;
        let to = serde_json::to_string(
            &tx.outputs
                .iter()
                .map(|output| Destination {
                    address: &output.address,
                    value: output.value,
                    is_change: output.is_change,
                })
                .collect::<Vec<_>>(),
        )?;
        let sign_status = tx.sign_status().map(|status| status.to_string());

        Ok(match &proposal.context {
            ResolutionContext::Casa { .. } => PendingRecord::Casa(CasaSignature {
                id: None,
                tx_id: String::new(),
                signed_payload: None,
                sign_status: sign_status.unwrap_or_default(),
                amount: tx.formatted_amount(),
                from,
                to,
                fee: tx.formatted_fee(),
                memo: tx.memo.clone(),
            }),
            context => PendingRecord::Tx(TxRecord {
                tx_id: String::new(),
                sign_id: tx.sign_id.clone(),
                coin: tx.coin,
                timestamp: tx.timestamp,
                from,
                to,
                amount: tx.formatted_amount(),
                fee: tx.formatted_fee(),
                memo: tx.memo.clone(),
                belong_to: match context.wallet() {
                    Some(wallet) => wallet.fingerprint.clone(),
                    None => self.keys.master_fingerprint().to_string(),
                },
                sign_status,
                signed_payload: None,
            }),
        })
    }

    /// Extends the stored receive addresses to cover every receive index
    /// spent from, at most `max_address_gap` new entries per path.
    fn cache_input_addresses(&self, wallet: &MultisigWallet, tx: &Transaction) -> Result<()> {
        for path in tx.distinct_paths() {
            let (change, index) = wallet.address_indices(path)?;
            if change != 0 {
                continue;
            }
            self.addresses
                .ensure(&self.repo, wallet, change, index, self.config.max_address_gap)?;
        }
        Ok(())
    }

    /// Runs the duplicate check and opens a signing session for `proposal`.
    pub fn confirm(&self, proposal: Proposal) -> Result<SigningSession> {
        let (record, verdict) = self.assess(&proposal)?;
        Ok(SigningSession::new(proposal, record, verdict))
    }

    pub fn begin_signing(
        &self,
        session: &mut SigningSession,
        token: AuthToken,
        signer: &dyn SecureSigner,
    ) -> Result<SignResult> {
        session.sign(&self.keys, &self.repo, token, signer)
    }

    /// Registers a multisig wallet this device is a cosigner of. Importing
    /// the same wallet again updates it in place.
    pub fn import_multisig_wallet(&self, descriptor: WalletDescriptor) -> Result<MultisigWallet> {
        let network = self.config.network;
        let device_xpub = self
            .keys
            .extended_public_key(&descriptor.base_path(network))?;
        let wallet = create_wallet(
            descriptor,
            self.keys.master_fingerprint(),
            &device_xpub,
            network,
        )?;
        let created = self.repo.save_multisig_wallet(&wallet)?;
        if created {
            self.addresses.generate(&self.repo, &wallet, 0, 1)?;
            self.addresses.generate(&self.repo, &wallet, 1, 1)?;
        }
        event!(
            Level::INFO,
            wallet = %wallet.fingerprint,
            name = %wallet.name,
            policy = %format!("{}-of-{}", wallet.threshold, wallet.total),
            created,
            "multisig wallet imported"
        );
        Ok(wallet)
    }

    /// Decodes a Coldcard or Caravan setup file and imports it.
    pub fn import_wallet_file(&self, content: &str) -> Result<MultisigWallet> {
        self.import_multisig_wallet(decode_wallet_file(content)?)
    }

    /// Removes a wallet together with its addresses and history.
    pub fn delete_multisig_wallet(&self, fingerprint: &str) -> Result<()> {
        self.repo.delete_wallet(fingerprint)?;
        event!(Level::INFO, wallet = %fingerprint, "multisig wallet deleted");
        Ok(())
    }

    /// Appends `count` addresses on a branch of a stored wallet.
    pub fn generate_addresses(
        &self,
        fingerprint: &str,
        change: u32,
        count: u32,
    ) -> Result<Vec<MultisigAddress>> {
        let wallet = self
            .repo
            .load_multisig_wallet(fingerprint)?
            .ok_or_else(|| Error::InvalidWallet(format!("no wallet {fingerprint}")))?;
        self.addresses.generate(&self.repo, &wallet, change, count)
    }
}
