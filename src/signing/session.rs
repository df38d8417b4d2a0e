//! One confirmation, from verified proposal to persisted signature.
//!
//! ```text
//! None --sign--> Signing --> SignSuccess --take_result--> None
//!                        \-> SignFail    --take_result--> None
//! ```

use tracing::{Level, event};

use super::{SecureSigner, SignEvent, SignRequest, SignState, TokenGuard, assemble_signers};
use crate::engine::{PendingRecord, Proposal};
use crate::error::{Error, Result};
use crate::fee_attack::FeeAttackVerdict;
use crate::store::{KeyStore, Repository};
use crate::transaction::SignStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignResult {
    pub tx_id: String,
    pub signed_payload: String,
    /// Status after this device's signature, multisig only.
    pub sign_status: Option<SignStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutcome {
    Signed(SignResult),
    Failed,
}

#[derive(Debug)]
pub struct SigningSession {
    proposal: Proposal,
    record: PendingRecord,
    verdict: FeeAttackVerdict,
    acknowledged: bool,
    signed: bool,
    state: SignState,
    outcome: Option<SignOutcome>,
}

impl SigningSession {
    pub(crate) fn new(proposal: Proposal, record: PendingRecord, verdict: FeeAttackVerdict) -> Self {
        SigningSession {
            proposal,
            record,
            verdict,
            acknowledged: false,
            signed: false,
            state: SignState::None,
            outcome: None,
        }
    }

    pub fn state(&self) -> SignState {
        self.state
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    pub fn record(&self) -> &PendingRecord {
        &self.record
    }

    pub fn verdict(&self) -> FeeAttackVerdict {
        self.verdict
    }

    /// User override for advisory verdicts. Duplicates of signed
    /// transactions stay blocked.
    pub fn acknowledge_warning(&mut self) -> Result<()> {
        if self.signed || self.verdict.is_hard_block() {
            return Err(Error::DuplicateTransaction {
                already_signed: true,
            });
        }
        self.acknowledged = true;
        Ok(())
    }

    /// Consumes a finished attempt and returns the session to `None`.
    pub fn take_result(&mut self) -> Option<SignOutcome> {
        match self.state {
            SignState::SignSuccess | SignState::SignFail => {
                self.state = SignState::None;
                self.outcome.take()
            }
            SignState::None | SignState::Signing => None,
        }
    }

    fn gate(&self) -> Result<()> {
        if self.signed {
            return Err(Error::DuplicateTransaction {
                already_signed: true,
            });
        }
        match self.verdict {
            FeeAttackVerdict::Normal => Ok(()),
            verdict if verdict.is_hard_block() => verdict.into_result(),
            verdict if self.acknowledged => {
                event!(Level::INFO, ?verdict, "signing after acknowledged warning");
                Ok(())
            }
            verdict => verdict.into_result(),
        }
    }

    /// Runs one signing attempt. The token is invalidated before this
    /// returns, on every path.
    pub fn sign<K, R>(
        &mut self,
        keys: &K,
        repo: &R,
        token: super::AuthToken,
        signer: &dyn SecureSigner,
    ) -> Result<SignResult>
    where
        K: KeyStore + ?Sized,
        R: Repository + ?Sized,
    {
        let guard = TokenGuard::new(keys, token);
        if self.state != SignState::None {
            return Err(Error::SigningInProgress);
        }
        self.gate()?;
        if let Some(status) = self.proposal.transaction.sign_status() {
            if status.is_complete() {
                return Err(Error::InvalidTransaction(format!(
                    "sign status {status} leaves nothing to sign"
                )));
            }
        }
        let signers = assemble_signers(&self.proposal.transaction, &self.proposal.context, keys)?;

        self.state = SignState::Signing;
        event!(Level::INFO, signers = signers.len(), "signing started");

        let mut finished: Option<Option<(Option<String>, String)>> = None;
        let request = SignRequest {
            transaction: &self.proposal.transaction,
            psbt: self.proposal.psbt.as_ref(),
            signers: &signers,
            token: guard.token(),
        };
        signer.sign(&request, &mut |signal| match signal {
            SignEvent::Started => event!(Level::DEBUG, "signer started"),
            SignEvent::Progress(percent) => event!(Level::DEBUG, percent, "signer progress"),
            SignEvent::Success {
                txid,
                signed_payload,
            } => {
                finished.get_or_insert(Some((txid, signed_payload)));
            }
            SignEvent::Failed => {
                finished.get_or_insert(None);
            }
        });

        let persisted = match finished.flatten() {
            Some((txid, payload)) => self.persist(repo, txid, payload),
            None => Err(Error::SignFail),
        };
        drop(guard);

        match persisted {
            Ok(result) => {
                self.state = SignState::SignSuccess;
                self.signed = true;
                self.outcome = Some(SignOutcome::Signed(result.clone()));
                event!(Level::INFO, tx_id = %result.tx_id, "signing succeeded");
                Ok(result)
            }
            Err(err) => {
                self.state = SignState::SignFail;
                self.outcome = Some(SignOutcome::Failed);
                event!(Level::WARN, error = %err, "signing failed");
                Err(err)
            }
        }
    }

    fn persist<R: Repository + ?Sized>(
        &self,
        repo: &R,
        txid: Option<String>,
        signed_payload: String,
    ) -> Result<SignResult> {
        let sign_status = self
            .proposal
            .transaction
            .sign_status()
            .map(SignStatus::increment)
            .transpose()?;
        let txid = txid.filter(|id| !id.is_empty());

        let tx_id = match &self.record {
            PendingRecord::Tx(pending) => {
                let mut record = pending.clone();
                record.sign_status = sign_status.map(|s| s.to_string());
                let tx_id = match txid {
                    Some(id) => id,
                    None => format!("unknown_txid_{}", record.content_digest()?),
                };
                record.tx_id = tx_id.clone();
                record.signed_payload = Some(signed_payload.clone());
                repo.insert_transaction(record)?;
                tx_id
            }
            PendingRecord::Casa(pending) => {
                let mut signature = pending.clone();
                if let Some(status) = sign_status {
                    signature.sign_status = status.to_string();
                }
                let tx_id = match txid {
                    Some(id) => id,
                    None => format!("unknown_txid_{}", signature.content_digest()?),
                };
                signature.tx_id = tx_id.clone();
                signature.signed_payload = Some(signed_payload.clone());
                repo.insert_casa_signature(signature)?;
                tx_id
            }
        };

        Ok(SignResult {
            tx_id,
            signed_payload,
            sign_status,
        })
    }
}
