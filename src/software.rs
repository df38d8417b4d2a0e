//! A key store and secure signer backed by an in-memory master key.
//!
//! Stands in for the device's secure element in the CLI and in tests. The
//! PSBT path signs every input whose bip32 derivations name one of the
//! assembled signer keys, the same way a hardware signer would.

use base64::{Engine, engine::general_purpose::STANDARD};
use bitcoin::bip32::{Fingerprint, Xpriv, Xpub};
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Network, NetworkKind};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{Level, event};

use crate::error::{Error, Result};
use crate::path::HdPath;
use crate::signing::{AuthToken, SecureSigner, SignEvent, SignRequest, SignerDescriptor};
use crate::store::KeyStore;

/// On-disk form of a device master key, written by `keygen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceKeyFile {
    pub name: String,
    pub xprv: String,
    pub fingerprint: String,
}

impl DeviceKeyFile {
    pub fn generate(name: &str, network: Network) -> Result<Self> {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let master = Xpriv::new_master(network, &seed)
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        let secp = Secp256k1::signing_only();
        Ok(DeviceKeyFile {
            name: name.to_string(),
            xprv: master.to_string(),
            fingerprint: master.fingerprint(&secp).to_string(),
        })
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn master(&self) -> Result<Xpriv> {
        Xpriv::from_str(&self.xprv).map_err(|e| Error::InvalidKey(e.to_string()))
    }
}

pub struct SoftwareKeyStore {
    secp: Secp256k1<All>,
    master: Xpriv,
    password: String,
    live_tokens: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for SoftwareKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareKeyStore")
            .field("fingerprint", &self.master_fingerprint())
            .finish_non_exhaustive()
    }
}

impl SoftwareKeyStore {
    pub fn new(master: Xpriv, password: impl Into<String>) -> Self {
        SoftwareKeyStore {
            secp: Secp256k1::new(),
            master,
            password: password.into(),
            live_tokens: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_seed(seed: &[u8], network: Network, password: impl Into<String>) -> Result<Self> {
        let master =
            Xpriv::new_master(network, seed).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self::new(master, password))
    }

    pub fn from_key_file(file: &DeviceKeyFile, password: impl Into<String>) -> Result<Self> {
        Ok(Self::new(file.master()?, password))
    }

    pub fn network(&self) -> NetworkKind {
        self.master.network
    }

    /// Number of tokens handed out and not yet invalidated.
    pub fn live_token_count(&self) -> usize {
        self.tokens().len()
    }

    fn tokens(&self) -> MutexGuard<'_, HashSet<String>> {
        self.live_tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn derive_priv(&self, path: &HdPath) -> Result<Xpriv> {
        self.master
            .derive_priv(&self.secp, &path.to_derivation_path())
            .map_err(|e| Error::invalid_path(path.to_string(), e.to_string()))
    }

    /// Private key for a signer descriptor, checked against the public key
    /// the descriptor expects.
    fn signing_key(&self, signer: &SignerDescriptor) -> Result<Xpriv> {
        let path: HdPath = signer.path.parse()?;
        let key = self.derive_priv(&path)?;
        let public_key = PublicKey::from_secret_key(&self.secp, &key.private_key);
        if public_key.to_string() != signer.public_key {
            return Err(Error::InvalidKey(format!(
                "key at {path} is not {}",
                signer.public_key
            )));
        }
        Ok(key)
    }

    fn sign_psbt(
        &self,
        psbt: &Psbt,
        signers: &[SignerDescriptor],
        events: &mut dyn FnMut(SignEvent),
    ) -> Result<Psbt> {
        let mut psbt = psbt.clone();
        let tx = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&tx);
        let total = psbt.inputs.len();
        let mut signed = 0;

        for index in 0..total {
            let input = &psbt.inputs[index];
            let found = input.bip32_derivation.keys().find_map(|public_key| {
                let encoded = public_key.to_string();
                signers
                    .iter()
                    .find(|s| s.public_key == encoded)
                    .map(|s| (*public_key, s))
            });
            let Some((public_key, signer)) = found else {
                continue;
            };
            let key = self.signing_key(signer)?;

            let digest: [u8; 32] = if let Some(witness_script) = &input.witness_script {
                let utxo = input
                    .witness_utxo
                    .as_ref()
                    .ok_or_else(|| Error::InvalidPsbt(format!("input {index}: missing witness utxo")))?;
                cache
                    .p2wsh_signature_hash(index, witness_script, utxo.value, EcdsaSighashType::All)
                    .map_err(|e| Error::InvalidPsbt(format!("input {index}: {e}")))?
                    .to_byte_array()
            } else if let Some(utxo) = &input.witness_utxo {
                let script = input.redeem_script.as_ref().unwrap_or(&utxo.script_pubkey);
                cache
                    .p2wpkh_signature_hash(index, script, utxo.value, EcdsaSighashType::All)
                    .map_err(|e| Error::InvalidPsbt(format!("input {index}: {e}")))?
                    .to_byte_array()
            } else {
                let vout = tx.input[index].previous_output.vout as usize;
                let spent = input
                    .non_witness_utxo
                    .as_ref()
                    .and_then(|prev| prev.output.get(vout))
                    .ok_or_else(|| Error::InvalidPsbt(format!("input {index}: missing utxo")))?;
                let script = input.redeem_script.as_ref().unwrap_or(&spent.script_pubkey);
                cache
                    .legacy_signature_hash(index, script, EcdsaSighashType::All.to_u32())
                    .map_err(|e| Error::InvalidPsbt(format!("input {index}: {e}")))?
                    .to_byte_array()
            };

            let message = Message::from_digest(digest);
            let signature = self.secp.sign_ecdsa(&message, &key.private_key);
            psbt.inputs[index].partial_sigs.insert(
                bitcoin::PublicKey::new(public_key),
                EcdsaSignature::sighash_all(signature),
            );
            signed += 1;
            events(SignEvent::Progress(progress(index + 1, total)));
        }

        if signed == 0 {
            return Err(Error::InvalidPsbt("no input matches the signer keys".into()));
        }
        event!(Level::DEBUG, signed, total, "psbt inputs signed");
        Ok(psbt)
    }

    /// Signs the digest of the descriptor JSON once per signer key.
    fn sign_descriptor(&self, request: &SignRequest<'_>) -> Result<String> {
        let descriptor = serde_json::to_vec(&request.transaction.to_descriptor())?;
        let message = Message::from_digest(Sha256::digest(&descriptor).into());
        let signatures = request
            .signers
            .iter()
            .map(|signer| {
                let key = self.signing_key(signer)?;
                let signature = self.secp.sign_ecdsa(&message, &key.private_key);
                Ok(DescriptorSignature {
                    path: signer.path.clone(),
                    public_key: signer.public_key.clone(),
                    signature: hex::encode(&*signature.serialize_der()),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(serde_json::to_string(&signatures)?)
    }

    fn run(
        &self,
        request: &SignRequest<'_>,
        events: &mut dyn FnMut(SignEvent),
    ) -> Result<(Option<String>, String)> {
        if !self.tokens().contains(request.token.expose()) {
            return Err(Error::Unauthorized);
        }
        match request.psbt {
            Some(psbt) => {
                let signed = self.sign_psbt(psbt, request.signers, events)?;
                // partially signed multisig transactions have no final id yet
                let txid = (!request.transaction.is_multisig())
                    .then(|| signed.unsigned_tx.compute_txid().to_string());
                Ok((txid, STANDARD.encode(signed.serialize())))
            }
            None => Ok((None, self.sign_descriptor(request)?)),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DescriptorSignature {
    path: String,
    public_key: String,
    signature: String,
}

fn progress(done: usize, total: usize) -> u8 {
    u8::try_from(done * 100 / total.max(1)).unwrap_or(100)
}

impl KeyStore for SoftwareKeyStore {
    fn master_fingerprint(&self) -> Fingerprint {
        self.master.fingerprint(&self.secp)
    }

    fn extended_public_key(&self, path: &HdPath) -> Result<Xpub> {
        Ok(Xpub::from_priv(&self.secp, &self.derive_priv(path)?))
    }

    fn auth_token(&self, credential: &str) -> Option<AuthToken> {
        if credential != self.password {
            event!(Level::WARN, "rejected signing credential");
            return None;
        }
        let mut raw = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = hex::encode(raw);
        self.tokens().insert(token.clone());
        Some(AuthToken::new(token))
    }

    fn invalidate_auth_token(&self, token: &AuthToken) {
        self.tokens().remove(token.expose());
    }
}

impl SecureSigner for SoftwareKeyStore {
    fn sign(&self, request: &SignRequest<'_>, events: &mut dyn FnMut(SignEvent)) {
        events(SignEvent::Started);
        match self.run(request, events) {
            Ok((txid, signed_payload)) => events(SignEvent::Success {
                txid,
                signed_payload,
            }),
            Err(err) => {
                event!(Level::WARN, error = %err, "software signer failed");
                events(SignEvent::Failed);
            }
        }
    }
}
