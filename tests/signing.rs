mod common;

use std::cell::Cell;

use cold_confirm::signing::{SignEvent, SignRequest};
use cold_confirm::store::{HistoryScope, Repository};
use cold_confirm::{
    Coin, Error, FeeAttackVerdict, PendingRecord, SecureSigner, SignOutcome, SignState, TxKind,
};
use common::{Multisig, PASSWORD, Pay, SingleSig, Spend, casa_engine, engine, to_base64};

/// Fails the first `failures` attempts, then defers to the software signer.
struct Flaky<'a> {
    inner: &'a dyn SecureSigner,
    failures: Cell<u32>,
}

impl SecureSigner for Flaky<'_> {
    fn sign(&self, request: &SignRequest<'_>, events: &mut dyn FnMut(SignEvent)) {
        if self.failures.get() > 0 {
            self.failures.set(self.failures.get() - 1);
            events(SignEvent::Started);
            events(SignEvent::Failed);
            return;
        }
        self.inner.sign(request, events);
    }
}

/// Reports success with an empty transaction id.
struct Anonymous;

impl SecureSigner for Anonymous {
    fn sign(&self, _request: &SignRequest<'_>, events: &mut dyn FnMut(SignEvent)) {
        events(SignEvent::Success {
            txid: Some(String::new()),
            signed_payload: "signed".into(),
        });
    }
}

fn payment(account: &SingleSig, index: u32) -> Vec<u8> {
    to_base64(&account.psbt(
        &[Spend::new(0, index, 50_000)],
        &[
            Pay::External(30_000),
            Pay::Change {
                change: 1,
                index: 0,
                value: 19_000,
            },
        ],
    ))
}

#[test]
fn signs_once_and_records_history() {
    let account = SingleSig::new(7);
    let engine = engine(7);
    let proposal = engine.adapt_psbt(&payment(&account, 0), false).unwrap();
    let expected_txid = proposal.psbt.as_ref().unwrap().unsigned_tx.compute_txid().to_string();
    let mut session = engine.confirm(proposal).unwrap();
    assert_eq!(session.verdict(), FeeAttackVerdict::Normal);
    assert_eq!(session.state(), SignState::None);

    let token = engine.authorize(PASSWORD).unwrap();
    let result = engine.begin_signing(&mut session, token, engine.keys()).unwrap();
    assert_eq!(result.tx_id, expected_txid);
    assert!(result.sign_status.is_none());
    assert_eq!(engine.keys().live_token_count(), 0);

    let signed = cold_confirm::psbt::decode_psbt(result.signed_payload.as_bytes()).unwrap();
    assert_eq!(signed.inputs[0].partial_sigs.len(), 1);

    let history = engine
        .repo()
        .load_transaction_history(&HistoryScope::Coin(Coin::Xtn))
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].tx_id, expected_txid);
    assert_eq!(history[0].belong_to, account.root.to_string());
    assert!(history[0].is_signed());
    assert!(history[0].to.contains("\"isChange\":true"));

    assert_eq!(session.take_result(), Some(SignOutcome::Signed(result)));
    assert_eq!(session.state(), SignState::None);
    assert_eq!(session.take_result(), None);
}

#[test]
fn wrong_credential_is_unauthorized() {
    let engine = engine(7);
    assert!(matches!(engine.authorize("0000"), Err(Error::Unauthorized)));
}

#[test]
fn second_attempt_is_blocked() {
    let account = SingleSig::new(7);
    let engine = engine(7);
    let proposal = engine.adapt_psbt(&payment(&account, 0), false).unwrap();
    let mut session = engine.confirm(proposal).unwrap();
    let token = engine.authorize(PASSWORD).unwrap();
    engine.begin_signing(&mut session, token, engine.keys()).unwrap();

    let token = engine.authorize(PASSWORD).unwrap();
    let err = engine.begin_signing(&mut session, token, engine.keys()).unwrap_err();
    assert!(matches!(err, Error::SigningInProgress));
    assert_eq!(engine.keys().live_token_count(), 0);

    session.take_result();
    let token = engine.authorize(PASSWORD).unwrap();
    let err = engine.begin_signing(&mut session, token, engine.keys()).unwrap_err();
    assert!(matches!(err, Error::DuplicateTransaction { already_signed: true }));
}

#[test]
fn failure_invalidates_the_token_and_allows_a_retry() {
    let account = SingleSig::new(7);
    let engine = engine(7);
    let proposal = engine.adapt_psbt(&payment(&account, 0), false).unwrap();
    let mut session = engine.confirm(proposal).unwrap();
    let signer = Flaky {
        inner: engine.keys(),
        failures: Cell::new(1),
    };

    let token = engine.authorize(PASSWORD).unwrap();
    let err = engine.begin_signing(&mut session, token, &signer).unwrap_err();
    assert!(matches!(err, Error::SignFail));
    assert_eq!(session.state(), SignState::SignFail);
    assert_eq!(engine.keys().live_token_count(), 0);
    assert!(
        engine
            .repo()
            .load_transaction_history(&HistoryScope::Coin(Coin::Xtn))
            .unwrap()
            .is_empty()
    );

    assert_eq!(session.take_result(), Some(SignOutcome::Failed));
    let token = engine.authorize(PASSWORD).unwrap();
    engine.begin_signing(&mut session, token, &signer).unwrap();
    assert_eq!(session.state(), SignState::SignSuccess);
}

#[test]
fn invalidated_token_is_refused_by_the_signer() {
    let account = SingleSig::new(7);
    let engine = engine(7);
    let proposal = engine.adapt_psbt(&payment(&account, 0), false).unwrap();
    let mut session = engine.confirm(proposal).unwrap();

    let token = engine.authorize(PASSWORD).unwrap();
    cold_confirm::KeyStore::invalidate_auth_token(engine.keys(), &token);
    let err = engine.begin_signing(&mut session, token, engine.keys()).unwrap_err();
    assert!(matches!(err, Error::SignFail));
}

#[test]
fn resubmitting_a_signed_transaction_is_hard_blocked() {
    let account = SingleSig::new(7);
    let engine = engine(7);
    let proposal = engine.adapt_psbt(&payment(&account, 0), false).unwrap();
    let mut session = engine.confirm(proposal).unwrap();
    let token = engine.authorize(PASSWORD).unwrap();
    engine.begin_signing(&mut session, token, engine.keys()).unwrap();

    let again = engine.adapt_psbt(&payment(&account, 0), false).unwrap();
    assert_eq!(again.transaction.timestamp, 1);
    assert_eq!(
        engine.check_duplicate_or_fee_attack(&again).unwrap(),
        FeeAttackVerdict::Duplicate { already_signed: true }
    );
    let mut session = engine.confirm(again).unwrap();
    assert!(matches!(
        session.acknowledge_warning(),
        Err(Error::DuplicateTransaction { already_signed: true })
    ));
    let token = engine.authorize(PASSWORD).unwrap();
    let err = engine.begin_signing(&mut session, token, engine.keys()).unwrap_err();
    assert!(matches!(err, Error::DuplicateTransaction { already_signed: true }));
    assert_eq!(session.state(), SignState::None);
    assert_eq!(engine.keys().live_token_count(), 0);
}

#[test]
fn same_outputs_need_an_override() {
    let account = SingleSig::new(7);
    let engine = engine(7);
    let proposal = engine.adapt_psbt(&payment(&account, 0), false).unwrap();
    let mut session = engine.confirm(proposal).unwrap();
    let token = engine.authorize(PASSWORD).unwrap();
    engine.begin_signing(&mut session, token, engine.keys()).unwrap();

    // same recipients, paid from another coin
    let other = engine.adapt_psbt(&payment(&account, 1), false).unwrap();
    let mut session = engine.confirm(other).unwrap();
    assert_eq!(session.verdict(), FeeAttackVerdict::SameOutputs);

    let token = engine.authorize(PASSWORD).unwrap();
    let err = engine.begin_signing(&mut session, token, engine.keys()).unwrap_err();
    assert!(matches!(err, Error::SameOutputsWarning));
    assert_eq!(err.kind(), cold_confirm::ErrorKind::Advisory);

    session.acknowledge_warning().unwrap();
    let token = engine.authorize(PASSWORD).unwrap();
    engine.begin_signing(&mut session, token, engine.keys()).unwrap();
    assert_eq!(
        engine
            .repo()
            .load_transaction_history(&HistoryScope::Coin(Coin::Xtn))
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn synthetic_txid_is_reproducible() {
    let account = SingleSig::new(7);
    let sign = || {
        let engine = engine(7);
        let proposal = engine.adapt_psbt(&payment(&account, 0), false).unwrap();
        let mut session = engine.confirm(proposal).unwrap();
        let token = engine.authorize(PASSWORD).unwrap();
        let result = engine.begin_signing(&mut session, token, &Anonymous).unwrap();
        let stored = engine
            .repo()
            .load_transaction_history(&HistoryScope::Coin(Coin::Xtn))
            .unwrap()
            .remove(0);
        (result.tx_id, stored)
    };

    let (first, stored) = sign();
    let (second, _) = sign();
    assert_eq!(first, second);
    assert_eq!(first, format!("unknown_txid_{}", stored.content_digest().unwrap()));
    assert!(first.len() > "unknown_txid_".len());
    assert_eq!(stored.signed_payload.as_deref(), Some("signed"));
}

#[test]
fn complete_sign_status_is_refused() {
    let wallet = Multisig::new(&[1, 2, 3], 2);
    let engine = engine(1);
    let stored = engine
        .import_wallet_file(&wallet.setup_file("done"))
        .unwrap();
    let json = format!(
        r#"{{
            "coinCode": "XTN",
            "signId": "PSBT_MULTISIG",
            "xtnTx": {{
                "multisig": true,
                "wallet_fingerprint": "{fingerprint}",
                "signStatus": "3-2-3",
                "inputs": [{{
                    "hash": "{hash}",
                    "index": 0,
                    "utxo": {{ "value": 10000 }},
                    "ownerKeyPath": "{base}/0/0"
                }}],
                "outputs": [{{ "address": "{dest}", "value": 9000 }}]
            }}
        }}"#,
        fingerprint = stored.fingerprint,
        hash = "22".repeat(32),
        base = wallet.base_path,
        dest = common::DESTINATION,
    );
    let proposal = engine.normalize_transaction(&json).unwrap();
    let mut session = engine.confirm(proposal).unwrap();
    let token = engine.authorize(PASSWORD).unwrap();
    let err = engine.begin_signing(&mut session, token, engine.keys()).unwrap_err();
    assert!(matches!(err, Error::InvalidTransaction(_)));
    assert_eq!(engine.keys().live_token_count(), 0);
}

#[test]
fn casa_signatures_are_recorded_without_history_checks() {
    let vault = Multisig::casa(&[4, 5, 6], 2);
    let engine = casa_engine(5);
    let psbt = vault.psbt(&[Spend::new(0, 5, 80_000)], &[Pay::External(79_000)]);

    let proposal = engine.adapt_psbt(&to_base64(&psbt), true).unwrap();
    assert!(matches!(proposal.transaction.kind, TxKind::Casa { .. }));
    assert_eq!(proposal.transaction.coin, Coin::Xtn);
    assert_eq!(proposal.transaction.outputs[0].address, common::DESTINATION);
    assert_eq!(proposal.transaction.inputs[0].path.to_string(), "m/45'/1'/0'/0/5");

    let mut session = engine.confirm(proposal).unwrap();
    assert_eq!(session.verdict(), FeeAttackVerdict::Normal);
    assert!(matches!(session.record(), PendingRecord::Casa(_)));
    let token = engine.authorize(PASSWORD).unwrap();
    let result = engine.begin_signing(&mut session, token, engine.keys()).unwrap();
    assert_eq!(result.sign_status.unwrap().to_string(), "1-2-3");

    let signatures = engine.repo().casa_signatures();
    assert_eq!(signatures.len(), 1);
    assert_eq!(signatures[0].id, Some(1));
    assert_eq!(signatures[0].sign_status, "1-2-3");
    assert_eq!(signatures[0].tx_id, result.tx_id);
}

#[test]
fn casa_psbt_without_this_device_is_refused() {
    let vault = Multisig::casa(&[4, 5, 6], 2);
    let engine = casa_engine(9);
    let psbt = vault.psbt(&[Spend::new(0, 5, 80_000)], &[Pay::External(79_000)]);
    let err = engine.adapt_psbt(&to_base64(&psbt), true).unwrap_err();
    assert!(matches!(err, Error::NoMatchingCasaKey { .. }));
}
