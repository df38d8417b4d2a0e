mod common;

use cold_confirm::store::Repository;
use cold_confirm::wallet::{decode_wallet_file, export_caravan, export_coldcard};
use cold_confirm::{Error, ErrorKind};
use common::{Multisig, engine};

fn caravan_file(wallet: &Multisig) -> String {
    let keys: Vec<String> = wallet
        .roots
        .iter()
        .zip(&wallet.xpubs)
        .enumerate()
        .map(|(i, (root, xpub))| {
            format!(
                r#"{{"name": "key {i}", "bip32Path": "{}", "xpub": "{xpub}", "xfp": "{root}"}}"#,
                wallet.base_path
            )
        })
        .collect();
    format!(
        r#"{{
            "name": "caravan vault",
            "addressType": "P2WSH",
            "network": "testnet",
            "quorum": {{ "requiredSigners": {}, "totalSigners": {} }},
            "extendedPublicKeys": [{}]
        }}"#,
        wallet.threshold,
        wallet.xpubs.len(),
        keys.join(",")
    )
}

#[test]
fn coldcard_and_caravan_files_describe_the_same_wallet() {
    let wallet = Multisig::new(&[1, 2, 3], 2);
    let from_coldcard = engine(3).import_wallet_file(&wallet.setup_file("vault")).unwrap();
    let from_caravan = engine(3).import_wallet_file(&caravan_file(&wallet)).unwrap();

    assert_eq!(from_coldcard.fingerprint, from_caravan.fingerprint);
    assert_eq!(from_coldcard.verify_code, from_caravan.verify_code);
    assert_eq!(from_coldcard.creator, "Coldcard");
    assert_eq!(from_caravan.creator, "Caravan");
    assert_eq!(from_caravan.name, "caravan vault");
    assert_eq!(from_coldcard.verify_code.len(), 8);
    assert!(from_coldcard.fingerprint.ends_with(&wallet.roots[2].to_string()));
    assert_eq!(
        from_coldcard.derive_address(0, 0).unwrap(),
        wallet.address(0, 0)
    );
}

#[test]
fn wallet_without_this_device_is_refused() {
    let wallet = Multisig::new(&[1, 2, 3], 2);
    let engine = engine(4);
    let err = engine
        .import_wallet_file(&wallet.setup_file("not mine"))
        .unwrap_err();
    assert!(matches!(err, Error::XfpMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::IdentityMismatch);
    assert!(engine.repo().load_all_multisig_wallets().unwrap().is_empty());
}

#[test]
fn reimport_updates_in_place() {
    let wallet = Multisig::new(&[1, 2, 3], 2);
    let engine = engine(1);
    let first = engine.import_wallet_file(&wallet.setup_file("vault")).unwrap();
    let second = engine.import_wallet_file(&wallet.setup_file("renamed")).unwrap();

    assert_eq!(first.fingerprint, second.fingerprint);
    let stored = engine.repo().load_all_multisig_wallets().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "renamed");
    assert_eq!(
        engine.repo().load_multisig_addresses(&first.fingerprint).unwrap().len(),
        2
    );
}

#[test]
fn export_reimports_to_the_same_wallet() {
    let wallet = Multisig::new(&[1, 2, 3], 2);
    let engine = engine(2);
    let stored = engine.import_wallet_file(&wallet.setup_file("vault")).unwrap();

    let exported = export_coldcard(&stored).unwrap();
    let descriptor = decode_wallet_file(&exported).unwrap();
    assert_eq!(descriptor.name.as_deref(), Some("vault"));
    assert_eq!(engine.import_multisig_wallet(descriptor).unwrap().fingerprint, stored.fingerprint);
}

#[test]
fn caravan_export_reimports_to_the_same_wallet() {
    let wallet = Multisig::new(&[1, 2, 3], 2);
    let engine = engine(2);
    let stored = engine.import_wallet_file(&wallet.setup_file("vault")).unwrap();

    let exported = export_caravan(&stored).unwrap();
    assert!(exported.contains("\"addressType\": \"P2WSH\""));
    assert!(exported.contains("\"network\": \"testnet\""));
    let descriptor = decode_wallet_file(&exported).unwrap();
    assert_eq!(descriptor.creator, "Caravan");
    assert_eq!(descriptor.name.as_deref(), Some("vault"));
    assert_eq!((descriptor.threshold, descriptor.total), (2, 3));

    let reimported = engine.import_multisig_wallet(descriptor).unwrap();
    assert_eq!(reimported.fingerprint, stored.fingerprint);
    assert_eq!(reimported.verify_code, stored.verify_code);
    assert_eq!(engine.repo().load_all_multisig_wallets().unwrap().len(), 1);
}

#[test]
fn unnamed_wallet_gets_a_default_name() {
    let wallet = Multisig::new(&[1, 2, 3], 2);
    let setup = wallet.setup_file("x").replace("Name: x\n", "");
    let stored = engine(1).import_wallet_file(&setup).unwrap();
    assert_eq!(stored.name, format!("KT_{}_2-3", stored.verify_code));
}

#[test]
fn concurrent_generation_keeps_indices_unique() {
    let wallet = Multisig::new(&[1, 2, 3], 2);
    let engine = engine(1);
    let fingerprint = engine
        .import_wallet_file(&wallet.setup_file("vault"))
        .unwrap()
        .fingerprint;

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| engine.generate_addresses(&fingerprint, 0, 5).unwrap());
        }
    });

    let mut indices: Vec<u32> = engine
        .repo()
        .load_multisig_addresses(&fingerprint)
        .unwrap()
        .into_iter()
        .filter(|a| a.change == 0)
        .map(|a| a.index)
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..21).collect::<Vec<_>>());
}
