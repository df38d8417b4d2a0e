//! Creates a device key file holding a fresh master key.

use bitcoin::Network;
use cold_confirm::derive::MultisigScript;
use cold_confirm::{DeviceKeyFile, KeyStore, SoftwareKeyStore};
use std::fs;
use std::str::FromStr;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let args: Vec<String> = std::env::args().collect();
    let Some(name) = args.get(1) else {
        eprintln!("Usage: {} <name> [bitcoin|testnet|regtest]", args[0]);
        std::process::exit(1);
    };
    let network = match args.get(2) {
        Some(value) => Network::from_str(value)?,
        None => Network::Testnet,
    };

    let file = DeviceKeyFile::generate(name, network)?;
    let keys = SoftwareKeyStore::from_key_file(&file, "")?;
    let filename = format!("{name}.json");
    fs::write(&filename, serde_json::to_string_pretty(&file)?)?;
    println!("{name}: {} -> {filename}", file.fingerprint);

    // the P2WSH multisig account, ready for a wallet setup file
    let path = MultisigScript::P2wsh.base_path(network);
    println!("{path}: {}", keys.extended_public_key(&path)?);

    println!("\nKeep the key file offline, share only the xpub.");
    Ok(())
}
