//! Cold signer - verifies a proposal against the device keys, then signs it.
//!
//! Runs the whole confirmation pipeline on one machine:
//! 1. Load the device key file
//! 2. Register the multisig wallet, if a setup file is given
//! 3. Adapt the PSBT and re-derive every change address
//! 4. Check signing history for duplicates
//! 5. Sign and write the signed PSBT
//!
//! Settings are read from `cold-confirm.json` when present.

use bitcoin::{Network, NetworkKind};
use cold_confirm::{
    ConfirmEngine, DeviceKeyFile, EngineConfig, FeeAttackVerdict, HdPath, KeyStore,
    MemoryRepository, SoftwareKeyStore, wallet_info,
};
use std::path::Path;
use std::str::FromStr;

const CONFIG_FILE: &str = "cold-confirm.json";

type Engine = ConfirmEngine<SoftwareKeyStore, MemoryRepository>;

fn usage(program: &str) -> ! {
    eprintln!("Usage:");
    eprintln!("  {program} xpub <key_file.json> <path>");
    eprintln!("  {program} import <key_file.json> <wallet_file>");
    eprintln!("  {program} sign <key_file.json> <psbt_base64_or_file> [wallet_file]");
    std::process::exit(1);
}

fn load_engine(key_file: &str) -> Result<(Engine, DeviceKeyFile), Box<dyn std::error::Error>> {
    let file = DeviceKeyFile::read(key_file)?;
    let keys = SoftwareKeyStore::from_key_file(&file, "")?;
    let config = if Path::new(CONFIG_FILE).exists() {
        EngineConfig::from_file(CONFIG_FILE)?
    } else {
        let network = if keys.network() == NetworkKind::Main {
            Network::Bitcoin
        } else {
            Network::Testnet
        };
        EngineConfig {
            network,
            ..EngineConfig::default()
        }
    };
    Ok((ConfirmEngine::new(keys, MemoryRepository::new(), config), file))
}

fn read_psbt(input: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if Path::new(input).exists() {
        Ok(std::fs::read(input)?)
    } else {
        Ok(input.as_bytes().to_vec())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        usage(&args[0]);
    }
    let (engine, key_file) = load_engine(&args[2])?;
    println!("Signer: {} [{}]", key_file.name, engine.keys().master_fingerprint());

    match args[1].as_str() {
        "xpub" => {
            let path = HdPath::from_str(&args[3])?;
            println!("{path}: {}", engine.keys().extended_public_key(&path)?);
        }
        "import" => {
            let wallet = engine.import_wallet_file(&std::fs::read_to_string(&args[3])?)?;
            for line in wallet_info(&wallet) {
                println!("  {line}");
            }
        }
        "sign" => sign(&engine, &args[3], args.get(4).map(String::as_str), &key_file.name)?,
        _ => usage(&args[0]),
    }
    Ok(())
}

fn sign(
    engine: &Engine,
    psbt_input: &str,
    wallet_file: Option<&str>,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(wallet_file) = wallet_file {
        let wallet = engine.import_wallet_file(&std::fs::read_to_string(wallet_file)?)?;
        println!("Wallet: {} ({}-of-{})", wallet.name, wallet.threshold, wallet.total);
    }

    let proposal = engine.adapt_psbt(&read_psbt(psbt_input)?, wallet_file.is_some())?;
    let tx = &proposal.transaction;
    println!("\nTRANSACTION DETAILS");
    println!("───────────────────────────────────────────────────────────────");
    for (i, input) in tx.inputs.iter().enumerate() {
        println!("  Input {i}: {} sats at {}", input.value, input.path);
    }
    for (i, output) in tx.outputs.iter().enumerate() {
        let tag = if output.is_change { " (change, verified)" } else { "" };
        println!("  Output {i}: {} sats to {}{tag}", output.value, output.address);
    }
    println!("  Amount: {}", tx.formatted_amount());
    println!("  Fee:    {}", tx.formatted_fee());
    if let Some(status) = tx.sign_status() {
        println!("  Signed: {} of {} required", status.signed(), status.threshold());
    }
    println!("───────────────────────────────────────────────────────────────");

    let mut session = engine.confirm(proposal)?;
    if session.verdict() != FeeAttackVerdict::Normal {
        println!("  Warning: {:?}, continuing", session.verdict());
        session.acknowledge_warning()?;
    }

    let token = engine.authorize("")?;
    let result = engine.begin_signing(&mut session, token, engine.keys())?;

    println!("\n  Transaction id: {}", result.tx_id);
    if let Some(status) = result.sign_status {
        println!("  Signatures: {} of {} required", status.signed(), status.threshold());
    }
    let output_name = format!("signed_by_{name}.psbt.base64");
    std::fs::write(&output_name, &result.signed_payload)?;
    println!("  Saved to: {output_name}\n");
    Ok(())
}
