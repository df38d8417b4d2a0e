fn main() {
    println!("cold-confirm: signing confirmation for a cold wallet");
    println!();
    println!("Available commands:");
    println!("  cargo run --bin keygen -- <name> [network]                       Create a device key file");
    println!("  cargo run --bin signer -- xpub <key.json> <path>                 Export an account xpub");
    println!("  cargo run --bin signer -- import <key.json> <wallet file>        Show a multisig wallet");
    println!("  cargo run --bin signer -- sign <key.json> <psbt> [wallet file]   Verify and sign a PSBT");
}
