use crate::context::ResolutionContext;
use crate::derive::derive_public_key;
use crate::error::{Error, Result};
use crate::path::{HdPath, normal_indices};
use crate::store::KeyStore;
use crate::transaction::Transaction;

use super::SignerDescriptor;

/// One descriptor per distinct input path, each with the public key the
/// device expects to sign with.
pub fn assemble_signers<K: KeyStore + ?Sized>(
    tx: &Transaction,
    ctx: &ResolutionContext,
    keys: &K,
) -> Result<Vec<SignerDescriptor>> {
    tx.distinct_paths()
        .into_iter()
        .map(|path| {
            let public_key = expected_key(path, ctx, keys)?;
            Ok(SignerDescriptor {
                path: path.to_string().to_lowercase(),
                public_key,
            })
        })
        .collect()
}

fn expected_key<K: KeyStore + ?Sized>(
    path: &HdPath,
    ctx: &ResolutionContext,
    keys: &K,
) -> Result<String> {
    let key = match ctx {
        ResolutionContext::SingleSig { .. } => {
            let account = ctx
                .account_for(path)
                .ok_or_else(|| Error::UnknownAccount(path.to_string()))?;
            let (change, index) = path.change_and_index()?;
            derive_public_key(&account.xpub, &[change, index])?
        }
        ResolutionContext::LegacyMultisig { wallet } => {
            let (change, index) = wallet.address_indices(path)?;
            keys.public_key_at(&wallet.base_path, &[change, index])?
        }
        ResolutionContext::Casa { .. } => {
            let (xpub_path, tail) = path.split_hardened();
            keys.public_key_at(&xpub_path, &normal_indices(&tail, path)?)?
        }
    };
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::ScriptType;
    use crate::software::SoftwareKeyStore;
    use crate::store::Account;
    use crate::transaction::normalize_transaction;
    use bitcoin::Network;

    fn tx(paths: &[&str]) -> Transaction {
        let inputs: Vec<String> = paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                format!(
                    r#"{{"hash": "{}", "index": {i}, "utxo": {{"value": 1000}}, "ownerKeyPath": "{path}"}}"#,
                    "22".repeat(32)
                )
            })
            .collect();
        let json = format!(
            r#"{{"coinCode": "XTN", "signId": "T", "timestamp": 0, "xtnTx": {{
                "fee": 100,
                "inputs": [{}],
                "outputs": [{{"address": "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx", "value": 900}}]
            }}}}"#,
            inputs.join(",")
        );
        normalize_transaction(&json).unwrap()
    }

    fn keys() -> SoftwareKeyStore {
        SoftwareKeyStore::from_seed(&[7; 32], Network::Testnet, "1234").unwrap()
    }

    fn account(keys: &SoftwareKeyStore) -> Account {
        let path = ScriptType::P2wpkh.account_path(Network::Testnet);
        Account {
            xpub: keys.extended_public_key(&path).unwrap(),
            path,
            script: ScriptType::P2wpkh,
        }
    }

    #[test]
    fn one_descriptor_per_distinct_path() {
        let keys = keys();
        let ctx = ResolutionContext::single(account(&keys));
        let tx = tx(&["m/84'/1'/0'/0/1", "m/84'/1'/0'/0/1", "M/84H/1H/0H/1/0"]);

        let signers = assemble_signers(&tx, &ctx, &keys).unwrap();
        assert_eq!(signers.len(), 2);
        assert_eq!(signers[0].path, "m/84'/1'/0'/0/1");
        let account_path = ScriptType::P2wpkh.account_path(Network::Testnet);
        assert_eq!(
            signers[0].public_key,
            keys.public_key_at(&account_path, &[0, 1]).unwrap().to_string()
        );
        assert_eq!(
            signers[1].public_key,
            keys.public_key_at(&account_path, &[1, 0]).unwrap().to_string()
        );
    }

    #[test]
    fn path_outside_the_account_is_unknown() {
        let keys = keys();
        let ctx = ResolutionContext::single(account(&keys));
        let tx = tx(&["m/44'/1'/0'/0/1"]);
        assert!(matches!(
            assemble_signers(&tx, &ctx, &keys),
            Err(Error::UnknownAccount(_))
        ));
    }

    #[test]
    fn casa_keys_come_from_the_hardened_prefix() {
        let keys = keys();
        let ctx = ResolutionContext::Casa {
            network: Network::Testnet,
        };
        let tx = tx(&["m/45'/1'/0/0/4"]);
        let signers = assemble_signers(&tx, &ctx, &keys).unwrap();
        let prefix: HdPath = "m/45'/1'".parse().unwrap();
        assert_eq!(
            signers[0].public_key,
            keys.public_key_at(&prefix, &[0, 0, 4]).unwrap().to_string()
        );
    }
}
