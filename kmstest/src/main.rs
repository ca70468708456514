//! Exercise a configured KMS end to end from inside a driver pod.
//!
//! ```text
//! kmstest <kmsID> [tenant] [secrets.json]
//! ```
//!
//! The secrets file holds the StorageClass secrets as a JSON object.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use csi_kms::{
    KmsBuilder,
    config::ConfigMap,
    crypto::envelope::generate_passphrase,
    kms::{Deadline, DekStoreType},
};

const VOLUME_ID: &str = "csi-vol-kmstest-0000";
const TIMEOUT: Duration = Duration::from_secs(120);

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(kms_id) = args.next() else {
        bail!("usage: kmstest <kmsID> [tenant] [secrets.json]");
    };
    let tenant = args.next().unwrap_or_else(|| "default".to_owned());
    let secrets: ConfigMap = match args.next() {
        Some(path) => {
            let content = std::fs::read(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_slice(&content).with_context(|| format!("parsing {path}"))?
        }
        None => ConfigMap::new(),
    };

    println!("=== KMS smoke test: {kms_id:?} for tenant {tenant:?} ===\n");
    let deadline = Deadline::after(TIMEOUT);

    let mut kms = KmsBuilder::new()
        .tenant(tenant)
        .secrets(secrets)
        .deadline(deadline)
        .build(&kms_id)
        .context("building KMS")?;
    let store_type = kms.requires_dek_store();
    println!("✓ KMS initialized, DEK store: {store_type:?}\n");

    let dek = generate_passphrase(20)?;

    println!("--- Testing EncryptDEK/DecryptDEK ---");
    let wrapped = kms.encrypt_dek(VOLUME_ID, &dek).context("encrypting DEK")?;
    let unwrapped = kms.decrypt_dek(VOLUME_ID, &wrapped).context("decrypting DEK")?;
    if unwrapped != dek {
        bail!("decrypted DEK does not match");
    }
    println!("✓ DEK round trip\n");

    match store_type {
        DekStoreType::Integrated => {
            let Some(store) = kms.dek_store() else {
                bail!("integrated KMS without a DEK store");
            };
            println!("--- Testing StoreDEK/FetchDEK/RemoveDEK ---");
            store.store_dek(deadline, VOLUME_ID, &wrapped).context("storing DEK")?;
            let fetched = store.fetch_dek(deadline, VOLUME_ID).context("fetching DEK")?;
            log::debug!("fetched {} bytes", fetched.len());
            store.remove_dek(deadline, VOLUME_ID).context("removing DEK")?;
            println!("✓ DEK store round trip\n");
        }
        DekStoreType::Metadata => {
            if kms.decrypt_dek("csi-vol-kmstest-other", &wrapped).is_ok() {
                println!("! DEK also opens for another volume ID\n");
            } else {
                println!("✓ DEK bound to its volume ID\n");
            }
        }
    }

    match kms.get_secret(VOLUME_ID) {
        Ok(_) => println!("✓ GetSecret supported"),
        Err(e) => println!("✓ GetSecret: {e}"),
    }

    kms.destroy();
    println!("\n=== All tests completed ===");
    Ok(())
}
