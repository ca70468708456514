//! `vault`: a single Vault for all tenants, logged in to with the driver's
//! own ServiceAccount.
//!
//! ```json
//! {
//!     "local_vault_unique_identifier": {
//!         "encryptionKMSType": "vault",
//!         "vaultAddress": "https://127.0.0.1:8500",
//!         "vaultAuthPath": "/v1/auth/kubernetes/login",
//!         "vaultRole": "csi-kubernetes",
//!         "vaultNamespace": "",
//!         "vaultPassphraseRoot": "/v1/secret",
//!         "vaultPassphrasePath": "",
//!         "vaultCAVerify": true,
//!         "vaultCAFromSecret": "vault-ca"
//!     }
//! }
//! ```

use std::path::PathBuf;

use super::{
    DEFAULT_AUTH_PATH, DEFAULT_ROLE,
    client::{VaultAuth, join_path},
    connection::VaultConnection,
    detect_auth_mount_path,
};
use crate::{
    cluster::SERVICE_ACCOUNT_DIR,
    config::{ConfigMap, optional_string},
    error::{KmsError, Result},
    kms::{Deadline, DekStore, DekStoreType, EncryptionKms, IntegratedDek, ProviderInitArgs},
};

pub const KMS_TYPE_VAULT: &str = "vault";

pub struct VaultKms {
    conn: VaultConnection,
    integrated: IntegratedDek,
    passphrase_path: String,
}

/// The CA named by `vaultCAFromSecret` comes from the StorageClass secrets.
fn init_certificates(conn: &mut VaultConnection, config: &ConfigMap, args: &ProviderInitArgs<'_>) -> Result<()> {
    let Some(name) = optional_string(config, "vaultCAFromSecret")?.filter(|n| !n.is_empty()) else {
        return Ok(());
    };
    let pem = args
        .secret(&name)
        .ok_or_else(|| KmsError::Config(format!("missing vault CA in secret {name}")))?;
    conn.ca_cert = Some(conn.write_pem("vault-ca-cert", pem.as_bytes())?);
    Ok(())
}

fn setup(kms: &mut VaultKms, args: &ProviderInitArgs<'_>) -> Result<()> {
    let config = &args.config;
    init_certificates(&mut kms.conn, config, args)
        .map_err(|e| e.context("failed to initialize Vault certificates"))?;

    let auth_path = optional_string(config, "vaultAuthPath")?.unwrap_or_else(|| DEFAULT_AUTH_PATH.to_owned());
    let mount = detect_auth_mount_path(&auth_path)
        .map_err(|e| e.context("failed to set \"vaultAuthPath\" in Vault config"))?;
    let role = optional_string(config, "vaultRole")?.unwrap_or_else(|| DEFAULT_ROLE.to_owned());

    if let Some(root) = optional_string(config, "vaultPassphraseRoot")? {
        let root = root.strip_prefix("/v1/").unwrap_or(&root);
        kms.conn.backend_path = Some(root.to_owned());
    }
    if let Some(path) = optional_string(config, "vaultPassphrasePath")? {
        kms.passphrase_path = path;
    }

    let auth = VaultAuth::Kubernetes {
        mount,
        role,
        token_path: PathBuf::from(SERVICE_ACCOUNT_DIR).join("token"),
    };
    kms.conn.connect(&auth, args.deadline)
}

pub fn init_vault_kms(args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    let mut kms = VaultKms {
        conn: VaultConnection::default(),
        integrated: IntegratedDek,
        passphrase_path: String::new(),
    };
    kms.conn
        .init_connection(&args.config)
        .map_err(|e| e.context("failed to initialize Vault connection"))?;

    if let Err(e) = setup(&mut kms, &args) {
        kms.destroy();
        return Err(e);
    }
    Ok(Box::new(kms))
}

impl VaultKms {
    fn key_path(&self, key: &str) -> String {
        join_path([self.passphrase_path.as_str(), key])
    }
}

impl EncryptionKms for VaultKms {
    fn destroy(&mut self) {
        self.conn.destroy();
    }

    fn requires_dek_store(&self) -> DekStoreType {
        self.integrated.requires_dek_store()
    }

    fn encrypt_dek(&self, volume_id: &str, plain_dek: &str) -> Result<String> {
        self.integrated.encrypt_dek(volume_id, plain_dek)
    }

    fn decrypt_dek(&self, volume_id: &str, encrypted_dek: &str) -> Result<String> {
        self.integrated.decrypt_dek(volume_id, encrypted_dek)
    }

    fn get_secret(&self, volume_id: &str) -> Result<String> {
        self.integrated.get_secret(volume_id)
    }

    fn dek_store(&self) -> Option<&dyn DekStore> {
        Some(self)
    }
}

/// DEKs live below `vaultPassphrasePath`.
impl DekStore for VaultKms {
    fn fetch_dek(&self, deadline: Deadline, key: &str) -> Result<String> {
        self.conn.fetch_passphrase(deadline, &self.key_path(key))
    }

    fn store_dek(&self, deadline: Deadline, key: &str, value: &str) -> Result<()> {
        self.conn.store_passphrase(deadline, &self.key_path(key), value)
    }

    fn remove_dek(&self, deadline: Deadline, key: &str) -> Result<()> {
        self.conn.remove_passphrase(deadline, &self.key_path(key))
    }
}
