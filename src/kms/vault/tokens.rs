//! `vaulttokens`: every tenant brings its own Vault token, stored in a
//! secret in the tenant namespace.
//!
//! ```json
//! {
//!     "vault-with-tokens": {
//!         "encryptionKMSType": "vaulttokens",
//!         "vaultAddress": "http://vault.default.svc.cluster.local:8200",
//!         "vaultBackend": "kv-v2",
//!         "vaultBackendPath": "secret/",
//!         "vaultCAFromSecret": "vault-ca",
//!         "tenantConfigName": "ceph-csi-kms-config",
//!         "tenantTokenName": "ceph-csi-kms-token",
//!         "tenants": {
//!             "an-other-app": {
//!                 "tenantTokenName": "storage-encryption-token"
//!             }
//!         }
//!     }
//! }
//! ```

use zeroize::Zeroizing;

use super::{
    client::VaultAuth,
    legacy::transform_config,
    tenant::{TenantConfigured, VaultTenantConnection, is_tenant_config_option},
};
use crate::{
    cluster::{ClusterApi, secret_string},
    config::{ConfigMap, KMS_PROVIDER_KEY, optional_string},
    error::{KmsError, Result},
    kms::{DekStore, DekStoreType, EncryptionKms, IntegratedDek, ProviderInitArgs},
};

pub const KMS_TYPE_VAULT_TOKENS: &str = "vaulttokens";

const DEFAULT_TOKEN_NAME: &str = "ceph-csi-kms-token";
const TOKEN_SECRET_KEY: &str = "token";

pub struct VaultTokensKms {
    tenant_conn: VaultTenantConnection,
    integrated: IntegratedDek,
    token_name: String,
}

impl TenantConfigured for VaultTokensKms {
    fn connection(&mut self) -> &mut VaultTenantConnection {
        &mut self.tenant_conn
    }

    fn parse_provider_options(&mut self, config: &ConfigMap) -> Result<()> {
        if let Some(name) = optional_string(config, "tenantTokenName")? {
            self.token_name = name;
        }
        Ok(())
    }
}

impl VaultTokensKms {
    fn new() -> Self {
        Self {
            tenant_conn: VaultTenantConnection::new(is_tenant_config_option),
            integrated: IntegratedDek,
            token_name: DEFAULT_TOKEN_NAME.to_owned(),
        }
    }

    fn get_token(&self, cluster: &dyn ClusterApi) -> Result<Zeroizing<String>> {
        let secret = cluster.get_secret(&self.tenant_conn.tenant, &self.token_name)?;
        secret_string(&secret, TOKEN_SECRET_KEY)
            .map(Zeroizing::new)
            .ok_or_else(|| KmsError::Config("failed to parse token".into()))
    }
}

pub fn init_vault_tokens_kms(args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    let config = if args.config.contains_key(KMS_PROVIDER_KEY) {
        transform_config(&args.config).map_err(|e| e.context("failed to convert configuration"))?
    } else {
        args.config.clone()
    };

    let mut kms = VaultTokensKms::new();
    kms.parse_config(&config)
        .map_err(|e| e.context("failed to initialize Vault connection"))?;

    if !args.tenant.is_empty() {
        kms.configure_tenant(&config, &args.tenant, args.cluster)?;
    }

    let token = kms.get_token(args.cluster).map_err(|e| {
        e.context(format!(
            "failed fetching token from {}/{}",
            args.tenant, kms.token_name
        ))
    })?;

    let init = |kms: &mut VaultTokensKms| -> Result<()> {
        kms.tenant_conn
            .init_certificates(&config, args.cluster, &args.namespace)
            .map_err(|e| e.context("failed to initialize Vault certificates"))?;
        kms.tenant_conn.conn.connect(&VaultAuth::Token(token), args.deadline)
    };
    if let Err(e) = init(&mut kms) {
        kms.destroy();
        return Err(e);
    }
    Ok(Box::new(kms))
}

impl EncryptionKms for VaultTokensKms {
    fn destroy(&mut self) {
        self.tenant_conn.conn.destroy();
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
        Some(&self.tenant_conn)
    }
}
