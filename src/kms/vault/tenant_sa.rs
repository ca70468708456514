//! `vaulttenantsa`: log in to Vault with a ServiceAccount of the tenant
//! that owns the volume.
//!
//! ```json
//! {
//!     "vault-tenant-sa": {
//!         "encryptionKMSType": "vaulttenantsa",
//!         "vaultAddress": "http://vault.default.svc.cluster.local:8200",
//!         "vaultBackendPath": "secret/",
//!         "tenantConfigName": "ceph-csi-kms-config",
//!         "tenantSAName": "ceph-csi-vault-sa",
//!         "tenants": {
//!             "an-other-app": {
//!                 "tenantSAName": "encryped-storage-sa"
//!             }
//!         }
//!     }
//! }
//! ```

use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use super::{
    DEFAULT_AUTH_MOUNT_PATH, DEFAULT_ROLE,
    client::VaultAuth,
    detect_auth_mount_path,
    legacy::transform_config,
    tenant::{TenantConfigured, VaultTenantConnection, is_tenant_config_option},
};
use crate::{
    cluster::{ClusterApi, secret_string},
    config::{ConfigMap, KMS_PROVIDER_KEY, optional_string},
    error::{KmsError, Result},
    kms::{DekStore, DekStoreType, EncryptionKms, IntegratedDek, ProviderInitArgs},
};

pub const KMS_TYPE_VAULT_TENANT_SA: &str = "vaulttenantsa";

const DEFAULT_TENANT_SA_NAME: &str = "ceph-csi-vault-sa";

/// Tenant options, plus the ServiceAccount and Kubernetes auth settings.
pub fn is_tenant_sa_config_option(opt: &str) -> bool {
    is_tenant_config_option(opt) || matches!(opt, "tenantSAName" | "vaultAuthPath" | "vaultRole")
}

pub struct VaultTenantSa {
    tenant_conn: VaultTenantConnection,
    integrated: IntegratedDek,
    tenant_sa_name: String,
    auth_mount_path: String,
    role: String,
}

impl TenantConfigured for VaultTenantSa {
    fn connection(&mut self) -> &mut VaultTenantConnection {
        &mut self.tenant_conn
    }

    fn parse_provider_options(&mut self, config: &ConfigMap) -> Result<()> {
        if let Some(name) = optional_string(config, "tenantSAName")? {
            self.tenant_sa_name = name;
        }
        if let Some(path) = optional_string(config, "vaultAuthPath")? {
            self.auth_mount_path = detect_auth_mount_path(&path)
                .map_err(|e| e.context("failed to set \"vaultAuthPath\" in Vault config"))?;
        }
        if let Some(role) = optional_string(config, "vaultRole")? {
            self.role = role;
        }
        Ok(())
    }
}

impl VaultTenantSa {
    fn new() -> Self {
        Self {
            tenant_conn: VaultTenantConnection::new(is_tenant_sa_config_option),
            integrated: IntegratedDek,
            tenant_sa_name: DEFAULT_TENANT_SA_NAME.to_owned(),
            auth_mount_path: DEFAULT_AUTH_MOUNT_PATH.to_owned(),
            role: DEFAULT_ROLE.to_owned(),
        }
    }

    /// A token for the ServiceAccount: a fresh one from the TokenRequest
    /// API, otherwise one of the secrets linked to the account.
    fn get_token(&self, cluster: &dyn ClusterApi) -> Result<Zeroizing<String>> {
        let tenant = &self.tenant_conn.tenant;
        let sa = cluster
            .get_service_account(tenant, &self.tenant_sa_name)
            .map_err(|e| e.context(format!("failed to get ServiceAccount {tenant}/{}", self.tenant_sa_name)))?;

        let request_err = match cluster.create_service_account_token(tenant, &sa.name) {
            Ok(token) => return Ok(Zeroizing::new(token)),
            Err(e) => e,
        };
        log::debug!("TokenRequest for {tenant}/{} failed, trying linked secrets: {request_err}", sa.name);

        for secret_name in &sa.secrets {
            let secret = cluster
                .get_secret(tenant, secret_name)
                .map_err(|e| e.context(format!("failed to get Secret {tenant}/{secret_name}")))?;
            if let Some(token) = secret_string(&secret, "token") {
                return Ok(Zeroizing::new(token));
            }
        }

        Err(KmsError::Cluster(format!(
            "failed to find/create ServiceAccount token {tenant}/{}: {request_err}",
            sa.name
        )))
    }

    /// Write the token where the Kubernetes auth method picks it up.
    fn get_token_path(&mut self, cluster: &dyn ClusterApi) -> Result<PathBuf> {
        let dir = self
            .tenant_conn
            .conn
            .scratch
            .dir(&self.tenant_sa_name)
            .map_err(|e| {
                e.context(format!(
                    "failed to create directory for ServiceAccount {}/{}",
                    self.tenant_conn.tenant, self.tenant_sa_name
                ))
            })?;
        let token = self.get_token(cluster)?;
        let path = dir.join("token");
        write_private(&path, token.as_bytes())?;
        Ok(path)
    }
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(data)?;
    Ok(())
}

pub fn init_vault_tenant_sa(args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    let config = if args.config.contains_key(KMS_PROVIDER_KEY) {
        transform_config(&args.config).map_err(|e| e.context("failed to convert configuration"))?
    } else {
        args.config.clone()
    };

    let mut kms = VaultTenantSa::new();
    kms.parse_config(&config)
        .map_err(|e| e.context("failed to initialize Vault connection"))?;

    if !args.tenant.is_empty() {
        kms.configure_tenant(&config, &args.tenant, args.cluster)?;
    }

    let init = |kms: &mut VaultTenantSa| -> Result<()> {
        let token_path = kms.get_token_path(args.cluster).map_err(|e| {
            e.context(format!(
                "failed setting up token for {}/{}",
                kms.tenant_conn.tenant, kms.tenant_sa_name
            ))
        })?;
        kms.tenant_conn
            .init_certificates(&config, args.cluster, &args.namespace)
            .map_err(|e| e.context("failed to initialize Vault certificates"))?;
        let auth = VaultAuth::Kubernetes {
            mount: kms.auth_mount_path.clone(),
            role: kms.role.clone(),
            token_path,
        };
        kms.tenant_conn.conn.connect(&auth, args.deadline)
    };
    if let Err(e) = init(&mut kms) {
        kms.destroy();
        return Err(e);
    }
    Ok(Box::new(kms))
}

impl EncryptionKms for VaultTenantSa {
    /// Removes the token directory and any certificate files.
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

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cluster::{MemoryCluster, ServiceAccount};

    #[test]
    fn option_filter() {
        assert!(is_tenant_sa_config_option("vaultAddress"));
        assert!(is_tenant_sa_config_option("tenantSAName"));
        assert!(is_tenant_sa_config_option("vaultRole"));
        assert!(!is_tenant_sa_config_option("tenantTokenName"));
        assert!(!is_tenant_config_option("vaultRole"));
    }

    #[test]
    fn tenant_overrides_auth_settings() {
        let cluster = MemoryCluster::new().with_config_map(
            "bob",
            "ceph-csi-kms-config",
            [("vaultAuthPath", "/v1/auth/bobs-cluster/login"), ("vaultRole", "bob")],
        );
        let config = json!({
            "vaultAddress": "https://vault",
            "tenants": {"bob": {"tenantSAName": "encrypted-storage-sa"}}
        });
        let config = config.as_object().unwrap();

        let mut kms = VaultTenantSa::new();
        kms.parse_config(config).unwrap();
        assert_eq!(kms.auth_mount_path, "kubernetes");
        assert_eq!(kms.role, "csi-kubernetes");

        kms.configure_tenant(config, "bob", &cluster).unwrap();
        assert_eq!(kms.tenant_sa_name, "encrypted-storage-sa");
        assert_eq!(kms.auth_mount_path, "bobs-cluster");
        assert_eq!(kms.role, "bob");
    }

    #[test]
    fn token_from_token_request() {
        let cluster = MemoryCluster::new()
            .with_service_account("bob", ServiceAccount {
                name: DEFAULT_TENANT_SA_NAME.into(),
                secrets: vec![],
            })
            .with_token("bob", DEFAULT_TENANT_SA_NAME, "fresh-token");
        let mut kms = VaultTenantSa::new();
        kms.tenant_conn.tenant = "bob".into();

        let path = kms.get_token_path(&cluster).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh-token");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        kms.destroy();
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn token_from_linked_secret() {
        let cluster = MemoryCluster::new()
            .with_service_account("bob", ServiceAccount {
                name: DEFAULT_TENANT_SA_NAME.into(),
                secrets: vec!["sa-dockercfg".into(), "sa-token".into()],
            })
            .with_secret("bob", "sa-dockercfg", [(".dockercfg", "{}")])
            .with_secret("bob", "sa-token", [("token", "legacy-token")]);
        let mut kms = VaultTenantSa::new();
        kms.tenant_conn.tenant = "bob".into();
        assert_eq!(kms.get_token(&cluster).unwrap().as_str(), "legacy-token");
    }

    #[test]
    fn no_token_anywhere() {
        let cluster = MemoryCluster::new().with_service_account("bob", ServiceAccount {
            name: DEFAULT_TENANT_SA_NAME.into(),
            secrets: vec![],
        });
        let mut kms = VaultTenantSa::new();
        kms.tenant_conn.tenant = "bob".into();
        assert!(kms.get_token(&cluster).is_err());
    }
}
