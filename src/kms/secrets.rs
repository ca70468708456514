//! Providers backed by a plain passphrase held in a Kubernetes secret.
//!
//! `default` hands out the StorageClass passphrase as the DEK of every
//! volume. `metadata` uses the passphrase to wrap a per-volume DEK that the
//! driver stores with the volume.

use zeroize::Zeroizing;

use crate::{
    cluster::secret_string,
    config::{ConfigMap, optional_string, set_config_string},
    crypto::envelope,
    error::{KmsError, Result},
    kms::{
        Deadline, DekStore, DekStoreType, EncryptionKms, IntegratedDek, ProviderInitArgs,
    },
};

pub const DEFAULT_KMS_TYPE: &str = "default";
pub const SECRETS_METADATA_KMS_TYPE: &str = "metadata";

const ENCRYPTION_PASSPHRASE_KEY: &str = "encryptionPassphrase";
const METADATA_SECRET_NAME_KEY: &str = "secretName";
const METADATA_SECRET_NAMESPACE_KEY: &str = "secretNamespace";

pub struct SecretsKms {
    integrated: IntegratedDek,
    passphrase: Zeroizing<String>,
}

impl SecretsKms {
    pub(crate) fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            integrated: IntegratedDek,
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }
}

pub fn new_secrets_kms(args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    let passphrase = args
        .secret(ENCRYPTION_PASSPHRASE_KEY)
        .ok_or_else(|| KmsError::Config("missing encryption passphrase in secrets".into()))?;
    Ok(Box::new(SecretsKms::with_passphrase(passphrase)))
}

impl EncryptionKms for SecretsKms {
    fn destroy(&mut self) {}

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

/// Every volume shares the passphrase, nothing is stored.
impl DekStore for SecretsKms {
    fn fetch_dek(&self, _deadline: Deadline, _key: &str) -> Result<String> {
        Ok(self.passphrase.to_string())
    }

    fn store_dek(&self, _deadline: Deadline, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    fn remove_dek(&self, _deadline: Deadline, _key: &str) -> Result<()> {
        Ok(())
    }
}

pub struct SecretsMetadataKms {
    passphrase: Zeroizing<String>,
}

impl SecretsMetadataKms {
    pub(crate) fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }
}

pub fn init_secrets_metadata_kms(args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    let passphrase = match fetch_encryption_passphrase(&args.config, &args) {
        Ok(p) => p,
        Err(e) if e.is_config_missing() => args
            .secret(ENCRYPTION_PASSPHRASE_KEY)
            .map(str::to_owned)
            .ok_or_else(|| {
                KmsError::Config(format!(
                    "missing {ENCRYPTION_PASSPHRASE_KEY:?} in storageclass secret"
                ))
            })?,
        Err(e) => return Err(e),
    };
    Ok(Box::new(SecretsMetadataKms::with_passphrase(passphrase)))
}

/// Read the passphrase from the secret named in the configuration. Returns
/// the missing sentinel when no secret is configured.
fn fetch_encryption_passphrase(config: &ConfigMap, args: &ProviderInitArgs<'_>) -> Result<String> {
    let mut secret_name = String::new();
    set_config_string(&mut secret_name, config, METADATA_SECRET_NAME_KEY)?;
    let namespace = optional_string(config, METADATA_SECRET_NAMESPACE_KEY)?
        .unwrap_or_else(|| args.tenant.clone());

    let secret = args
        .cluster
        .get_secret(&namespace, &secret_name)
        .map_err(|e| e.context(format!("failed to get Secret {namespace}/{secret_name}")))?;
    secret_string(&secret, ENCRYPTION_PASSPHRASE_KEY).ok_or_else(|| {
        KmsError::Config(format!(
            "missing {ENCRYPTION_PASSPHRASE_KEY:?} in Secret {namespace}/{secret_name}"
        ))
    })
}

impl EncryptionKms for SecretsMetadataKms {
    fn destroy(&mut self) {}

    fn requires_dek_store(&self) -> DekStoreType {
        DekStoreType::Metadata
    }

    fn encrypt_dek(&self, volume_id: &str, plain_dek: &str) -> Result<String> {
        envelope::encrypt_dek(&self.passphrase, volume_id, plain_dek)
    }

    fn decrypt_dek(&self, volume_id: &str, encrypted_dek: &str) -> Result<String> {
        envelope::decrypt_dek(&self.passphrase, volume_id, encrypted_dek)
    }

    fn get_secret(&self, _volume_id: &str) -> Result<String> {
        Ok(self.passphrase.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cluster::MemoryCluster;

    fn args<'a>(cluster: &'a MemoryCluster, config: serde_json::Value, secrets: serde_json::Value) -> ProviderInitArgs<'a> {
        ProviderInitArgs {
            tenant: "tenant".into(),
            config: config.as_object().cloned().unwrap(),
            secrets: secrets.as_object().cloned().unwrap(),
            namespace: "ceph-csi".into(),
            cluster,
            deadline: Deadline::none(),
        }
    }

    #[test]
    fn default_needs_passphrase() {
        let cluster = MemoryCluster::new();
        assert!(new_secrets_kms(args(&cluster, json!({}), json!({}))).is_err());

        let kms = new_secrets_kms(args(
            &cluster,
            json!({}),
            json!({"encryptionPassphrase": "p4ss"}),
        ))
        .unwrap();
        assert_eq!(kms.requires_dek_store(), DekStoreType::Integrated);
        let store = kms.dek_store().unwrap();
        assert_eq!(store.fetch_dek(Deadline::none(), "vol").unwrap(), "p4ss");
        assert!(matches!(
            kms.get_secret("vol"),
            Err(KmsError::GetSecretIntegrated)
        ));
    }

    #[test]
    fn metadata_from_storageclass_secret() {
        let cluster = MemoryCluster::new();
        let kms = init_secrets_metadata_kms(args(
            &cluster,
            json!({}),
            json!({"encryptionPassphrase": "my-passphrase-from-kubernetes"}),
        ))
        .unwrap();
        assert_eq!(kms.requires_dek_store(), DekStoreType::Metadata);
        assert!(kms.dek_store().is_none());
        assert_eq!(kms.get_secret("vol").unwrap(), "my-passphrase-from-kubernetes");

        let wrapped = kms.encrypt_dek("vol-1", "dek").unwrap();
        assert_eq!(kms.decrypt_dek("vol-1", &wrapped).unwrap(), "dek");
        assert!(kms.decrypt_dek("vol-2", &wrapped).is_err());
    }

    #[test]
    fn metadata_from_named_secret() {
        let cluster = MemoryCluster::new()
            .with_secret("tenant", "luks", [("encryptionPassphrase", "from-tenant")])
            .with_secret("other", "luks", [("encryptionPassphrase", "from-other")]);

        let kms = init_secrets_metadata_kms(args(&cluster, json!({"secretName": "luks"}), json!({}))).unwrap();
        assert_eq!(kms.get_secret("vol").unwrap(), "from-tenant");

        let kms = init_secrets_metadata_kms(args(
            &cluster,
            json!({"secretName": "luks", "secretNamespace": "other"}),
            json!({}),
        ))
        .unwrap();
        assert_eq!(kms.get_secret("vol").unwrap(), "from-other");

        assert!(init_secrets_metadata_kms(args(&cluster, json!({"secretName": "nope"}), json!({}))).is_err());
    }

    #[test]
    fn metadata_without_any_passphrase() {
        let cluster = MemoryCluster::new();
        assert!(init_secrets_metadata_kms(args(&cluster, json!({}), json!({}))).is_err());
    }
}
