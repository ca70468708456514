//! Key management for encrypted Ceph CSI volumes.
//!
//! A driver RPC that handles an encrypted volume asks for a KMS instance by
//! kmsID and tenant, uses it to wrap or unwrap the volume's DEK, and
//! destroys it when the RPC returns.
//!
//! ```no_run
//! use csi_kms::{KmsBuilder, config::ConfigMap, kms::DekStoreType};
//!
//! # fn main() -> csi_kms::error::Result<()> {
//! let mut kms = KmsBuilder::new()
//!     .tenant("tenant-namespace")
//!     .secrets(ConfigMap::new())
//!     .build("vault-tokens-test")?;
//! if kms.requires_dek_store() == DekStoreType::Metadata {
//!     let wrapped = kms.encrypt_dek("csi-vol-1", "plain DEK")?;
//!     assert_eq!(kms.decrypt_dek("csi-vol-1", &wrapped)?, "plain DEK");
//! }
//! kms.destroy();
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod crypto;
pub mod error;
pub mod kmip;
pub mod kms;
pub mod registry;

use std::path::PathBuf;

use crate::{
    cluster::{ClusterApi, InClusterClient},
    config::{ConfigMap, KMS_CONFIG_PATH, kms_section, load_kms_configuration},
    error::Result,
    kms::{Deadline, EncryptionKms, ProviderInitArgs, secrets},
    registry::KMS_REGISTRY,
};

/// Resolves a kmsID to a provider instance.
///
/// Without further settings the configuration is read from its usual mount
/// point and cluster objects through the API server of the pod.
pub struct KmsBuilder<'a> {
    config_path: PathBuf,
    cluster: Option<&'a dyn ClusterApi>,
    tenant: String,
    secrets: ConfigMap,
    namespace: String,
    deadline: Deadline,
}

impl Default for KmsBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> KmsBuilder<'a> {
    pub fn new() -> Self {
        Self {
            config_path: PathBuf::from(KMS_CONFIG_PATH),
            cluster: None,
            tenant: String::new(),
            secrets: ConfigMap::new(),
            namespace: String::new(),
            deadline: Deadline::none(),
        }
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    pub fn cluster(mut self, cluster: &'a dyn ClusterApi) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Namespace owning the volume.
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    /// StorageClass secrets of the call.
    pub fn secrets(mut self, secrets: ConfigMap) -> Self {
        self.secrets = secrets;
        self
    }

    /// Namespace of the driver pod. Taken from `POD_NAMESPACE` when unset.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Build the instance for `kms_id`. An empty ID or `default` uses the
    /// passphrase in the StorageClass secrets and reads no configuration.
    pub fn build(self, kms_id: &str) -> Result<Box<dyn EncryptionKms>> {
        let in_cluster;
        let cluster: &dyn ClusterApi = match self.cluster {
            Some(cluster) => cluster,
            None => {
                in_cluster = InClusterClient::new().with_deadline(self.deadline);
                &in_cluster
            }
        };

        let mut args = ProviderInitArgs {
            tenant: self.tenant,
            config: ConfigMap::new(),
            secrets: self.secrets,
            namespace: self.namespace,
            cluster,
            deadline: self.deadline,
        };

        if kms_id.is_empty() || kms_id == secrets::DEFAULT_KMS_TYPE {
            return secrets::new_secrets_kms(args);
        }

        let config = load_kms_configuration(&self.config_path, cluster)?;
        args.config = kms_section(&config, kms_id)?;
        KMS_REGISTRY.build_kms(args)
    }
}

/// Build the instance for `kms_id` with the process defaults.
pub fn get_kms(tenant: &str, kms_id: &str, secrets: ConfigMap) -> Result<Box<dyn EncryptionKms>> {
    KmsBuilder::new().tenant(tenant).secrets(secrets).build(kms_id)
}
