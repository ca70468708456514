//! Process-wide table of KMS providers.
//!
//! Every provider type is registered once, keyed by the value operators put
//! in `encryptionKMSType`. A second table holds dummy providers with a fixed
//! passphrase for tests of code that consumes a KMS.

use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::URL_SAFE};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::{
    cluster::MemoryCluster,
    config::{ConfigMap, get_provider, pod_namespace},
    error::{KmsError, Result},
    kmip,
    kms::{
        Deadline, EncryptionKms, ProviderInitArgs, aws, azure, keyprotect,
        secrets::{self, SecretsKms, SecretsMetadataKms},
        vault,
    },
};

/// Builds an instance from its configuration section.
pub type Initializer = fn(ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>>;

#[derive(Clone, Copy)]
pub struct Provider {
    pub unique_id: &'static str,
    pub initializer: Option<Initializer>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("unique_id", &self.unique_id)
            .field("initializer", &self.initializer.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<&'static str, Initializer>>,
}

impl ProviderRegistry {
    /// Add a provider.
    ///
    /// # Panics
    /// On an empty ID, a missing initializer, or an ID that is already
    /// registered. Registration happens while the table is built, so these
    /// are programming errors.
    pub fn register(&self, provider: Provider) {
        if provider.unique_id.is_empty() {
            panic!("a provider must have a unique ID");
        }
        let Some(initializer) = provider.initializer else {
            panic!("provider {:?} must have an initializer", provider.unique_id);
        };

        let mut providers = self.providers.write();
        if providers.contains_key(provider.unique_id) {
            panic!("duplicate registration of provider {:?}", provider.unique_id);
        }
        providers.insert(provider.unique_id, initializer);
    }

    pub fn get_provider(&self, unique_id: &str) -> Option<Initializer> {
        self.providers.read().get(unique_id).copied()
    }

    /// Registered IDs, sorted.
    pub fn provider_ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.providers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Build the provider named in `args.config`. The namespace of the
    /// driver pod is filled in from the environment when the caller did not
    /// set one.
    pub fn build_kms(&self, mut args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
        let provider = get_provider(&args.config)?;
        let initializer = self
            .get_provider(&provider)
            .ok_or_else(|| KmsError::Config(format!("could not find KMS provider {provider:?}")))?;

        if args.namespace.is_empty() {
            match pod_namespace() {
                Ok(ns) => args.namespace = ns,
                Err(e) => log::debug!("no driver namespace for provider {provider:?}: {e}"),
            }
        }

        log::debug!("initializing KMS provider {provider:?} for tenant {:?}", args.tenant);
        initializer(args)
    }
}

const BUILTIN_PROVIDERS: &[Provider] = &[
    Provider {
        unique_id: secrets::DEFAULT_KMS_TYPE,
        initializer: Some(secrets::new_secrets_kms),
    },
    Provider {
        unique_id: secrets::SECRETS_METADATA_KMS_TYPE,
        initializer: Some(secrets::init_secrets_metadata_kms),
    },
    Provider {
        unique_id: vault::kubernetes::KMS_TYPE_VAULT,
        initializer: Some(vault::kubernetes::init_vault_kms),
    },
    Provider {
        unique_id: vault::tokens::KMS_TYPE_VAULT_TOKENS,
        initializer: Some(vault::tokens::init_vault_tokens_kms),
    },
    Provider {
        unique_id: vault::tenant_sa::KMS_TYPE_VAULT_TENANT_SA,
        initializer: Some(vault::tenant_sa::init_vault_tenant_sa),
    },
    Provider {
        unique_id: aws::metadata::KMS_TYPE_AWS_METADATA,
        initializer: Some(aws::metadata::init_aws_metadata_kms),
    },
    Provider {
        unique_id: aws::sts::KMS_TYPE_AWS_STS_METADATA,
        initializer: Some(aws::sts::init_aws_sts_metadata_kms),
    },
    Provider {
        unique_id: azure::KMS_TYPE_AZURE,
        initializer: Some(azure::init_azure_kms),
    },
    Provider {
        unique_id: keyprotect::KMS_TYPE_KEY_PROTECT,
        initializer: Some(keyprotect::init_key_protect_kms),
    },
    Provider {
        unique_id: kmip::KMS_TYPE_KMIP,
        initializer: Some(kmip::init_kmip_kms),
    },
];

/// Every provider this crate ships.
pub static KMS_REGISTRY: Lazy<ProviderRegistry> = Lazy::new(|| {
    let registry = ProviderRegistry::default();
    for provider in BUILTIN_PROVIDERS {
        registry.register(*provider);
    }
    registry
});

fn test_passphrase() -> String {
    URL_SAFE.encode("test dummy passphrase")
}

fn default_test_dummy(_args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    Ok(Box::new(SecretsKms::with_passphrase(test_passphrase())))
}

fn metadata_test_dummy(_args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    Ok(Box::new(SecretsMetadataKms::with_passphrase(test_passphrase())))
}

/// Dummies that need neither a cluster nor a remote KMS.
pub static TEST_REGISTRY: Lazy<ProviderRegistry> = Lazy::new(|| {
    let registry = ProviderRegistry::default();
    registry.register(Provider {
        unique_id: secrets::DEFAULT_KMS_TYPE,
        initializer: Some(default_test_dummy),
    });
    registry.register(Provider {
        unique_id: secrets::SECRETS_METADATA_KMS_TYPE,
        initializer: Some(metadata_test_dummy),
    });
    registry
});

/// IDs accepted by [`get_kms_test_dummy`].
pub fn test_providers() -> Vec<&'static str> {
    TEST_REGISTRY.provider_ids()
}

pub fn get_kms_test_dummy(kms_id: &str) -> Result<Box<dyn EncryptionKms>> {
    let initializer = TEST_REGISTRY
        .get_provider(kms_id)
        .ok_or_else(|| KmsError::Config(format!("no test dummy for KMS provider {kms_id:?}")))?;
    let cluster = MemoryCluster::new();
    initializer(ProviderInitArgs {
        tenant: String::new(),
        config: ConfigMap::new(),
        secrets: ConfigMap::new(),
        namespace: String::new(),
        cluster: &cluster,
        deadline: Deadline::none(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kms::DekStoreType;

    fn noop(_args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
        Ok(Box::new(SecretsKms::with_passphrase("noop")))
    }

    #[test]
    #[should_panic(expected = "unique ID")]
    fn register_empty_id() {
        ProviderRegistry::default().register(Provider {
            unique_id: "",
            initializer: Some(noop),
        });
    }

    #[test]
    #[should_panic(expected = "must have an initializer")]
    fn register_without_initializer() {
        ProviderRegistry::default().register(Provider {
            unique_id: "incomplete-provider",
            initializer: None,
        });
    }

    #[test]
    #[should_panic(expected = "duplicate registration")]
    fn register_twice() {
        let registry = ProviderRegistry::default();
        let provider = Provider {
            unique_id: "duplicate",
            initializer: Some(noop),
        };
        registry.register(provider);
        registry.register(provider);
    }

    #[test]
    fn registered_provider_is_found() {
        let registry = ProviderRegistry::default();
        registry.register(Provider {
            unique_id: "unique-id",
            initializer: Some(noop),
        });
        assert!(registry.get_provider("unique-id").is_some());
        assert!(registry.get_provider("other").is_none());
    }

    #[test]
    fn builtin_providers() {
        assert_eq!(
            KMS_REGISTRY.provider_ids(),
            [
                "aws-metadata",
                "aws-sts-metadata",
                "azure-kv",
                "default",
                "ibmkeyprotect",
                "kmip",
                "metadata",
                "vault",
                "vaulttenantsa",
                "vaulttokens",
            ]
        );
    }

    #[test]
    fn build_unknown_provider() {
        let _ = env_logger::builder().is_test(true).try_init();
        let cluster = MemoryCluster::new();
        let err = KMS_REGISTRY
            .build_kms(ProviderInitArgs {
                tenant: "tenant".into(),
                config: json!({"encryptionKMSType": "no-such-kms"}).as_object().cloned().unwrap(),
                secrets: ConfigMap::new(),
                namespace: "ceph-csi".into(),
                cluster: &cluster,
                deadline: Deadline::none(),
            })
            .err()
            .unwrap();
        assert!(err.to_string().contains("no-such-kms"));
    }

    #[test]
    fn test_dummies() {
        assert_eq!(test_providers(), ["default", "metadata"]);

        let kms = get_kms_test_dummy("default").unwrap();
        assert_eq!(kms.requires_dek_store(), DekStoreType::Integrated);
        let dek = kms.dek_store().unwrap().fetch_dek(Deadline::none(), "vol").unwrap();
        assert_eq!(dek, test_passphrase());

        let kms = get_kms_test_dummy("metadata").unwrap();
        let wrapped = kms.encrypt_dek("vol", "dek").unwrap();
        assert_eq!(kms.decrypt_dek("vol", &wrapped).unwrap(), "dek");

        assert!(get_kms_test_dummy("vault").is_err());
    }
}
