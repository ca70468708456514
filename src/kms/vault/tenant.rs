//! Vault connection that can be adjusted per tenant.
//!
//! Options are layered: the global section first, then the inline
//! `tenants.<tenant>` object, then the config-map `tenantConfigName` in the
//! tenant namespace. Only allow-listed options are taken from the
//! config-map; the rest is ignored.

use serde_json::Value;

use super::connection::VaultConnection;
use crate::{
    cluster::{ClusterApi, secret_string},
    config::{ConfigMap, fetch_tenant_config, optional_string},
    error::{KmsError, Result},
    kms::{Deadline, DekStore},
};

pub const DEFAULT_TENANT_CONFIG_NAME: &str = "ceph-csi-kms-config";

/// Options a tenant may override.
pub fn is_tenant_config_option(opt: &str) -> bool {
    matches!(
        opt,
        "vaultAddress"
            | "vaultBackend"
            | "vaultBackendPath"
            | "vaultAuthNamespace"
            | "vaultNamespace"
            | "vaultDestroyKeys"
            | "vaultTLSServerName"
            | "vaultCAFromSecret"
            | "vaultCAVerify"
    )
}

pub struct VaultTenantConnection {
    pub(crate) conn: VaultConnection,
    pub(crate) tenant: String,
    pub(crate) config_name: String,
    option_filter: fn(&str) -> bool,
}

impl VaultTenantConnection {
    pub fn new(option_filter: fn(&str) -> bool) -> Self {
        Self {
            conn: VaultConnection::default(),
            tenant: String::new(),
            config_name: DEFAULT_TENANT_CONFIG_NAME.to_owned(),
            option_filter,
        }
    }

    pub fn parse_config(&mut self, config: &ConfigMap) -> Result<()> {
        self.conn.init_connection(config)?;
        if let Some(name) = optional_string(config, "tenantConfigName")? {
            self.config_name = name;
        }
        Ok(())
    }

    /// Read the tenant's config-map. `None` when there is no tenant, no
    /// config-map, or nothing usable in it.
    pub fn parse_tenant_config(&self, cluster: &dyn ClusterApi) -> Result<Option<ConfigMap>> {
        if self.tenant.is_empty() || self.config_name.is_empty() {
            return Ok(None);
        }

        let data = match cluster.get_config_map(&self.tenant, &self.config_name) {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => {
                return Err(e.context(format!(
                    "failed to get config ({}) for tenant ({})",
                    self.config_name, self.tenant
                )));
            }
        };

        let mut config: ConfigMap = data
            .into_iter()
            .filter(|(k, _)| (self.option_filter)(k))
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        if config.is_empty() {
            return Ok(None);
        }

        self.set_tenant_auth_namespace(&mut config);
        Ok(Some(config))
    }

    /// When the global configuration did not separate the namespaces, a
    /// tenant that moves `vaultNamespace` moves `vaultAuthNamespace` along.
    pub fn set_tenant_auth_namespace(&self, tenant_config: &mut ConfigMap) {
        let (Some(namespace), Some(auth_namespace)) =
            (&self.conn.namespace, &self.conn.auth_namespace)
        else {
            return;
        };
        if namespace != auth_namespace || tenant_config.contains_key("vaultAuthNamespace") {
            return;
        }
        if let Some(tenant_namespace) = tenant_config.get("vaultNamespace").cloned() {
            tenant_config.insert("vaultAuthNamespace".into(), tenant_namespace);
        }
    }

    /// Fetch `key` of secret `name`, from the tenant namespace or else from
    /// the driver namespace.
    fn get_certificate(
        &self,
        cluster: &dyn ClusterApi,
        pod_namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<String> {
        let secret = match cluster.get_secret(&self.tenant, name) {
            Err(e) if e.is_not_found() => cluster.get_secret(pod_namespace, name)?,
            other => other?,
        };
        secret_string(&secret, key)
            .ok_or_else(|| KmsError::Config(format!("failed to parse certificates from secret {name}")))
    }

    /// Resolve the CA and client certificate options into temporary files.
    pub fn init_certificates(
        &mut self,
        config: &ConfigMap,
        cluster: &dyn ClusterApi,
        pod_namespace: &str,
    ) -> Result<()> {
        let options = [
            ("vaultCAFromSecret", "cert", "vault-ca-cert"),
            ("vaultClientCertFromSecret", "cert", "vault-client-cert"),
            ("vaultClientCertKeyFromSecret", "key", "vault-client-cert-key"),
        ];
        for (option, key, prefix) in options {
            let Some(name) = optional_string(config, option)?.filter(|n| !n.is_empty()) else {
                continue;
            };
            let pem = self
                .get_certificate(cluster, pod_namespace, &name, key)
                .map_err(|e| e.context(format!("failed to get {prefix} from secret {name}")))?;
            let path = self.conn.write_pem(prefix, pem.as_bytes())?;
            match option {
                "vaultCAFromSecret" => self.conn.ca_cert = Some(path),
                "vaultClientCertFromSecret" => self.conn.client_cert = Some(path),
                _ => self.conn.client_key = Some(path),
            }
        }
        Ok(())
    }
}

/// Layering of tenant options, shared by the per-tenant Vault providers.
pub trait TenantConfigured {
    fn connection(&mut self) -> &mut VaultTenantConnection;

    /// Options only this provider knows about.
    fn parse_provider_options(&mut self, config: &ConfigMap) -> Result<()>;

    fn parse_config(&mut self, config: &ConfigMap) -> Result<()> {
        self.connection().parse_config(config)?;
        self.parse_provider_options(config)
    }

    fn configure_tenant(&mut self, config: &ConfigMap, tenant: &str, cluster: &dyn ClusterApi) -> Result<()> {
        self.connection().tenant = tenant.to_owned();

        if let Some(inline) = fetch_tenant_config(config, tenant) {
            log::debug!("applying inline configuration for tenant {tenant}");
            self.parse_config(&inline)?;
        }

        let conn = self.connection();
        let config_name = conn.config_name.clone();
        if let Some(overlay) = conn
            .parse_tenant_config(cluster)
            .map_err(|e| e.context("failed to parse config for tenant"))?
        {
            log::debug!("applying config-map {config_name} of tenant {tenant}");
            self.parse_config(&overlay).map_err(|e| {
                e.context(format!(
                    "failed to parse config ({config_name}) for tenant ({tenant})"
                ))
            })?;
        }
        Ok(())
    }
}

/// Secrets are stored under the volume key as given.
impl DekStore for VaultTenantConnection {
    fn fetch_dek(&self, deadline: Deadline, key: &str) -> Result<String> {
        self.conn.fetch_passphrase(deadline, key)
    }

    fn store_dek(&self, deadline: Deadline, key: &str, value: &str) -> Result<()> {
        self.conn.store_passphrase(deadline, key, value)
    }

    fn remove_dek(&self, deadline: Deadline, key: &str) -> Result<()> {
        self.conn.remove_passphrase(deadline, key)
    }
}
