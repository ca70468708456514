use std::path::PathBuf;

use serde_json::{Value, json};

use super::client::{KeyContext, VaultAuth, VaultClient, VaultSettings};
use crate::{
    config::{ConfigMap, optional_string, parse_bool},
    error::{KmsError, Result},
    kms::{Deadline, ScratchFiles},
};

const DEFAULT_NAMESPACE: &str = "";
const DEFAULT_CA_VERIFY: bool = true;
const DEFAULT_DESTROY_KEYS: &str = "true";

/// Options and resources shared by all Vault providers.
///
/// `init_connection` may run several times, once for the global
/// configuration and again for each tenant overlay. The first run requires
/// `vaultAddress` and applies defaults; later runs only change what the
/// overlay sets.
#[derive(Default)]
pub struct VaultConnection {
    initialized: bool,
    pub(crate) address: Option<String>,
    pub(crate) backend: Option<String>,
    pub(crate) backend_path: Option<String>,
    pub(crate) tls_server_name: Option<String>,
    /// Namespace for login.
    pub(crate) auth_namespace: Option<String>,
    /// Namespace holding the secrets.
    pub(crate) namespace: Option<String>,
    pub(crate) insecure: Option<bool>,
    pub(crate) destroy_keys: bool,

    pub(crate) ca_cert: Option<PathBuf>,
    pub(crate) client_cert: Option<PathBuf>,
    pub(crate) client_key: Option<PathBuf>,

    pub(crate) scratch: ScratchFiles,
    client: Option<VaultClient>,
}

/// A boolean option; Vault settings arrive as strings from config-maps and
/// as JSON booleans from the configuration file.
fn optional_bool(config: &ConfigMap, key: &str) -> Result<Option<bool>> {
    match config.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => parse_bool(s)
            .map(Some)
            .ok_or_else(|| KmsError::invalid(key, format!("failed to parse {s:?} as boolean"))),
        Some(other) => Err(KmsError::invalid(
            key,
            format!("expected string, but got {other}"),
        )),
    }
}

impl VaultConnection {
    pub fn init_connection(&mut self, config: &ConfigMap) -> Result<()> {
        let first_init = !self.initialized;

        let address = optional_string(config, "vaultAddress")?;
        if first_init && address.is_none() {
            return Err(KmsError::missing("vaultAddress"));
        }
        let backend = optional_string(config, "vaultBackend")?;
        let backend_path = optional_string(config, "vaultBackendPath")?;
        let destroy_keys = optional_string(config, "vaultDestroyKeys")?;
        let tls_server_name = optional_string(config, "vaultTLSServerName")?;

        let namespace_set = optional_string(config, "vaultNamespace")?;
        let namespace = namespace_set
            .clone()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned());

        let auth_namespace_set = optional_string(config, "vaultAuthNamespace")?;
        let auth_namespace = match auth_namespace_set.as_deref() {
            None | Some("") => namespace.clone(),
            Some(ns) => ns.to_owned(),
        };

        let ca_verify = optional_bool(config, "vaultCAVerify")?;
        optional_string(config, "vaultCAFromSecret")?;

        if address.is_some() {
            self.address = address;
        }
        if backend.is_some() {
            self.backend = backend;
        }
        if backend_path.is_some() {
            self.backend_path = backend_path;
        }
        if tls_server_name.is_some() {
            self.tls_server_name = tls_server_name;
        }
        if first_init || destroy_keys.is_some() {
            self.destroy_keys =
                destroy_keys.as_deref().unwrap_or(DEFAULT_DESTROY_KEYS) == DEFAULT_DESTROY_KEYS;
        }
        if first_init || namespace_set.is_some() {
            self.namespace = Some(namespace);
        }
        if first_init || auth_namespace_set.is_some() {
            self.auth_namespace = Some(auth_namespace);
        }
        if first_init || ca_verify.is_some() {
            self.insecure = Some(!ca_verify.unwrap_or(DEFAULT_CA_VERIFY));
        }

        self.initialized = true;
        Ok(())
    }

    /// Context for reads and writes.
    pub fn key_context(&self) -> KeyContext {
        KeyContext {
            namespace: self.namespace.clone(),
            destroy: false,
        }
    }

    /// Context for deletes. Only deletes may carry the destroy flag, Vault
    /// rejects writes that have it.
    pub fn delete_key_context(&self) -> KeyContext {
        KeyContext {
            destroy: self.destroy_keys,
            ..self.key_context()
        }
    }

    /// Materialise a PEM from a secret so it can be handed to the client.
    pub(crate) fn write_pem(&mut self, prefix: &str, pem: &[u8]) -> Result<PathBuf> {
        self.scratch
            .file(prefix, pem)
            .map_err(|e| KmsError::Config(format!("failed to create temporary file for {prefix}: {e}")))
    }

    pub fn connect(&mut self, auth: &VaultAuth, deadline: Deadline) -> Result<()> {
        let settings = VaultSettings {
            address: self.address.clone().unwrap_or_default(),
            backend: self.backend.clone(),
            backend_path: self.backend_path.clone(),
            auth_namespace: self.auth_namespace.clone(),
            tls_server_name: self.tls_server_name.clone(),
            insecure: self.insecure.unwrap_or(!DEFAULT_CA_VERIFY),
            ca_cert: self.ca_cert.clone(),
            client_cert: self.client_cert.clone(),
            client_key: self.client_key.clone(),
        };
        let client = VaultClient::connect(&settings, auth, deadline)
            .map_err(|e| e.context("failed connecting to Vault"))?;
        self.client = Some(client);
        Ok(())
    }

    fn client(&self) -> Result<&VaultClient> {
        self.client
            .as_ref()
            .ok_or_else(|| KmsError::Config("Vault connection is not initialized".into()))
    }

    pub(crate) fn fetch_passphrase(&self, deadline: Deadline, path: &str) -> Result<String> {
        let secret = self.client()?.get_secret(path, &self.key_context(), deadline)?;
        let data = secret
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| KmsError::Config(format!("failed parsing data for get passphrase request for {path:?}")))?;
        data.get("passphrase")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                KmsError::Config(format!(
                    "failed parsing passphrase for get passphrase request for {path:?}"
                ))
            })
    }

    pub(crate) fn store_passphrase(&self, deadline: Deadline, path: &str, value: &str) -> Result<()> {
        let data = json!({ "data": { "passphrase": value } });
        self.client()?
            .put_secret(path, data, &self.key_context(), deadline)
            .map_err(|e| e.context(format!("saving passphrase at {path} request to vault failed")))
    }

    pub(crate) fn remove_passphrase(&self, deadline: Deadline, path: &str) -> Result<()> {
        self.client()?
            .delete_secret(path, &self.delete_key_context(), deadline)
            .map_err(|e| e.context(format!("delete passphrase at {path} request to vault failed")))
    }

    pub fn destroy(&mut self) {
        self.client = None;
        self.scratch.remove_all();
    }
}
