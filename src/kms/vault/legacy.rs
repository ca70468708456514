//! Translation of configurations written with the environment variable
//! names of the Vault CLI (`VAULT_ADDR`, ...) into the option names used
//! everywhere else.

use serde_json::Value;

use crate::{
    config::{ConfigMap, parse_bool},
    error::{KmsError, Result},
};

/// Legacy key and the option it becomes. `VAULT_SKIP_VERIFY` is handled
/// separately because its meaning is inverted.
const FIELDS: [(&str, &str); 11] = [
    ("KMS_PROVIDER", "encryptionKMSType"),
    ("VAULT_ADDR", "vaultAddress"),
    ("VAULT_BACKEND", "vaultBackend"),
    ("VAULT_BACKEND_PATH", "vaultBackendPath"),
    ("VAULT_DESTROY_KEYS", "vaultDestroyKeys"),
    ("VAULT_CACERT", "vaultCAFromSecret"),
    ("VAULT_TLS_SERVER_NAME", "vaultTLSServerName"),
    ("VAULT_CLIENT_CERT", "vaultClientCertFromSecret"),
    ("VAULT_CLIENT_KEY", "vaultClientCertKeyFromSecret"),
    ("VAULT_AUTH_NAMESPACE", "vaultAuthNamespace"),
    ("VAULT_NAMESPACE", "vaultNamespace"),
];

const DEFAULTS: [(&str, &str); 3] = [
    ("VAULT_DESTROY_KEYS", "true"),
    ("VAULT_NAMESPACE", ""),
    ("VAULT_SKIP_VERIFY", "false"),
];

fn legacy_string(config: &ConfigMap, key: &str) -> Result<String> {
    match config.get(key) {
        None => Ok(DEFAULTS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| (*v).to_owned())
            .unwrap_or_default()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(KmsError::Config(format!(
            "failed to read the vault configuration: {key} must be a string, got {other}"
        ))),
    }
}

/// Return the options for a legacy configuration. Every option is present
/// in the result; those without a value are empty. An unparsable
/// `VAULT_SKIP_VERIFY` leaves `vaultCAVerify` empty.
pub fn transform_config(legacy: &ConfigMap) -> Result<ConfigMap> {
    let mut config = ConfigMap::new();
    for (from, to) in FIELDS {
        config.insert(to.to_owned(), Value::String(legacy_string(legacy, from)?));
    }

    let skip_verify = legacy_string(legacy, "VAULT_SKIP_VERIFY")?;
    let ca_verify = parse_bool(&skip_verify)
        .map(|skip| (!skip).to_string())
        .unwrap_or_default();
    config.insert("vaultCAVerify".into(), Value::String(ca_verify));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn every_field_is_translated() {
        let legacy = json!({
            "KMS_PROVIDER": "vaulttokens",
            "VAULT_ADDR": "https://vault.example.com",
            "VAULT_BACKEND": "kv-v2",
            "VAULT_BACKEND_PATH": "/secret",
            "VAULT_DESTROY_KEYS": "true",
            "VAULT_CACERT": "",
            "VAULT_TLS_SERVER_NAME": "vault.example.com",
            "VAULT_CLIENT_CERT": "",
            "VAULT_CLIENT_KEY": "",
            "VAULT_AUTH_NAMESPACE": "devops",
            "VAULT_NAMESPACE": "devops/homepage",
            "VAULT_SKIP_VERIFY": "true"
        });
        let legacy = legacy.as_object().unwrap();
        let config = transform_config(legacy).unwrap();

        for (from, to) in FIELDS {
            assert_eq!(config[to], legacy[from], "{from} -> {to}");
        }
        assert_eq!(config["vaultCAVerify"], "false");
        assert_eq!(config.len(), 12);
    }

    #[test]
    fn defaults() {
        let legacy = json!({"KMS_PROVIDER": "vaulttokens"});
        let config = transform_config(legacy.as_object().unwrap()).unwrap();
        assert_eq!(config["encryptionKMSType"], "vaulttokens");
        assert_eq!(config["vaultDestroyKeys"], "true");
        assert_eq!(config["vaultCAVerify"], "true");
        assert_eq!(config["vaultNamespace"], "");
        assert_eq!(config["vaultAddress"], "");
    }

    #[test]
    fn unparsable_skip_verify() {
        let legacy = json!({"KMS_PROVIDER": "vaulttokens", "VAULT_SKIP_VERIFY": "sometimes"});
        let config = transform_config(legacy.as_object().unwrap()).unwrap();
        assert_eq!(config["vaultCAVerify"], "");
    }

    #[test]
    fn non_string_values_are_rejected() {
        let legacy = json!({"KMS_PROVIDER": "vaulttokens", "VAULT_ADDR": 42});
        assert!(transform_config(legacy.as_object().unwrap()).is_err());
    }
}
