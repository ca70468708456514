//! Configuration lookup for KMS connections.
//!
//! The configuration is a JSON object keyed by kmsID. Each section holds the
//! provider type plus provider specific options. It is normally mounted as a
//! file; when the file does not exist the same content is read from a
//! config-map in the namespace of the driver pod.

use std::{io::ErrorKind, path::Path};

use serde_json::Value;

use crate::{
    cluster::ClusterApi,
    error::{KmsError, Result},
};

/// One configuration section, or the overlay of a tenant.
pub type ConfigMap = serde_json::Map<String, Value>;

/// Provider type key used by config-map based (legacy) configurations.
pub const KMS_PROVIDER_KEY: &str = "KMS_PROVIDER";
/// Provider type key used by the configuration file. Preferred.
pub const KMS_TYPE_KEY: &str = "encryptionKMSType";

pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
pub const KMS_CONFIGMAP_ENV: &str = "KMS_CONFIGMAP_NAME";
pub const DEFAULT_KMS_CONFIGMAP_NAME: &str = "csi-kms-connection-details";
pub const KMS_CONFIG_PATH: &str = "/etc/ceph-csi-encryption-kms-config/config.json";

/// Read a string option into `option`.
///
/// A missing key leaves `option` untouched and returns
/// [`KmsError::ConfigOptionMissing`]; a value of another type returns
/// [`KmsError::ConfigOptionInvalid`].
pub fn set_config_string(option: &mut String, config: &ConfigMap, key: &str) -> Result<()> {
    match config.get(key) {
        None => Err(KmsError::missing(key)),
        Some(Value::String(s)) => {
            *option = s.clone();
            Ok(())
        }
        Some(other) => Err(KmsError::invalid(
            key,
            format!("expected string, but got {}", json_type(other)),
        )),
    }
}

/// Read an integer option into `option`. JSON numbers arrive as floats from
/// some producers, so whole-valued floats are accepted too.
pub fn set_config_int(option: &mut i64, config: &ConfigMap, key: &str) -> Result<()> {
    let value = config.get(key).ok_or_else(|| KmsError::missing(key))?;
    let parsed = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        _ => None,
    };
    match parsed {
        Some(v) => {
            *option = v;
            Ok(())
        }
        None => Err(KmsError::invalid(
            key,
            format!("expected integer, but got {}", json_type(value)),
        )),
    }
}

/// Optional string: `Ok(None)` when missing, error only when invalid.
pub(crate) fn optional_string(config: &ConfigMap, key: &str) -> Result<Option<String>> {
    let mut value = String::new();
    match set_config_string(&mut value, config, key) {
        Ok(()) => Ok(Some(value)),
        Err(e) if e.is_config_missing() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Boolean parsing with the same spellings operators are used to from
/// `VAULT_SKIP_VERIFY` style settings.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Return the namespace the driver pod runs in.
pub fn pod_namespace() -> Result<String> {
    match std::env::var(POD_NAMESPACE_ENV) {
        Ok(ns) if !ns.is_empty() => Ok(ns),
        _ => Err(KmsError::Config(format!(
            "{POD_NAMESPACE_ENV:?} is not set in the environment"
        ))),
    }
}

pub fn kms_config_map_name() -> String {
    std::env::var(KMS_CONFIGMAP_ENV)
        .ok()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_KMS_CONFIGMAP_NAME.to_owned())
}

/// Load every KMS section, from `path` if it exists, otherwise from the
/// config-map in the driver namespace.
pub fn load_kms_configuration(path: &Path, cluster: &dyn ClusterApi) -> Result<ConfigMap> {
    match std::fs::read(path) {
        Ok(content) => serde_json::from_slice(&content).map_err(|e| {
            KmsError::Config(format!("failed to parse KMS configuration: {e}"))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::debug!(
                "KMS configuration {} not found, reading config-map",
                path.display()
            );
            load_kms_config_map(cluster)
        }
        Err(e) => Err(KmsError::Config(format!(
            "failed to read KMS configuration from {}: {e}",
            path.display()
        ))),
    }
}

fn load_kms_config_map(cluster: &dyn ClusterApi) -> Result<ConfigMap> {
    let ns = pod_namespace()?;
    let name = kms_config_map_name();
    let data = cluster.get_config_map(&ns, &name)?;

    let mut config = ConfigMap::new();
    for (kms_id, raw) in data {
        let section: ConfigMap = serde_json::from_str(&raw).map_err(|_| {
            KmsError::Config(format!(
                "could not convert contents of {kms_id:?} to a config section"
            ))
        })?;
        config.insert(kms_id, Value::Object(section));
    }
    Ok(config)
}

/// Pick the section for `kms_id` out of the full configuration.
pub fn kms_section(config: &ConfigMap, kms_id: &str) -> Result<ConfigMap> {
    let section = config.get(kms_id).ok_or_else(|| {
        let have: Vec<&str> = config.keys().map(String::as_str).collect();
        KmsError::Config(format!(
            "could not get KMS configuration for {kms_id:?} (have {have:?})"
        ))
    })?;
    match section {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(KmsError::Config(format!(
            "failed to convert KMS configuration section: {kms_id}"
        ))),
    }
}

/// Identify the provider a section asks for. `encryptionKMSType` wins over
/// the legacy `KMS_PROVIDER`.
pub fn get_provider(config: &ConfigMap) -> Result<String> {
    for key in [KMS_TYPE_KEY, KMS_PROVIDER_KEY] {
        if let Some(value) = config.get(key) {
            return match value {
                Value::String(name) => Ok(name.clone()),
                other => Err(KmsError::Config(format!(
                    "could not convert KMS provider type ({other}) to string"
                ))),
            };
        }
    }
    Err(KmsError::Config(format!(
        "failed to get KMS provider, missing configuration option {KMS_TYPE_KEY:?} or {KMS_PROVIDER_KEY:?}"
    )))
}

/// Return the inline overrides under `tenants.<tenant>`, if any.
pub fn fetch_tenant_config(config: &ConfigMap, tenant: &str) -> Option<ConfigMap> {
    match config.get("tenants")?.as_object()?.get(tenant)? {
        Value::Object(map) => Some(map.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(v: Value) -> ConfigMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn string_option_missing_keeps_value() {
        let options = ConfigMap::new();
        let mut value = "default-value".to_owned();
        let err = set_config_string(&mut value, &options, "nonexistent").unwrap_err();
        assert!(err.is_config_missing());
        assert_eq!(value, "default-value");
    }

    #[test]
    fn string_option_overrides_default() {
        let options = map(json!({"set-me": "non-default"}));
        let mut value = "default-value".to_owned();
        set_config_string(&mut value, &options, "set-me").unwrap();
        assert_eq!(value, "non-default");
    }

    #[test]
    fn string_option_wrong_type() {
        let options = map(json!({"a": 1}));
        let mut value = String::new();
        let err = set_config_string(&mut value, &options, "a").unwrap_err();
        assert!(err.is_config_invalid());
        assert!(value.is_empty());
    }

    #[test]
    fn int_option() {
        let mut option = 7;
        set_config_int(&mut option, &map(json!({"a": 1.0})), "a").unwrap();
        assert_eq!(option, 1);

        let err = set_config_int(&mut option, &map(json!({"a": "abc"})), "a").unwrap_err();
        assert!(err.is_config_invalid());
        assert_eq!(option, 1);

        let err = set_config_int(&mut option, &ConfigMap::new(), "a").unwrap_err();
        assert!(err.is_config_missing());
        assert_eq!(option, 1);
    }

    #[test]
    fn provider_key_preference() {
        let both = map(json!({"encryptionKMSType": "vault", "KMS_PROVIDER": "vaulttokens"}));
        assert_eq!(get_provider(&both).unwrap(), "vault");

        let legacy = map(json!({"KMS_PROVIDER": "vaulttokens"}));
        assert_eq!(get_provider(&legacy).unwrap(), "vaulttokens");

        assert!(get_provider(&ConfigMap::new()).is_err());
        assert!(get_provider(&map(json!({"encryptionKMSType": 3}))).is_err());
    }

    #[test]
    fn tenant_overrides() {
        let config = map(json!({
            "vaultAddress": "https://vault.example.com",
            "tenants": {
                "bob": {"vaultAddress": "https://vault.bob.example.org"}
            }
        }));
        let bob = fetch_tenant_config(&config, "bob").unwrap();
        assert_eq!(bob["vaultAddress"], "https://vault.bob.example.org");
        assert!(fetch_tenant_config(&config, "alice").is_none());
    }

    #[test]
    fn bool_spellings() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("yes"), None);
    }
}
