//! Access to the Kubernetes objects the providers read their credentials
//! from.
//!
//! Providers only see the [`ClusterApi`] trait. [`InClusterClient`] talks
//! to the API server with the pod's own service-account credentials;
//! [`MemoryCluster`] serves objects from memory and backs the tests.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde_json::{Value, json};

use crate::{
    crypto::tls::{self, TlsOptions},
    error::{KmsError, Result},
    kms::Deadline,
};

/// Data of a secret, already base64-decoded.
pub type SecretData = BTreeMap<String, Vec<u8>>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceAccount {
    pub name: String,
    /// Names of the secrets linked to the account (legacy token secrets).
    pub secrets: Vec<String>,
}

pub trait ClusterApi: Send + Sync {
    fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData>;

    fn get_config_map(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>>;

    fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount>;

    /// Issue a short-lived token for the account through the TokenRequest API.
    fn create_service_account_token(&self, namespace: &str, name: &str) -> Result<String>;
}

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct Connection {
    agent: ureq::Agent,
    base_url: String,
}

impl Connection {
    fn from_environment() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| KmsError::Cluster("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))?;
        let tls_config = tls::client_config(&TlsOptions {
            ca_pem: Some(&ca),
            ..Default::default()
        })?;
        let agent = ureq::AgentBuilder::new().tls_config(tls_config).build();
        Ok(Self {
            agent,
            base_url: format!("https://{host}:{port}"),
        })
    }
}

/// REST client for the API server the pod runs under.
///
/// The connection is set up on first use. The bearer token is re-read for
/// every request since projected tokens are rotated by the kubelet.
pub struct InClusterClient {
    conn: OnceCell<Connection>,
    deadline: Deadline,
}

impl Default for InClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InClusterClient {
    pub fn new() -> Self {
        Self {
            conn: OnceCell::new(),
            deadline: Deadline::none(),
        }
    }

    /// Bound every request made through this client.
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    fn connection(&self) -> Result<&Connection> {
        self.conn.get_or_try_init(Connection::from_environment)
    }

    fn token() -> Result<String> {
        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))?;
        Ok(token.trim().to_owned())
    }

    fn request(
        &self,
        method: &str,
        kind: &'static str,
        namespace: &str,
        name: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let conn = self.connection()?;
        let url = format!("{}/api/v1/namespaces/{namespace}/{path}", conn.base_url);
        let req = conn
            .agent
            .request(method, &url)
            .set("Authorization", &format!("Bearer {}", Self::token()?))
            .set("Accept", "application/json")
            .timeout(self.deadline.timeout(DEFAULT_TIMEOUT)?);
        let result = match body {
            Some(body) => req.send_json(body),
            None => req.call(),
        };
        match result {
            Ok(resp) => Ok(resp.into_json()?),
            Err(ureq::Error::Status(404, _)) => Err(KmsError::ClusterNotFound {
                kind,
                namespace: namespace.to_owned(),
                name: name.to_owned(),
            }),
            Err(e) => Err(KmsError::from(e).context(format!("get {kind} {namespace}/{name}"))),
        }
    }
}

fn string_map(obj: &Value, field: &str) -> BTreeMap<String, String> {
    obj.get(field)
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

impl ClusterApi for InClusterClient {
    fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData> {
        let obj = self.request("GET", "secret", namespace, name, &format!("secrets/{name}"), None)?;
        string_map(&obj, "data")
            .into_iter()
            .map(|(k, v)| {
                let decoded = STANDARD.decode(v.as_bytes()).map_err(|e| {
                    KmsError::Cluster(format!("secret {namespace}/{name} key {k}: {e}"))
                })?;
                Ok((k, decoded))
            })
            .collect()
    }

    fn get_config_map(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        let obj = self.request(
            "GET",
            "configmap",
            namespace,
            name,
            &format!("configmaps/{name}"),
            None,
        )?;
        Ok(string_map(&obj, "data"))
    }

    fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount> {
        let obj = self.request(
            "GET",
            "serviceaccount",
            namespace,
            name,
            &format!("serviceaccounts/{name}"),
            None,
        )?;
        let secrets = obj
            .get("secrets")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|s| s.get("name").and_then(Value::as_str))
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ServiceAccount {
            name: name.to_owned(),
            secrets,
        })
    }

    fn create_service_account_token(&self, namespace: &str, name: &str) -> Result<String> {
        let body = json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "TokenRequest",
            "spec": {},
        });
        let obj = self.request(
            "POST",
            "serviceaccount",
            namespace,
            name,
            &format!("serviceaccounts/{name}/token"),
            Some(body),
        )?;
        obj.pointer("/status/token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| {
                KmsError::Cluster(format!(
                    "no token in TokenRequest response for {namespace}/{name}"
                ))
            })
    }
}

type Key = (String, String);

/// Cluster objects held in memory.
#[derive(Default)]
pub struct MemoryCluster {
    secrets: RwLock<HashMap<Key, SecretData>>,
    config_maps: RwLock<HashMap<Key, BTreeMap<String, String>>>,
    service_accounts: RwLock<HashMap<Key, ServiceAccount>>,
    tokens: RwLock<HashMap<Key, String>>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_owned(), name.to_owned())
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret<K, V>(self, namespace: &str, name: &str, data: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: AsRef<[u8]>,
    {
        let data = data
            .into_iter()
            .map(|(k, v)| (k.into(), v.as_ref().to_vec()))
            .collect();
        self.secrets.write().insert(key(namespace, name), data);
        self
    }

    pub fn with_config_map<K, V>(self, namespace: &str, name: &str, data: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let data = data.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.config_maps.write().insert(key(namespace, name), data);
        self
    }

    pub fn with_service_account(self, namespace: &str, account: ServiceAccount) -> Self {
        self.service_accounts
            .write()
            .insert(key(namespace, &account.name), account);
        self
    }

    /// Token handed out by `create_service_account_token` for the account.
    pub fn with_token(self, namespace: &str, name: &str, token: &str) -> Self {
        self.tokens.write().insert(key(namespace, name), token.to_owned());
        self
    }
}

fn lookup<T: Clone>(
    table: &RwLock<HashMap<Key, T>>,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> Result<T> {
    table
        .read()
        .get(&key(namespace, name))
        .cloned()
        .ok_or_else(|| KmsError::ClusterNotFound {
            kind,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        })
}

impl ClusterApi for MemoryCluster {
    fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData> {
        lookup(&self.secrets, "secret", namespace, name)
    }

    fn get_config_map(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        lookup(&self.config_maps, "configmap", namespace, name)
    }

    fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount> {
        lookup(&self.service_accounts, "serviceaccount", namespace, name)
    }

    fn create_service_account_token(&self, namespace: &str, name: &str) -> Result<String> {
        lookup(&self.tokens, "serviceaccount", namespace, name)
    }
}

/// Fetch one field of a secret as UTF-8.
pub(crate) fn secret_string(data: &SecretData, key: &str) -> Option<String> {
    data.get(key)
        .map(|v| String::from_utf8_lossy(v).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_cluster_lookup() {
        let cluster = MemoryCluster::new()
            .with_secret("tenant", "creds", [("token", "s3cr3t")])
            .with_config_map("tenant", "cfg", [("vaultAddress", "https://vault")]);

        let secret = cluster.get_secret("tenant", "creds").unwrap();
        assert_eq!(secret_string(&secret, "token").as_deref(), Some("s3cr3t"));
        assert_eq!(
            cluster.get_config_map("tenant", "cfg").unwrap()["vaultAddress"],
            "https://vault"
        );

        let err = cluster.get_secret("other", "creds").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn string_map_skips_non_strings() {
        let obj = json!({"data": {"a": "1", "b": 2}});
        let map = string_map(&obj, "data");
        assert_eq!(map.len(), 1);
        assert_eq!(map["a"], "1");
        assert!(string_map(&obj, "missing").is_empty());
    }
}
