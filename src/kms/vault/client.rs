//! Minimal Vault HTTP client: token or Kubernetes login plus the KV
//! secrets engine (version 1 and 2).

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde_json::{Value, json};
use zeroize::Zeroizing;

use crate::{
    crypto::tls::{self, TlsOptions},
    error::{KmsError, Result},
    kms::Deadline,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_BACKEND_PATH: &str = "secret";

/// How the client obtains its token.
pub enum VaultAuth {
    Token(Zeroizing<String>),
    /// Kubernetes auth method; the JWT is read from `token_path` at login.
    Kubernetes {
        mount: String,
        role: String,
        token_path: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KvVersion {
    V1,
    V2,
}

impl KvVersion {
    fn from_backend(backend: &str) -> Result<Self> {
        match backend {
            "kv" => Ok(KvVersion::V1),
            "kv-v2" => Ok(KvVersion::V2),
            other => Err(KmsError::invalid(
                "vaultBackend",
                format!("unsupported backend {other:?}, expected \"kv\" or \"kv-v2\""),
            )),
        }
    }
}

/// Connection settings collected from the configuration.
#[derive(Default)]
pub struct VaultSettings {
    pub address: String,
    pub backend: Option<String>,
    pub backend_path: Option<String>,
    /// Namespace used for login, and for secrets without a namespace.
    pub auth_namespace: Option<String>,
    pub tls_server_name: Option<String>,
    pub insecure: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// Options for a single secret operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyContext {
    pub namespace: Option<String>,
    /// Remove all versions and metadata instead of a soft delete.
    pub destroy: bool,
}

pub struct VaultClient {
    agent: ureq::Agent,
    address: String,
    token: Zeroizing<String>,
    auth_namespace: Option<String>,
    backend_path: String,
    kv_version: KvVersion,
}

fn read_pem(path: &Option<PathBuf>) -> Result<Option<Vec<u8>>> {
    path.as_ref()
        .map(std::fs::read)
        .transpose()
        .map_err(KmsError::from)
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

/// Join path components, dropping empty ones and stray slashes.
pub(crate) fn join_path<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .flat_map(|p| p.split('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

impl VaultClient {
    /// Log in and find out which KV version serves the backend path.
    pub fn connect(settings: &VaultSettings, auth: &VaultAuth, deadline: Deadline) -> Result<Self> {
        if settings.address.is_empty() {
            return Err(KmsError::missing("vaultAddress"));
        }

        let ca = read_pem(&settings.ca_cert)?;
        let cert = read_pem(&settings.client_cert)?;
        let key = read_pem(&settings.client_key)?;
        let tls_config = tls::client_config(&TlsOptions {
            ca_pem: ca.as_deref(),
            client_cert_pem: cert.as_deref(),
            client_key_pem: key.as_deref(),
            server_name: settings.tls_server_name.as_deref(),
            insecure: settings.insecure,
        })?;

        let mut client = VaultClient {
            agent: ureq::AgentBuilder::new()
                .tls_config(tls_config)
                .build(),
            address: settings.address.trim_end_matches('/').to_owned(),
            token: Zeroizing::new(String::new()),
            auth_namespace: non_empty(&settings.auth_namespace).map(str::to_owned),
            backend_path: non_empty(&settings.backend_path)
                .map(|p| join_path([p]))
                .unwrap_or_else(|| DEFAULT_BACKEND_PATH.to_owned()),
            kv_version: KvVersion::V1,
        };

        client.token = match auth {
            VaultAuth::Token(token) => token.clone(),
            VaultAuth::Kubernetes {
                mount,
                role,
                token_path,
            } => client.login_kubernetes(mount, role, token_path, deadline)?,
        };

        client.kv_version = match non_empty(&settings.backend) {
            Some(backend) => KvVersion::from_backend(backend)?,
            None => client.detect_kv_version(deadline)?,
        };
        log::debug!(
            "connected to Vault at {} ({:?} on {})",
            client.address,
            client.kv_version,
            client.backend_path
        );
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path)
    }

    fn request(&self, method: &str, path: &str, namespace: Option<&str>, deadline: Deadline) -> Result<ureq::Request> {
        let mut req = self
            .agent
            .request(method, &self.url(path))
            .timeout(deadline.timeout(DEFAULT_TIMEOUT)?);
        if !self.token.is_empty() {
            req = req.set("X-Vault-Token", &self.token);
        }
        if let Some(ns) = namespace.filter(|ns| !ns.is_empty()).or(self.auth_namespace.as_deref()) {
            req = req.set("X-Vault-Namespace", ns);
        }
        Ok(req)
    }

    fn login_kubernetes(
        &self,
        mount: &str,
        role: &str,
        token_path: &Path,
        deadline: Deadline,
    ) -> Result<Zeroizing<String>> {
        let jwt = Zeroizing::new(std::fs::read_to_string(token_path).map_err(|e| {
            KmsError::Config(format!(
                "failed to read service account token {}: {e}",
                token_path.display()
            ))
        })?);
        let path = join_path(["auth", mount, "login"]);
        let resp: Value = self
            .request("POST", &path, None, deadline)?
            .send_json(json!({"role": role, "jwt": jwt.trim()}))
            .map_err(|e| KmsError::from(e).context("Vault kubernetes login"))?
            .into_json()?;
        resp.pointer("/auth/client_token")
            .and_then(Value::as_str)
            .map(|t| Zeroizing::new(t.to_owned()))
            .ok_or_else(|| KmsError::remote("Vault kubernetes login", None, "no client token in response"))
    }

    fn detect_kv_version(&self, deadline: Deadline) -> Result<KvVersion> {
        let path = format!("sys/internal/ui/mounts/{}", self.backend_path);
        let resp: Value = self
            .request("GET", &path, None, deadline)?
            .call()
            .map_err(|e| KmsError::from(e).context("Vault backend detection"))?
            .into_json()?;
        match resp.pointer("/data/options/version").and_then(Value::as_str) {
            Some("2") => Ok(KvVersion::V2),
            _ => Ok(KvVersion::V1),
        }
    }

    fn data_path(&self, key: &str) -> String {
        match self.kv_version {
            KvVersion::V1 => join_path([self.backend_path.as_str(), key]),
            KvVersion::V2 => join_path([self.backend_path.as_str(), "data", key]),
        }
    }

    /// Return the object stored at `key`.
    pub fn get_secret(&self, key: &str, ctx: &KeyContext, deadline: Deadline) -> Result<Value> {
        let resp: Value = self
            .request("GET", &self.data_path(key), ctx.namespace.as_deref(), deadline)?
            .call()
            .map_err(|e| KmsError::from(e).context(format!("get secret {key}")))?
            .into_json()?;
        let pointer = match self.kv_version {
            KvVersion::V1 => "/data",
            KvVersion::V2 => "/data/data",
        };
        resp.pointer(pointer)
            .cloned()
            .ok_or_else(|| KmsError::remote(format!("get secret {key}"), None, "no data in response"))
    }

    pub fn put_secret(&self, key: &str, data: Value, ctx: &KeyContext, deadline: Deadline) -> Result<()> {
        let body = match self.kv_version {
            KvVersion::V1 => data,
            KvVersion::V2 => json!({ "data": data }),
        };
        self.request("PUT", &self.data_path(key), ctx.namespace.as_deref(), deadline)?
            .send_json(body)
            .map_err(|e| KmsError::from(e).context(format!("put secret {key}")))?;
        Ok(())
    }

    pub fn delete_secret(&self, key: &str, ctx: &KeyContext, deadline: Deadline) -> Result<()> {
        let path = match self.kv_version {
            KvVersion::V2 if ctx.destroy => join_path([self.backend_path.as_str(), "metadata", key]),
            _ => self.data_path(key),
        };
        self.request("DELETE", &path, ctx.namespace.as_deref(), deadline)?
            .call()
            .map_err(|e| KmsError::from(e).context(format!("delete secret {key}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::fake_http::FakeHttp;

    fn settings(url: &str, backend: Option<&str>, backend_path: Option<&str>) -> VaultSettings {
        VaultSettings {
            address: url.to_owned(),
            backend: backend.map(str::to_owned),
            backend_path: backend_path.map(str::to_owned),
            ..VaultSettings::default()
        }
    }

    fn token() -> VaultAuth {
        VaultAuth::Token(Zeroizing::new("root-token".into()))
    }

    fn ctx(namespace: Option<&str>, destroy: bool) -> KeyContext {
        KeyContext {
            namespace: namespace.map(str::to_owned),
            destroy,
        }
    }

    #[test]
    fn join_path_normalises() {
        assert_eq!(join_path(["/secret/", "", "vol-1"]), "secret/vol-1");
        assert_eq!(join_path(["auth", "kubernetes", "login"]), "auth/kubernetes/login");
        assert_eq!(join_path(["a/b/", "/c"]), "a/b/c");
    }

    #[test]
    fn backend_names() {
        assert_eq!(KvVersion::from_backend("kv").unwrap(), KvVersion::V1);
        assert_eq!(KvVersion::from_backend("kv-v2").unwrap(), KvVersion::V2);
        assert!(KvVersion::from_backend("transit").unwrap_err().is_config_invalid());
    }

    #[test]
    fn connect_requires_address() {
        let err = VaultClient::connect(
            &VaultSettings::default(),
            &VaultAuth::Token(Zeroizing::new("t".into())),
            Deadline::none(),
        )
        .err()
        .unwrap();
        assert!(err.is_config_missing());
    }

    #[test]
    fn kv_v1_paths() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = FakeHttp::serve(vec![
            (204, String::new()),
            (200, r#"{"data":{"data":{"passphrase":"p4ss"}}}"#.to_owned()),
            (204, String::new()),
        ]);
        let client = VaultClient::connect(
            &settings(&server.url, Some("kv"), Some("/csi/")),
            &token(),
            Deadline::none(),
        )
        .unwrap();

        let data = json!({"data": {"passphrase": "p4ss"}});
        client.put_secret("vol-1", data.clone(), &ctx(Some("team"), false), Deadline::none()).unwrap();
        assert_eq!(client.get_secret("vol-1", &ctx(None, false), Deadline::none()).unwrap(), data);
        // no metadata in KV v1, destroy deletes the secret itself
        client.delete_secret("vol-1", &ctx(None, true), Deadline::none()).unwrap();

        let requests = server.finish();
        assert_eq!(requests.len(), 3);
        assert_eq!((requests[0].method.as_str(), requests[0].target.as_str()), ("PUT", "/v1/csi/vol-1"));
        assert_eq!(requests[0].json(), data);
        assert_eq!(requests[0].header("X-Vault-Token"), Some("root-token"));
        assert_eq!(requests[0].header("X-Vault-Namespace"), Some("team"));
        assert_eq!((requests[1].method.as_str(), requests[1].target.as_str()), ("GET", "/v1/csi/vol-1"));
        assert_eq!(requests[1].header("X-Vault-Namespace"), None);
        assert_eq!((requests[2].method.as_str(), requests[2].target.as_str()), ("DELETE", "/v1/csi/vol-1"));
    }

    #[test]
    fn kv_v2_detected_from_mount() {
        let server = FakeHttp::serve(vec![
            (200, r#"{"data":{"type":"kv","options":{"version":"2"},"path":"secret/"}}"#.to_owned()),
            (204, String::new()),
            (200, r#"{"data":{"data":{"passphrase":"p4ss"},"metadata":{"version":1}}}"#.to_owned()),
            (204, String::new()),
            (204, String::new()),
        ]);
        let client = VaultClient::connect(&settings(&server.url, None, None), &token(), Deadline::none()).unwrap();

        let data = json!({"passphrase": "p4ss"});
        client.put_secret("vol-1", data.clone(), &ctx(None, false), Deadline::none()).unwrap();
        assert_eq!(client.get_secret("vol-1", &ctx(None, false), Deadline::none()).unwrap(), data);
        client.delete_secret("vol-1", &ctx(None, false), Deadline::none()).unwrap();
        client.delete_secret("vol-1", &ctx(None, true), Deadline::none()).unwrap();

        let requests = server.finish();
        let calls: Vec<(&str, &str)> = requests
            .iter()
            .map(|r| (r.method.as_str(), r.target.as_str()))
            .collect();
        assert_eq!(
            calls,
            [
                ("GET", "/v1/sys/internal/ui/mounts/secret"),
                ("PUT", "/v1/secret/data/vol-1"),
                ("GET", "/v1/secret/data/vol-1"),
                ("DELETE", "/v1/secret/data/vol-1"),
                ("DELETE", "/v1/secret/metadata/vol-1"),
            ]
        );
        assert_eq!(requests[1].json(), json!({"data": {"passphrase": "p4ss"}}));
    }

    #[test]
    fn kubernetes_login() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token");
        std::fs::write(&token_path, "service-account-jwt\n").unwrap();

        let server = FakeHttp::serve(vec![
            (200, r#"{"auth":{"client_token":"s.vault-token","lease_duration":3600}}"#.to_owned()),
            (200, r#"{"data":{"passphrase":"p4ss"}}"#.to_owned()),
        ]);
        let auth = VaultAuth::Kubernetes {
            mount: "bobs-cluster".into(),
            role: "csi".into(),
            token_path,
        };
        let mut vault = settings(&server.url, Some("kv"), None);
        vault.auth_namespace = Some("sso".into());
        let client = VaultClient::connect(&vault, &auth, Deadline::none()).unwrap();
        client.get_secret("vol-1", &ctx(Some("team"), false), Deadline::none()).unwrap();

        let requests = server.finish();
        assert_eq!(requests[0].target, "/v1/auth/bobs-cluster/login");
        assert_eq!(requests[0].json(), json!({"role": "csi", "jwt": "service-account-jwt"}));
        assert_eq!(requests[0].header("X-Vault-Namespace"), Some("sso"));
        assert_eq!(requests[0].header("X-Vault-Token"), None);
        assert_eq!(requests[1].header("X-Vault-Token"), Some("s.vault-token"));
        assert_eq!(requests[1].header("X-Vault-Namespace"), Some("team"));
    }

    #[test]
    fn error_status_is_reported() {
        let server = FakeHttp::serve(vec![(403, r#"{"errors":["permission denied"]}"#.to_owned())]);
        let client = VaultClient::connect(&settings(&server.url, Some("kv"), None), &token(), Deadline::none()).unwrap();
        let err = client.get_secret("vol-1", &ctx(None, false), Deadline::none()).unwrap_err();
        match err {
            KmsError::Remote { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("403"));
                assert!(message.contains("permission denied"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        server.finish();
    }
}
