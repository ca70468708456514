pub mod aws;
pub mod azure;
#[cfg(test)]
pub(crate) mod fake_http;
pub mod keyprotect;
pub mod secrets;
pub mod vault;

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use tempfile::{NamedTempFile, TempDir};

use crate::{
    cluster::{ClusterApi, secret_string},
    config::ConfigMap,
    error::{KmsError, Result},
};

/// Where the DEK of a volume lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DekStoreType {
    /// The KMS keeps the DEK; the driver goes through [`DekStore`].
    Integrated,
    /// The driver stores the value returned by `encrypt_dek` with the volume.
    Metadata,
}

/// Capabilities every provider instance exposes.
///
/// An instance serves a single RPC for a single tenant. After `destroy` no
/// other method may be called.
pub trait EncryptionKms: Send {
    /// Release temporary files and connections. Safe to call more than once.
    fn destroy(&mut self);

    fn requires_dek_store(&self) -> DekStoreType;

    fn encrypt_dek(&self, volume_id: &str, plain_dek: &str) -> Result<String>;

    fn decrypt_dek(&self, volume_id: &str, encrypted_dek: &str) -> Result<String>;

    /// Raw passphrase for the volume, where the provider can expose one.
    fn get_secret(&self, _volume_id: &str) -> Result<String> {
        Err(KmsError::GetSecretUnsupported)
    }

    /// Providers that keep the DEK themselves return their store here.
    fn dek_store(&self) -> Option<&dyn DekStore> {
        None
    }
}

/// Per-volume DEK persistence for integrated providers.
pub trait DekStore {
    fn fetch_dek(&self, deadline: Deadline, key: &str) -> Result<String>;

    fn store_dek(&self, deadline: Deadline, key: &str, value: &str) -> Result<()>;

    fn remove_dek(&self, deadline: Deadline, key: &str) -> Result<()>;
}

/// Behaviour shared by providers whose remote side stores the DEK under a
/// name: the DEK is passed through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntegratedDek;

impl IntegratedDek {
    pub fn requires_dek_store(&self) -> DekStoreType {
        DekStoreType::Integrated
    }

    pub fn encrypt_dek(&self, _volume_id: &str, plain_dek: &str) -> Result<String> {
        Ok(plain_dek.to_owned())
    }

    pub fn decrypt_dek(&self, _volume_id: &str, encrypted_dek: &str) -> Result<String> {
        Ok(encrypted_dek.to_owned())
    }

    pub fn get_secret(&self, _volume_id: &str) -> Result<String> {
        Err(KmsError::GetSecretIntegrated)
    }
}

/// Point in time by which a call must complete. The default never expires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Result<Option<Duration>> {
        match self.0 {
            None => Ok(None),
            Some(at) => match at.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => Ok(Some(left)),
                _ => Err(KmsError::DeadlineExceeded),
            },
        }
    }

    /// `default`, shortened to the time left.
    pub fn timeout(&self, default: Duration) -> Result<Duration> {
        Ok(self.remaining()?.map_or(default, |left| left.min(default)))
    }

    /// The earlier of the two.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (a, b) => Deadline(a.or(b)),
        }
    }
}

/// Everything an initializer gets to build an instance.
pub struct ProviderInitArgs<'a> {
    /// Namespace owning the volume.
    pub tenant: String,
    /// The kmsID section of the configuration.
    pub config: ConfigMap,
    /// StorageClass secrets of the call.
    pub secrets: ConfigMap,
    /// Namespace of the driver pod, used as fallback for lookups.
    pub namespace: String,
    pub cluster: &'a dyn ClusterApi,
    pub deadline: Deadline,
}

impl ProviderInitArgs<'_> {
    /// A StorageClass secret as string.
    pub(crate) fn secret(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).and_then(|v| v.as_str())
    }
}

/// Read a credentials secret, accepting only the `allowed` fields.
pub(crate) fn read_settings_secret(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    kms_type: &str,
    allowed: &[&str],
) -> Result<ConfigMap> {
    let secret = cluster
        .get_secret(namespace, name)
        .map_err(|e| e.context(format!("failed to get Secret {namespace}/{name}")))?;

    let mut settings = ConfigMap::new();
    for key in secret.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(KmsError::Config(format!(
                "unsupported option for KMS provider {kms_type:?}: {key}"
            )));
        }
        if let Some(value) = secret_string(&secret, key) {
            settings.insert(key.clone(), value.into());
        }
    }
    Ok(settings)
}

/// Temporary files and directories owned by one instance, removed on
/// `destroy` (or drop, whichever comes first).
#[derive(Default)]
pub struct ScratchFiles {
    entries: Vec<Scratch>,
}

enum Scratch {
    File(NamedTempFile),
    Dir(TempDir),
}

impl ScratchFiles {
    /// Write `content` to a new private temporary file and return its path.
    pub fn file(&mut self, prefix: &str, content: &[u8]) -> Result<PathBuf> {
        use std::io::Write;

        let mut file = tempfile::Builder::new().prefix(prefix).tempfile()?;
        file.write_all(content)?;
        file.flush()?;
        let path = file.path().to_path_buf();
        self.entries.push(Scratch::File(file));
        Ok(path)
    }

    /// Create a private temporary directory.
    pub fn dir(&mut self, prefix: &str) -> Result<PathBuf> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        let path = dir.path().to_path_buf();
        self.entries.push(Scratch::Dir(dir));
        Ok(path)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove_all(&mut self) {
        for entry in self.entries.drain(..) {
            let (path, result) = match entry {
                Scratch::File(f) => (f.path().to_path_buf(), f.close()),
                Scratch::Dir(d) => (d.path().to_path_buf(), d.close()),
            };
            if let Err(e) = result {
                log::warn!("failed to remove {}: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;

    #[test]
    fn integrated_passthrough() {
        let dek = IntegratedDek;
        assert_eq!(dek.requires_dek_store(), DekStoreType::Integrated);
        assert_eq!(dek.encrypt_dek("vol", "secret").unwrap(), "secret");
        assert_eq!(dek.decrypt_dek("vol", "secret").unwrap(), "secret");
        assert!(matches!(
            dek.get_secret("vol"),
            Err(KmsError::GetSecretIntegrated)
        ));
    }

    #[test]
    fn deadline_expiry() {
        assert_eq!(Deadline::none().remaining().unwrap(), None);
        assert_eq!(
            Deadline::none().timeout(Duration::from_secs(10)).unwrap(),
            Duration::from_secs(10)
        );

        let soon = Deadline::after(Duration::from_secs(60));
        assert!(soon.timeout(Duration::from_secs(10)).unwrap() <= Duration::from_secs(10));
        assert!(soon.timeout(Duration::from_secs(600)).unwrap() <= Duration::from_secs(60));

        let past = Deadline::at(Instant::now() - Duration::from_secs(1));
        assert!(matches!(past.remaining(), Err(KmsError::DeadlineExceeded)));
        assert_eq!(past.min(Deadline::none()), past);
        assert_eq!(Deadline::none().min(soon), soon);
    }

    #[test]
    fn scratch_files_are_removed() {
        let mut scratch = ScratchFiles::default();
        let file = scratch.file("ca-", b"pem").unwrap();
        let dir = scratch.dir("sa-").unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"pem");
        assert!(dir.is_dir());

        scratch.remove_all();
        assert!(scratch.is_empty());
        assert!(!file.exists());
        assert!(!dir.exists());
        scratch.remove_all();
    }

    #[test]
    fn settings_secret_rejects_unknown_fields() {
        let cluster = MemoryCluster::new()
            .with_secret("ns", "good", [("a", "1"), ("b", "2")])
            .with_secret("ns", "bad", [("a", "1"), ("c", "3")]);

        let settings = read_settings_secret(&cluster, "ns", "good", "test", &["a", "b"]).unwrap();
        assert_eq!(settings["b"], "2");

        let err = read_settings_secret(&cluster, "ns", "bad", "test", &["a", "b"]).unwrap_err();
        assert!(err.to_string().contains("unsupported option"));

        let err = read_settings_secret(&cluster, "ns", "missing", "test", &["a"]).unwrap_err();
        assert!(err.is_not_found());
    }
}
