//! Providers storing DEKs in the KV engine of a HashiCorp Vault.

pub mod client;
pub mod connection;
pub mod kubernetes;
pub mod legacy;
pub mod tenant;
pub mod tenant_sa;
pub mod tokens;

use crate::error::{KmsError, Result};

pub const DEFAULT_AUTH_PATH: &str = "/v1/auth/kubernetes/login";
pub const DEFAULT_AUTH_MOUNT_PATH: &str = "kubernetes";
pub const DEFAULT_ROLE: &str = "csi-kubernetes";

/// Reduce an auth path like `/v1/auth/<mount>/login` to its mount. Other
/// values are taken to be the mount already.
pub fn detect_auth_mount_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(KmsError::invalid("vaultAuthPath", "path is empty"));
    }

    let mut mount: Vec<&str> = Vec::new();
    let mut in_mount = false;
    for part in path.split('/') {
        if part == "auth" {
            in_mount = true;
            continue;
        }
        if part == "login" {
            break;
        }
        if in_mount {
            mount.push(part);
        }
    }

    if mount.is_empty() {
        Ok(path.to_owned())
    } else {
        Ok(mount.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_mount_path() {
        assert_eq!(detect_auth_mount_path(DEFAULT_AUTH_PATH).unwrap(), "kubernetes");
        assert_eq!(detect_auth_mount_path("kubernetes").unwrap(), "kubernetes");
        assert_eq!(
            detect_auth_mount_path("/v1/auth/cluster/east/login").unwrap(),
            "cluster/east"
        );
        assert!(detect_auth_mount_path("").is_err());
    }
}
