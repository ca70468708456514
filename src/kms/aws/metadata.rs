//! `aws-metadata`: static AWS credentials from a secret in the driver
//! namespace. The wrapped DEK is stored with the volume.
//!
//! ```json
//! {
//!     "aws-metadata-test": {
//!         "encryptionKMSType": "aws-metadata",
//!         "AWS_REGION": "us-west-2",
//!         "KMS_SECRET_NAME": "ceph-csi-aws-credentials"
//!     }
//! }
//! ```

use zeroize::Zeroizing;

use super::{Credentials, DEFAULT_SECRET_NAME, KmsClient};
use crate::{
    config::{ConfigMap, optional_string, set_config_string},
    error::Result,
    kms::{Deadline, DekStoreType, EncryptionKms, ProviderInitArgs, read_settings_secret},
};

pub const KMS_TYPE_AWS_METADATA: &str = "aws-metadata";

const SECRET_NAME_KEY: &str = "KMS_SECRET_NAME";
const REGION_KEY: &str = "AWS_REGION";

const ACCESS_KEY: &str = "AWS_ACCESS_KEY_ID";
const SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
const CMK: &str = "AWS_CMK_ARN";

pub struct AwsMetadataKms {
    client: KmsClient,
    cmk: String,
    deadline: Deadline,
}

/// Credentials and CMK from the secret. The session token is optional.
fn parse_secret(secret: &ConfigMap) -> Result<(Credentials, String)> {
    let mut access_key = String::new();
    set_config_string(&mut access_key, secret, ACCESS_KEY)?;
    let mut secret_key = Zeroizing::new(String::new());
    set_config_string(&mut secret_key, secret, SECRET_ACCESS_KEY)?;
    let session_token = optional_string(secret, SESSION_TOKEN)?.map(Zeroizing::new);
    let mut cmk = String::new();
    set_config_string(&mut cmk, secret, CMK)?;

    Ok((
        Credentials::new(
            access_key,
            secret_key.as_str(),
            session_token.map(|t| t.to_string()),
            None,
            KMS_TYPE_AWS_METADATA,
        ),
        cmk,
    ))
}

pub fn init_aws_metadata_kms(args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    let secret_name = optional_string(&args.config, SECRET_NAME_KEY)?
        .unwrap_or_else(|| DEFAULT_SECRET_NAME.to_owned());
    let mut region = String::new();
    set_config_string(&mut region, &args.config, REGION_KEY)?;

    let secret = read_settings_secret(
        args.cluster,
        &args.namespace,
        &secret_name,
        KMS_TYPE_AWS_METADATA,
        &[SECRET_ACCESS_KEY, ACCESS_KEY, SESSION_TOKEN, CMK],
    )
    .map_err(|e| e.context("failed to get secrets for aws-metadata"))?;
    let (credentials, cmk) = parse_secret(&secret)?;

    log::debug!("using AWS KMS in {region} with CMK {cmk}");
    Ok(Box::new(AwsMetadataKms {
        client: KmsClient::new(&region, credentials),
        cmk,
        deadline: args.deadline,
    }))
}

impl EncryptionKms for AwsMetadataKms {
    fn destroy(&mut self) {}

    /// Storing DEKs in AWS adds cost, so they go with the volume.
    fn requires_dek_store(&self) -> DekStoreType {
        DekStoreType::Metadata
    }

    fn encrypt_dek(&self, _volume_id: &str, plain_dek: &str) -> Result<String> {
        super::encrypt_dek(&self.client, &self.cmk, plain_dek, self.deadline)
    }

    fn decrypt_dek(&self, _volume_id: &str, encrypted_dek: &str) -> Result<String> {
        super::decrypt_dek(&self.client, encrypted_dek, self.deadline)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::{Value, json};

    use super::*;
    use crate::{cluster::MemoryCluster, error::KmsError, kms::Deadline};

    fn args<'a>(cluster: &'a MemoryCluster, config: Value) -> ProviderInitArgs<'a> {
        ProviderInitArgs {
            tenant: "tenant".into(),
            config: config.as_object().cloned().unwrap(),
            secrets: ConfigMap::new(),
            namespace: "ceph-csi".into(),
            cluster,
            deadline: Deadline::none(),
        }
    }

    #[test]
    fn region_is_required() {
        let cluster = MemoryCluster::new();
        let err = init_aws_metadata_kms(args(&cluster, json!({}))).err().unwrap();
        assert!(err.is_config_missing());
    }

    #[test]
    fn secret_read_from_driver_namespace() {
        let cluster = MemoryCluster::new().with_secret(
            "ceph-csi",
            DEFAULT_SECRET_NAME,
            [
                (ACCESS_KEY, "AKID"),
                (SECRET_ACCESS_KEY, "secret"),
                (CMK, "arn:aws:kms:us-west-2:123:key/abc"),
            ],
        );
        let kms = init_aws_metadata_kms(args(&cluster, json!({"AWS_REGION": "us-west-2"}))).unwrap();
        assert_eq!(kms.requires_dek_store(), DekStoreType::Metadata);
        assert!(matches!(kms.get_secret("vol"), Err(KmsError::GetSecretUnsupported)));
    }

    #[test]
    fn expired_deadline_fails_before_io() {
        let cluster = MemoryCluster::new().with_secret(
            "ceph-csi",
            DEFAULT_SECRET_NAME,
            [(ACCESS_KEY, "AKID"), (SECRET_ACCESS_KEY, "secret"), (CMK, "cmk")],
        );
        let mut init = args(&cluster, json!({"AWS_REGION": "us-west-2"}));
        init.deadline = Deadline::at(Instant::now() - Duration::from_secs(5));
        let kms = init_aws_metadata_kms(init).unwrap();

        assert!(matches!(kms.encrypt_dek("vol", "dek"), Err(KmsError::DeadlineExceeded)));
        assert!(matches!(
            kms.decrypt_dek("vol", "d3JhcHBlZA=="),
            Err(KmsError::DeadlineExceeded)
        ));
    }

    #[test]
    fn secret_name_is_configurable() {
        let cluster = MemoryCluster::new().with_secret(
            "ceph-csi",
            "my-aws",
            [(ACCESS_KEY, "AKID"), (SECRET_ACCESS_KEY, "secret")],
        );
        let err = init_aws_metadata_kms(args(
            &cluster,
            json!({"AWS_REGION": "us-west-2", "KMS_SECRET_NAME": "my-aws"}),
        ))
        .err()
        .unwrap();
        // found the secret, the CMK is what is missing
        assert!(err.is_config_missing());
        assert!(err.to_string().contains(CMK));
    }

    #[test]
    fn unknown_secret_field() {
        let cluster = MemoryCluster::new().with_secret(
            "ceph-csi",
            DEFAULT_SECRET_NAME,
            [(ACCESS_KEY, "AKID"), ("AWS_PROFILE", "default")],
        );
        let err = init_aws_metadata_kms(args(&cluster, json!({"AWS_REGION": "us-west-2"})))
            .err()
            .unwrap();
        assert!(err.to_string().contains("unsupported option"));
    }

    #[test]
    fn session_token_is_optional() {
        let secret = json!({
            "AWS_ACCESS_KEY_ID": "AKID",
            "AWS_SECRET_ACCESS_KEY": "secret",
            "AWS_CMK_ARN": "cmk",
        });
        let (creds, cmk) = parse_secret(secret.as_object().unwrap()).unwrap();
        assert!(creds.session_token().is_none());
        assert_eq!(creds.access_key_id(), "AKID");
        assert_eq!(cmk, "cmk");
    }
}
