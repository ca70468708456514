//! `aws-sts-metadata`: like `aws-metadata`, but credentials are obtained for
//! every operation by assuming a role with the projected OIDC token of the
//! driver. Role, CMK and region come from a secret in the tenant namespace.
//!
//! ```json
//! {
//!     "aws-sts-metadata-test": {
//!         "encryptionKMSType": "aws-sts-metadata",
//!         "secretName": "ceph-csi-aws-credentials"
//!     }
//! }
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use zeroize::Zeroizing;

use super::{Credentials, DEFAULT_SECRET_NAME, KmsClient, aws_error};
use crate::{
    config::{ConfigMap, optional_string, set_config_string},
    error::{KmsError, Result},
    kms::{Deadline, DekStoreType, EncryptionKms, ProviderInitArgs, read_settings_secret},
};

pub const KMS_TYPE_AWS_STS_METADATA: &str = "aws-sts-metadata";

const SECRET_NAME_KEY: &str = "secretName";
const ROLE_ARN_KEY: &str = "awsRoleARN";
const CMK_ARN_KEY: &str = "awsCMKARN";
const REGION_KEY: &str = "awsRegion";

const ROLE_SESSION_NAME: &str = "ceph-csi-aws-sts-metadata";
pub const TOKEN_FILE_PATH: &str = "/run/secrets/tokens/oidc-token";

const STS_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AwsStsMetadataKms {
    role: String,
    cmk: String,
    region: String,
    sts_endpoint: String,
    token_path: PathBuf,
    deadline: Deadline,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    assume_role_with_web_identity_response: AssumeRoleEnvelope,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleEnvelope {
    assume_role_with_web_identity_result: AssumeRoleResult,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResult {
    credentials: StsCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
}

fn required(settings: &ConfigMap, key: &str) -> Result<String> {
    let mut value = String::new();
    set_config_string(&mut value, settings, key)?;
    Ok(value)
}

pub fn init_aws_sts_metadata_kms(args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    let secret_name = optional_string(&args.config, SECRET_NAME_KEY)?
        .unwrap_or_else(|| DEFAULT_SECRET_NAME.to_owned());

    let settings = read_settings_secret(
        args.cluster,
        &args.tenant,
        &secret_name,
        KMS_TYPE_AWS_STS_METADATA,
        &[ROLE_ARN_KEY, REGION_KEY, CMK_ARN_KEY],
    )
    .map_err(|e| e.context("failed to get secrets"))?;

    let region = required(&settings, REGION_KEY)?;
    Ok(Box::new(AwsStsMetadataKms {
        role: required(&settings, ROLE_ARN_KEY)?,
        cmk: required(&settings, CMK_ARN_KEY)?,
        sts_endpoint: format!("https://sts.{region}.amazonaws.com/"),
        region,
        token_path: PathBuf::from(TOKEN_FILE_PATH),
        deadline: args.deadline,
    }))
}

fn read_web_identity_token(path: &Path) -> Result<Zeroizing<String>> {
    let token = std::fs::read_to_string(path).map_err(|e| {
        KmsError::Config(format!(
            "failed to read oidc token file {:?}: {e}",
            path.display()
        ))
    })?;
    Ok(Zeroizing::new(token.trim().to_owned()))
}

impl AwsStsMetadataKms {
    /// Exchange the OIDC token for temporary credentials. The call itself
    /// is not signed.
    fn assume_role(&self) -> Result<Credentials> {
        let timeout = self.deadline.timeout(STS_TIMEOUT)?;
        let token = read_web_identity_token(&self.token_path)
            .map_err(|e| e.context("failed to get web identity token"))?;

        let resp: AssumeRoleResponse = ureq::post(&self.sts_endpoint)
            .timeout(timeout)
            .set("Accept", "application/json")
            .send_form(&[
                ("Action", "AssumeRoleWithWebIdentity"),
                ("Version", "2011-06-15"),
                ("RoleArn", self.role.as_str()),
                ("RoleSessionName", ROLE_SESSION_NAME),
                ("WebIdentityToken", token.as_str()),
            ])
            .map_err(|e| aws_error("failed to assume role with web identity token", e))?
            .into_json()?;

        let creds = resp
            .assume_role_with_web_identity_response
            .assume_role_with_web_identity_result
            .credentials;
        let secret_access_key = Zeroizing::new(creds.secret_access_key);
        Ok(Credentials::new(
            creds.access_key_id,
            secret_access_key.as_str(),
            Some(creds.session_token),
            None,
            KMS_TYPE_AWS_STS_METADATA,
        ))
    }

    fn client(&self) -> Result<KmsClient> {
        let creds = self
            .assume_role()
            .map_err(|e| e.context("could not get KMS service"))?;
        Ok(KmsClient::new(&self.region, creds))
    }
}

impl EncryptionKms for AwsStsMetadataKms {
    fn destroy(&mut self) {}

    fn requires_dek_store(&self) -> DekStoreType {
        DekStoreType::Metadata
    }

    fn encrypt_dek(&self, _volume_id: &str, plain_dek: &str) -> Result<String> {
        super::encrypt_dek(&self.client()?, &self.cmk, plain_dek, self.deadline)
    }

    fn decrypt_dek(&self, _volume_id: &str, encrypted_dek: &str) -> Result<String> {
        super::decrypt_dek(&self.client()?, encrypted_dek, self.deadline)
    }
}
