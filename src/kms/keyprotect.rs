//! `ibmkeyprotect`: DEKs wrapped with a customer root key in IBM Key
//! Protect. The volume ID is bound to the wrapped DEK as additional
//! authenticated data.
//!
//! ```json
//! {
//!     "ibmkeyprotect-test": {
//!         "encryptionKMSType": "ibmkeyprotect",
//!         "IBM_KP_SECRET_NAME": "ceph-csi-kp-credentials",
//!         "IBM_KP_SERVICE_INSTANCE_ID": "7abef064-01dd-4237-9ea5-8b3890970be3",
//!         "IBM_KP_REGION": "us-east-2"
//!     }
//! }
//! ```

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    config::{optional_string, set_config_string},
    error::{KmsError, Result},
    kms::{Deadline, DekStoreType, EncryptionKms, ProviderInitArgs, read_settings_secret},
};

pub const KMS_TYPE_KEY_PROTECT: &str = "ibmkeyprotect";

const DEFAULT_SECRET_NAME: &str = "ceph-csi-kp-credentials";
const SECRET_NAME_KEY: &str = "IBM_KP_SECRET_NAME";
const REGION_KEY: &str = "IBM_KP_REGION";
const SERVICE_INSTANCE_ID_KEY: &str = "IBM_KP_SERVICE_INSTANCE_ID";
const BASE_URL_KEY: &str = "IBM_KP_BASE_URL";
const TOKEN_URL_KEY: &str = "IBM_KP_TOKEN_URL";

const API_KEY: &str = "IBM_KP_SERVICE_API_KEY";
const CUSTOMER_ROOT_KEY: &str = "IBM_KP_CUSTOMER_ROOT_KEY";
const SESSION_TOKEN: &str = "IBM_KP_SESSION_TOKEN";
const CRK_ARN: &str = "IBM_KP_CRK_ARN";

pub const DEFAULT_BASE_URL: &str = "https://us-south.kms.cloud.ibm.com";
pub const DEFAULT_TOKEN_URL: &str = "https://iam.cloud.ibm.com/oidc/token";

const KEY_ACTION_CONTENT_TYPE: &str = "application/vnd.ibm.kms.key_action+json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct KeyProtectKms {
    service_instance_id: String,
    base_url: String,
    token_url: String,
    api_key: Zeroizing<String>,
    customer_root_key: String,
    deadline: Deadline,
}

#[derive(Serialize)]
struct WrapRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    plaintext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ciphertext: Option<&'a str>,
    aad: [&'a str; 1],
}

#[derive(Deserialize)]
struct WrapResponse {
    ciphertext: String,
}

#[derive(Deserialize)]
struct UnwrapResponse {
    plaintext: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorCollection {
    resources: Vec<ErrorResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResource {
    error_msg: Option<String>,
    reasons: Option<Vec<ErrorReason>>,
}

#[derive(Deserialize)]
struct ErrorReason {
    code: Option<String>,
    message: Option<String>,
}

fn key_protect_error(operation: &str, e: ureq::Error) -> KmsError {
    match e {
        ureq::Error::Status(status, resp) => {
            let body = resp.into_string().unwrap_or_default();
            let Ok(errors) = serde_json::from_str::<ErrorCollection>(&body) else {
                return KmsError::remote(operation, Some(status.to_string()), body);
            };
            let first = errors.resources.into_iter().next();
            let reason = first
                .as_ref()
                .and_then(|r| r.reasons.as_ref())
                .and_then(|r| r.first());
            let code = reason
                .and_then(|r| r.code.clone())
                .unwrap_or_else(|| status.to_string());
            let message = reason
                .and_then(|r| r.message.clone())
                .or_else(|| first.as_ref().and_then(|r| r.error_msg.clone()))
                .unwrap_or(body);
            KmsError::remote(operation, Some(code), message)
        }
        other => KmsError::from(other).context(operation),
    }
}

pub fn init_key_protect_kms(args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    let config = &args.config;
    let secret_name =
        optional_string(config, SECRET_NAME_KEY)?.unwrap_or_else(|| DEFAULT_SECRET_NAME.to_owned());

    let mut service_instance_id = String::new();
    set_config_string(&mut service_instance_id, config, SERVICE_INSTANCE_ID_KEY)?;

    // a region selects the regional endpoint unless the URL is explicit
    let region = optional_string(config, REGION_KEY)?;
    let base_url = match (optional_string(config, BASE_URL_KEY)?, &region) {
        (Some(url), _) => url,
        (None, Some(region)) if !region.is_empty() => format!("https://{region}.kms.cloud.ibm.com"),
        (None, _) => DEFAULT_BASE_URL.to_owned(),
    };
    let token_url = optional_string(config, TOKEN_URL_KEY)?.unwrap_or_else(|| DEFAULT_TOKEN_URL.to_owned());

    let secret = read_settings_secret(
        args.cluster,
        &args.namespace,
        &secret_name,
        KMS_TYPE_KEY_PROTECT,
        &[API_KEY, CUSTOMER_ROOT_KEY, SESSION_TOKEN, CRK_ARN],
    )
    .map_err(|e| e.context("failed to get secrets for ibmkeyprotect"))?;
    let mut api_key = Zeroizing::new(String::new());
    set_config_string(&mut api_key, &secret, API_KEY)?;
    let mut customer_root_key = String::new();
    set_config_string(&mut customer_root_key, &secret, CUSTOMER_ROOT_KEY)?;
    // validated only, the IAM exchange does not use them
    optional_string(&secret, SESSION_TOKEN)?;
    optional_string(&secret, CRK_ARN)?;

    Ok(Box::new(KeyProtectKms {
        service_instance_id,
        base_url: base_url.trim_end_matches('/').to_owned(),
        token_url,
        api_key,
        customer_root_key,
        deadline: args.deadline,
    }))
}

impl KeyProtectKms {
    fn access_token(&self) -> Result<Zeroizing<String>> {
        let resp: TokenResponse = ureq::post(&self.token_url)
            .timeout(self.deadline.timeout(REQUEST_TIMEOUT)?)
            .set("Accept", "application/json")
            .send_form(&[
                ("grant_type", "urn:ibm:params:oauth:grant-type:apikey"),
                ("apikey", self.api_key.as_str()),
            ])
            .map_err(|e| key_protect_error("failed to create keyprotect client", e))?
            .into_json()?;
        Ok(Zeroizing::new(resp.access_token))
    }

    fn key_action<T: for<'de> Deserialize<'de>>(&self, action: &str, body: &WrapRequest<'_>) -> Result<T> {
        let token = self
            .access_token()
            .map_err(|e| e.context("could not get KMS service"))?;
        let url = format!("{}/api/v2/keys/{}", self.base_url, self.customer_root_key);
        let resp = ureq::post(&url)
            .timeout(self.deadline.timeout(REQUEST_TIMEOUT)?)
            .query("action", action)
            .set("Authorization", &format!("Bearer {}", token.as_str()))
            .set("bluemix-instance", &self.service_instance_id)
            .set("Content-Type", KEY_ACTION_CONTENT_TYPE)
            .send_string(&serde_json::to_string(body)?)
            .map_err(|e| key_protect_error(&format!("failed to {action} the DEK"), e))?;
        Ok(resp.into_json()?)
    }
}

impl EncryptionKms for KeyProtectKms {
    fn destroy(&mut self) {}

    fn requires_dek_store(&self) -> DekStoreType {
        DekStoreType::Metadata
    }

    /// The service answers with a base64 ciphertext, which is encoded once
    /// more for storage.
    fn encrypt_dek(&self, volume_id: &str, plain_dek: &str) -> Result<String> {
        let resp: WrapResponse = self.key_action(
            "wrap",
            &WrapRequest {
                plaintext: Some(STANDARD.encode(plain_dek)),
                ciphertext: None,
                aad: [volume_id],
            },
        )?;
        Ok(STANDARD.encode(resp.ciphertext))
    }

    fn decrypt_dek(&self, volume_id: &str, encrypted_dek: &str) -> Result<String> {
        let ciphertext = STANDARD
            .decode(encrypted_dek)
            .map_err(|e| KmsError::Config(format!("failed to decode base64 cipher: {e}")))?;
        let ciphertext = String::from_utf8(ciphertext).map_err(|_| KmsError::CannotProcessDek)?;

        let resp: UnwrapResponse = self.key_action(
            "unwrap",
            &WrapRequest {
                plaintext: None,
                ciphertext: Some(&ciphertext),
                aad: [volume_id],
            },
        )?;
        let plain = STANDARD
            .decode(resp.plaintext)
            .map_err(|e| KmsError::remote("failed to unwrap the DEK", None, format!("invalid plaintext: {e}")))?;
        String::from_utf8(plain).map_err(|_| KmsError::CannotProcessDek)
    }
}
