//! `azure-kv`: DEKs stored as secrets in an Azure Key Vault. The driver
//! authenticates as an Entra ID application with a client certificate.
//!
//! ```json
//! {
//!     "azure-test": {
//!         "encryptionKMSType": "azure-kv",
//!         "AZURE_CERT_SECRET_NAME": "ceph-csi-azure-credentials",
//!         "AZURE_VAULT_URL": "https://vault-name.vault.azure.net/",
//!         "AZURE_CLIENT_ID": "1234-abcd",
//!         "AZURE_TENANT_ID": "5678-efgh"
//!     }
//! }
//! ```

use std::time::Duration;

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15::SigningKey,
    pkcs8::DecodePrivateKey,
    signature::{SignatureEncoding, Signer},
};
use rustls::pki_types::PrivateKeyDer;
use serde::Deserialize;
use serde_json::json;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{
    config::{optional_string, set_config_string},
    crypto::tls::{parse_certificates, parse_private_key},
    error::{KmsError, Result},
    kms::{
        Deadline, DekStore, DekStoreType, EncryptionKms, IntegratedDek, ProviderInitArgs,
        read_settings_secret,
    },
};

pub const KMS_TYPE_AZURE: &str = "azure-kv";

const DEFAULT_SECRET_NAME: &str = "ceph-csi-azure-credentials";
const SECRET_NAME_KEY: &str = "AZURE_CERT_SECRET_NAME";
const VAULT_URL_KEY: &str = "AZURE_VAULT_URL";
const CLIENT_ID_KEY: &str = "AZURE_CLIENT_ID";
const TENANT_ID_KEY: &str = "AZURE_TENANT_ID";
const CLIENT_CERT_KEY: &str = "CLIENT_CERT";

const AUTHORITY: &str = "https://login.microsoftonline.com";
const VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const API_VERSION: &str = "7.4";
const ASSERTION_LIFETIME: i64 = 600;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AzureKms {
    integrated: IntegratedDek,
    vault_url: String,
    client_id: String,
    tenant_id: String,
    /// PEM with the certificate followed by its private key.
    client_certificate: Zeroizing<Vec<u8>>,
    authority: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

fn azure_error(operation: &str, e: ureq::Error) -> KmsError {
    match e {
        ureq::Error::Status(status, resp) => {
            let body = resp.into_string().unwrap_or_default();
            match serde_json::from_str::<ErrorBody>(&body) {
                Ok(ErrorBody { error }) => KmsError::remote(
                    operation,
                    Some(error.code.unwrap_or_else(|| status.to_string())),
                    error.message.unwrap_or(body),
                ),
                Err(_) => KmsError::remote(operation, Some(status.to_string()), body),
            }
        }
        other => KmsError::from(other).context(operation),
    }
}

pub fn init_azure_kms(args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    let config = &args.config;
    let secret_name =
        optional_string(config, SECRET_NAME_KEY)?.unwrap_or_else(|| DEFAULT_SECRET_NAME.to_owned());

    let mut vault_url = String::new();
    set_config_string(&mut vault_url, config, VAULT_URL_KEY)?;
    let mut client_id = String::new();
    set_config_string(&mut client_id, config, CLIENT_ID_KEY)?;
    let mut tenant_id = String::new();
    set_config_string(&mut tenant_id, config, TENANT_ID_KEY)?;

    let secret = read_settings_secret(
        args.cluster,
        &args.namespace,
        &secret_name,
        KMS_TYPE_AZURE,
        &[CLIENT_CERT_KEY],
    )
    .map_err(|e| e.context("failed to get secrets for azure-kv"))?;
    let mut encoded = String::new();
    set_config_string(&mut encoded, &secret, CLIENT_CERT_KEY)?;
    let client_certificate = STANDARD
        .decode(encoded.trim())
        .map_err(|e| KmsError::Config(format!("failed to decode client certificate: {e}")))?;

    Ok(Box::new(AzureKms {
        integrated: IntegratedDek,
        vault_url: vault_url.trim_end_matches('/').to_owned(),
        client_id,
        tenant_id,
        client_certificate: Zeroizing::new(client_certificate),
        authority: AUTHORITY.to_owned(),
    }))
}

fn rsa_key(key: &PrivateKeyDer<'_>) -> Result<RsaPrivateKey> {
    let parsed = match key {
        PrivateKeyDer::Pkcs8(der) => RsaPrivateKey::from_pkcs8_der(der.secret_pkcs8_der()).map_err(|e| e.to_string()),
        PrivateKeyDer::Pkcs1(der) => RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der()).map_err(|e| e.to_string()),
        _ => Err("only RSA keys are supported".to_owned()),
    };
    parsed.map_err(|e| KmsError::Config(format!("failed to parse Azure client certificate: {e}")))
}

impl AzureKms {
    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }

    /// RS256 client assertion identifying the certificate by its SHA-1
    /// thumbprint.
    fn client_assertion(&self, now: i64) -> Result<String> {
        let certs = parse_certificates(&self.client_certificate)
            .map_err(|e| e.context("failed to parse Azure client certificate"))?;
        let cert = certs
            .first()
            .ok_or_else(|| KmsError::Config("no certificate in Azure client certificate".into()))?;
        let key = rsa_key(&parse_private_key(&self.client_certificate)?)?;

        let mut jti = [0u8; 16];
        getrandom::getrandom(&mut jti).map_err(|e| KmsError::Config(format!("random source: {e}")))?;

        let header = json!({
            "alg": "RS256",
            "typ": "JWT",
            "x5t": URL_SAFE_NO_PAD.encode(Sha1::digest(&**cert)),
        });
        let claims = json!({
            "aud": self.token_url(),
            "iss": self.client_id,
            "sub": self.client_id,
            "jti": hex::encode(jti),
            "nbf": now,
            "exp": now + ASSERTION_LIFETIME,
        });

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );
        let signature = SigningKey::<Sha256>::new(key).sign(signing_input.as_bytes());
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature.to_bytes())))
    }

    fn access_token(&self, agent: &ureq::Agent, deadline: Deadline) -> Result<Zeroizing<String>> {
        let timeout = deadline.timeout(DEFAULT_TIMEOUT)?;
        let assertion = self.client_assertion(chrono::Utc::now().timestamp())?;
        let resp: TokenResponse = agent
            .post(&self.token_url())
            .timeout(timeout)
            .send_form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", VAULT_SCOPE),
                (
                    "client_assertion_type",
                    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
                ),
                ("client_assertion", assertion.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .map_err(|e| azure_error("failed to create Azure credentials", e))?
            .into_json()?;
        Ok(Zeroizing::new(resp.access_token))
    }

    /// A request against the vault with a fresh bearer token. The token
    /// exchange and the request share the deadline.
    fn request(&self, deadline: Deadline, method: &str, key: &str) -> Result<ureq::Request> {
        let agent = ureq::Agent::new();
        let token = self
            .access_token(&agent, deadline)
            .map_err(|e| e.context("failed to get KMS service"))?;
        Ok(agent
            .request(method, &format!("{}/secrets/{key}", self.vault_url))
            .timeout(deadline.timeout(DEFAULT_TIMEOUT)?)
            .query("api-version", API_VERSION)
            .set("Authorization", &format!("Bearer {}", token.as_str())))
    }
}

impl EncryptionKms for AzureKms {
    fn destroy(&mut self) {}

    fn requires_dek_store(&self) -> DekStoreType {
        self.integrated.requires_dek_store()
    }

    fn encrypt_dek(&self, volume_id: &str, plain_dek: &str) -> Result<String> {
        self.integrated.encrypt_dek(volume_id, plain_dek)
    }

    fn decrypt_dek(&self, volume_id: &str, encrypted_dek: &str) -> Result<String> {
        self.integrated.decrypt_dek(volume_id, encrypted_dek)
    }

    fn get_secret(&self, volume_id: &str) -> Result<String> {
        self.integrated.get_secret(volume_id)
    }

    fn dek_store(&self) -> Option<&dyn DekStore> {
        Some(self)
    }
}

impl DekStore for AzureKms {
    fn fetch_dek(&self, deadline: Deadline, key: &str) -> Result<String> {
        let bundle: SecretBundle = self
            .request(deadline, "GET", key)?
            .call()
            .map_err(|e| azure_error("failed to get secret", e))?
            .into_json()?;
        Ok(bundle.value)
    }

    fn store_dek(&self, deadline: Deadline, key: &str, value: &str) -> Result<()> {
        self.request(deadline, "PUT", key)?
            .send_json(json!({ "value": value }))
            .map_err(|e| azure_error("failed to set secret", e))?;
        Ok(())
    }

    fn remove_dek(&self, deadline: Deadline, key: &str) -> Result<()> {
        self.request(deadline, "DELETE", key)?
            .call()
            .map_err(|e| azure_error("failed to delete secret", e))?;
        Ok(())
    }
}
