//! Providers wrapping DEKs with a customer master key in Amazon KMS.
//!
//! Both talk to the KMS JSON API directly: a signed `POST /` with the
//! operation in `X-Amz-Target`.

pub mod metadata;
pub mod sigv4;
pub mod sts;

use std::time::{Duration, SystemTime};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::{KmsError, Result},
    kms::Deadline,
};

pub use aws_credential_types::Credentials;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default name of the secret holding AWS credentials or settings.
pub const DEFAULT_SECRET_NAME: &str = "ceph-csi-aws-credentials";

pub struct KmsClient {
    endpoint: String,
    region: String,
    credentials: Credentials,
}

#[derive(Serialize)]
struct EncryptRequest<'a> {
    #[serde(rename = "KeyId")]
    key_id: &'a str,
    #[serde(rename = "Plaintext")]
    plaintext: String,
}

#[derive(Deserialize)]
struct EncryptResponse {
    #[serde(rename = "CiphertextBlob")]
    ciphertext_blob: String,
}

#[derive(Serialize)]
struct DecryptRequest {
    #[serde(rename = "CiphertextBlob")]
    ciphertext_blob: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    #[serde(rename = "Plaintext")]
    plaintext: String,
}

/// Error body of the AWS JSON protocols.
#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(rename = "__type")]
    kind: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

/// `com.amazonaws.kms#NotFoundException` -> `NotFoundException`.
fn short_error_type(kind: &str) -> &str {
    kind.rsplit('#').next().unwrap_or(kind)
}

pub(crate) fn aws_error(operation: &str, e: ureq::Error) -> KmsError {
    match e {
        ureq::Error::Status(status, resp) => {
            let body = resp.into_string().unwrap_or_default();
            match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(ErrorResponse { kind, message }) => KmsError::remote(
                    operation,
                    Some(kind.as_deref().map_or_else(|| status.to_string(), |k| short_error_type(k).to_owned())),
                    message.unwrap_or(body),
                ),
                Err(_) => KmsError::remote(operation, Some(status.to_string()), body),
            }
        }
        other => KmsError::from(other).context(operation),
    }
}

impl KmsClient {
    pub fn new(region: &str, credentials: Credentials) -> Self {
        Self::with_endpoint(format!("https://kms.{region}.amazonaws.com/"), region, credentials)
    }

    pub fn with_endpoint(endpoint: impl Into<String>, region: &str, credentials: Credentials) -> Self {
        Self {
            endpoint: endpoint.into(),
            region: region.to_owned(),
            credentials,
        }
    }

    fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        operation: &str,
        body: &Req,
        deadline: Deadline,
    ) -> Result<Resp> {
        let timeout = deadline.timeout(REQUEST_TIMEOUT)?;
        let target = format!("TrentService.{operation}");
        let payload = serde_json::to_vec(body)?;
        let content_type = "application/x-amz-json-1.1";

        let signed = sigv4::sign(
            &sigv4::Request {
                method: "POST",
                url: &self.endpoint,
                headers: &[("Content-Type", content_type), ("X-Amz-Target", target.as_str())],
                payload: &payload,
            },
            &self.credentials,
            &self.region,
            "kms",
            SystemTime::now(),
        )?;

        let mut req = ureq::post(&self.endpoint)
            .timeout(timeout)
            .set("Content-Type", content_type)
            .set("X-Amz-Target", &target);
        for (name, value) in &signed {
            req = req.set(name, value);
        }

        let resp = req
            .send_bytes(&payload)
            .map_err(|e| aws_error(&format!("KMS {operation}"), e))?;
        Ok(resp.into_json()?)
    }

    /// Encrypt `plaintext` with `key_id`, returning the ciphertext blob.
    pub fn encrypt(&self, key_id: &str, plaintext: &[u8], deadline: Deadline) -> Result<Vec<u8>> {
        let resp: EncryptResponse = self.call(
            "Encrypt",
            &EncryptRequest {
                key_id,
                plaintext: STANDARD.encode(plaintext),
            },
            deadline,
        )?;
        decode_blob(&resp.ciphertext_blob)
    }

    /// The key is identified by the blob itself.
    pub fn decrypt(&self, ciphertext_blob: &[u8], deadline: Deadline) -> Result<Vec<u8>> {
        let resp: DecryptResponse = self.call(
            "Decrypt",
            &DecryptRequest {
                ciphertext_blob: STANDARD.encode(ciphertext_blob),
            },
            deadline,
        )?;
        decode_blob(&resp.plaintext)
    }
}

fn decode_blob(b64: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(b64)
        .map_err(|e| KmsError::remote("KMS", None, format!("invalid base64 in response: {e}")))
}

/// Wrap a DEK and encode the blob for storage with the volume.
pub(crate) fn encrypt_dek(client: &KmsClient, cmk: &str, plain_dek: &str, deadline: Deadline) -> Result<String> {
    let blob = client
        .encrypt(cmk, plain_dek.as_bytes(), deadline)
        .map_err(|e| e.context("failed to encrypt DEK"))?;
    Ok(STANDARD.encode(blob))
}

pub(crate) fn decrypt_dek(client: &KmsClient, encrypted_dek: &str, deadline: Deadline) -> Result<String> {
    let blob = STANDARD
        .decode(encrypted_dek)
        .map_err(|e| KmsError::Config(format!("failed to decode base64 cipher: {e}")))?;
    let plain = client
        .decrypt(&blob, deadline)
        .map_err(|e| e.context("failed to decrypt DEK"))?;
    String::from_utf8(plain).map_err(|_| KmsError::CannotProcessDek)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::kms::fake_http::FakeHttp;

    fn credentials() -> Credentials {
        Credentials::new("AKID", "secret", None, None, "test")
    }

    #[test]
    fn error_type_is_shortened() {
        assert_eq!(short_error_type("com.amazonaws.kms#NotFoundException"), "NotFoundException");
        assert_eq!(short_error_type("AccessDeniedException"), "AccessDeniedException");
    }

    #[test]
    fn invalid_stored_dek_is_rejected_locally() {
        let client = KmsClient::with_endpoint("http://127.0.0.1:9/", "us-east-1", credentials());
        let err = decrypt_dek(&client, "not base64!", Deadline::none()).unwrap_err();
        assert!(err.to_string().contains("failed to decode base64 cipher"));
    }

    #[test]
    fn expired_deadline_sends_nothing() {
        let client = KmsClient::with_endpoint("http://127.0.0.1:9/", "us-east-1", credentials());
        let past = Deadline::at(Instant::now() - Duration::from_secs(5));
        assert!(matches!(
            encrypt_dek(&client, "cmk", "dek", past),
            Err(KmsError::DeadlineExceeded)
        ));
    }

    #[test]
    fn encrypt_request() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = FakeHttp::serve(vec![(
            200,
            format!(r#"{{"CiphertextBlob":"{}","KeyId":"cmk"}}"#, STANDARD.encode(b"wrapped")),
        )]);
        let client = KmsClient::with_endpoint(format!("{}/", server.url), "us-east-1", credentials());

        let stored = encrypt_dek(&client, "cmk", "plain", Deadline::after(Duration::from_secs(10))).unwrap();
        assert_eq!(stored, STANDARD.encode(b"wrapped"));

        let requests = server.finish();
        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        assert_eq!(req.method, "POST");
        assert_eq!(req.target, "/");
        assert_eq!(req.header("X-Amz-Target"), Some("TrentService.Encrypt"));
        assert!(req.header("Authorization").unwrap().starts_with("AWS4-HMAC-SHA256 Credential=AKID/"));
        let body = req.json();
        assert_eq!(body["KeyId"], "cmk");
        assert_eq!(body["Plaintext"], STANDARD.encode("plain"));
    }

    #[test]
    fn service_error_is_decoded() {
        let server = FakeHttp::serve(vec![(
            400,
            r#"{"__type":"com.amazonaws.kms#NotFoundException","message":"Key not found"}"#.to_owned(),
        )]);
        let client = KmsClient::with_endpoint(format!("{}/", server.url), "us-east-1", credentials());

        let err = decrypt_dek(&client, &STANDARD.encode(b"wrapped"), Deadline::none()).unwrap_err();
        match err {
            KmsError::Remote { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("NotFoundException"));
                assert_eq!(message, "Key not found");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(server.finish()[0].header("X-Amz-Target"), Some("TrentService.Decrypt"));
    }
}
