//! AWS Signature Version 4 for JSON and query API requests.

use std::time::SystemTime;

use aws_credential_types::Credentials;
use aws_sigv4::{
    http_request::{SignableBody, SignableRequest, SigningParams, SigningSettings, sign as sign_request},
    sign::v4,
};
use aws_smithy_runtime_api::client::identity::Identity;

use crate::error::{KmsError, Result};

/// The parts of a request that go into the signature.
pub struct Request<'a> {
    pub method: &'a str,
    pub url: &'a str,
    /// Headers to sign besides `host`, `x-amz-date` and the session token.
    pub headers: &'a [(&'a str, &'a str)],
    pub payload: &'a [u8],
}

fn signing_error(e: impl std::fmt::Display) -> KmsError {
    KmsError::Config(format!("failed to sign AWS request: {e}"))
}

/// Return the headers to add to `req`: `x-amz-date`, the session token if
/// any, and `authorization`.
pub fn sign(
    req: &Request<'_>,
    creds: &Credentials,
    region: &str,
    service: &str,
    time: SystemTime,
) -> Result<Vec<(String, String)>> {
    let identity: Identity = creds.clone().into();
    let params: SigningParams<'_> = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(service)
        .time(time)
        .settings(SigningSettings::default())
        .build()
        .map_err(signing_error)?
        .into();

    let signable = SignableRequest::new(
        req.method,
        req.url,
        req.headers.iter().copied(),
        SignableBody::Bytes(req.payload),
    )
    .map_err(signing_error)?;
    let (instructions, _signature) = sign_request(signable, &params)
        .map_err(signing_error)?
        .into_parts();

    Ok(instructions
        .headers()
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    // 2015-08-30T12:36:00Z
    const EXAMPLE_TIME: u64 = 1_440_938_160;

    fn example_credentials(session_token: Option<&str>) -> Credentials {
        Credentials::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            session_token.map(str::to_owned),
            None,
            "test",
        )
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn get_vanilla() {
        let req = Request {
            method: "GET",
            url: "https://example.amazonaws.com/",
            headers: &[],
            payload: b"",
        };
        let time = UNIX_EPOCH + Duration::from_secs(EXAMPLE_TIME);
        let headers = sign(&req, &example_credentials(None), "us-east-1", "service", time).unwrap();

        assert_eq!(header(&headers, "x-amz-date"), Some("20150830T123600Z"));
        assert_eq!(
            header(&headers, "authorization"),
            Some(
                "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
                 SignedHeaders=host;x-amz-date, \
                 Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
            )
        );
        assert_eq!(header(&headers, "x-amz-security-token"), None);
    }

    #[test]
    fn session_token_is_signed() {
        let req = Request {
            method: "POST",
            url: "https://kms.us-east-1.amazonaws.com/",
            headers: &[("X-Amz-Target", "TrentService.Encrypt")],
            payload: b"{}",
        };
        let time = UNIX_EPOCH + Duration::from_secs(EXAMPLE_TIME);
        let headers = sign(&req, &example_credentials(Some("session")), "us-east-1", "kms", time).unwrap();

        assert_eq!(header(&headers, "x-amz-security-token"), Some("session"));
        let authorization = header(&headers, "authorization").unwrap();
        assert!(authorization.contains("x-amz-security-token"));
        assert!(authorization.contains("x-amz-target"));
    }
}
