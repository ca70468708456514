//! rustls client configuration shared by the Vault, cluster and KMIP
//! clients.

use std::{io::BufReader, sync::Arc};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};

use crate::error::{KmsError, Result};

#[derive(Default)]
pub struct TlsOptions<'a> {
    /// PEM bundle. When set it is the only trust anchor; otherwise the
    /// webpki roots are used.
    pub ca_pem: Option<&'a [u8]>,
    pub client_cert_pem: Option<&'a [u8]>,
    pub client_key_pem: Option<&'a [u8]>,
    /// Verify the peer against this name instead of the dialled host.
    pub server_name: Option<&'a str>,
    pub insecure: bool,
}

fn tls_err(e: impl std::fmt::Display) -> KmsError {
    KmsError::Tls(e.to_string())
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_err(format!("malformed certificate: {e}")))?;
    if certs.is_empty() {
        return Err(tls_err("no certificate found in PEM data"));
    }
    Ok(certs)
}

pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| tls_err(format!("malformed private key: {e}")))?
        .ok_or_else(|| tls_err("no private key found in PEM data"))
}

fn root_store(ca_pem: Option<&[u8]>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_pem {
        Some(pem) => {
            for cert in parse_certificates(pem)? {
                roots.add(cert).map_err(tls_err)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

/// Build a client configuration with TLS 1.2 as the minimum version.
pub fn client_config(opts: &TlsOptions<'_>) -> Result<Arc<ClientConfig>> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(tls_err)?;

    let builder = if opts.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerify(provider)))
    } else if let Some(name) = opts.server_name.filter(|n| !n.is_empty()) {
        let inner =
            WebPkiServerVerifier::builder_with_provider(Arc::new(root_store(opts.ca_pem)?), provider)
                .build()
                .map_err(tls_err)?;
        let name = ServerName::try_from(name.to_owned()).map_err(tls_err)?;
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(ServerNameOverride { inner, name }))
    } else {
        builder.with_root_certificates(root_store(opts.ca_pem)?)
    };

    let config = match (opts.client_cert_pem, opts.client_key_pem) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(parse_certificates(cert)?, parse_private_key(key)?)
            .map_err(|e| tls_err(format!("invalid X509 key pair: {e}")))?,
        (None, None) => builder.with_no_client_auth(),
        _ => return Err(tls_err("client certificate and key must be set together")),
    };
    Ok(Arc::new(config))
}

/// Accepts any server certificate, but still checks handshake signatures.
#[derive(Debug)]
struct SkipVerify(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Full webpki verification against a fixed name.
#[derive(Debug)]
struct ServerNameOverride {
    inner: Arc<WebPkiServerVerifier>,
    name: ServerName<'static>,
}

impl ServerCertVerifier for ServerNameOverride {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_webpki_roots() {
        assert!(client_config(&TlsOptions::default()).is_ok());
    }

    #[test]
    fn insecure_config_builds() {
        let opts = TlsOptions {
            insecure: true,
            ..Default::default()
        };
        assert!(client_config(&opts).is_ok());
    }

    #[test]
    fn garbage_ca_is_rejected() {
        let opts = TlsOptions {
            ca_pem: Some(b"not a certificate"),
            ..Default::default()
        };
        assert!(matches!(client_config(&opts), Err(KmsError::Tls(_))));
    }

    #[test]
    fn half_a_key_pair_is_rejected() {
        let opts = TlsOptions {
            client_cert_pem: Some(b"-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n"),
            ..Default::default()
        };
        assert!(client_config(&opts).is_err());
    }
}
