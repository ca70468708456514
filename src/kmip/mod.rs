//! `kmip`: DEKs encrypted by a single pre-provisioned AES key held in a
//! KMIP 1.4 server.
//!
//! Every call opens its own mutually authenticated TLS connection, checks
//! the server speaks 1.4, and runs one Encrypt or Decrypt operation. The
//! result is stored with the volume in the same envelope format as the
//! passphrase wrapper.

pub mod message;
pub mod ttlv;

use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use rustls::{ClientConfig, ClientConnection, StreamOwned, pki_types::ServerName};

use crate::{
    config::{ConfigMap, optional_string, set_config_int, set_config_string},
    crypto::{
        envelope::{EncryptedDek, generate_nonce},
        tls::{TlsOptions, client_config},
    },
    error::{KmsError, Result},
    kms::{Deadline, DekStoreType, EncryptionKms, ProviderInitArgs, read_settings_secret},
};
use message::{
    BATCH_ITEM_ID_SIZE, Operation, PROTOCOL_VERSION, ResponseBatchItem, ResponseMessage,
    crypt_payload, discover_versions_payload, request,
};
use ttlv::Ttlv;

pub const KMS_TYPE_KMIP: &str = "kmip";

const DEFAULT_SECRET_NAME: &str = "ceph-csi-kmip-credentials";
const SECRET_NAME_KEY: &str = "KMIP_SECRET_NAME";
const ENDPOINT_KEY: &str = "KMIP_ENDPOINT";
const SERVER_NAME_KEY: &str = "TLS_SERVER_NAME";
const READ_TIMEOUT_KEY: &str = "READ_TIMEOUT";
const WRITE_TIMEOUT_KEY: &str = "WRITE_TIMEOUT";

const CA_CERT: &str = "CA_CERT";
const CLIENT_CERT: &str = "CLIENT_CERT";
const CLIENT_KEY: &str = "CLIENT_KEY";
const UNIQUE_IDENTIFIER: &str = "UNIQUE_IDENTIFIER";

/// Seconds.
const DEFAULT_TIMEOUT: i64 = 10;
const IV_SIZE: usize = 16;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KmipKms {
    endpoint: String,
    server_name: String,
    tls_config: Arc<ClientConfig>,
    unique_identifier: String,
    read_timeout: Duration,
    write_timeout: Duration,
    deadline: Deadline,
}

fn timeout_option(config: &ConfigMap, key: &str) -> Result<Duration> {
    let mut secs = DEFAULT_TIMEOUT;
    match set_config_int(&mut secs, config, key) {
        Ok(()) => {}
        Err(e) if e.is_config_missing() => {}
        Err(e) => return Err(e),
    }
    u64::try_from(secs)
        .map(Duration::from_secs)
        .map_err(|_| KmsError::invalid(key, "must not be negative"))
}

/// `kmip.example.com:5696` -> `kmip.example.com`, `[::1]:5696` -> `::1`.
/// IPv6 addresses must be bracketed, otherwise the port cannot be told
/// apart from the address.
fn host_of(endpoint: &str) -> Result<&str> {
    if let Some(rest) = endpoint.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, port)) if !host.is_empty() && (port.is_empty() || port.starts_with(':')) => {
                Ok(host)
            }
            _ => Err(KmsError::invalid(
                ENDPOINT_KEY,
                format!("malformed bracketed address {endpoint:?}"),
            )),
        };
    }
    match endpoint.split_once(':') {
        None => Ok(endpoint),
        Some((host, port)) if !host.is_empty() && !port.contains(':') => Ok(host),
        Some(_) => Err(KmsError::invalid(
            ENDPOINT_KEY,
            format!("IPv6 address in {endpoint:?} must be enclosed in brackets"),
        )),
    }
}

pub fn init_kmip_kms(args: ProviderInitArgs<'_>) -> Result<Box<dyn EncryptionKms>> {
    let config = &args.config;
    let secret_name =
        optional_string(config, SECRET_NAME_KEY)?.unwrap_or_else(|| DEFAULT_SECRET_NAME.to_owned());

    let mut endpoint = String::new();
    set_config_string(&mut endpoint, config, ENDPOINT_KEY)?;
    let host = host_of(&endpoint)?;
    let server_name = optional_string(config, SERVER_NAME_KEY)?
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| host.to_owned());
    let read_timeout = timeout_option(config, READ_TIMEOUT_KEY)?;
    let write_timeout = timeout_option(config, WRITE_TIMEOUT_KEY)?;

    let secret = read_settings_secret(
        args.cluster,
        &args.namespace,
        &secret_name,
        KMS_TYPE_KMIP,
        &[CA_CERT, CLIENT_CERT, CLIENT_KEY, UNIQUE_IDENTIFIER],
    )
    .map_err(|e| e.context("failed to get secrets for kmip"))?;

    let mut ca_cert = String::new();
    set_config_string(&mut ca_cert, &secret, CA_CERT)?;
    let mut client_cert = String::new();
    set_config_string(&mut client_cert, &secret, CLIENT_CERT)?;
    let mut client_key = zeroize::Zeroizing::new(String::new());
    set_config_string(&mut client_key, &secret, CLIENT_KEY)?;
    let mut unique_identifier = String::new();
    set_config_string(&mut unique_identifier, &secret, UNIQUE_IDENTIFIER)?;

    let tls_config = client_config(&TlsOptions {
        ca_pem: Some(ca_cert.as_bytes()),
        client_cert_pem: Some(client_cert.as_bytes()),
        client_key_pem: Some(client_key.as_bytes()),
        ..Default::default()
    })?;

    Ok(Box::new(KmipKms {
        endpoint,
        server_name,
        tls_config,
        unique_identifier,
        read_timeout,
        write_timeout,
        deadline: args.deadline,
    }))
}

/// Socket timeouts report as `WouldBlock` on some platforms.
fn io_error(e: io::Error) -> KmsError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => KmsError::DeadlineExceeded,
        _ => KmsError::Io(e),
    }
}

/// One KMIP conversation over an established stream.
struct Session<S> {
    stream: S,
}

impl<S: Read + Write> Session<S> {
    fn send(&mut self, operation: Operation, payload: Vec<Ttlv>) -> Result<ResponseBatchItem> {
        let batch_item_id = generate_nonce(BATCH_ITEM_ID_SIZE)?;
        let msg = request(operation, &batch_item_id, payload).encode();
        self.stream.write_all(&msg).map_err(io_error)?;
        self.stream.flush().map_err(io_error)?;

        let resp = Ttlv::read_from(&mut self.stream).map_err(|e| match e {
            KmsError::Io(e) => io_error(e),
            other => other,
        })?;
        ResponseMessage::from_ttlv(&resp)?.verify(operation, &batch_item_id)
    }

    /// Propose 1.4 and insist the server picks it.
    fn discover_versions(&mut self) -> Result<()> {
        let item = self.send(
            Operation::DiscoverVersions,
            discover_versions_payload(&[PROTOCOL_VERSION]),
        )?;
        let versions = item.protocol_versions()?;
        match versions.as_slice() {
            [v] if *v == PROTOCOL_VERSION => {
                log::debug!("KMIP server agreed on protocol version {v}");
                Ok(())
            }
            [v] => Err(KmsError::remote(
                "KMIP DiscoverVersions",
                None,
                format!("invalid discovered protocol version {v}, expected {PROTOCOL_VERSION}"),
            )),
            _ => Err(KmsError::remote(
                "KMIP DiscoverVersions",
                None,
                format!("{} protocol versions returned, expected 1", versions.len()),
            )),
        }
    }

    fn encrypt(&mut self, unique_identifier: &str, plain_dek: &[u8]) -> Result<EncryptedDek> {
        let iv = generate_nonce(IV_SIZE)?;
        let item = self.send(Operation::Encrypt, crypt_payload(unique_identifier, plain_dek, &iv))?;
        Ok(EncryptedDek::new(item.data()?, iv))
    }

    fn decrypt(&mut self, unique_identifier: &str, record: &EncryptedDek) -> Result<Vec<u8>> {
        let item = self.send(
            Operation::Decrypt,
            crypt_payload(unique_identifier, &record.dek, &record.nonce),
        )?;
        item.data()
    }
}

impl KmipKms {
    /// A configured socket timeout, shortened to the time left.
    fn socket_timeout(&self, configured: Duration) -> Result<Option<Duration>> {
        if configured.is_zero() {
            self.deadline.remaining()
        } else {
            self.deadline.timeout(configured).map(Some)
        }
    }

    fn connect(&self) -> Result<Session<StreamOwned<ClientConnection, TcpStream>>> {
        let connect_timeout = self.deadline.timeout(CONNECT_TIMEOUT)?;
        let mut last_err = None;
        let mut sock = None;
        for addr in self.endpoint.to_socket_addrs().map_err(|e| {
            KmsError::Config(format!("failed to resolve KMIP endpoint {}: {e}", self.endpoint))
        })? {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(s) => {
                    sock = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let sock = match (sock, last_err) {
            (Some(s), _) => s,
            (None, Some(e)) => return Err(io_error(e)),
            (None, None) => {
                return Err(KmsError::Config(format!(
                    "KMIP endpoint {} resolved to no address",
                    self.endpoint
                )));
            }
        };
        sock.set_read_timeout(self.socket_timeout(self.read_timeout)?)?;
        sock.set_write_timeout(self.socket_timeout(self.write_timeout)?)?;

        let name = ServerName::try_from(self.server_name.clone())
            .map_err(|e| KmsError::Tls(format!("invalid server name {:?}: {e}", self.server_name)))?;
        let conn = ClientConnection::new(self.tls_config.clone(), name)
            .map_err(|e| KmsError::Tls(e.to_string()))?;
        let mut stream = StreamOwned::new(conn, sock);
        while stream.conn.is_handshaking() {
            stream.conn.complete_io(&mut stream.sock).map_err(|e| match io_error(e) {
                KmsError::Io(e) => KmsError::Tls(format!("failed to perform connection handshake: {e}")),
                other => other,
            })?;
        }

        let mut session = Session { stream };
        session.discover_versions()?;
        Ok(session)
    }
}

impl EncryptionKms for KmipKms {
    fn destroy(&mut self) {}

    fn requires_dek_store(&self) -> DekStoreType {
        DekStoreType::Metadata
    }

    fn encrypt_dek(&self, _volume_id: &str, plain_dek: &str) -> Result<String> {
        let mut session = self.connect()?;
        let record = session
            .encrypt(&self.unique_identifier, plain_dek.as_bytes())
            .map_err(|e| e.context("failed to encrypt DEK"))?;
        session.stream.conn.send_close_notify();
        record.to_json()
    }

    fn decrypt_dek(&self, _volume_id: &str, encrypted_dek: &str) -> Result<String> {
        let record = EncryptedDek::from_json(encrypted_dek)?;
        let mut session = self.connect()?;
        let plain = session
            .decrypt(&self.unique_identifier, &record)
            .map_err(|e| e.context("failed to decrypt DEK"))?;
        session.stream.conn.send_close_notify();
        String::from_utf8(plain).map_err(|_| KmsError::CannotProcessDek)
    }
}
