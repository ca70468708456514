//! Passphrase based DEK wrapping for volumes that carry their own
//! (encrypted) DEK.
//!
//! The wrapping key is derived with scrypt from the passphrase, salted with
//! the volume ID, so a wrapped DEK only opens for the volume it was made
//! for. The KDF parameters are part of the stored format.

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{KmsError, Result};

const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const KEY_LEN: usize = 32;
/// AES-GCM standard nonce.
const NONCE_SIZE: usize = 12;

/// Version of [`EncryptedDek`] records written today. Records without a
/// version field are this version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Stored form of a wrapped DEK: `{"dek":"<b64>","nonce":"<b64>"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDek {
    #[serde(with = "b64")]
    pub dek: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl EncryptedDek {
    pub fn new(dek: Vec<u8>, nonce: Vec<u8>) -> Self {
        Self {
            dek,
            nonce,
            version: None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|_| KmsError::CannotProcessDek)
    }

    /// Parse a stored record, rejecting versions this build cannot open.
    pub fn from_json(s: &str) -> Result<Self> {
        let record: Self = serde_json::from_str(s).map_err(|_| KmsError::CannotProcessDek)?;
        match record.version.unwrap_or(ENVELOPE_VERSION) {
            ENVELOPE_VERSION => Ok(record),
            other => {
                log::error!("unsupported DEK envelope version {other}");
                Err(KmsError::CannotProcessDek)
            }
        }
    }
}

mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(D::Error::custom)
    }
}

/// Derive the volume key and return an AEAD keyed with it.
pub fn generate_cipher(passphrase: &str, salt: &str) -> Result<Aes256Gcm> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|_| KmsError::CannotProcessDek)?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(passphrase.as_bytes(), salt.as_bytes(), &params, key.as_mut())
        .map_err(|_| KmsError::CannotProcessDek)?;
    Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| KmsError::CannotProcessDek)
}

/// `size` bytes from the OS random source.
pub fn generate_nonce(size: usize) -> Result<Vec<u8>> {
    let mut nonce = vec![0u8; size];
    getrandom::getrandom(&mut nonce).map_err(|_| KmsError::CannotProcessDek)?;
    Ok(nonce)
}

/// A new random passphrase of `length` bytes, URL-safe base64 encoded.
pub fn generate_passphrase(length: usize) -> Result<String> {
    let bytes = Zeroizing::new(generate_nonce(length)?);
    Ok(URL_SAFE.encode(bytes.as_slice()))
}

/// Wrap `plain_dek` for `volume_id` and return the JSON envelope.
pub fn encrypt_dek(passphrase: &str, volume_id: &str, plain_dek: &str) -> Result<String> {
    let aead = generate_cipher(passphrase, volume_id)?;
    let nonce = generate_nonce(NONCE_SIZE)?;
    let dek = aead
        .encrypt(Nonce::from_slice(&nonce), plain_dek.as_bytes())
        .map_err(|_| KmsError::CannotProcessDek)?;
    EncryptedDek::new(dek, nonce).to_json()
}

/// Open an envelope made by [`encrypt_dek`] for the same volume.
pub fn decrypt_dek(passphrase: &str, volume_id: &str, encrypted_dek: &str) -> Result<String> {
    let record = EncryptedDek::from_json(encrypted_dek)?;
    if record.nonce.len() != NONCE_SIZE {
        return Err(KmsError::CannotProcessDek);
    }
    let aead = generate_cipher(passphrase, volume_id)?;
    let plain = Zeroizing::new(
        aead.decrypt(Nonce::from_slice(&record.nonce), record.dek.as_slice())
            .map_err(|_| KmsError::CannotProcessDek)?,
    );
    String::from_utf8(plain.to_vec()).map_err(|_| KmsError::CannotProcessDek)
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;

    use super::*;

    const PASSPHRASE: &str = "my-passphrase-from-kubernetes";
    const VOLUME_ID: &str = "csi-vol-1b00f5f8-b1c1-11e9-8421-9243c1f659f0";
    const PLAIN_DEK: &str = "usually created with generateNewEncryptionPassphrase()";

    #[test]
    fn nonce_has_requested_size() {
        assert_eq!(generate_nonce(64).unwrap().len(), 64);
    }

    #[test]
    fn cipher_from_passphrase() {
        assert!(generate_cipher("my-cool-luks-passphrase", "unique-id-for-the-volume").is_ok());
    }

    #[test]
    fn round_trip_bound_to_volume() {
        let wrapped = encrypt_dek(PASSPHRASE, VOLUME_ID, PLAIN_DEK).unwrap();
        assert!(!wrapped.is_empty());
        assert_ne!(wrapped, PLAIN_DEK);

        assert_eq!(decrypt_dek(PASSPHRASE, VOLUME_ID, &wrapped).unwrap(), PLAIN_DEK);

        let err = decrypt_dek(PASSPHRASE, "incorrect-volumeID", &wrapped).unwrap_err();
        assert!(matches!(err, KmsError::CannotProcessDek));
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let a = encrypt_dek(PASSPHRASE, VOLUME_ID, PLAIN_DEK).unwrap();
        let b = encrypt_dek(PASSPHRASE, VOLUME_ID, PLAIN_DEK).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn stored_format() {
        let wrapped = encrypt_dek(PASSPHRASE, VOLUME_ID, "dek").unwrap();
        let value: serde_json::Value = serde_json::from_str(&wrapped).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        let nonce = STANDARD.decode(obj["nonce"].as_str().unwrap()).unwrap();
        assert_eq!(nonce.len(), 12);
        assert!(obj["dek"].is_string());
    }

    #[test]
    fn envelope_versions() {
        let v1 = r#"{"dek":"AAAA","nonce":"AAAA","v":1}"#;
        assert_eq!(EncryptedDek::from_json(v1).unwrap().dek, vec![0, 0, 0]);

        let v2 = r#"{"dek":"AAAA","nonce":"AAAA","v":2}"#;
        assert!(EncryptedDek::from_json(v2).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        for input in ["", "{}", "not json", r#"{"dek":"AAAA","nonce":"AA"}"#] {
            assert!(matches!(
                decrypt_dek(PASSPHRASE, VOLUME_ID, input),
                Err(KmsError::CannotProcessDek)
            ));
        }
    }

    #[test]
    fn passphrase_is_url_safe() {
        let p = generate_passphrase(20).unwrap();
        assert_eq!(URL_SAFE.decode(&p).unwrap().len(), 20);
        assert!(!p.contains('+') && !p.contains('/'));
    }
}
