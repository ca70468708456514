//! Request and response messages of the KMIP operations the client uses.

use super::ttlv::{Ttlv, tag};
use crate::error::{KmsError, Result};

/// Protocol version spoken and accepted.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 4 };

pub const BATCH_ITEM_ID_SIZE: usize = 16;

const CRYPTOGRAPHIC_ALGORITHM_AES: u32 = 0x03;
const BLOCK_CIPHER_MODE_CBC: u32 = 0x01;
const PADDING_METHOD_PKCS5: u32 = 0x03;

const RESULT_STATUS_SUCCESS: u32 = 0x00;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Encrypt,
    Decrypt,
    DiscoverVersions,
}

impl Operation {
    pub fn code(self) -> u32 {
        match self {
            Operation::DiscoverVersions => 0x1E,
            Operation::Encrypt => 0x1F,
            Operation::Decrypt => 0x20,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: i32,
    pub minor: i32,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl ProtocolVersion {
    fn to_ttlv(self) -> Ttlv {
        Ttlv::structure(
            tag::PROTOCOL_VERSION,
            vec![
                Ttlv::integer(tag::PROTOCOL_VERSION_MAJOR, self.major),
                Ttlv::integer(tag::PROTOCOL_VERSION_MINOR, self.minor),
            ],
        )
    }

    fn from_ttlv(item: &Ttlv) -> Result<Self> {
        Ok(Self {
            major: item.require(tag::PROTOCOL_VERSION_MAJOR)?.as_integer()?,
            minor: item.require(tag::PROTOCOL_VERSION_MINOR)?.as_integer()?,
        })
    }
}

/// A request message with a single batch item.
pub fn request(operation: Operation, batch_item_id: &[u8], payload: Vec<Ttlv>) -> Ttlv {
    Ttlv::structure(
        tag::REQUEST_MESSAGE,
        vec![
            Ttlv::structure(
                tag::REQUEST_HEADER,
                vec![PROTOCOL_VERSION.to_ttlv(), Ttlv::integer(tag::BATCH_COUNT, 1)],
            ),
            Ttlv::structure(
                tag::BATCH_ITEM,
                vec![
                    Ttlv::enumeration(tag::OPERATION, operation.code()),
                    Ttlv::bytes(tag::UNIQUE_BATCH_ITEM_ID, batch_item_id),
                    Ttlv::structure(tag::REQUEST_PAYLOAD, payload),
                ],
            ),
        ],
    )
}

pub fn discover_versions_payload(versions: &[ProtocolVersion]) -> Vec<Ttlv> {
    versions.iter().map(|v| v.to_ttlv()).collect()
}

fn cryptographic_parameters() -> Ttlv {
    Ttlv::structure(
        tag::CRYPTOGRAPHIC_PARAMETERS,
        vec![
            Ttlv::enumeration(tag::BLOCK_CIPHER_MODE, BLOCK_CIPHER_MODE_CBC),
            Ttlv::enumeration(tag::PADDING_METHOD, PADDING_METHOD_PKCS5),
            Ttlv::enumeration(tag::CRYPTOGRAPHIC_ALGORITHM, CRYPTOGRAPHIC_ALGORITHM_AES),
        ],
    )
}

/// Encrypt and Decrypt share their request layout: AES-CBC with PKCS#5
/// padding under the key `unique_identifier`.
pub fn crypt_payload(unique_identifier: &str, data: &[u8], iv: &[u8]) -> Vec<Ttlv> {
    vec![
        Ttlv::text(tag::UNIQUE_IDENTIFIER, unique_identifier),
        cryptographic_parameters(),
        Ttlv::bytes(tag::DATA, data),
        Ttlv::bytes(tag::IV_COUNTER_NONCE, iv),
    ]
}

#[derive(Debug)]
pub struct ResponseBatchItem {
    pub operation: Option<u32>,
    pub unique_batch_item_id: Option<Vec<u8>>,
    pub result_status: u32,
    pub result_reason: Option<u32>,
    pub result_message: Option<String>,
    pub payload: Option<Ttlv>,
}

#[derive(Debug)]
pub struct ResponseMessage {
    pub batch_count: i32,
    pub batch_items: Vec<ResponseBatchItem>,
}

impl ResponseMessage {
    pub fn from_ttlv(msg: &Ttlv) -> Result<Self> {
        if msg.tag != tag::RESPONSE_MESSAGE {
            return Err(KmsError::Ttlv(format!(
                "expected a response message, got tag 0x{:06x}",
                msg.tag
            )));
        }
        let header = msg.require(tag::RESPONSE_HEADER)?;
        let batch_count = header.require(tag::BATCH_COUNT)?.as_integer()?;

        let batch_items = msg
            .children(tag::BATCH_ITEM)
            .map(|item| {
                Ok(ResponseBatchItem {
                    operation: item.child(tag::OPERATION).map(Ttlv::as_enumeration).transpose()?,
                    unique_batch_item_id: item
                        .child(tag::UNIQUE_BATCH_ITEM_ID)
                        .map(|i| i.as_bytes().map(<[u8]>::to_vec))
                        .transpose()?,
                    result_status: item.require(tag::RESULT_STATUS)?.as_enumeration()?,
                    result_reason: item.child(tag::RESULT_REASON).map(Ttlv::as_enumeration).transpose()?,
                    result_message: item
                        .child(tag::RESULT_MESSAGE)
                        .map(|i| i.as_text().map(str::to_owned))
                        .transpose()?,
                    payload: item.child(tag::RESPONSE_PAYLOAD).cloned(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            batch_count,
            batch_items,
        })
    }

    /// Check the response answers the single request that was sent, and
    /// return its batch item.
    pub fn verify(self, operation: Operation, batch_item_id: &[u8]) -> Result<ResponseBatchItem> {
        let op_name = format!("KMIP {operation:?}");
        if self.batch_count != 1 {
            return Err(KmsError::remote(
                op_name,
                None,
                format!("batch count {} should be 1", self.batch_count),
            ));
        }
        let mut items = self.batch_items;
        if items.len() != 1 {
            return Err(KmsError::remote(
                op_name,
                None,
                format!("{} batch items, expected 1", items.len()),
            ));
        }
        let item = items.remove(0);

        if item.operation != Some(operation.code()) {
            return Err(KmsError::remote(
                op_name,
                None,
                format!("unexpected operation {:?}", item.operation),
            ));
        }
        if item.unique_batch_item_id.as_deref() != Some(batch_item_id) {
            return Err(KmsError::remote(op_name, None, "unexpected unique batch item ID"));
        }
        if item.result_status != RESULT_STATUS_SUCCESS {
            return Err(KmsError::remote(
                op_name,
                Some(format!(
                    "status {} reason {}",
                    item.result_status,
                    item.result_reason.map_or_else(|| "-".to_owned(), |r| r.to_string())
                )),
                item.result_message.clone().unwrap_or_default(),
            ));
        }
        Ok(item)
    }
}

impl ResponseBatchItem {
    fn payload(&self) -> Result<&Ttlv> {
        self.payload
            .as_ref()
            .ok_or_else(|| KmsError::Ttlv("failed to parse responsePayload".into()))
    }

    pub fn protocol_versions(&self) -> Result<Vec<ProtocolVersion>> {
        self.payload()?
            .children(tag::PROTOCOL_VERSION)
            .map(ProtocolVersion::from_ttlv)
            .collect()
    }

    /// `Data` of an Encrypt or Decrypt response.
    pub fn data(&self) -> Result<Vec<u8>> {
        Ok(self.payload()?.require(tag::DATA)?.as_bytes()?.to_vec())
    }
}
