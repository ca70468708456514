//! TTLV, the KMIP binary encoding.
//!
//! Every item is a 3-byte tag, a 1-byte type, a 4-byte big-endian length
//! and the value, padded with zeros to a multiple of 8 bytes. Structures
//! hold a sequence of items.

use std::io::Read;

use crate::error::{KmsError, Result};

const HEADER_LEN: usize = 8;
/// Upper bound on a single message, far above anything the client sends or
/// expects back.
const MAX_LEN: usize = 1 << 20;

pub mod tag {
    pub const BATCH_COUNT: u32 = 0x42000D;
    pub const BATCH_ITEM: u32 = 0x42000F;
    pub const BLOCK_CIPHER_MODE: u32 = 0x420011;
    pub const CRYPTOGRAPHIC_ALGORITHM: u32 = 0x420028;
    pub const CRYPTOGRAPHIC_PARAMETERS: u32 = 0x42002B;
    pub const IV_COUNTER_NONCE: u32 = 0x42003D;
    pub const OPERATION: u32 = 0x42005C;
    pub const PADDING_METHOD: u32 = 0x42005F;
    pub const PROTOCOL_VERSION: u32 = 0x420069;
    pub const PROTOCOL_VERSION_MAJOR: u32 = 0x42006A;
    pub const PROTOCOL_VERSION_MINOR: u32 = 0x42006B;
    pub const REQUEST_HEADER: u32 = 0x420077;
    pub const REQUEST_MESSAGE: u32 = 0x420078;
    pub const REQUEST_PAYLOAD: u32 = 0x420079;
    pub const RESPONSE_HEADER: u32 = 0x42007A;
    pub const RESPONSE_MESSAGE: u32 = 0x42007B;
    pub const RESPONSE_PAYLOAD: u32 = 0x42007C;
    pub const RESULT_MESSAGE: u32 = 0x42007D;
    pub const RESULT_REASON: u32 = 0x42007E;
    pub const RESULT_STATUS: u32 = 0x42007F;
    pub const TIME_STAMP: u32 = 0x420092;
    pub const UNIQUE_BATCH_ITEM_ID: u32 = 0x420093;
    pub const UNIQUE_IDENTIFIER: u32 = 0x420094;
    pub const DATA: u32 = 0x4200C2;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemType {
    Structure = 0x01,
    Integer = 0x02,
    LongInteger = 0x03,
    BigInteger = 0x04,
    Enumeration = 0x05,
    Boolean = 0x06,
    TextString = 0x07,
    ByteString = 0x08,
    DateTime = 0x09,
    Interval = 0x0A,
}

impl TryFrom<u8> for ItemType {
    type Error = KmsError;

    fn try_from(b: u8) -> Result<Self> {
        Ok(match b {
            0x01 => ItemType::Structure,
            0x02 => ItemType::Integer,
            0x03 => ItemType::LongInteger,
            0x04 => ItemType::BigInteger,
            0x05 => ItemType::Enumeration,
            0x06 => ItemType::Boolean,
            0x07 => ItemType::TextString,
            0x08 => ItemType::ByteString,
            0x09 => ItemType::DateTime,
            0x0A => ItemType::Interval,
            other => return Err(KmsError::Ttlv(format!("unknown item type 0x{other:02x}"))),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Structure(Vec<Ttlv>),
    Integer(i32),
    LongInteger(i64),
    BigInteger(Vec<u8>),
    Enumeration(u32),
    Boolean(bool),
    TextString(String),
    ByteString(Vec<u8>),
    DateTime(i64),
    Interval(u32),
}

impl Value {
    pub fn item_type(&self) -> ItemType {
        match self {
            Value::Structure(_) => ItemType::Structure,
            Value::Integer(_) => ItemType::Integer,
            Value::LongInteger(_) => ItemType::LongInteger,
            Value::BigInteger(_) => ItemType::BigInteger,
            Value::Enumeration(_) => ItemType::Enumeration,
            Value::Boolean(_) => ItemType::Boolean,
            Value::TextString(_) => ItemType::TextString,
            Value::ByteString(_) => ItemType::ByteString,
            Value::DateTime(_) => ItemType::DateTime,
            Value::Interval(_) => ItemType::Interval,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ttlv {
    pub tag: u32,
    pub value: Value,
}

fn padded(len: usize) -> usize {
    len.div_ceil(8) * 8
}

impl Ttlv {
    pub fn new(tag: u32, value: Value) -> Self {
        Self { tag, value }
    }

    pub fn structure(tag: u32, items: Vec<Ttlv>) -> Self {
        Self::new(tag, Value::Structure(items))
    }

    pub fn integer(tag: u32, v: i32) -> Self {
        Self::new(tag, Value::Integer(v))
    }

    pub fn enumeration(tag: u32, v: u32) -> Self {
        Self::new(tag, Value::Enumeration(v))
    }

    pub fn text(tag: u32, v: impl Into<String>) -> Self {
        Self::new(tag, Value::TextString(v.into()))
    }

    pub fn bytes(tag: u32, v: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, Value::ByteString(v.into()))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag.to_be_bytes()[1..]);
        out.push(self.value.item_type() as u8);

        let len_at = out.len();
        out.extend_from_slice(&[0; 4]);
        let start = out.len();

        let len = match &self.value {
            Value::Structure(items) => {
                for item in items {
                    item.encode_into(out);
                }
                out.len() - start
            }
            Value::Integer(v) => {
                out.extend_from_slice(&v.to_be_bytes());
                4
            }
            Value::Enumeration(v) | Value::Interval(v) => {
                out.extend_from_slice(&v.to_be_bytes());
                4
            }
            Value::LongInteger(v) | Value::DateTime(v) => {
                out.extend_from_slice(&v.to_be_bytes());
                8
            }
            Value::Boolean(v) => {
                out.extend_from_slice(&u64::from(*v).to_be_bytes());
                8
            }
            Value::TextString(s) => {
                out.extend_from_slice(s.as_bytes());
                s.len()
            }
            Value::ByteString(b) | Value::BigInteger(b) => {
                out.extend_from_slice(b);
                b.len()
            }
        };

        out[len_at..start].copy_from_slice(&(len as u32).to_be_bytes());
        out.resize(start + padded(len), 0);
    }

    /// Decode one item from the start of `buf`, returning it and the number
    /// of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Ttlv, usize)> {
        let (tag, item_type, len) = parse_header(buf)?;
        let total = HEADER_LEN + padded(len);
        if buf.len() < total {
            return Err(KmsError::Ttlv(format!(
                "truncated item 0x{tag:06x}: need {total} bytes, have {}",
                buf.len()
            )));
        }
        let body = &buf[HEADER_LEN..HEADER_LEN + len];
        Ok((Ttlv::new(tag, decode_value(tag, item_type, body)?), total))
    }

    /// Read exactly one item from a stream.
    pub fn read_from(r: &mut impl Read) -> Result<Ttlv> {
        let mut header = [0u8; HEADER_LEN];
        r.read_exact(&mut header)?;
        let (_, _, len) = parse_header(&header)?;
        if len > MAX_LEN {
            return Err(KmsError::Ttlv(format!("message of {len} bytes exceeds limit")));
        }

        let mut buf = vec![0u8; HEADER_LEN + padded(len)];
        buf[..HEADER_LEN].copy_from_slice(&header);
        r.read_exact(&mut buf[HEADER_LEN..])?;
        Ok(Ttlv::decode(&buf)?.0)
    }

    /// First direct child with `tag`.
    pub fn child(&self, tag: u32) -> Option<&Ttlv> {
        self.children(tag).next()
    }

    /// All direct children with `tag`.
    pub fn children(&self, tag: u32) -> impl Iterator<Item = &Ttlv> {
        let items: &[Ttlv] = match &self.value {
            Value::Structure(items) => items,
            _ => &[],
        };
        items.iter().filter(move |i| i.tag == tag)
    }

    pub fn require(&self, tag: u32) -> Result<&Ttlv> {
        self.child(tag).ok_or_else(|| {
            KmsError::Ttlv(format!("0x{:06x} lacks required field 0x{tag:06x}", self.tag))
        })
    }

    pub fn as_integer(&self) -> Result<i32> {
        match self.value {
            Value::Integer(v) => Ok(v),
            _ => Err(self.type_error(ItemType::Integer)),
        }
    }

    pub fn as_enumeration(&self) -> Result<u32> {
        match self.value {
            Value::Enumeration(v) => Ok(v),
            _ => Err(self.type_error(ItemType::Enumeration)),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match &self.value {
            Value::ByteString(v) => Ok(v),
            _ => Err(self.type_error(ItemType::ByteString)),
        }
    }

    pub fn as_text(&self) -> Result<&str> {
        match &self.value {
            Value::TextString(v) => Ok(v),
            _ => Err(self.type_error(ItemType::TextString)),
        }
    }

    fn type_error(&self, expected: ItemType) -> KmsError {
        KmsError::Ttlv(format!(
            "0x{:06x} is {:?}, expected {expected:?}",
            self.tag,
            self.value.item_type()
        ))
    }
}

fn parse_header(buf: &[u8]) -> Result<(u32, ItemType, usize)> {
    let Some(header) = buf.get(..HEADER_LEN) else {
        return Err(KmsError::Ttlv("truncated item header".into()));
    };
    let tag = u32::from_be_bytes([0, header[0], header[1], header[2]]);
    let item_type = ItemType::try_from(header[3])?;
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    Ok((tag, item_type, len))
}

fn fixed<const N: usize>(tag: u32, body: &[u8]) -> Result<[u8; N]> {
    body.try_into().map_err(|_| {
        KmsError::Ttlv(format!(
            "0x{tag:06x}: length {} invalid, expected {N}",
            body.len()
        ))
    })
}

fn decode_value(tag: u32, item_type: ItemType, body: &[u8]) -> Result<Value> {
    Ok(match item_type {
        ItemType::Structure => {
            let mut items = Vec::new();
            let mut rest = body;
            while !rest.is_empty() {
                let (item, used) = Ttlv::decode(rest)?;
                items.push(item);
                rest = &rest[used..];
            }
            Value::Structure(items)
        }
        ItemType::Integer => Value::Integer(i32::from_be_bytes(fixed(tag, body)?)),
        ItemType::Enumeration => Value::Enumeration(u32::from_be_bytes(fixed(tag, body)?)),
        ItemType::Interval => Value::Interval(u32::from_be_bytes(fixed(tag, body)?)),
        ItemType::LongInteger => Value::LongInteger(i64::from_be_bytes(fixed(tag, body)?)),
        ItemType::DateTime => Value::DateTime(i64::from_be_bytes(fixed(tag, body)?)),
        ItemType::Boolean => Value::Boolean(u64::from_be_bytes(fixed(tag, body)?) != 0),
        ItemType::BigInteger => Value::BigInteger(body.to_vec()),
        ItemType::ByteString => Value::ByteString(body.to_vec()),
        ItemType::TextString => Value::TextString(
            String::from_utf8(body.to_vec())
                .map_err(|_| KmsError::Ttlv(format!("0x{tag:06x}: text is not UTF-8")))?,
        ),
    })
}
