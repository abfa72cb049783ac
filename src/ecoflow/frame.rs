use crate::prelude::*;

use bytes::Bytes;

use super::wire::{FieldWriter, Fields, Value};

/// Envelope field carrying the repeated headers.
const ENVELOPE_HEADER: u32 = 1;

// Header fields
const HEADER_PAYLOAD: u32 = 1;
const HEADER_ENC_TYPE: u32 = 6;
const HEADER_CMD_FUNC: u32 = 8;
const HEADER_CMD_ID: u32 = 9;
const HEADER_SEQ: u32 = 14;

/// `enc_type` value marking an XOR-encrypted payload.
const ENC_TYPE_XOR: u64 = 1;

/// XOR every byte with the low byte of `sequence`. Encryption and
/// decryption are the same operation.
pub fn xor(payload: &[u8], sequence: u64) -> Vec<u8> {
    let key = (sequence & 0xff) as u8;
    payload.iter().map(|b| b ^ key).collect()
}

/// One sub-message exactly as it sits in the envelope. `payload` is still
/// encrypted when `encrypted` is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub type_family: u32,
    pub type_id: u32,
    pub encrypted: bool,
    pub sequence: u64,
    pub payload: Bytes,
}

impl Header {
    /// Builds a header around a plaintext payload, encrypting it with the
    /// sequence key.
    pub fn encrypted(type_family: u32, type_id: u32, sequence: u64, plaintext: &[u8]) -> Self {
        Self {
            type_family,
            type_id,
            encrypted: true,
            sequence,
            payload: Bytes::from(xor(plaintext, sequence)),
        }
    }

    pub fn plain(type_family: u32, type_id: u32, sequence: u64, payload: &[u8]) -> Self {
        Self {
            type_family,
            type_id,
            encrypted: false,
            sequence,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    pub fn key(&self) -> u8 {
        (self.sequence & 0xff) as u8
    }

    pub fn decrypted_payload(&self) -> Bytes {
        if self.encrypted && !self.payload.is_empty() {
            Bytes::from(xor(&self.payload, self.sequence))
        } else {
            self.payload.clone()
        }
    }

    /// Reads one header. The envelope framed it correctly, so a failure
    /// here only costs this header; its type tags are unknown and reported
    /// as 0.
    fn decode(index: usize, input: &[u8]) -> Result<Self, DecodeError> {
        let malformed = |reason: String| DecodeError::payload(0, 0, format!("header {}: {}", index, reason));

        let fields = Fields::parse(input).map_err(|e| malformed(e.to_string()))?;

        let tag = |number: u32, name: &str| -> Result<u32, DecodeError> {
            let value = fields.uint(number).unwrap_or(0);
            u32::try_from(value).map_err(|_| malformed(format!("{} {} out of range", name, value)))
        };

        let payload = match fields.values(HEADER_PAYLOAD).next() {
            None => Bytes::new(),
            Some(Value::Bytes(b)) => Bytes::copy_from_slice(b),
            Some(other) => return Err(malformed(format!("pdata has wrong wire type {:?}", other))),
        };

        Ok(Self {
            type_family: tag(HEADER_CMD_FUNC, "cmd_func")?,
            type_id: tag(HEADER_CMD_ID, "cmd_id")?,
            encrypted: fields.uint(HEADER_ENC_TYPE) == Some(ENC_TYPE_XOR),
            sequence: fields.uint(HEADER_SEQ).unwrap_or(0),
            payload,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = FieldWriter::new();
        if !self.payload.is_empty() {
            writer = writer.bytes(HEADER_PAYLOAD, &self.payload);
        }
        if self.encrypted {
            writer = writer.varint(HEADER_ENC_TYPE, ENC_TYPE_XOR);
        }
        writer
            .varint(HEADER_CMD_FUNC, u64::from(self.type_family))
            .varint(HEADER_CMD_ID, u64::from(self.type_id))
            .varint(HEADER_SEQ, self.sequence)
            .finish()
    }
}

/// A decrypted sub-message ready for payload dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub type_family: u32,
    pub type_id: u32,
    pub payload: Bytes,
}

impl From<&Header> for Message {
    fn from(header: &Header) -> Self {
        Self {
            type_family: header.type_family,
            type_id: header.type_id,
            payload: header.decrypted_payload(),
        }
    }
}

/// One inbound transport message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub headers: Vec<Header>,
}

impl Frame {
    pub fn new(headers: Vec<Header>) -> Self {
        Self { headers }
    }

    /// Splits an envelope into its headers, in order. Only a broken
    /// envelope fails outright; a header that cannot be read takes an
    /// `Err` slot and its siblings are unaffected.
    pub fn split(raw: &[u8]) -> Result<Vec<Result<Header, DecodeError>>, DecodeError> {
        let envelope = Fields::parse(raw).map_err(|e| DecodeError::frame(e.to_string()))?;

        envelope
            .values(ENVELOPE_HEADER)
            .enumerate()
            .map(|(index, value)| match value {
                Value::Bytes(b) => Ok(Header::decode(index, b)),
                other => Err(DecodeError::frame(format!(
                    "header {}: wrong wire type {:?}",
                    index, other
                ))),
            })
            .collect()
    }

    /// Decrypted messages in envelope order.
    pub fn messages(&self) -> Vec<Message> {
        self.headers.iter().map(Message::from).collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.headers
            .iter()
            .fold(FieldWriter::new(), |writer, header| {
                writer.bytes(ENVELOPE_HEADER, &header.encode())
            })
            .finish()
    }
}

/// Decodes raw transport bytes straight to decrypted messages.
pub fn decode(raw: &[u8]) -> Result<Vec<Result<Message, DecodeError>>, DecodeError> {
    Ok(Frame::split(raw)?
        .into_iter()
        .map(|header| header.map(|h| Message::from(&h)))
        .collect())
}
