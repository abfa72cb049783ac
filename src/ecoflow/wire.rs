use nom::{
    bytes::complete::take,
    combinator::{all_consuming, map},
    error::{Error as NomError, ErrorKind},
    multi::many0,
    number::complete::{le_u32, le_u64},
    IResult,
};
use thiserror::Error;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

const MAX_FIELD_NUMBER: u64 = (1 << 29) - 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bad encoding at byte {offset} ({kind:?})")]
pub struct WireError {
    pub offset: usize,
    pub kind: ErrorKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field<'a> {
    pub number: u32,
    pub value: Value<'a>,
}

/// One decoded message level. Getters are lenient: an absent field, or one
/// carrying an unexpected wire type, reads as `None` and the caller picks
/// the default.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fields<'a> {
    fields: Vec<Field<'a>>,
}

pub fn varint(input: &[u8]) -> IResult<&[u8], u64> {
    let mut value: u64 = 0;
    for (i, byte) in input.iter().take(10).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((&input[i + 1..], value));
        }
    }

    // complete input only; a truncated varint is corruption, never "need more"
    Err(nom::Err::Error(NomError::new(input, ErrorKind::TooLarge)))
}

fn length_delimited(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (rest, len) = varint(input)?;
    let len = usize::try_from(len)
        .map_err(|_| nom::Err::Error(NomError::new(input, ErrorKind::TooLarge)))?;
    take(len)(rest)
}

fn field(input: &[u8]) -> IResult<&[u8], Field<'_>> {
    let (rest, key) = varint(input)?;

    let number = key >> 3;
    if number == 0 || number > MAX_FIELD_NUMBER {
        return Err(nom::Err::Error(NomError::new(input, ErrorKind::Verify)));
    }

    let (rest, value) = match key & 0x07 {
        WIRE_VARINT => map(varint, Value::Varint)(rest)?,
        WIRE_FIXED64 => map(le_u64::<_, NomError<&[u8]>>, Value::Fixed64)(rest)?,
        WIRE_LEN => map(length_delimited, Value::Bytes)(rest)?,
        WIRE_FIXED32 => map(le_u32::<_, NomError<&[u8]>>, Value::Fixed32)(rest)?,
        // groups (3, 4) and reserved types are not used by the device
        _ => return Err(nom::Err::Error(NomError::new(input, ErrorKind::Switch))),
    };

    Ok((
        rest,
        Field {
            number: number as u32,
            value,
        },
    ))
}

impl<'a> Fields<'a> {
    /// Parses a complete message. Every byte must belong to a well-formed
    /// field, otherwise the offset of the first bad field is reported.
    pub fn parse(input: &'a [u8]) -> Result<Self, WireError> {
        match all_consuming(many0(field))(input) {
            Ok((_, fields)) => Ok(Self { fields }),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(WireError {
                offset: input.len() - e.input.len(),
                kind: e.code,
            }),
            Err(nom::Err::Incomplete(_)) => Err(WireError {
                offset: input.len(),
                kind: ErrorKind::Eof,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field<'a>> + '_ {
        self.fields.iter()
    }

    pub fn values(&self, number: u32) -> impl Iterator<Item = Value<'a>> + '_ {
        self.fields
            .iter()
            .filter(move |f| f.number == number)
            .map(|f| f.value)
    }

    // first occurrence wins for singular fields, which is how the device's
    // own tooling reads them
    fn first(&self, number: u32) -> Option<Value<'a>> {
        self.values(number).next()
    }

    pub fn uint(&self, number: u32) -> Option<u64> {
        match self.first(number)? {
            Value::Varint(v) | Value::Fixed64(v) => Some(v),
            Value::Fixed32(v) => Some(u64::from(v)),
            Value::Bytes(_) => None,
        }
    }

    pub fn int(&self, number: u32) -> Option<i64> {
        match self.first(number)? {
            Value::Varint(v) | Value::Fixed64(v) => Some(v as i64),
            Value::Fixed32(v) => Some(i64::from(v as i32)),
            Value::Bytes(_) => None,
        }
    }

    /// Reads a float/double field. Integer-encoded values are accepted too,
    /// some firmware revisions send whole numbers as varints.
    pub fn float(&self, number: u32) -> Option<f64> {
        match self.first(number)? {
            Value::Fixed32(v) => Some(f64::from(f32::from_bits(v))),
            Value::Fixed64(v) => Some(f64::from_bits(v)),
            Value::Varint(v) => Some(v as i64 as f64),
            Value::Bytes(_) => None,
        }
    }

    pub fn bool(&self, number: u32) -> Option<bool> {
        self.uint(number).map(|v| v != 0)
    }

    pub fn bytes(&self, number: u32) -> Option<&'a [u8]> {
        match self.first(number)? {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn string(&self, number: u32) -> Option<String> {
        self.bytes(number)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Parses an embedded message. An absent field is `Ok(None)`; a present
    /// but corrupt one is an error.
    pub fn message(&self, number: u32) -> Result<Option<Fields<'a>>, WireError> {
        self.bytes(number).map(Fields::parse).transpose()
    }

    /// Parses every occurrence of a repeated embedded message field.
    pub fn messages(&self, number: u32) -> Result<Vec<Fields<'a>>, WireError> {
        self.values(number)
            .filter_map(|v| match v {
                Value::Bytes(b) => Some(Fields::parse(b)),
                _ => None,
            })
            .collect()
    }
}

/// Minimal encoder for the same wire format, used to build envelopes and
/// device requests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&mut self, number: u32, wire_type: u64) {
        put_varint(&mut self.buf, (u64::from(number) << 3) | wire_type);
    }

    pub fn varint(mut self, number: u32, value: u64) -> Self {
        self.key(number, WIRE_VARINT);
        put_varint(&mut self.buf, value);
        self
    }

    pub fn int(self, number: u32, value: i64) -> Self {
        self.varint(number, value as u64)
    }

    pub fn float(mut self, number: u32, value: f32) -> Self {
        self.key(number, WIRE_FIXED32);
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
        self
    }

    pub fn double(mut self, number: u32, value: f64) -> Self {
        self.key(number, WIRE_FIXED64);
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
        self
    }

    pub fn bytes(mut self, number: u32, value: &[u8]) -> Self {
        self.key(number, WIRE_LEN);
        put_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn string(self, number: u32, value: &str) -> Self {
        self.bytes(number, value.as_bytes())
    }

    pub fn message(self, number: u32, value: FieldWriter) -> Self {
        self.bytes(number, &value.buf)
    }

    /// Appends raw, already-encoded bytes.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_multi_byte() {
        assert_eq!(varint(&[0x96, 0x01, 0xff]), Ok((&[0xff][..], 150)));
    }

    #[test]
    fn varint_truncated_is_error_not_incomplete() {
        assert!(matches!(varint(&[0x96]), Err(nom::Err::Error(_))));
        assert!(matches!(varint(&[]), Err(nom::Err::Error(_))));
    }

    #[test]
    fn parses_all_wire_types() {
        let bytes = FieldWriter::new()
            .varint(1, 300)
            .double(2, -1.5)
            .string(3, "HJ31")
            .float(4, 49.5)
            .finish();

        let fields = Fields::parse(&bytes).unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields.uint(1), Some(300));
        assert_eq!(fields.float(2), Some(-1.5));
        assert_eq!(fields.string(3), Some("HJ31".to_string()));
        assert_eq!(fields.float(4), Some(49.5));
    }

    #[test]
    fn lenient_getters() {
        let bytes = FieldWriter::new().string(1, "x").int(2, -20).finish();
        let fields = Fields::parse(&bytes).unwrap();

        assert_eq!(fields.uint(1), None);
        assert_eq!(fields.float(9), None);
        assert_eq!(fields.int(2), Some(-20));
        assert_eq!(fields.float(2), Some(-20.0));
    }

    #[test]
    fn truncated_length_delimited_field() {
        let mut bytes = FieldWriter::new()
            .varint(1, 7)
            .bytes(2, &[1, 2, 3, 4])
            .finish();
        bytes.truncate(bytes.len() - 2);

        let err = Fields::parse(&bytes).unwrap_err();
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn rejects_field_zero_and_groups() {
        assert!(Fields::parse(&[0x00, 0x01]).is_err());
        // field 1, wire type 3 (start group)
        assert!(Fields::parse(&[0x0b]).is_err());
    }

    #[test]
    fn empty_input_is_empty_message() {
        assert!(Fields::parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn repeated_messages() {
        let bytes = FieldWriter::new()
            .message(1, FieldWriter::new().varint(1, 10))
            .varint(2, 5)
            .message(1, FieldWriter::new().varint(1, 20))
            .finish();
        let fields = Fields::parse(&bytes).unwrap();

        let inner = fields.messages(1).unwrap();
        assert_eq!(inner.len(), 2);
        assert_eq!(inner[1].uint(1), Some(20));
        assert!(fields.message(3).unwrap().is_none());
    }
}
