//! Column types and typed values.

use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, FixedOffset, NaiveDateTime};

use super::{number, temporal};
use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::{Error, Result};

/// Largest text or raw value, in bytes.
pub const MAX_VALUE_BYTES: usize = 32767;

/// Charset id of the implicit (database) character set: UTF-8.
pub const CHARSET_UTF8: u16 = 873;

/// Charset id of the national character set: UTF-16 big-endian.
pub const CHARSET_UTF16: u16 = 2000;

/// Wire type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DbType {
    Varchar = 1,
    Number = 2,
    BinaryInteger = 3,
    Date = 12,
    Raw = 23,
    Char = 96,
    BinaryFloat = 100,
    BinaryDouble = 101,
    Clob = 112,
    Blob = 113,
    Timestamp = 180,
    TimestampTz = 181,
    Boolean = 252,
}

impl DbType {
    /// Map a tag; unknown tags are never coerced.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::Varchar),
            2 => Ok(Self::Number),
            3 => Ok(Self::BinaryInteger),
            12 => Ok(Self::Date),
            23 => Ok(Self::Raw),
            96 => Ok(Self::Char),
            100 => Ok(Self::BinaryFloat),
            101 => Ok(Self::BinaryDouble),
            112 => Ok(Self::Clob),
            113 => Ok(Self::Blob),
            180 => Ok(Self::Timestamp),
            181 => Ok(Self::TimestampTz),
            252 => Ok(Self::Boolean),
            other => Err(Error::unsupported_type(format!("type tag {other}"))),
        }
    }

    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// True for types whose payload is character data.
    #[must_use]
    pub const fn is_text(self) -> bool {
        matches!(self, Self::Varchar | Self::Char)
    }

    /// Default maximum size advertised for binds of this type.
    #[must_use]
    pub const fn default_max_size(self) -> u32 {
        match self {
            Self::Varchar | Self::Char | Self::Raw => MAX_VALUE_BYTES as u32,
            Self::Number => 22,
            Self::BinaryInteger | Self::BinaryDouble => 8,
            Self::BinaryFloat => 4,
            Self::Date => temporal::DATE_LEN as u32,
            Self::Timestamp => temporal::TIMESTAMP_LEN as u32,
            Self::TimestampTz => temporal::TIMESTAMP_TZ_LEN as u32,
            Self::Clob | Self::Blob => 112,
            Self::Boolean => 1,
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Varchar => "VARCHAR2",
            Self::Number => "NUMBER",
            Self::BinaryInteger => "BINARY_INTEGER",
            Self::Date => "DATE",
            Self::Raw => "RAW",
            Self::Char => "CHAR",
            Self::BinaryFloat => "BINARY_FLOAT",
            Self::BinaryDouble => "BINARY_DOUBLE",
            Self::Clob => "CLOB",
            Self::Blob => "BLOB",
            Self::Timestamp => "TIMESTAMP",
            Self::TimestampTz => "TIMESTAMP WITH TIME ZONE",
            Self::Boolean => "BOOLEAN",
        };
        f.write_str(name)
    }
}

/// Character set used for a text column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CharsetForm {
    /// Database character set (UTF-8).
    #[default]
    Implicit,
    /// National character set (UTF-16BE).
    National,
}

impl CharsetForm {
    pub(crate) const fn code(self) -> u8 {
        match self {
            Self::Implicit => 1,
            Self::National => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Self> {
        match code {
            0 | 1 => Ok(Self::Implicit),
            2 => Ok(Self::National),
            other => Err(Error::protocol(format!("unknown charset form {other}"))),
        }
    }

    /// Charset id announced for this form.
    #[must_use]
    pub const fn charset_id(self) -> u16 {
        match self {
            Self::Implicit => CHARSET_UTF8,
            Self::National => CHARSET_UTF16,
        }
    }
}

/// Reference to a large object held on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LobLocator {
    /// Total length in bytes (BLOB) or characters (CLOB).
    pub size: u64,
    /// Preferred read size.
    pub chunk_size: u32,
    /// Opaque server locator.
    pub locator: Vec<u8>,
}

impl LobLocator {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.locator.len());
        out.extend_from_slice(&self.size.to_be_bytes());
        out.extend_from_slice(&self.chunk_size.to_be_bytes());
        out.extend_from_slice(&self.locator);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = ReadBuffer::new(bytes);
        let size = reader.get_u64()?;
        let chunk_size = reader.get_u32()?;
        let locator = reader.get_bytes(reader.remaining())?.to_vec();
        Ok(Self {
            size,
            chunk_size,
            locator,
        })
    }
}

/// A typed column or bind value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Varchar(String),
    Char(String),
    Number(BigDecimal),
    Integer(i64),
    Float(f32),
    Double(f64),
    Raw(Vec<u8>),
    Date(NaiveDateTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Boolean(bool),
    Clob(LobLocator),
    Blob(LobLocator),
}

impl Value {
    /// Wire type of this value; `None` for NULL, which takes the type of its
    /// column.
    #[must_use]
    pub const fn db_type(&self) -> Option<DbType> {
        Some(match self {
            Self::Null => return None,
            Self::Varchar(_) => DbType::Varchar,
            Self::Char(_) => DbType::Char,
            Self::Number(_) => DbType::Number,
            Self::Integer(_) => DbType::BinaryInteger,
            Self::Float(_) => DbType::BinaryFloat,
            Self::Double(_) => DbType::BinaryDouble,
            Self::Raw(_) => DbType::Raw,
            Self::Date(_) => DbType::Date,
            Self::Timestamp(_) => DbType::Timestamp,
            Self::TimestampTz(_) => DbType::TimestampTz,
            Self::Boolean(_) => DbType::Boolean,
            Self::Clob(_) => DbType::Clob,
            Self::Blob(_) => DbType::Blob,
        })
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text content of VARCHAR and CHAR values.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Varchar(s) | Self::Char(s) => Some(s),
            _ => None,
        }
    }

    /// Integral content of NUMBER and BINARY_INTEGER values.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        use num_traits::ToPrimitive;
        match self {
            Self::Integer(v) => Some(*v),
            Self::Number(d) if d.is_integer() => d.to_i64(),
            _ => None,
        }
    }

    /// Large object locator of CLOB and BLOB values.
    #[must_use]
    pub const fn as_lob(&self) -> Option<&LobLocator> {
        match self {
            Self::Clob(l) | Self::Blob(l) => Some(l),
            _ => None,
        }
    }

    /// Encode the payload (without the length prefix).
    pub fn encode_payload(&self, form: CharsetForm) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::Null => Vec::new(),
            Self::Varchar(s) | Self::Char(s) => encode_text(s, form),
            Self::Number(d) => number::encode(d)?,
            Self::Integer(v) => v.to_be_bytes().to_vec(),
            Self::Float(v) => {
                let bits = encode_float_bits(u64::from(v.to_bits()), 32) as u32;
                bits.to_be_bytes().to_vec()
            }
            Self::Double(v) => encode_float_bits(v.to_bits(), 64).to_be_bytes().to_vec(),
            Self::Raw(b) => b.clone(),
            Self::Date(v) => temporal::encode_date(v)?,
            Self::Timestamp(v) => temporal::encode_timestamp(v)?,
            Self::TimestampTz(v) => temporal::encode_timestamp_tz(v)?,
            Self::Boolean(b) => vec![u8::from(*b)],
            Self::Clob(l) | Self::Blob(l) => l.encode(),
        };
        if matches!(self, Self::Varchar(_) | Self::Char(_) | Self::Raw(_))
            && bytes.len() > MAX_VALUE_BYTES
        {
            return Err(Error::interface(format!(
                "{} value of {} bytes exceeds the maximum of {MAX_VALUE_BYTES}",
                self.db_type().map_or_else(String::new, |t| t.to_string()),
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Decode a payload of the given type.
    pub fn decode_payload(db_type: DbType, form: CharsetForm, bytes: &[u8]) -> Result<Self> {
        let fixed = |len: usize| -> Result<()> {
            if bytes.len() == len {
                Ok(())
            } else {
                Err(Error::protocol(format!(
                    "{db_type} value has {} bytes, expected {len}",
                    bytes.len()
                )))
            }
        };
        Ok(match db_type {
            DbType::Varchar => Self::Varchar(decode_text(bytes, form)?),
            DbType::Char => Self::Char(decode_text(bytes, form)?),
            DbType::Number => Self::Number(number::decode(bytes)?),
            DbType::BinaryInteger => {
                fixed(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Self::Integer(i64::from_be_bytes(raw))
            }
            DbType::BinaryFloat => {
                fixed(4)?;
                let bits = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Self::Float(f32::from_bits(decode_float_bits(u64::from(bits), 32) as u32))
            }
            DbType::BinaryDouble => {
                fixed(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Self::Double(f64::from_bits(decode_float_bits(u64::from_be_bytes(raw), 64)))
            }
            DbType::Raw => Self::Raw(bytes.to_vec()),
            DbType::Date => Self::Date(temporal::decode_date(bytes)?),
            DbType::Timestamp => Self::Timestamp(temporal::decode_timestamp(bytes)?),
            DbType::TimestampTz => Self::TimestampTz(temporal::decode_timestamp_tz(bytes)?),
            DbType::Boolean => {
                fixed(1)?;
                Self::Boolean(bytes[0] != 0)
            }
            DbType::Clob => Self::Clob(LobLocator::decode(bytes)?),
            DbType::Blob => Self::Blob(LobLocator::decode(bytes)?),
        })
    }

    /// Write the value with its length prefix.
    pub fn encode(&self, form: CharsetForm, buf: &mut WriteBuffer) -> Result<()> {
        if self.is_null() {
            return buf.put_value(None);
        }
        buf.put_value(Some(&self.encode_payload(form)?))
    }

    /// Read a length-prefixed value. An empty payload is an empty string or
    /// byte string, distinct from NULL.
    pub fn decode(db_type: DbType, form: CharsetForm, buf: &mut ReadBuffer<'_>) -> Result<Self> {
        match buf.get_value()? {
            None => Ok(Self::Null),
            Some(bytes) => Self::decode_payload(db_type, form, bytes),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Varchar(s) | Self::Char(s) => f.write_str(s),
            Self::Number(d) => write!(f, "{d}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Raw(b) => {
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S")),
            Self::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            Self::TimestampTz(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f %:z")),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Clob(l) => write!(f, "<CLOB {} chars>", l.size),
            Self::Blob(l) => write!(f, "<BLOB {} bytes>", l.size),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Varchar(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Varchar(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<BigDecimal> for Value {
    fn from(v: BigDecimal) -> Self {
        Self::Number(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Raw(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::Timestamp(v)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Self::TimestampTz(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

fn encode_text(s: &str, form: CharsetForm) -> Vec<u8> {
    match form {
        CharsetForm::Implicit => s.as_bytes().to_vec(),
        CharsetForm::National => s.encode_utf16().flat_map(u16::to_be_bytes).collect(),
    }
}

fn decode_text(bytes: &[u8], form: CharsetForm) -> Result<String> {
    match form {
        CharsetForm::Implicit => String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::protocol(format!("invalid UTF-8 text: {e}"))),
        CharsetForm::National => {
            if bytes.len() % 2 != 0 {
                return Err(Error::protocol("UTF-16 text with an odd byte count"));
            }
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|p| u16::from_be_bytes([p[0], p[1]]))
                .collect();
            String::from_utf16(&units)
                .map_err(|e| Error::protocol(format!("invalid UTF-16 text: {e}")))
        }
    }
}

// IEEE bits reordered so that byte order matches numeric order: positive
// values get the sign bit set, negative values are fully inverted.
const fn encode_float_bits(bits: u64, width: u32) -> u64 {
    let sign = 1u64 << (width - 1);
    let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
    if bits & sign == 0 { bits | sign } else { !bits & mask }
}

const fn decode_float_bits(bits: u64, width: u32) -> u64 {
    let sign = 1u64 << (width - 1);
    let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
    if bits & sign == 0 { !bits & mask } else { bits & !sign }
}

/// Column metadata returned by a describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub db_type: DbType,
    pub max_size: u32,
    pub precision: i16,
    pub scale: i16,
    pub nullable: bool,
    pub charset_form: CharsetForm,
}

impl ColumnInfo {
    /// Column with default size and nullability for its type.
    pub fn new(name: impl Into<String>, db_type: DbType) -> Self {
        Self {
            name: name.into(),
            db_type,
            max_size: db_type.default_max_size(),
            precision: 0,
            scale: 0,
            nullable: true,
            charset_form: CharsetForm::Implicit,
        }
    }

    pub(crate) fn encode(&self, buf: &mut WriteBuffer) -> Result<()> {
        buf.put_str(&self.name)?;
        buf.put_u8(self.db_type.tag());
        buf.put_u32(self.max_size);
        buf.put_i16(self.precision);
        buf.put_i16(self.scale);
        buf.put_u8(u8::from(self.nullable));
        buf.put_u8(self.charset_form.code());
        Ok(())
    }

    pub(crate) fn decode(buf: &mut ReadBuffer<'_>) -> Result<Self> {
        Ok(Self {
            name: buf.get_string()?,
            db_type: DbType::from_tag(buf.get_u8()?)?,
            max_size: buf.get_u32()?,
            precision: buf.get_i16()?,
            scale: buf.get_i16()?,
            nullable: buf.get_u8()? != 0,
            charset_form: CharsetForm::from_code(buf.get_u8()?)?,
        })
    }
}

/// Type information sent with each bind position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindDescriptor {
    pub db_type: DbType,
    pub charset_form: CharsetForm,
    pub max_size: u32,
}

impl BindDescriptor {
    #[must_use]
    pub const fn new(db_type: DbType) -> Self {
        Self {
            db_type,
            charset_form: CharsetForm::Implicit,
            max_size: db_type.default_max_size(),
        }
    }

    pub(crate) fn encode(&self, buf: &mut WriteBuffer) {
        buf.put_u8(self.db_type.tag());
        buf.put_u8(self.charset_form.code());
        buf.put_u32(self.max_size);
    }

    pub(crate) fn decode(buf: &mut ReadBuffer<'_>) -> Result<Self> {
        Ok(Self {
            db_type: DbType::from_tag(buf.get_u8()?)?,
            charset_form: CharsetForm::from_code(buf.get_u8()?)?,
            max_size: buf.get_u32()?,
        })
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    #[must_use]
    pub const fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub(crate) fn encode(&self, columns: &[ColumnInfo], buf: &mut WriteBuffer) -> Result<()> {
        if self.values.len() != columns.len() {
            return Err(Error::interface(format!(
                "row has {} values for {} columns",
                self.values.len(),
                columns.len()
            )));
        }
        for (value, column) in self.values.iter().zip(columns) {
            value.encode(column.charset_form, buf)?;
        }
        Ok(())
    }

    pub(crate) fn decode(columns: &[ColumnInfo], buf: &mut ReadBuffer<'_>) -> Result<Self> {
        let values = columns
            .iter()
            .map(|c| Value::decode(c.db_type, c.charset_form, buf))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { values })
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
