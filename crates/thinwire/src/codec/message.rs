//! Function call requests and their multi-item responses.
//!
//! A request is `[MESSAGE_FUNCTION][function code][call id]` followed by the
//! function's payload. A response is the echoed call id followed by a
//! sequence of tagged items closed by [`item::END_OF_RESPONSE`].

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use super::types::{BindDescriptor, ColumnInfo, Row, Value};
use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::config::AuthMode;
use crate::error::{Error, Result, ServerError};

/// Leading byte of every function call message.
pub const MESSAGE_FUNCTION: u8 = 3;

/// Server function invoked by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    Fetch = 5,
    Logoff = 9,
    Commit = 14,
    Rollback = 15,
    Execute = 94,
    LobRead = 96,
    CloseCursors = 105,
    AuthPhaseTwo = 115,
    AuthPhaseOne = 118,
    Ping = 147,
}

impl TryFrom<u8> for FunctionCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            5 => Self::Fetch,
            9 => Self::Logoff,
            14 => Self::Commit,
            15 => Self::Rollback,
            94 => Self::Execute,
            96 => Self::LobRead,
            105 => Self::CloseCursors,
            115 => Self::AuthPhaseTwo,
            118 => Self::AuthPhaseOne,
            147 => Self::Ping,
            other => return Err(Error::protocol(format!("unknown function code {other}"))),
        })
    }
}

/// Response item tags.
pub mod item {
    pub const ERROR: u8 = 4;
    pub const ROW_DATA: u8 = 7;
    pub const PARAMETER: u8 = 8;
    pub const STATUS: u8 = 9;
    pub const LOB_DATA: u8 = 14;
    pub const WARNING: u8 = 15;
    pub const DESCRIBE_INFO: u8 = 16;
    pub const BATCH_ERRORS: u8 = 21;
    pub const END_OF_RESPONSE: u8 = 29;
}

/// Execute option bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExecuteOptions(u32);

impl ExecuteOptions {
    pub const PARSE: Self = Self(0x01);
    pub const DESCRIBE: Self = Self(0x02);
    pub const EXECUTE: Self = Self(0x04);
    pub const FETCH: Self = Self(0x08);
    pub const COMMIT: Self = Self(0x10);
    pub const BATCH_ERRORS: Self = Self(0x20);
    pub const DML_ROWCOUNTS: Self = Self(0x40);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ExecuteOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ExecuteOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Key/value pair exchanged during authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Parameter {
    pub key: String,
    pub value: Vec<u8>,
}

impl Parameter {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Value as UTF-8 text, if it is valid.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    fn encode(&self, buf: &mut WriteBuffer) -> Result<()> {
        buf.put_str(&self.key)?;
        buf.put_chunk(&self.value)
    }

    fn decode(buf: &mut ReadBuffer<'_>) -> Result<Self> {
        Ok(Self {
            key: buf.get_string()?,
            value: buf.get_chunk()?.to_vec(),
        })
    }
}

// Values may carry secrets (proofs, signatures); print only their length.
impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("key", &self.key)
            .field("len", &self.value.len())
            .finish()
    }
}

/// Look up a parameter by key.
pub fn find_parameter<'a>(parameters: &'a [Parameter], key: &str) -> Option<&'a [u8]> {
    parameters
        .iter()
        .find(|p| p.key == key)
        .map(|p| p.value.as_slice())
}

/// Payload of an execute call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecuteRequest {
    /// Zero asks the server to open a new cursor.
    pub cursor_id: u32,
    /// Statement text; omitted when re-executing a parsed cursor.
    pub sql: Option<String>,
    pub options: ExecuteOptions,
    pub prefetch_rows: u32,
    pub binds: Vec<BindDescriptor>,
    /// One entry per execution; each holds a value per bind.
    pub rows: Vec<Vec<Value>>,
    /// Cursors the server may release before executing.
    pub close_cursor_ids: Vec<u32>,
}

impl ExecuteRequest {
    fn encode(&self, buf: &mut WriteBuffer) -> Result<()> {
        buf.put_u32(self.cursor_id);
        buf.put_u32(self.options.bits());
        buf.put_u32(self.prefetch_rows);
        match &self.sql {
            Some(sql) => {
                buf.put_u8(1);
                buf.put_str(sql)?;
            }
            None => buf.put_u8(0),
        }

        buf.put_u16(count_u16(self.binds.len(), "bind positions")?);
        for bind in &self.binds {
            bind.encode(buf);
        }
        buf.put_u32(count_u32(self.rows.len(), "bind rows")?);
        for (index, row) in self.rows.iter().enumerate() {
            if row.len() != self.binds.len() {
                return Err(Error::interface(format!(
                    "bind row {index} has {} values for {} positions",
                    row.len(),
                    self.binds.len()
                )));
            }
            for (value, bind) in row.iter().zip(&self.binds) {
                value.encode(bind.charset_form, buf)?;
            }
        }

        buf.put_u16(count_u16(self.close_cursor_ids.len(), "cursors to close")?);
        for id in &self.close_cursor_ids {
            buf.put_u32(*id);
        }
        Ok(())
    }

    fn decode(buf: &mut ReadBuffer<'_>) -> Result<Self> {
        let cursor_id = buf.get_u32()?;
        let options = ExecuteOptions::from_bits(buf.get_u32()?);
        let prefetch_rows = buf.get_u32()?;
        let sql = match buf.get_u8()? {
            0 => None,
            _ => Some(buf.get_string()?),
        };
        let binds = (0..buf.get_u16()?)
            .map(|_| BindDescriptor::decode(buf))
            .collect::<Result<Vec<_>>>()?;
        let row_count = buf.get_u32()?;
        let mut rows = Vec::with_capacity(row_count.min(1024) as usize);
        for _ in 0..row_count {
            let row = binds
                .iter()
                .map(|b| Value::decode(b.db_type, b.charset_form, buf))
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }
        let close_cursor_ids = (0..buf.get_u16()?)
            .map(|_| buf.get_u32())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cursor_id,
            sql,
            options,
            prefetch_rows,
            binds,
            rows,
            close_cursor_ids,
        })
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    AuthPhaseOne {
        username: String,
        program: String,
        mode: AuthMode,
    },
    AuthPhaseTwo {
        parameters: Vec<Parameter>,
    },
    Execute(ExecuteRequest),
    Fetch {
        cursor_id: u32,
        max_rows: u32,
    },
    CloseCursors {
        cursor_ids: Vec<u32>,
    },
    Commit,
    Rollback,
    Ping,
    Logoff,
    LobRead {
        locator: Vec<u8>,
        offset: u64,
        amount: u64,
    },
}

impl Request {
    #[must_use]
    pub const fn function(&self) -> FunctionCode {
        match self {
            Self::AuthPhaseOne { .. } => FunctionCode::AuthPhaseOne,
            Self::AuthPhaseTwo { .. } => FunctionCode::AuthPhaseTwo,
            Self::Execute(_) => FunctionCode::Execute,
            Self::Fetch { .. } => FunctionCode::Fetch,
            Self::CloseCursors { .. } => FunctionCode::CloseCursors,
            Self::Commit => FunctionCode::Commit,
            Self::Rollback => FunctionCode::Rollback,
            Self::Ping => FunctionCode::Ping,
            Self::Logoff => FunctionCode::Logoff,
            Self::LobRead { .. } => FunctionCode::LobRead,
        }
    }

    /// Append the framed request to `buf`.
    pub fn encode(&self, call_id: u8, buf: &mut WriteBuffer) -> Result<()> {
        buf.put_u8(MESSAGE_FUNCTION);
        buf.put_u8(self.function() as u8);
        buf.put_u8(call_id);
        match self {
            Self::AuthPhaseOne {
                username,
                program,
                mode,
            } => {
                buf.put_str(username)?;
                buf.put_str(program)?;
                buf.put_u8(mode.code());
            }
            Self::AuthPhaseTwo { parameters } => {
                buf.put_u16(count_u16(parameters.len(), "parameters")?);
                for parameter in parameters {
                    parameter.encode(buf)?;
                }
            }
            Self::Execute(execute) => execute.encode(buf)?,
            Self::Fetch {
                cursor_id,
                max_rows,
            } => {
                buf.put_u32(*cursor_id);
                buf.put_u32(*max_rows);
            }
            Self::CloseCursors { cursor_ids } => {
                buf.put_u16(count_u16(cursor_ids.len(), "cursors to close")?);
                for id in cursor_ids {
                    buf.put_u32(*id);
                }
            }
            Self::Commit | Self::Rollback | Self::Ping | Self::Logoff => {}
            Self::LobRead {
                locator,
                offset,
                amount,
            } => {
                buf.put_chunk(locator)?;
                buf.put_u64(*offset);
                buf.put_u64(*amount);
            }
        }
        Ok(())
    }

    /// Parse a framed request, returning its call id.
    pub fn decode(bytes: &[u8]) -> Result<(u8, Self)> {
        let mut buf = ReadBuffer::new(bytes);
        let marker = buf.get_u8()?;
        if marker != MESSAGE_FUNCTION {
            return Err(Error::protocol(format!(
                "expected a function message, got type {marker}"
            )));
        }
        let function = FunctionCode::try_from(buf.get_u8()?)?;
        let call_id = buf.get_u8()?;
        let request = match function {
            FunctionCode::AuthPhaseOne => Self::AuthPhaseOne {
                username: buf.get_string()?,
                program: buf.get_string()?,
                mode: AuthMode::from_code(buf.get_u8()?)?,
            },
            FunctionCode::AuthPhaseTwo => Self::AuthPhaseTwo {
                parameters: (0..buf.get_u16()?)
                    .map(|_| Parameter::decode(&mut buf))
                    .collect::<Result<Vec<_>>>()?,
            },
            FunctionCode::Execute => Self::Execute(ExecuteRequest::decode(&mut buf)?),
            FunctionCode::Fetch => Self::Fetch {
                cursor_id: buf.get_u32()?,
                max_rows: buf.get_u32()?,
            },
            FunctionCode::CloseCursors => Self::CloseCursors {
                cursor_ids: (0..buf.get_u16()?)
                    .map(|_| buf.get_u32())
                    .collect::<Result<Vec<_>>>()?,
            },
            FunctionCode::Commit => Self::Commit,
            FunctionCode::Rollback => Self::Rollback,
            FunctionCode::Ping => Self::Ping,
            FunctionCode::Logoff => Self::Logoff,
            FunctionCode::LobRead => Self::LobRead {
                locator: buf.get_chunk()?.to_vec(),
                offset: buf.get_u64()?,
                amount: buf.get_u64()?,
            },
        };
        ensure_consumed(&buf)?;
        Ok((call_id, request))
    }
}

/// Completion status of a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub cursor_id: u32,
    /// Rows affected (DML) or fetched so far (queries).
    pub row_count: u64,
    /// No more rows remain on the cursor.
    pub end_of_data: bool,
    /// Non-zero while a transaction is open on the server.
    pub transaction_id: u32,
    /// Per-row affected counts of a batched DML.
    pub row_counts: Vec<u64>,
}

impl Status {
    fn encode(&self, buf: &mut WriteBuffer) -> Result<()> {
        buf.put_u32(self.cursor_id);
        buf.put_u64(self.row_count);
        buf.put_u8(u8::from(self.end_of_data));
        buf.put_u32(self.transaction_id);
        buf.put_u32(count_u32(self.row_counts.len(), "row counts")?);
        for count in &self.row_counts {
            buf.put_u64(*count);
        }
        Ok(())
    }

    fn decode(buf: &mut ReadBuffer<'_>) -> Result<Self> {
        Ok(Self {
            cursor_id: buf.get_u32()?,
            row_count: buf.get_u64()?,
            end_of_data: buf.get_u8()? != 0,
            transaction_id: buf.get_u32()?,
            row_counts: (0..buf.get_u32()?)
                .map(|_| buf.get_u64())
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

/// Failure of one row in a batched DML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchError {
    /// Zero-based row index.
    pub index: u32,
    pub error: ServerError,
}

/// Non-fatal diagnostic attached to a successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerWarning {
    pub code: u32,
    pub message: String,
}

/// A decoded server reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub call_id: u8,
    pub columns: Option<Vec<ColumnInfo>>,
    pub rows: Vec<Row>,
    pub parameters: Vec<Parameter>,
    pub lob_data: Option<Vec<u8>>,
    pub batch_errors: Vec<BatchError>,
    pub warnings: Vec<ServerWarning>,
    pub status: Option<Status>,
    pub error: Option<ServerError>,
}

impl Response {
    #[must_use]
    pub fn new(call_id: u8) -> Self {
        Self {
            call_id,
            ..Self::default()
        }
    }

    /// Decode a reply. Row data is interpreted against the columns described
    /// in the same reply, or else `known_columns` from an earlier describe.
    pub fn decode(bytes: &[u8], known_columns: Option<&[ColumnInfo]>) -> Result<Self> {
        let mut buf = ReadBuffer::new(bytes);
        let mut response = Self::new(buf.get_u8()?);
        loop {
            match buf.get_u8()? {
                item::DESCRIBE_INFO => {
                    let columns = (0..buf.get_u16()?)
                        .map(|_| ColumnInfo::decode(&mut buf))
                        .collect::<Result<Vec<_>>>()?;
                    response.columns = Some(columns);
                }
                item::ROW_DATA => {
                    let columns = response
                        .columns
                        .as_deref()
                        .or(known_columns)
                        .ok_or_else(|| Error::protocol("row data received before any describe"))?;
                    let count = buf.get_u32()?;
                    response.rows.reserve(count.min(4096) as usize);
                    for _ in 0..count {
                        response.rows.push(Row::decode(columns, &mut buf)?);
                    }
                }
                item::PARAMETER => {
                    for _ in 0..buf.get_u16()? {
                        response.parameters.push(Parameter::decode(&mut buf)?);
                    }
                }
                item::LOB_DATA => response.lob_data = Some(buf.get_chunk()?.to_vec()),
                item::BATCH_ERRORS => {
                    for _ in 0..buf.get_u32()? {
                        let index = buf.get_u32()?;
                        let error = decode_server_error(&mut buf)?;
                        response.batch_errors.push(BatchError { index, error });
                    }
                }
                item::WARNING => {
                    let code = buf.get_u32()?;
                    let message = buf.get_string()?;
                    response.warnings.push(ServerWarning { code, message });
                }
                item::STATUS => response.status = Some(Status::decode(&mut buf)?),
                item::ERROR => response.error = Some(decode_server_error(&mut buf)?),
                item::END_OF_RESPONSE => break,
                other => {
                    return Err(Error::protocol(format!(
                        "unknown response item {other} at offset {}",
                        buf.position() - 1
                    )));
                }
            }
        }
        ensure_consumed(&buf)?;
        Ok(response)
    }

    /// Encode the reply. Rows are written against the reply's own columns,
    /// or `known_columns` when the reply carries no describe.
    pub fn encode(&self, known_columns: Option<&[ColumnInfo]>, buf: &mut WriteBuffer) -> Result<()> {
        buf.put_u8(self.call_id);
        if let Some(columns) = &self.columns {
            buf.put_u8(item::DESCRIBE_INFO);
            buf.put_u16(count_u16(columns.len(), "columns")?);
            for column in columns {
                column.encode(buf)?;
            }
        }
        if !self.rows.is_empty() {
            let columns = self
                .columns
                .as_deref()
                .or(known_columns)
                .ok_or_else(|| Error::interface("rows cannot be encoded without columns"))?;
            buf.put_u8(item::ROW_DATA);
            buf.put_u32(count_u32(self.rows.len(), "rows")?);
            for row in &self.rows {
                row.encode(columns, buf)?;
            }
        }
        if !self.parameters.is_empty() {
            buf.put_u8(item::PARAMETER);
            buf.put_u16(count_u16(self.parameters.len(), "parameters")?);
            for parameter in &self.parameters {
                parameter.encode(buf)?;
            }
        }
        if let Some(data) = &self.lob_data {
            buf.put_u8(item::LOB_DATA);
            buf.put_chunk(data)?;
        }
        if !self.batch_errors.is_empty() {
            buf.put_u8(item::BATCH_ERRORS);
            buf.put_u32(count_u32(self.batch_errors.len(), "batch errors")?);
            for batch_error in &self.batch_errors {
                buf.put_u32(batch_error.index);
                encode_server_error(&batch_error.error, buf)?;
            }
        }
        for warning in &self.warnings {
            buf.put_u8(item::WARNING);
            buf.put_u32(warning.code);
            buf.put_str(&warning.message)?;
        }
        if let Some(status) = &self.status {
            buf.put_u8(item::STATUS);
            status.encode(buf)?;
        }
        if let Some(error) = &self.error {
            buf.put_u8(item::ERROR);
            encode_server_error(error, buf)?;
        }
        buf.put_u8(item::END_OF_RESPONSE);
        Ok(())
    }

    /// Turn an error item into `Err`; it takes precedence over anything else
    /// in the reply.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(error) => Err(Error::statement(error)),
            None => Ok(self),
        }
    }

    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&[u8]> {
        find_parameter(&self.parameters, key)
    }
}

fn encode_server_error(error: &ServerError, buf: &mut WriteBuffer) -> Result<()> {
    buf.put_u32(error.code());
    match error.offset() {
        Some(offset) => {
            buf.put_u8(1);
            buf.put_u32(offset);
        }
        None => buf.put_u8(0),
    }
    buf.put_str(error.message())
}

fn decode_server_error(buf: &mut ReadBuffer<'_>) -> Result<ServerError> {
    let code = buf.get_u32()?;
    let offset = match buf.get_u8()? {
        0 => None,
        _ => Some(buf.get_u32()?),
    };
    let error = ServerError::new(code, buf.get_string()?);
    Ok(match offset {
        Some(offset) => error.with_offset(offset),
        None => error,
    })
}

fn ensure_consumed(buf: &ReadBuffer<'_>) -> Result<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(Error::protocol(format!(
            "{} trailing bytes after message",
            buf.remaining()
        )))
    }
}

fn count_u16(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::interface(format!("too many {what}: {len}")))
}

fn count_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::interface(format!("too many {what}: {len}")))
}
