//! Error hierarchy for thinwire.
//!
//! Follows the "canonical error struct" pattern: a single [`Error`] type with a
//! private kind and `is_xxx()` predicates for classification, so new failure
//! modes can be added without breaking callers.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Error reported by the database server for a call.
///
/// Carries the server's numeric code, message text and, for parse errors, the
/// character offset into the SQL text. Surfaced verbatim and never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    code: u32,
    message: String,
    offset: Option<u32>,
}

impl ServerError {
    /// Create a server error.
    #[must_use]
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            offset: None,
        }
    }

    /// Attach the SQL text offset the error refers to.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Server error code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        self.code
    }

    /// Server message text.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Offset into the SQL text, when the server reported one.
    #[must_use]
    pub const fn offset(&self) -> Option<u32> {
        self.offset
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(offset) = self.offset {
            write!(f, " (at offset {offset})")?;
        }
        Ok(())
    }
}

/// Root error type for the thinwire crate.
///
/// # Example
///
/// ```rust,ignore
/// use thinwire::Error;
///
/// fn handle_error(err: Error) {
///     if err.is_session_busy() {
///         eprintln!("another call is still running on this session");
///     } else if let Some(server) = err.server_error() {
///         eprintln!("server rejected the statement: {server}");
///     }
/// }
/// ```
#[derive(Error, Debug)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
}

/// Internal error classification.
///
/// This enum is `pub(crate)` to allow adding variants without breaking changes.
/// External code should use the `is_xxx()` predicate methods instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub(crate) enum ErrorKind {
    /// The transport could not be established.
    #[error("cannot connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Transport failure after the connection was established.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// A blocking read or write exceeded its timeout.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Client and server share no protocol version.
    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),

    /// Credentials rejected or authentication exchange failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed, out-of-order or unexpected data on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A value or type tag that has no mapping.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// A request is already in flight on the session.
    #[error("session busy: another request is in flight")]
    SessionBusy,

    /// The session or pool has been closed.
    #[error("session closed")]
    Closed,

    /// A state transition outside the transition table.
    #[error("invalid session state transition from {from} to {to}")]
    InvalidState { from: SessionState, to: SessionState },

    /// No pooled session became available in time.
    #[error("no pooled session available after {0:?}")]
    PoolTimeout(Duration),

    /// The pool is at capacity and the caller asked not to wait.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Error reported by the server for a statement.
    #[error("database error {0}")]
    Statement(ServerError),

    /// Caller misuse: unknown handles, bad binds, wrong call order.
    #[error("interface error: {0}")]
    Interface(String),

    /// Invalid configuration values.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    // ═══════════════════════════════════════════════════════════════════════
    // Constructors
    // ═══════════════════════════════════════════════════════════════════════

    /// Create error for a failed connection attempt.
    #[must_use]
    pub fn connect(address: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Connect {
                address: address.into(),
                reason: reason.to_string(),
            },
        }
    }

    /// Create error for a TLS failure.
    #[must_use]
    pub fn tls(message: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Tls(message.to_string()),
        }
    }

    /// Create error for an operation that timed out.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout(message.into()),
        }
    }

    /// Create error for a protocol version mismatch.
    #[must_use]
    pub fn version_mismatch(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::VersionMismatch(message.into()),
        }
    }

    /// Create error for failed authentication.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Auth(message.into()),
        }
    }

    /// Create error for malformed or unexpected wire data.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Protocol(message.into()),
        }
    }

    /// Create error for an unsupported type or value.
    #[must_use]
    pub fn unsupported_type(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::UnsupportedType(message.into()),
        }
    }

    /// Create error for a concurrent request on a busy session.
    #[must_use]
    pub const fn session_busy() -> Self {
        Self {
            kind: ErrorKind::SessionBusy,
        }
    }

    /// Create error for use of a closed session or pool.
    #[must_use]
    pub const fn closed() -> Self {
        Self {
            kind: ErrorKind::Closed,
        }
    }

    /// Create error for a rejected state transition.
    #[must_use]
    pub const fn invalid_state(from: SessionState, to: SessionState) -> Self {
        Self {
            kind: ErrorKind::InvalidState { from, to },
        }
    }

    /// Create error for an expired pool wait.
    #[must_use]
    pub const fn pool_timeout(waited: Duration) -> Self {
        Self {
            kind: ErrorKind::PoolTimeout(waited),
        }
    }

    /// Create error for a full pool when waiting was not allowed.
    #[must_use]
    pub const fn pool_exhausted() -> Self {
        Self {
            kind: ErrorKind::PoolExhausted,
        }
    }

    /// Create error carrying a server-reported failure.
    #[must_use]
    pub const fn statement(error: ServerError) -> Self {
        Self {
            kind: ErrorKind::Statement(error),
        }
    }

    /// Create error for caller misuse of the API.
    #[must_use]
    pub fn interface(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Interface(message.into()),
        }
    }

    /// Create error for invalid configuration.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Config(message.into()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Predicate Methods (is_xxx)
    // ═══════════════════════════════════════════════════════════════════════

    /// Returns true if the transport could not be established.
    #[must_use]
    pub const fn is_connect(&self) -> bool {
        matches!(self.kind, ErrorKind::Connect { .. })
    }

    /// Returns true if this is a TLS error.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.kind, ErrorKind::Tls(_))
    }

    /// Returns true if this is a transport I/O error.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self.kind, ErrorKind::Io(_))
    }

    /// Returns true if a blocking operation timed out.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout(_))
    }

    /// Returns true if no protocol version could be agreed.
    #[must_use]
    pub const fn is_version_mismatch(&self) -> bool {
        matches!(self.kind, ErrorKind::VersionMismatch(_))
    }

    /// Returns true if authentication failed.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self.kind, ErrorKind::Auth(_))
    }

    /// Returns true if this is a protocol error.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self.kind, ErrorKind::Protocol(_))
    }

    /// Returns true if a value or type tag is unsupported.
    #[must_use]
    pub const fn is_unsupported_type(&self) -> bool {
        matches!(self.kind, ErrorKind::UnsupportedType(_))
    }

    /// Returns true if the session already had a request in flight.
    #[must_use]
    pub const fn is_session_busy(&self) -> bool {
        matches!(self.kind, ErrorKind::SessionBusy)
    }

    /// Returns true if the session or pool was closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::Closed)
    }

    /// Returns true if a state transition was rejected.
    #[must_use]
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidState { .. })
    }

    /// Returns true if a pool wait expired.
    #[must_use]
    pub const fn is_pool_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::PoolTimeout(_))
    }

    /// Returns true if the pool was full and waiting was not allowed.
    #[must_use]
    pub const fn is_pool_exhausted(&self) -> bool {
        matches!(self.kind, ErrorKind::PoolExhausted)
    }

    /// Returns true if the server rejected a statement.
    #[must_use]
    pub const fn is_statement(&self) -> bool {
        matches!(self.kind, ErrorKind::Statement(_))
    }

    /// Returns true if the API was misused.
    #[must_use]
    pub const fn is_interface(&self) -> bool {
        matches!(self.kind, ErrorKind::Interface(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self.kind, ErrorKind::Config(_))
    }

    /// Returns true if the session that produced this error can no longer be
    /// used: the transport is broken or the byte stream is out of sync.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Connect { .. }
                | ErrorKind::Tls(_)
                | ErrorKind::Io(_)
                | ErrorKind::Timeout(_)
                | ErrorKind::Protocol(_)
        )
    }

    /// The server-reported error, if this is a statement error.
    #[must_use]
    pub const fn server_error(&self) -> Option<&ServerError> {
        match &self.kind {
            ErrorKind::Statement(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::timeout(err.to_string()),
            _ => Self {
                kind: ErrorKind::Io(err),
            },
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::tls(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::config(format!("invalid connection URL: {err}"))
    }
}

/// Result type alias for thinwire operations.
pub type Result<T> = std::result::Result<T, Error>;
