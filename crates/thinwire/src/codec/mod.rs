//! Message codec: negotiation payloads, function call requests, multi-item
//! responses and the typed value encodings they carry.

pub mod connect;
pub mod message;
pub mod number;
pub mod temporal;
pub mod types;

pub use connect::{AcceptResponse, ConnectRequest, RefuseResponse, VERSION_MAX, VERSION_MIN};
pub use message::{
    BatchError, ExecuteOptions, ExecuteRequest, FunctionCode, Parameter, Request, Response,
    ServerWarning, Status,
};
pub use types::{BindDescriptor, CharsetForm, ColumnInfo, DbType, LobLocator, Row, Value};
