//! Session lifecycle: negotiation, authentication and request/response
//! correlation on one connection.
//!
//! A [`Session`] is shared by reference (`&self`); at most one request is in
//! flight. The state field is the single source of truth: a call switches it
//! `Ready -> Executing` atomically and any concurrent caller gets
//! [`SessionBusy`](crate::Error::is_session_busy). Transport, protocol and
//! timeout failures move the session to `Error` and close the transport.

mod auth;
mod state;

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

pub use self::state::SessionState;
use crate::buffer::WriteBuffer;
use crate::codec::connect::{capability, refuse_reason};
use crate::codec::{
    AcceptResponse, ColumnInfo, ConnectRequest, LobLocator, RefuseResponse, Request, Response,
    VERSION_MAX, VERSION_MIN,
};
use crate::config::{ConnectDescriptor, Credentials, MIN_SDU, SessionOptions};
use crate::error::{Error, Result};
use crate::packet::{Framer, MarkerKind, PacketType, Received};
use crate::statement::{CursorTable, StatementCache};
use crate::statistics::SessionStatistics;
use crate::transport::{Transport, TransportCloser};

#[cfg(any(test, feature = "test-utils"))]
pub(crate) use self::auth::{
    INVALID_CREDENTIALS, auth_message, keys as auth_keys, salted_password, server_signature,
    stored_key, verify_client_proof,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// What negotiation and authentication established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Negotiated protocol version.
    pub protocol_version: u16,
    /// Negotiated maximum packet size.
    pub sdu: u32,
    /// Capabilities both sides support.
    pub capabilities: u32,
    /// Server-side session id.
    pub session_id: u32,
    pub serial: u32,
    /// Charset id of the database character set.
    pub charset: u16,
    /// Charset id of the national character set.
    pub ncharset: u16,
    /// Server version banner.
    pub version: String,
}

impl ServerInfo {
    #[must_use]
    pub const fn supports(&self, capability: u32) -> bool {
        self.capabilities & capability == capability
    }
}

/// State touched only by the request in flight.
pub(crate) struct SessionIo {
    pub(crate) framer: Framer,
    buffer: WriteBuffer,
    call_id: u8,
    pub(crate) cursors: CursorTable,
    pub(crate) cache: StatementCache,
    /// Server cursors to release with the next execute.
    pub(crate) pending_close: Vec<u32>,
}

impl SessionIo {
    fn new(framer: Framer, options: &SessionOptions) -> Self {
        let sdu = framer.sdu() as usize;
        Self {
            framer,
            buffer: WriteBuffer::with_capacity(sdu),
            call_id: 0,
            cursors: CursorTable::default(),
            cache: StatementCache::new(options.statement_cache_size),
            pending_close: Vec::new(),
        }
    }

    const fn next_call_id(&mut self) -> u8 {
        self.call_id = self.call_id.wrapping_add(1);
        if self.call_id == 0 {
            self.call_id = 1;
        }
        self.call_id
    }

    /// Send one request and read its reply, answering break markers on the
    /// way. Row data is decoded against `columns` when the reply carries no
    /// describe of its own.
    pub(crate) fn round_trip(
        &mut self,
        request: &Request,
        columns: Option<&[ColumnInfo]>,
    ) -> Result<(Response, Duration)> {
        let call_id = self.next_call_id();
        self.buffer.clear();
        request.encode(call_id, &mut self.buffer)?;

        let (mut reply, mut waited) =
            self.framer.exchange(PacketType::Data, self.buffer.as_slice())?;
        let payload = loop {
            match reply {
                Received::Message {
                    packet_type: PacketType::Data,
                    payload,
                } => break payload,
                Received::Message { packet_type, .. } => {
                    return Err(Error::protocol(format!(
                        "unexpected {packet_type:?} packet during a call"
                    )));
                }
                Received::Marker(kind) => {
                    let started = std::time::Instant::now();
                    if kind == MarkerKind::Break {
                        debug!(call_id, "server sent break, resetting");
                        self.framer.send_marker(MarkerKind::Reset)?;
                    }
                    reply = self.framer.receive()?;
                    waited += started.elapsed();
                }
            }
        };

        let response = Response::decode(&payload, columns)?;
        if response.call_id != call_id {
            return Err(Error::protocol(format!(
                "reply for call {} while call {call_id} is outstanding",
                response.call_id
            )));
        }
        trace!(call_id, function = ?request.function(), ?waited, "round trip");
        Ok((response, waited))
    }
}

/// Exclusive access for one call. Dropping it returns the session to
/// `Ready`, or to `Error` after a fatal failure.
pub(crate) struct CallGuard<'a> {
    session: &'a Session,
    pub(crate) io: MutexGuard<'a, SessionIo>,
    failed: bool,
}

impl CallGuard<'_> {
    /// Round trip with statistics and fatal-error tracking. Server errors are
    /// returned as `Err` and leave the session usable.
    pub(crate) fn call(
        &mut self,
        request: &Request,
        columns: Option<&[ColumnInfo]>,
    ) -> Result<Response> {
        match self.io.round_trip(request, columns) {
            Ok((response, waited)) => {
                {
                    let mut stats = self.session.stats.lock();
                    stats.record_call(waited);
                    stats.transfer = self.io.framer.counters();
                }
                #[cfg(feature = "metrics")]
                crate::metrics::record_round_trip(request.function(), waited);
                debug!(
                    session = self.session.id,
                    function = ?request.function(),
                    waited_us = waited.as_micros() as u64,
                    "call completed"
                );
                let response = response.into_result()?;
                if let Some(status) = &response.status {
                    self.session
                        .transaction
                        .store(status.transaction_id, Ordering::Release);
                }
                Ok(response)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.failed = true;
                }
                Err(err)
            }
        }
    }

    pub(crate) const fn session_id(&self) -> u64 {
        self.session.id
    }

    pub(crate) fn options(&self) -> &SessionOptions {
        &self.session.options
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.failed {
            self.io.framer.close();
            self.session.mark_failed();
        } else {
            let mut state = self.session.state.lock();
            if *state == SessionState::Executing {
                *state = SessionState::Ready;
            }
        }
    }
}

/// One authenticated connection to the server.
pub struct Session {
    id: u64,
    state: Mutex<SessionState>,
    io: Mutex<SessionIo>,
    info: OnceLock<ServerInfo>,
    transaction: AtomicU32,
    stats: Mutex<SessionStatistics>,
    closer: TransportCloser,
    options: SessionOptions,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("server", &self.info.get())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open the transport, negotiate and authenticate.
    ///
    /// # Errors
    ///
    /// `Connect`, `Tls`, `Timeout`, `VersionMismatch`, `Auth` or `Protocol`;
    /// the transport is closed on every failure.
    pub fn connect(
        descriptor: &ConnectDescriptor,
        credentials: &Credentials,
        options: &SessionOptions,
    ) -> Result<Self> {
        let transport = Transport::open(descriptor, options)?;
        let session = Self::with_transport(transport, options.clone());
        match session.establish(descriptor, credentials) {
            Ok(()) => {
                let server = session.server_info();
                info!(
                    session = session.id,
                    address = %descriptor.address(),
                    service = descriptor.service(),
                    protocol_version = server.map(|s| s.protocol_version),
                    sdu = server.map(|s| s.sdu),
                    "session established"
                );
                Ok(session)
            }
            Err(err) => {
                warn!(address = %descriptor.address(), error = %err, "session setup failed");
                session.io.lock().framer.close();
                session.mark_failed();
                Err(err)
            }
        }
    }

    fn with_transport(transport: Transport, options: SessionOptions) -> Self {
        let framer = Framer::new(transport, options.effective_sdu());
        let closer = framer.closer();
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SessionState::Disconnected),
            io: Mutex::new(SessionIo::new(framer, &options)),
            info: OnceLock::new(),
            transaction: AtomicU32::new(0),
            stats: Mutex::new(SessionStatistics::default()),
            closer,
            options,
        }
    }

    fn establish(&self, descriptor: &ConnectDescriptor, credentials: &Credentials) -> Result<()> {
        self.transition(SessionState::Negotiating)?;
        let mut io = self.io.lock();
        let accept = negotiate(&mut io.framer, descriptor, &self.options)?;

        self.transition(SessionState::Authenticating)?;
        let outcome = auth::authenticate(&mut io, credentials, &self.options)?;
        {
            let mut stats = self.stats.lock();
            stats.transfer = io.framer.counters();
        }
        drop(io);

        let _ = self.info.set(ServerInfo {
            protocol_version: accept.version,
            sdu: accept.sdu,
            capabilities: accept.capabilities,
            session_id: outcome.session_id,
            serial: outcome.serial,
            charset: outcome.charset,
            ncharset: outcome.ncharset,
            version: outcome.banner,
        });
        self.transition(SessionState::Ready)?;
        Ok(())
    }

    fn transition(&self, next: SessionState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(Error::invalid_state(*state, next));
        }
        trace!(session = self.id, from = %*state, to = %next, "state transition");
        *state = next;
        Ok(())
    }

    fn mark_failed(&self) {
        let mut state = self.state.lock();
        if state.can_transition_to(SessionState::Error) {
            warn!(session = self.id, from = %*state, "session failed");
            *state = SessionState::Error;
            #[cfg(feature = "metrics")]
            crate::metrics::record_session_error("fatal");
        }
    }

    /// Claim the session for one call.
    pub(crate) fn begin(&self) -> Result<CallGuard<'_>> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Ready => *state = SessionState::Executing,
                SessionState::Closing | SessionState::Closed => return Err(Error::closed()),
                busy if busy.is_busy() => return Err(Error::session_busy()),
                other => return Err(Error::invalid_state(other, SessionState::Executing)),
            }
        }
        Ok(CallGuard {
            session: self,
            io: self.io.lock(),
            failed: false,
        })
    }

    /// Round trip with no payload, used to validate liveness.
    pub fn ping(&self) -> Result<()> {
        self.begin()?.call(&Request::Ping, None).map(drop)
    }

    pub fn commit(&self) -> Result<()> {
        self.begin()?.call(&Request::Commit, None)?;
        self.transaction.store(0, Ordering::Release);
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.begin()?.call(&Request::Rollback, None)?;
        self.transaction.store(0, Ordering::Release);
        Ok(())
    }

    /// Read `amount` bytes (BLOB) or characters (CLOB) starting at the
    /// zero-based `offset`. Fewer are returned at the end of the object.
    pub fn read_lob(&self, locator: &LobLocator, offset: u64, amount: u64) -> Result<Vec<u8>> {
        let response = self.begin()?.call(
            &Request::LobRead {
                locator: locator.locator.clone(),
                offset,
                amount,
            },
            None,
        )?;
        Ok(response.lob_data.unwrap_or_default())
    }

    /// Read a whole large object in chunk-sized pieces.
    pub fn read_lob_to_end(&self, locator: &LobLocator) -> Result<Vec<u8>> {
        let chunk = u64::from(locator.chunk_size.max(1));
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < locator.size {
            let piece = self.read_lob(locator, offset, chunk.min(locator.size - offset))?;
            if piece.is_empty() {
                break;
            }
            offset += chunk;
            out.extend_from_slice(&piece);
        }
        Ok(out)
    }

    /// Log off and close the transport. Closing a closed session is a no-op.
    ///
    /// # Errors
    ///
    /// `SessionBusy` while a call is in flight (use [`Session::closer`] to
    /// interrupt it). A failed logoff is reported after the transport is
    /// closed.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Closed => return Ok(()),
                SessionState::Error => {
                    *state = SessionState::Closed;
                    drop(state);
                    self.closer.close();
                    return Ok(());
                }
                current if current.can_transition_to(SessionState::Closing) => {
                    *state = SessionState::Closing;
                }
                _ => return Err(Error::session_busy()),
            }
        }

        let mut io = self.io.lock();
        let logoff = io.round_trip(&Request::Logoff, None).and_then(|(r, _)| r.into_result());
        io.framer.close();
        *self.state.lock() = SessionState::Closed;
        drop(io);

        info!(session = self.id, "session closed");
        logoff.map(drop)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Process-unique id, carried by cursor handles.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Server-side session id, once authenticated.
    #[must_use]
    pub fn session_id(&self) -> Option<u32> {
        self.info.get().map(|i| i.session_id)
    }

    /// Server version banner, once authenticated.
    #[must_use]
    pub fn server_version(&self) -> Option<&str> {
        self.info.get().map(|i| i.version.as_str())
    }

    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.info.get()
    }

    /// Server transaction id; zero when no transaction is open.
    #[must_use]
    pub fn transaction_id(&self) -> u32 {
        self.transaction.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction_id() != 0
    }

    #[must_use]
    pub fn statistics(&self) -> SessionStatistics {
        *self.stats.lock()
    }

    /// Handle that aborts a blocked call from another thread by closing the
    /// socket. The interrupted call fails and the session moves to `Error`.
    #[must_use]
    pub fn closer(&self) -> TransportCloser {
        self.closer.clone()
    }

    #[must_use]
    pub const fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Read call state, waiting for an in-flight call to finish.
    pub(crate) fn io_snapshot<T>(&self, f: impl FnOnce(&SessionIo) -> T) -> T {
        f(&self.io.lock())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if *self.state.get_mut() != SessionState::Closed {
            self.closer.close();
        }
    }
}

fn negotiate(
    framer: &mut Framer,
    descriptor: &ConnectDescriptor,
    options: &SessionOptions,
) -> Result<AcceptResponse> {
    let requested_sdu = options.effective_sdu();
    let request = ConnectRequest {
        version_min: VERSION_MIN,
        version_max: VERSION_MAX,
        sdu: requested_sdu,
        capabilities: capability::CLIENT,
        service: descriptor.service().to_string(),
    };
    let mut buf = WriteBuffer::default();
    request.encode(&mut buf)?;

    match framer.exchange(PacketType::Connect, buf.as_slice())?.0 {
        Received::Message {
            packet_type: PacketType::Accept,
            payload,
        } => {
            let accept = AcceptResponse::decode(&payload)?;
            if !(VERSION_MIN..=VERSION_MAX).contains(&accept.version) {
                return Err(Error::protocol(format!(
                    "server chose version {} outside the offered {VERSION_MIN}..={VERSION_MAX}",
                    accept.version
                )));
            }
            if accept.sdu < MIN_SDU {
                return Err(Error::protocol(format!(
                    "server SDU {} is below the minimum {MIN_SDU}",
                    accept.sdu
                )));
            }
            let negotiated = AcceptResponse {
                version: accept.version,
                sdu: accept.sdu.min(requested_sdu),
                capabilities: accept.capabilities & capability::CLIENT,
            };
            framer.set_sdu(negotiated.sdu);
            debug!(
                version = negotiated.version,
                sdu = negotiated.sdu,
                capabilities = negotiated.capabilities,
                "negotiated"
            );
            Ok(negotiated)
        }
        Received::Message {
            packet_type: PacketType::Refuse,
            payload,
        } => {
            let refuse = RefuseResponse::decode(&payload)?;
            if refuse.reason == refuse_reason::VERSION_MISMATCH {
                Err(Error::version_mismatch(format!(
                    "client speaks {VERSION_MIN}..={VERSION_MAX}: {}",
                    refuse.message
                )))
            } else {
                Err(Error::connect(descriptor.address(), refuse.message))
            }
        }
        Received::Message { packet_type, .. } => Err(Error::protocol(format!(
            "unexpected {packet_type:?} packet during negotiation"
        ))),
        Received::Marker(kind) => Err(Error::protocol(format!(
            "unexpected {kind:?} marker during negotiation"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_capabilities() {
        let info = ServerInfo {
            protocol_version: 319,
            sdu: 8192,
            capabilities: capability::BATCH_ERRORS | capability::MARKERS,
            session_id: 1,
            serial: 1,
            charset: 873,
            ncharset: 2000,
            version: String::new(),
        };
        assert!(info.supports(capability::MARKERS));
        assert!(!info.supports(capability::LOB_READ));
    }
}
