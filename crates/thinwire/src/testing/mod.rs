//! In-process server speaking the wire protocol, for tests.
//!
//! [`MockServer`] listens on an ephemeral loopback port and serves each
//! connection on its own thread with the crate's own framer and codec. It
//! negotiates, runs both authentication phases, keeps cursors, holds rows in
//! per-connection transactions and sends a break marker before reporting a
//! missing table.

mod engine;

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rand::RngCore;
use tracing::debug;

use self::engine::{Database, Failure, Outcome, PendingRow, Plan};
use crate::buffer::WriteBuffer;
use crate::codec::connect::{capability, refuse_reason};
use crate::codec::message::find_parameter;
use crate::codec::{
    AcceptResponse, ColumnInfo, ConnectRequest, ExecuteOptions, ExecuteRequest, Parameter,
    RefuseResponse, Request, Response, Row, Status, VERSION_MAX, VERSION_MIN,
};
use crate::config::{AuthMode, ConnectDescriptor, Credentials, MAX_SDU};
use crate::error::{Error, Result, ServerError};
use crate::packet::{Framer, MarkerKind, PacketType, Received};
use crate::session::{
    INVALID_CREDENTIALS, auth_keys, auth_message, salted_password, server_signature, stored_key,
    verify_client_proof,
};
use crate::transport::{Transport, TransportCloser};

const NOT_LOGGED_ON: u32 = 1012;

/// Behaviour of a [`MockServer`].
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub service: String,
    pub username: String,
    pub password: String,
    pub version_min: u16,
    pub version_max: u16,
    pub sdu: u32,
    pub capabilities: u32,
    pub iterations: u32,
    pub banner: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            service: "testdb".into(),
            username: "scott".into(),
            password: "tiger".into(),
            version_min: VERSION_MIN,
            version_max: VERSION_MAX,
            sdu: 8192,
            capabilities: capability::CLIENT,
            iterations: 1000,
            banner: "Mock Database 23.4.0".into(),
        }
    }
}

struct Shared {
    config: MockConfig,
    database: Database,
    connections: Mutex<Vec<TransportCloser>>,
    accepted: AtomicUsize,
    parses: AtomicUsize,
    open_cursors: AtomicUsize,
    next_session: AtomicU32,
    next_transaction: AtomicU32,
    shutdown: AtomicBool,
}

/// A listening mock server; stops accepting and drops its connections when
/// dropped.
pub struct MockServer {
    shared: Arc<Shared>,
    address: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer")
            .field("address", &self.address)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl MockServer {
    /// Start with the default configuration.
    pub fn start() -> Result<Self> {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let address = listener.local_addr()?;
        let shared = Arc::new(Shared {
            config,
            database: Database::default(),
            connections: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            parses: AtomicUsize::new(0),
            open_cursors: AtomicUsize::new(0),
            next_session: AtomicU32::new(100),
            next_transaction: AtomicU32::new(1),
            shutdown: AtomicBool::new(false),
        });

        let accept_shared = Arc::clone(&shared);
        let acceptor = std::thread::Builder::new()
            .name("mock-acceptor".into())
            .spawn(move || accept_loop(&listener, &accept_shared))?;
        debug!(%address, "mock server listening");
        Ok(Self {
            shared,
            address,
            acceptor: Some(acceptor),
        })
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Descriptor pointing at this server's service.
    #[must_use]
    pub fn descriptor(&self) -> ConnectDescriptor {
        ConnectDescriptor::new(
            self.address.ip().to_string(),
            self.address.port(),
            self.shared.config.service.clone(),
        )
    }

    /// Credentials the server accepts.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            self.shared.config.username.clone(),
            self.shared.config.password.clone(),
        )
    }

    /// Connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.accepted.load(Ordering::Acquire)
    }

    /// Statements parsed so far, over all connections.
    #[must_use]
    pub fn parse_count(&self) -> usize {
        self.shared.parses.load(Ordering::Acquire)
    }

    /// Server cursors currently open, over all connections.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.shared.open_cursors.load(Ordering::Acquire)
    }

    /// Drop every open connection, as a server restart would.
    pub fn kill_connections(&self) {
        let closers = std::mem::take(&mut *self.shared.connections.lock());
        debug!(count = closers.len(), "killing mock connections");
        for closer in closers {
            closer.close();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        // Wake the blocking accept.
        let _ = TcpStream::connect(self.address);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        self.kill_connections();
    }
}

fn accept_loop(listener: &TcpListener, shared: &Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let socket = match stream {
            Ok(socket) => socket,
            Err(err) => {
                debug!(error = %err, "mock accept failed");
                continue;
            }
        };
        let shared = Arc::clone(shared);
        let spawned = std::thread::Builder::new()
            .name("mock-connection".into())
            .spawn(move || {
                if let Err(err) = Connection::open(socket, shared).and_then(Connection::serve) {
                    debug!(error = %err, "mock connection ended");
                }
            });
        if let Err(err) = spawned {
            debug!(error = %err, "mock connection thread not started");
        }
    }
}

struct Login {
    username: String,
    mode: AuthMode,
    salt: Vec<u8>,
    server_nonce: Vec<u8>,
}

struct ServerCursor {
    plan: Plan,
    columns: Vec<ColumnInfo>,
    remaining: VecDeque<Row>,
    sent: u64,
}

struct Reply {
    response: Response,
    columns: Option<Vec<ColumnInfo>>,
    interrupt: bool,
    hang_up: bool,
}

impl Reply {
    fn ok(response: Response) -> Self {
        Self {
            response,
            columns: None,
            interrupt: false,
            hang_up: false,
        }
    }

    fn error(call_id: u8, failure: Failure) -> Self {
        let mut response = Response::new(call_id);
        response.error = Some(failure.error);
        Self {
            interrupt: failure.interrupt,
            ..Self::ok(response)
        }
    }
}

struct Connection {
    shared: Arc<Shared>,
    framer: Framer,
    buffer: WriteBuffer,
    login: Option<Login>,
    authenticated: bool,
    cursors: HashMap<u32, ServerCursor>,
    next_cursor: u32,
    pending: Vec<PendingRow>,
    transaction_id: u32,
}

impl Connection {
    fn open(socket: TcpStream, shared: Arc<Shared>) -> Result<Self> {
        let framer = Framer::new(Transport::from_stream(socket, None)?, MAX_SDU);
        shared.connections.lock().push(framer.closer());
        shared.accepted.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            shared,
            framer,
            buffer: WriteBuffer::default(),
            login: None,
            authenticated: false,
            cursors: HashMap::new(),
            next_cursor: 0,
            pending: Vec::new(),
            transaction_id: 0,
        })
    }

    fn serve(mut self) -> Result<()> {
        let result = self.run();
        self.shared
            .open_cursors
            .fetch_sub(self.cursors.len(), Ordering::AcqRel);
        result
    }

    fn run(&mut self) -> Result<()> {
        self.negotiate()?;
        loop {
            let payload = match self.framer.receive()? {
                Received::Message {
                    packet_type: PacketType::Data,
                    payload,
                } => payload,
                Received::Marker(_) => continue,
                Received::Message { packet_type, .. } => {
                    return Err(Error::protocol(format!("unexpected {packet_type:?} packet")));
                }
            };
            let (call_id, request) = Request::decode(&payload)?;
            let before = self.cursors.len();
            let reply = self.handle(call_id, request);
            let after = self.cursors.len();
            if after > before {
                self.shared
                    .open_cursors
                    .fetch_add(after - before, Ordering::AcqRel);
            } else {
                self.shared
                    .open_cursors
                    .fetch_sub(before - after, Ordering::AcqRel);
            }

            if reply.interrupt {
                self.framer.send_marker(MarkerKind::Break)?;
                while self.framer.receive()? != Received::Marker(MarkerKind::Reset) {}
            }
            self.buffer.clear();
            reply
                .response
                .encode(reply.columns.as_deref(), &mut self.buffer)?;
            self.framer.send_message(PacketType::Data, self.buffer.as_slice())?;
            if reply.hang_up {
                self.framer.close();
                return Ok(());
            }
        }
    }

    fn negotiate(&mut self) -> Result<()> {
        let payload = match self.framer.receive()? {
            Received::Message {
                packet_type: PacketType::Connect,
                payload,
            } => payload,
            other => return Err(Error::protocol(format!("expected connect, got {other:?}"))),
        };
        let request = ConnectRequest::decode(&payload)?;
        let config = &self.shared.config;
        let version = request.version_max.min(config.version_max);

        let mut buf = WriteBuffer::default();
        let refusal = if version < request.version_min.max(config.version_min) {
            Some(RefuseResponse {
                reason: refuse_reason::VERSION_MISMATCH,
                message: format!(
                    "server supports {}..={}",
                    config.version_min, config.version_max
                ),
            })
        } else if request.service != config.service {
            Some(RefuseResponse {
                reason: refuse_reason::UNKNOWN_SERVICE,
                message: format!("unknown service {}", request.service),
            })
        } else {
            None
        };
        if let Some(refusal) = refusal {
            refusal.encode(&mut buf)?;
            self.framer.send_message(PacketType::Refuse, buf.as_slice())?;
            return Err(Error::connect("mock", refusal.message));
        }

        let accept = AcceptResponse {
            version,
            sdu: config.sdu.min(request.sdu),
            capabilities: config.capabilities & request.capabilities,
        };
        accept.encode(&mut buf);
        self.framer.send_message(PacketType::Accept, buf.as_slice())?;
        self.framer.set_sdu(accept.sdu);
        Ok(())
    }

    fn handle(&mut self, call_id: u8, request: Request) -> Reply {
        let authenticating = matches!(
            request,
            Request::AuthPhaseOne { .. } | Request::AuthPhaseTwo { .. }
        );
        if !self.authenticated && !authenticating {
            return Reply::error(
                call_id,
                ServerError::new(NOT_LOGGED_ON, "not logged on").into(),
            );
        }

        let mut response = Response::new(call_id);
        match request {
            Request::AuthPhaseOne {
                username, mode, ..
            } => {
                let mut salt = vec![0u8; 16];
                let mut server_nonce = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut salt);
                rand::thread_rng().fill_bytes(&mut server_nonce);
                if mode == AuthMode::ChallengeResponse {
                    response.parameters = vec![
                        Parameter::new(auth_keys::SALT, salt.clone()),
                        Parameter::new(
                            auth_keys::ITERATIONS,
                            self.shared.config.iterations.to_string(),
                        ),
                        Parameter::new(auth_keys::SERVER_NONCE, server_nonce.clone()),
                    ];
                }
                self.login = Some(Login {
                    username,
                    mode,
                    salt,
                    server_nonce,
                });
            }
            Request::AuthPhaseTwo { parameters } => match self.verify_login(&parameters) {
                Ok(accepted) => {
                    self.authenticated = true;
                    response.parameters = accepted;
                }
                Err(error) => return Reply::error(call_id, error.into()),
            },
            Request::Execute(execute) => return self.execute(call_id, execute),
            Request::Fetch {
                cursor_id,
                max_rows,
            } => {
                let Some(cursor) = self.cursors.get_mut(&cursor_id) else {
                    return Reply::error(call_id, invalid_cursor(cursor_id));
                };
                let take = (max_rows as usize).min(cursor.remaining.len());
                response.rows = cursor.remaining.drain(..take).collect();
                cursor.sent += take as u64;
                response.status = Some(Status {
                    cursor_id,
                    row_count: cursor.sent,
                    end_of_data: cursor.remaining.is_empty(),
                    transaction_id: self.transaction_id,
                    row_counts: Vec::new(),
                });
                return Reply {
                    columns: Some(cursor.columns.clone()),
                    ..Reply::ok(response)
                };
            }
            Request::CloseCursors { cursor_ids } => {
                for id in cursor_ids {
                    self.cursors.remove(&id);
                }
            }
            Request::Commit => self.commit(),
            Request::Rollback => {
                self.pending.clear();
                self.transaction_id = 0;
            }
            Request::Ping => {}
            Request::Logoff => {
                self.pending.clear();
                return Reply {
                    hang_up: true,
                    ..Reply::ok(response)
                };
            }
            Request::LobRead {
                locator,
                offset,
                amount,
            } => match self.shared.database.read_lob(&locator, offset, amount) {
                Ok(data) => response.lob_data = Some(data),
                Err(error) => return Reply::error(call_id, error.into()),
            },
        }
        Reply::ok(response)
    }

    fn verify_login(&self, parameters: &[Parameter]) -> std::result::Result<Vec<Parameter>, ServerError> {
        let denied = || ServerError::new(INVALID_CREDENTIALS, "invalid username/password; logon denied");
        let config = &self.shared.config;
        let login = self.login.as_ref().ok_or_else(denied)?;
        if !login.username.eq_ignore_ascii_case(&config.username) {
            return Err(denied());
        }

        let mut accepted = Vec::new();
        match login.mode {
            AuthMode::Plain => {
                let password = find_parameter(parameters, auth_keys::PASSWORD).ok_or_else(denied)?;
                if password != config.password.as_bytes() {
                    return Err(denied());
                }
            }
            AuthMode::ChallengeResponse => {
                let client_nonce =
                    find_parameter(parameters, auth_keys::CLIENT_NONCE).ok_or_else(denied)?;
                let proof = find_parameter(parameters, auth_keys::PROOF).ok_or_else(denied)?;
                let salted = salted_password(&config.password, &login.salt, config.iterations);
                let message = auth_message(&login.username, &login.server_nonce, client_nonce);
                let stored = stored_key(&salted).map_err(|_| denied())?;
                if !verify_client_proof(&stored, &message, proof) {
                    return Err(denied());
                }
                let signature = server_signature(&salted, &message).map_err(|_| denied())?;
                accepted.push(Parameter::new(auth_keys::SERVER_SIGNATURE, signature.to_vec()));
            }
        }

        let session_id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        accepted.extend([
            Parameter::new(auth_keys::SESSION_ID, session_id.to_string()),
            Parameter::new(auth_keys::SERIAL, "1"),
            Parameter::new(auth_keys::CHARSET, "873"),
            Parameter::new(auth_keys::NCHARSET, "2000"),
            Parameter::new(auth_keys::VERSION, config.banner.clone()),
        ]);
        Ok(accepted)
    }

    fn commit(&mut self) {
        self.shared
            .database
            .commit(std::mem::take(&mut self.pending));
        self.transaction_id = 0;
    }

    fn execute(&mut self, call_id: u8, request: ExecuteRequest) -> Reply {
        for id in &request.close_cursor_ids {
            self.cursors.remove(id);
        }
        let options = request.options;

        let existing = match request.cursor_id {
            0 => None,
            id => match self.cursors.remove(&id) {
                Some(cursor) => Some(cursor),
                None => return Reply::error(call_id, invalid_cursor(id)),
            },
        };
        let mut cursor = if options.contains(ExecuteOptions::PARSE) {
            let Some(sql) = request.sql.as_deref() else {
                return Reply::error(
                    call_id,
                    ServerError::new(engine::INVALID_SQL, "parse requested without SQL text").into(),
                );
            };
            self.shared.parses.fetch_add(1, Ordering::AcqRel);
            match engine::parse(sql) {
                Ok(plan) => ServerCursor {
                    plan,
                    columns: Vec::new(),
                    remaining: VecDeque::new(),
                    sent: 0,
                },
                Err(error) => return Reply::error(call_id, error.into()),
            }
        } else {
            match existing {
                Some(cursor) => cursor,
                None => return Reply::error(call_id, invalid_cursor(0)),
            }
        };
        let cursor_id = match request.cursor_id {
            0 => {
                self.next_cursor += 1;
                self.next_cursor
            }
            id => id,
        };

        let outcome = match self
            .shared
            .database
            .run(&cursor.plan, &request, &mut self.pending)
        {
            Ok(outcome) => outcome,
            Err(failure) => {
                // A failed re-execute keeps the parsed cursor.
                if request.cursor_id != 0 {
                    self.cursors.insert(cursor_id, cursor);
                }
                return Reply::error(call_id, failure);
            }
        };

        let mut response = Response::new(call_id);
        let mut status = Status {
            cursor_id,
            ..Status::default()
        };
        match outcome {
            Outcome::Rows { columns, rows } => {
                debug_assert!(cursor.plan.is_query());
                cursor.columns = columns;
                cursor.remaining = rows.into();
                cursor.sent = 0;
                if options.contains(ExecuteOptions::DESCRIBE) {
                    response.columns = Some(cursor.columns.clone());
                }
                if options.contains(ExecuteOptions::FETCH) {
                    let take = (request.prefetch_rows as usize).min(cursor.remaining.len());
                    response.rows = cursor.remaining.drain(..take).collect();
                    cursor.sent = take as u64;
                }
                status.row_count = cursor.sent;
                status.end_of_data = cursor.remaining.is_empty();
            }
            Outcome::Affected { row_counts, errors } => {
                status.row_count = row_counts.iter().sum();
                if status.row_count > 0 && self.transaction_id == 0 {
                    self.transaction_id = self.shared.next_transaction.fetch_add(1, Ordering::Relaxed);
                }
                if options.contains(ExecuteOptions::DML_ROWCOUNTS) {
                    status.row_counts = row_counts;
                }
                response.batch_errors = errors;
                status.end_of_data = true;
                if options.contains(ExecuteOptions::COMMIT) {
                    self.commit();
                }
            }
        }
        status.transaction_id = self.transaction_id;
        response.status = Some(status);

        let columns = Some(cursor.columns.clone());
        self.cursors.insert(cursor_id, cursor);
        Reply {
            columns,
            ..Reply::ok(response)
        }
    }
}

fn invalid_cursor(cursor_id: u32) -> Failure {
    ServerError::new(engine::INVALID_CURSOR, format!("invalid cursor {cursor_id}")).into()
}
