//! Blocking byte-stream transport: plain TCP or TLS over TCP.
//!
//! Every read and write is bounded by the session's network timeout. A blocked
//! [`Transport::receive`] can be interrupted from another thread through a
//! [`TransportCloser`], which shuts the socket down underneath it.

mod tls;

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{ConnectDescriptor, SessionOptions};
use crate::error::{Error, Result};

enum Stream {
    Plain(TcpStream),
    Tls(Box<tls::TlsStream>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// Handle that shuts a transport down from any thread.
#[derive(Debug, Clone)]
pub struct TransportCloser {
    socket: Arc<TcpStream>,
}

impl TransportCloser {
    /// Shut down both directions. Blocked reads and writes fail promptly.
    pub fn close(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            debug!(error = %e, "socket shutdown failed");
        }
    }
}

/// A connected byte stream.
pub struct Transport {
    stream: Stream,
    peer: SocketAddr,
    closer: TransportCloser,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl Transport {
    /// Connect to the descriptor's address, wrapping the stream in TLS when
    /// encryption is on.
    pub fn open(descriptor: &ConnectDescriptor, options: &SessionOptions) -> Result<Self> {
        let address = descriptor.address();
        let candidates = address
            .to_socket_addrs()
            .map_err(|e| Error::connect(&address, e))?;

        let mut last_error = None;
        let mut connected = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, options.connect_timeout) {
                Ok(socket) => {
                    connected = Some(socket);
                    break;
                }
                Err(e) => {
                    debug!(%candidate, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        let socket = connected.ok_or_else(|| match last_error {
            Some(e) => Error::connect(&address, e),
            None => Error::connect(&address, "host resolved to no addresses"),
        })?;

        socket
            .set_nodelay(true)
            .map_err(|e| Error::connect(&address, e))?;

        if descriptor.security().encryption {
            // Bound the handshake by the connect timeout, then switch to the
            // network timeout for regular traffic.
            set_timeouts(&socket, Some(options.connect_timeout))
                .map_err(|e| Error::connect(&address, e))?;
            let closer = TransportCloser {
                socket: Arc::new(socket.try_clone().map_err(|e| Error::connect(&address, e))?),
            };
            let peer = socket.peer_addr().map_err(|e| Error::connect(&address, e))?;
            let stream = tls::connect(descriptor, socket)?;
            set_timeouts(stream.get_ref(), options.network_timeout)?;
            debug!(%peer, "TLS transport established");
            Ok(Self {
                stream: Stream::Tls(Box::new(stream)),
                peer,
                closer,
            })
        } else {
            Self::from_stream(socket, options.network_timeout)
                .map_err(|e| Error::connect(&address, e))
        }
    }

    /// Wrap an already connected plain socket.
    pub fn from_stream(socket: TcpStream, timeout: Option<Duration>) -> Result<Self> {
        set_timeouts(&socket, timeout)?;
        let peer = socket.peer_addr()?;
        let closer = TransportCloser {
            socket: Arc::new(socket.try_clone()?),
        };
        Ok(Self {
            stream: Stream::Plain(socket),
            peer,
            closer,
        })
    }

    /// Write all bytes.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read whatever is available, up to `max_len` bytes, blocking until at
    /// least one byte arrives. A closed peer is an I/O error.
    pub fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len.max(1)];
        let n = self.receive_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub(crate) fn receive_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("connection closed by {}", self.peer),
                    )
                    .into());
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close the stream, sending a TLS close notification first when
    /// encrypted.
    pub fn close(&mut self) {
        if let Stream::Tls(stream) = &mut self.stream {
            stream.conn.send_close_notify();
            if let Err(e) = stream.flush() {
                debug!(error = %e, "TLS close notification not delivered");
            }
        }
        self.closer.close();
    }

    /// Cancellation handle for this transport.
    #[must_use]
    pub fn closer(&self) -> TransportCloser {
        self.closer.clone()
    }

    /// Remote address.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True when the stream runs over TLS.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }
}

fn set_timeouts(socket: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    // A zero duration is rejected by the socket API; treat it as "no timeout".
    let timeout = timeout.filter(|t| !t.is_zero());
    socket.set_read_timeout(timeout)?;
    socket.set_write_timeout(timeout)
}
