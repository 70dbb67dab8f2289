//! Connection state machine for managing SCGI connections.
//!
//! Each connection tracks its lifecycle state and owns its buffers:
//!
//! ```text
//! Reading ──(request decoded, handler returned)──▶ Writing ──(flushed)──▶ Closing
//!    └──────────────────────(error / EOF / timeout)─────────────────────────▲
//! ```
//!
//! SCGI carries exactly one request per connection, so there is no path
//! back from `Writing` to `Reading`.

use crate::dispatcher::Dispatcher;
use crate::error::ConnectionError;
use crate::protocols::scgi::{BodyStream, RequestDecoder, ResponseFrame};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

/// Socket read size.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating request bytes.
    Reading,
    /// Flushing the response.
    Writing,
    /// Terminal; buffers released.
    Closing,
}

impl ConnState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnState::Reading => "READ",
            ConnState::Writing => "WRITE",
            ConnState::Closing => "CLOSE",
        }
    }
}

/// What the reactor should do after an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Waiting for more readiness.
    Pending,
    /// A response was just produced; start writing.
    Respond,
    /// The response is fully flushed; the connection has moved to `Closing`.
    Done,
}

/// A single client connection.
pub struct Connection<S = TcpStream> {
    /// Unique for the lifetime of the reactor, unlike the table slot.
    pub serial: u64,
    pub stream: S,
    pub peer: Option<SocketAddr>,
    pub state: ConnState,
    /// Inactivity deadline.
    pub deadline: Instant,
    inbound: BytesMut,
    outbound: BytesMut,
    body: Option<BodyStream>,
    decoder: RequestDecoder,
    received: usize,
    sent: usize,
    peer_closed: bool,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in initial reading state.
    pub fn new(
        serial: u64,
        stream: S,
        peer: Option<SocketAddr>,
        max_request_size: usize,
        deadline: Instant,
    ) -> Self {
        Self {
            serial,
            stream,
            peer,
            state: ConnState::Reading,
            deadline,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            body: None,
            decoder: RequestDecoder::new(max_request_size),
            received: 0,
            sent: 0,
            peer_closed: false,
        }
    }

    /// Drain the socket and feed the decoder.
    ///
    /// Once a full request is buffered the handler runs synchronously and its
    /// response is queued. Bytes arriving outside `Reading` are a protocol
    /// violation by the peer.
    pub fn on_readable(&mut self, dispatcher: &Dispatcher) -> Result<Progress, ConnectionError> {
        let mut progress = Progress::Pending;
        let mut chunk = [0u8; READ_BUFFER_SIZE];

        loop {
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => return self.on_eof(progress),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progress),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            match self.state {
                ConnState::Reading => {
                    self.received += n;
                    self.inbound.extend_from_slice(&chunk[..n]);
                    if let Some(request) = self.decoder.decode(&mut self.inbound)? {
                        let response = dispatcher.dispatch(request, self.peer)?;
                        self.start_writing(response);
                        progress = Progress::Respond;
                    }
                }
                ConnState::Writing => return Err(ConnectionError::UnexpectedData),
                ConnState::Closing => return Ok(Progress::Pending),
            }
        }
    }

    fn on_eof(&mut self, progress: Progress) -> Result<Progress, ConnectionError> {
        match self.state {
            ConnState::Reading if self.received == 0 => Err(ConnectionError::EmptyRequest),
            ConnState::Reading => Err(ConnectionError::Eof),
            // Half-closed peer still gets its response.
            ConnState::Writing => {
                self.peer_closed = true;
                Ok(progress)
            }
            ConnState::Closing => Ok(Progress::Pending),
        }
    }

    /// Queue the response and transition to writing state.
    pub fn start_writing(&mut self, response: ResponseFrame) {
        let (head, body) = response.into_parts();
        self.inbound = BytesMut::new();
        self.outbound = head;
        self.body = Some(body);
        self.state = ConnState::Writing;
    }

    /// Flush as much of the response as the socket accepts, pulling stream
    /// bodies `chunk_size` bytes at a time.
    pub fn on_writable(&mut self, chunk_size: usize) -> Result<Progress, ConnectionError> {
        if self.state != ConnState::Writing {
            return Ok(Progress::Pending);
        }

        loop {
            if self.outbound.is_empty() {
                if let Some(body) = self.body.as_mut() {
                    match body.next_chunk(chunk_size)? {
                        Some(chunk) => self.outbound.extend_from_slice(&chunk),
                        None => self.body = None,
                    }
                }
                if self.outbound.is_empty() && self.body.is_none() {
                    self.close();
                    return Ok(Progress::Done);
                }
                continue;
            }

            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into())
                }
                Ok(n) => {
                    self.sent += n;
                    self.outbound.advance(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Pending),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Mark connection as closed and release its buffers and body stream.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnState::Closing {
            return false;
        }
        self.state = ConnState::Closing;
        self.inbound = BytesMut::new();
        self.outbound = BytesMut::new();
        self.body = None;
        true
    }

    /// Total request bytes received so far.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Total response bytes written so far.
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<S = TcpStream> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<usize, Connection<S>> {
        if self.is_full() {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }
}
