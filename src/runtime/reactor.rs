//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. Everything runs on the thread that calls [`Reactor::start`]; the
//! only cross-thread entry point is [`StopHandle`].

use crate::dispatcher::Dispatcher;
use crate::error::{ConnectionError, SetupError};
use crate::handler::Handler;
use crate::logging::Logger;
use crate::protocols::scgi::DEFAULT_CHUNK_SIZE;
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry, Progress};
use crate::runtime::timer::TimeoutQueue;
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Ceiling for deadlines whose timeout does not fit in an `Instant`.
const MAX_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Typed reactor settings.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub listen: SocketAddr,
    /// Inactivity window after which a connection is closed.
    pub timeout: Duration,
    /// Read size for stream bodies.
    pub chunk_size: usize,
    pub max_connections: usize,
    /// Upper bound on header block plus body.
    pub max_request_size: usize,
    /// Events handled per poll.
    pub batch_size: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9000)),
            timeout: Duration::from_secs(5),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_connections: 1024,
            max_request_size: 16 * 1024 * 1024,
            batch_size: 256,
        }
    }
}

/// Requests the owning reactor to exit. Safe to call from any thread, any
/// number of times, before or during [`Reactor::start`].
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Single-threaded SCGI transport.
pub struct Reactor {
    config: ReactorConfig,
    dispatcher: Dispatcher,
    logger: Logger,
    poll: Poll,
    listener: Option<TcpListener>,
    connections: ConnectionRegistry,
    timeouts: TimeoutQueue,
    next_serial: u64,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Reactor {
    pub fn new<H: Handler + 'static>(config: ReactorConfig, handler: H) -> Result<Self, SetupError> {
        let poll = Poll::new().map_err(SetupError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(SetupError::Poll)?;
        let logger = Logger::noop();

        Ok(Self {
            connections: ConnectionRegistry::new(config.max_connections),
            dispatcher: Dispatcher::new(handler, logger.clone()),
            logger,
            poll,
            listener: None,
            timeouts: TimeoutQueue::new(),
            next_serial: 0,
            stop: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
            config,
        })
    }

    /// Replace the diagnostic sink for both the transport and handlers.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.dispatcher.set_logger(logger.clone());
        self.logger = logger;
        self
    }

    /// Create and register the listening socket. Idempotent.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// listening on port 0.
    pub fn bind(&mut self) -> Result<SocketAddr, SetupError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let addr = self.config.listen;
        let listener = create_listener(addr).map_err(|source| SetupError::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(listener);
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(SetupError::Register)?;

        let local = listener
            .local_addr()
            .map_err(|source| SetupError::Bind { addr, source })?;
        self.listener = Some(listener);
        self.logger.log(format!("Socket created on {local}"));
        Ok(local)
    }

    /// Bind if needed, then dispatch events until stopped.
    pub fn start(&mut self) -> Result<(), SetupError> {
        self.bind()?;
        let mut events = Events::with_capacity(self.config.batch_size.max(1));

        while !self.stop.load(Ordering::Acquire) {
            let timeout = self.timeouts.poll_timeout(Instant::now());
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SetupError::Poll(e)),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    Token(conn_id) => self.handle_connection_event(conn_id, event),
                }
            }

            self.expire_timeouts(Instant::now());
        }

        debug!(
            connections = self.connections.len(),
            timers = self.timeouts.len(),
            "Reactor stopped"
        );
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn accept_connections(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.is_full() {
                        self.logger
                            .log(format!("Connection limit reached, dropping {peer}"));
                        continue;
                    }

                    let serial = self.next_serial;
                    self.next_serial += 1;
                    let deadline = deadline_after(Instant::now(), self.config.timeout);
                    let conn = Connection::new(
                        serial,
                        stream,
                        Some(peer),
                        self.config.max_request_size,
                        deadline,
                    );

                    let Ok(conn_id) = self.connections.insert(conn) else {
                        continue;
                    };

                    // Re-borrow after insert
                    let Some(conn) = self.connections.get_mut(conn_id) else {
                        continue;
                    };
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
                    {
                        self.logger
                            .log(format!("Failed to register connection {serial}: {e}"));
                        self.connections.remove(conn_id);
                        continue;
                    }

                    self.timeouts.schedule(deadline, conn_id, serial);
                    debug!(conn_id, serial, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.logger.log(format!("Accept error: {e}"));
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Event) {
        let Some((serial, activity)) = self
            .connections
            .get(conn_id)
            .map(|c| (c.serial, c.received() + c.sent()))
        else {
            return;
        };

        let result = self.drive(conn_id, event);

        match result {
            Ok(Progress::Done) => self.close_connection(conn_id),
            Ok(_) => {
                let deadline = deadline_after(Instant::now(), self.config.timeout);
                if let Some(conn) = self.connections.get_mut(conn_id) {
                    if conn.received() + conn.sent() != activity {
                        conn.deadline = deadline;
                    }
                }
            }
            Err(e) => {
                // Handler failures were already logged by the dispatcher.
                if !e.is_silent() && !matches!(e, ConnectionError::Application(_)) {
                    let phase = self
                        .connections
                        .get(conn_id)
                        .map(|c| c.state.label())
                        .unwrap_or(ConnState::Closing.label());
                    self.logger
                        .log(format!("Connection {serial} error: {e} on {phase}"));
                }
                self.close_connection(conn_id);
            }
        }
    }

    fn drive(&mut self, conn_id: usize, event: &Event) -> Result<Progress, ConnectionError> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(Progress::Pending);
        };

        if event.is_error() {
            let err = conn
                .stream
                .take_error()?
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
            return Err(err.into());
        }

        let mut progress = Progress::Pending;
        if event.is_readable() || event.is_read_closed() {
            progress = conn.on_readable(&self.dispatcher)?;
        }

        if progress == Progress::Respond {
            // Stay readable: bytes arriving mid-response are a peer error.
            self.poll.registry().reregister(
                &mut conn.stream,
                Token(conn_id),
                Interest::READABLE | Interest::WRITABLE,
            )?;
        }

        if conn.state == ConnState::Writing && (progress == Progress::Respond || event.is_writable())
        {
            progress = conn.on_writable(self.config.chunk_size)?;
        }

        Ok(progress)
    }

    fn expire_timeouts(&mut self, now: Instant) {
        for entry in self.timeouts.pop_expired(now) {
            let Some(conn) = self.connections.get(entry.conn_id) else {
                continue;
            };
            // Slot reused by a newer connection.
            if conn.serial != entry.serial {
                continue;
            }
            if conn.deadline > now {
                self.timeouts
                    .schedule(conn.deadline, entry.conn_id, entry.serial);
                continue;
            }

            let phase = conn.state.label();
            self.logger.log(format!(
                "Connection {} error: {} on {phase}",
                entry.serial,
                ConnectionError::Timeout
            ));
            self.close_connection(entry.conn_id);
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            conn.close();
            debug!(conn_id, serial = conn.serial, "Connection closed");
        }
    }
}

/// `now + timeout`, clamped so huge timeouts cannot overflow.
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout.min(MAX_DEADLINE)).unwrap_or(now)
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
