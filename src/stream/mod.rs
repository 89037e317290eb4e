//! Buffered, non-blocking socket streams driven by a [`Reactor`].
//!
//! A [`Stream`] wraps one TCP socket and exposes callback-based reads and
//! writes: [`read_until`](Stream::read_until) and
//! [`read_bytes`](Stream::read_bytes) complete when the requested data is
//! available, [`write`](Stream::write) buffers outbound data and drains it as
//! the socket allows. At most one read may be pending at a time; waiting is
//! represented purely as pending-operation data, not a parked stack.
//!
//! Streams may carry a TLS session (see [`tls`]); the handshake is pumped
//! from readiness events before the stream behaves like a plain one.

pub mod tls;

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::reactor::{Interest, Reactor, ReactorError, Ready};

use self::tls::TlsTransport;

/// Errors surfaced by stream operations, synchronously or through callbacks.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream is closed; delivered to any in-flight callback exactly
    /// once, and returned immediately by operations issued afterwards.
    #[error("stream is closed")]
    Closed,

    #[error("a read is already in progress")]
    ReadInProgress,

    #[error("read buffer exceeded {0} bytes")]
    BufferFull(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Callback receiving the bytes of a completed read.
pub type ReadCallback = Box<dyn FnOnce(Result<Bytes, StreamError>)>;
/// Callback invoked when the write buffer fully drains.
pub type WriteCallback = Box<dyn FnOnce(Result<(), StreamError>)>;
/// Callback invoked once when the stream closes.
pub type CloseCallback = Box<dyn FnOnce()>;
/// Callback invoked when an outbound connection (and TLS handshake, if any)
/// completes.
pub type ConnectCallback = Box<dyn FnOnce(Result<(), StreamError>)>;

/// What a pending read is waiting for.
enum ReadMode {
    /// Everything up to and including the first occurrence of the delimiter.
    UntilDelimiter(Vec<u8>),
    /// Exactly this many bytes.
    ExactBytes(usize),
}

struct PendingRead {
    mode: ReadMode,
    callback: ReadCallback,
}

/// Buffer sizing for a stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum amount of incoming data to buffer; exceeding it closes the
    /// stream. The outbound buffer is unbounded.
    pub max_read_buffer: usize,
    /// Amount of data to request from the socket per read call.
    pub read_chunk: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            max_read_buffer: 100 * 1024 * 1024,
            read_chunk: 64 * 1024,
        }
    }
}

/// Cap on bytes handed to a single send call, to stay clear of platform
/// write-size limits.
const WRITE_CHUNK: usize = 128 * 1024;

/// The socket transport behind a stream: plain TCP or a TLS session.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(TlsTransport),
}

/// Outcome of a TLS handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeStatus {
    WantsRead,
    WantsWrite,
    Done,
}

impl Transport {
    fn raw_fd(&self) -> RawFd {
        match self {
            Transport::Plain(sock) => sock.as_raw_fd(),
            Transport::Tls(t) => t.socket().as_raw_fd(),
        }
    }

    fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(sock) => sock,
            Transport::Tls(t) => t.socket(),
        }
    }

    fn handshaking(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(t) => t.handshaking(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.read(buf),
            Transport::Tls(t) => t.read(buf),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.write(data),
            Transport::Tls(t) => t.write(data),
        }
    }

    /// Pushes any transport-internal outbound bytes (TLS records) to the
    /// socket. A no-op for plain transports.
    fn flush_pending(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(_) => Ok(()),
            Transport::Tls(t) => t.flush_pending(),
        }
    }

    /// True if the transport itself has outbound bytes queued, independent
    /// of the stream's write buffer.
    fn wants_write(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(t) => t.wants_write(),
        }
    }

    fn handshake_step(&mut self) -> io::Result<HandshakeStatus> {
        match self {
            Transport::Plain(_) => Ok(HandshakeStatus::Done),
            Transport::Tls(t) => t.handshake_step(),
        }
    }
}

struct Inner {
    reactor: Rc<Reactor>,
    /// Taken (and thereby closed) when the stream closes.
    transport: Option<Transport>,
    fd: RawFd,
    peer: Option<SocketAddr>,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    pending_read: Option<PendingRead>,
    write_callback: Option<WriteCallback>,
    close_callback: Option<CloseCallback>,
    connect_callback: Option<ConnectCallback>,
    connecting: bool,
    registered: Option<Interest>,
    closed: bool,
    config: StreamConfig,
}

/// A buffered, non-blocking stream over one TCP socket.
///
/// `Stream` is a cheap cloneable handle; clones refer to the same socket.
/// It is registered with exactly one reactor for its whole life, and
/// `closed` transitions false to true exactly once, firing the close
/// callback exactly once.
#[derive(Clone)]
pub struct Stream {
    inner: Rc<RefCell<Inner>>,
}

impl Stream {
    /// Wraps an accepted (already connected) socket.
    pub fn new(reactor: Rc<Reactor>, socket: TcpStream) -> Result<Stream, StreamError> {
        Self::build(reactor, Transport::Plain(socket), false, StreamConfig::default())
    }

    /// Wraps an accepted socket with a custom buffer configuration.
    pub fn with_config(
        reactor: Rc<Reactor>,
        socket: TcpStream,
        config: StreamConfig,
    ) -> Result<Stream, StreamError> {
        Self::build(reactor, Transport::Plain(socket), false, config)
    }

    pub(crate) fn from_transport(
        reactor: Rc<Reactor>,
        transport: Transport,
        connecting: bool,
        config: StreamConfig,
    ) -> Result<Stream, StreamError> {
        Self::build(reactor, transport, connecting, config)
    }

    fn build(
        reactor: Rc<Reactor>,
        transport: Transport,
        connecting: bool,
        config: StreamConfig,
    ) -> Result<Stream, StreamError> {
        let fd = transport.raw_fd();
        let peer = transport.socket().peer_addr().ok();
        let inner = Rc::new(RefCell::new(Inner {
            reactor: Rc::clone(&reactor),
            transport: Some(transport),
            fd,
            peer,
            read_buffer: BytesMut::new(),
            write_buffer: BytesMut::new(),
            pending_read: None,
            write_callback: None,
            close_callback: None,
            connect_callback: None,
            connecting,
            registered: None,
            closed: false,
            config,
        }));
        let interest = Self::desired_interest(&inner.borrow());
        let handler = Rc::clone(&inner);
        reactor
            .register(fd, interest, move |_fd, ready| {
                Self::handle_events(&handler, ready);
            })
            .map_err(|e| match e {
                ReactorError::Io(e) => StreamError::Io(e),
                other => StreamError::Io(io::Error::other(other.to_string())),
            })?;
        inner.borrow_mut().registered = Some(interest);
        Ok(Stream { inner })
    }

    /// Returns the peer address recorded when the stream was created.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().peer
    }

    /// Returns `true` once the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Returns `true` while a read is pending.
    pub fn reading(&self) -> bool {
        self.inner.borrow().pending_read.is_some()
    }

    /// Returns `true` while the write buffer is non-empty.
    pub fn writing(&self) -> bool {
        !self.inner.borrow().write_buffer.is_empty()
    }

    /// The ALPN protocol negotiated during the TLS handshake, if any.
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        let inner = self.inner.borrow();
        match inner.transport.as_ref()? {
            Transport::Plain(_) => None,
            Transport::Tls(t) => t.alpn_protocol(),
        }
    }

    /// Returns `true` if the stream carries a TLS session.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.borrow().transport, Some(Transport::Tls(_)))
    }

    /// Registers `callback` to run when the stream closes. Replaces any
    /// previously set callback; runs exactly once.
    pub fn set_close_callback(&self, callback: impl FnOnce() + 'static) {
        self.inner.borrow_mut().close_callback = Some(Box::new(callback));
    }

    /// Registers `callback` to run when the outbound connection (including
    /// a TLS handshake, if any) is established. If the stream is already
    /// established the callback runs immediately.
    pub fn set_connect_callback(
        &self,
        callback: impl FnOnce(Result<(), StreamError>) + 'static,
    ) {
        let result = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                Err(StreamError::Closed)
            } else if inner.connecting
                || inner.transport.as_ref().is_some_and(Transport::handshaking)
            {
                inner.connect_callback = Some(Box::new(callback));
                return;
            } else {
                Ok(())
            }
        };
        callback(result);
    }

    /// Reads until `delimiter` is found, then runs `callback` with all bytes
    /// up to and including the delimiter. Any remainder stays buffered for
    /// the next read.
    ///
    /// The read is satisfied synchronously from the buffer when possible.
    ///
    /// # Errors
    ///
    /// [`StreamError::ReadInProgress`] if a read is already pending;
    /// [`StreamError::Closed`] if the stream is closed.
    pub fn read_until(
        &self,
        delimiter: impl Into<Vec<u8>>,
        callback: impl FnOnce(Result<Bytes, StreamError>) + 'static,
    ) -> Result<(), StreamError> {
        self.start_read(ReadMode::UntilDelimiter(delimiter.into()), Box::new(callback))
    }

    /// Reads exactly `n` bytes, then runs `callback` with them.
    ///
    /// `n == 0` runs the callback synchronously with an empty result and
    /// registers no reactor interest.
    ///
    /// # Errors
    ///
    /// Same as [`read_until`](Self::read_until).
    pub fn read_bytes(
        &self,
        n: usize,
        callback: impl FnOnce(Result<Bytes, StreamError>) + 'static,
    ) -> Result<(), StreamError> {
        self.start_read(ReadMode::ExactBytes(n), Box::new(callback))
    }

    fn start_read(&self, mode: ReadMode, callback: ReadCallback) -> Result<(), StreamError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(StreamError::Closed);
            }
            if inner.pending_read.is_some() {
                return Err(StreamError::ReadInProgress);
            }
            inner.pending_read = Some(PendingRead { mode, callback });
        }
        // Fast path: satisfy from data already buffered, or from whatever
        // the socket can hand over without blocking.
        if Self::dispatch_pending_read(&self.inner) {
            return Ok(());
        }
        let eof = Self::fill_read_buffer(&self.inner);
        if self.inner.borrow().closed {
            return Ok(());
        }
        let satisfied = Self::dispatch_pending_read(&self.inner);
        if eof {
            Self::close_inner(&self.inner);
        } else if !satisfied {
            Self::update_interest(&self.inner);
        }
        Ok(())
    }

    /// Appends `data` to the write buffer and drains as much as the socket
    /// allows. Any earlier pending write callback is left in place.
    ///
    /// The write buffer is unbounded; a slow peer grows it without limit.
    pub fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        self.write_inner(data, None)
    }

    /// Like [`write`](Self::write), but runs `callback` once the write
    /// buffer fully drains. Overwrites any previously pending write
    /// callback — only the latest is honored.
    pub fn write_with(
        &self,
        data: &[u8],
        callback: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> Result<(), StreamError> {
        self.write_inner(data, Some(Box::new(callback)))
    }

    fn write_inner(&self, data: &[u8], callback: Option<WriteCallback>) -> Result<(), StreamError> {
        let connecting = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(StreamError::Closed);
            }
            inner.write_buffer.extend_from_slice(data);
            if let Some(cb) = callback {
                inner.write_callback = Some(cb);
            }
            inner.connecting || inner.transport.as_ref().is_some_and(Transport::handshaking)
        };
        if !connecting {
            // Inline fast path; leftover data keeps WRITE interest below.
            Self::drain_write_buffer(&self.inner);
        }
        if !self.inner.borrow().closed {
            Self::update_interest(&self.inner);
        }
        Ok(())
    }

    /// Closes the stream: unregisters from the reactor, closes the socket,
    /// fails any in-flight read/write/connect callback with
    /// [`StreamError::Closed`], and runs the close callback. Idempotent.
    pub fn close(&self) {
        Self::close_inner(&self.inner);
    }

    fn close_inner(inner: &Rc<RefCell<Inner>>) {
        let (pending_read, write_cb, connect_cb, close_cb) = {
            let mut guard = inner.borrow_mut();
            if guard.closed {
                return;
            }
            guard.closed = true;
            if guard.registered.take().is_some() {
                if let Err(e) = guard.reactor.unregister(guard.fd) {
                    debug!(fd = guard.fd, error = %e, "unregister on close failed");
                }
            }
            // Dropping the transport closes the fd.
            guard.transport = None;
            (
                guard.pending_read.take(),
                guard.write_callback.take(),
                guard.connect_callback.take(),
                guard.close_callback.take(),
            )
        };
        if let Some(read) = pending_read {
            (read.callback)(Err(StreamError::Closed));
        }
        if let Some(cb) = write_cb {
            cb(Err(StreamError::Closed));
        }
        if let Some(cb) = connect_cb {
            cb(Err(StreamError::Closed));
        }
        if let Some(cb) = close_cb {
            cb();
        }
    }

    /// Reactor event handler for this stream's fd.
    fn handle_events(inner: &Rc<RefCell<Inner>>, ready: Ready) {
        if inner.borrow().closed {
            warn!("readiness for closed stream");
            return;
        }
        if inner.borrow().connecting && (ready.is_writable() || ready.is_error()) {
            Self::handle_connect(inner);
            if inner.borrow().closed {
                return;
            }
        }
        if inner
            .borrow()
            .transport
            .as_ref()
            .is_some_and(Transport::handshaking)
        {
            Self::pump_handshake(inner);
            if inner.borrow().closed
                || inner
                    .borrow()
                    .transport
                    .as_ref()
                    .is_some_and(Transport::handshaking)
            {
                return;
            }
            // Handshake finished: fall through to normal dispatch.
        }
        if ready.is_readable() {
            Self::handle_read(inner);
            if inner.borrow().closed {
                return;
            }
        }
        if ready.is_writable() && !inner.borrow().connecting {
            Self::handle_write(inner);
            if inner.borrow().closed {
                return;
            }
        }
        if ready.is_error() {
            let error = inner
                .borrow()
                .transport
                .as_ref()
                .and_then(|t| t.socket().take_error().ok().flatten());
            if let Some(e) = error {
                debug!(error = %e, "socket error reported by poller");
            }
            Self::close_inner(inner);
            return;
        }
        Self::update_interest(inner);
    }

    fn handle_connect(inner: &Rc<RefCell<Inner>>) {
        enum Outcome {
            Connected,
            StillConnecting,
            Failed(io::Error),
        }
        let outcome = {
            let mut guard = inner.borrow_mut();
            let Some(transport) = guard.transport.as_ref() else {
                return;
            };
            match transport.socket().take_error() {
                Ok(Some(e)) => Outcome::Failed(e),
                Err(e) => Outcome::Failed(e),
                Ok(None) => match transport.socket().peer_addr() {
                    Ok(peer) => {
                        guard.peer = Some(peer);
                        guard.connecting = false;
                        Outcome::Connected
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.kind() == io::ErrorKind::WouldBlock =>
                    {
                        Outcome::StillConnecting
                    }
                    Err(e) => Outcome::Failed(e),
                },
            }
        };
        match outcome {
            Outcome::StillConnecting => {}
            Outcome::Failed(e) => {
                warn!(error = %e, "connect failed");
                let callback = inner.borrow_mut().connect_callback.take();
                if let Some(cb) = callback {
                    cb(Err(StreamError::Io(e)));
                }
                Self::close_inner(inner);
            }
            Outcome::Connected => {
                let handshaking = inner
                    .borrow()
                    .transport
                    .as_ref()
                    .is_some_and(Transport::handshaking);
                if !handshaking {
                    let callback = inner.borrow_mut().connect_callback.take();
                    if let Some(cb) = callback {
                        cb(Ok(()));
                    }
                }
                // With a TLS transport the connect callback waits for the
                // handshake, which the handshake pump will drive next.
            }
        }
    }

    fn pump_handshake(inner: &Rc<RefCell<Inner>>) {
        let status = {
            let mut guard = inner.borrow_mut();
            match guard.transport.as_mut() {
                Some(t) => t.handshake_step(),
                None => return,
            }
        };
        match status {
            Err(e) => {
                warn!(error = %e, "TLS handshake failed");
                Self::close_inner(inner);
            }
            Ok(HandshakeStatus::WantsRead) | Ok(HandshakeStatus::WantsWrite) => {
                Self::update_interest(inner);
            }
            Ok(HandshakeStatus::Done) => {
                trace!("TLS handshake complete");
                let callback = inner.borrow_mut().connect_callback.take();
                if let Some(cb) = callback {
                    cb(Ok(()));
                }
            }
        }
    }

    /// Reads from the transport until it would block or the peer closes,
    /// then satisfies the pending read if possible. EOF closes the stream
    /// after any satisfiable read has been delivered.
    fn handle_read(inner: &Rc<RefCell<Inner>>) {
        let eof = Self::fill_read_buffer(inner);
        if inner.borrow().closed {
            return;
        }
        Self::dispatch_pending_read(inner);
        if eof {
            Self::close_inner(inner);
        }
    }

    /// Drains the socket into the read buffer. Returns `true` on EOF.
    /// Overflowing the configured cap or hitting a fatal I/O error closes
    /// the stream.
    fn fill_read_buffer(inner: &Rc<RefCell<Inner>>) -> bool {
        let mut eof = false;
        let mut fatal: Option<io::Error> = None;
        let mut overflow: Option<usize> = None;
        {
            let mut guard = inner.borrow_mut();
            let guard = &mut *guard;
            let Some(transport) = guard.transport.as_mut() else {
                return false;
            };
            loop {
                let start = guard.read_buffer.len();
                guard.read_buffer.resize(start + guard.config.read_chunk, 0);
                match transport.read(&mut guard.read_buffer[start..]) {
                    Ok(0) => {
                        guard.read_buffer.truncate(start);
                        eof = true;
                        break;
                    }
                    Ok(n) => {
                        guard.read_buffer.truncate(start + n);
                        if guard.read_buffer.len() > guard.config.max_read_buffer {
                            overflow = Some(guard.config.max_read_buffer);
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        guard.read_buffer.truncate(start);
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        guard.read_buffer.truncate(start);
                    }
                    Err(e) => {
                        guard.read_buffer.truncate(start);
                        if is_connection_reset(&e) {
                            // Treat abrupt peer teardown as a quiet close.
                            eof = true;
                        } else {
                            fatal = Some(e);
                        }
                        break;
                    }
                }
            }
        }
        if let Some(max) = overflow {
            error!(max, "read buffer exceeded maximum size, closing stream");
            Self::close_inner(inner);
            return false;
        }
        if let Some(e) = fatal {
            warn!(error = %e, "read error, closing stream");
            Self::close_inner(inner);
            return false;
        }
        eof
    }

    /// Completes the pending read from the buffer if it can be satisfied.
    /// Returns `true` if a callback ran.
    fn dispatch_pending_read(inner: &Rc<RefCell<Inner>>) -> bool {
        let completed = {
            let mut guard = inner.borrow_mut();
            let pos = match guard.pending_read.as_ref() {
                None => return false,
                Some(pending) => match &pending.mode {
                    ReadMode::ExactBytes(n) => {
                        if guard.read_buffer.len() >= *n {
                            Some(*n)
                        } else {
                            None
                        }
                    }
                    ReadMode::UntilDelimiter(delim) => {
                        find_subsequence(&guard.read_buffer, delim).map(|at| at + delim.len())
                    }
                },
            };
            match pos {
                Some(pos) => {
                    let data = guard.read_buffer.split_to(pos).freeze();
                    let pending = guard.pending_read.take().expect("pending read vanished");
                    Some((pending.callback, data))
                }
                None => None,
            }
        };
        match completed {
            Some((callback, data)) => {
                callback(Ok(data));
                true
            }
            None => false,
        }
    }

    fn handle_write(inner: &Rc<RefCell<Inner>>) {
        Self::drain_write_buffer(inner);
    }

    /// Sends from the write buffer until it empties or the socket blocks,
    /// then fires the write callback if the buffer fully drained.
    fn drain_write_buffer(inner: &Rc<RefCell<Inner>>) {
        let mut fatal: Option<io::Error> = None;
        let mut quiet_close = false;
        let drained_callback = {
            let mut guard = inner.borrow_mut();
            let guard = &mut *guard;
            let Some(transport) = guard.transport.as_mut() else {
                return;
            };
            if let Err(e) = transport.flush_pending() {
                if e.kind() != io::ErrorKind::WouldBlock {
                    fatal = Some(e);
                }
            }
            while fatal.is_none() && !guard.write_buffer.is_empty() {
                let size = guard.write_buffer.len().min(WRITE_CHUNK);
                match transport.write(&guard.write_buffer[..size]) {
                    Ok(0) => break,
                    Ok(n) => guard.write_buffer.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if is_connection_reset(&e) {
                            quiet_close = true;
                        } else {
                            fatal = Some(e);
                        }
                        break;
                    }
                }
            }
            if fatal.is_none() && !quiet_close && guard.write_buffer.is_empty() {
                guard.write_callback.take()
            } else {
                None
            }
        };
        if quiet_close {
            Self::close_inner(inner);
            return;
        }
        if let Some(e) = fatal {
            warn!(error = %e, "write error, closing stream");
            Self::close_inner(inner);
            return;
        }
        if let Some(callback) = drained_callback {
            callback(Ok(()));
        }
    }

    fn desired_interest(inner: &Inner) -> Interest {
        let handshaking = inner.transport.as_ref().is_some_and(Transport::handshaking);
        let transport_wants_write = inner.transport.as_ref().is_some_and(Transport::wants_write);
        let want_read = inner.pending_read.is_some() || handshaking;
        let want_write = !inner.write_buffer.is_empty()
            || inner.connecting
            || transport_wants_write
            || handshaking;
        // Error/hangup conditions are always reported by the poller. While
        // idle, keep read interest so a peer close is noticed promptly.
        match (want_read, want_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    /// Recomputes and applies the interest mask after buffers or pending
    /// operations changed.
    fn update_interest(inner: &Rc<RefCell<Inner>>) {
        let mut guard = inner.borrow_mut();
        if guard.closed {
            return;
        }
        let desired = Self::desired_interest(&guard);
        if guard.registered != Some(desired) {
            if let Err(e) = guard.reactor.update(guard.fd, desired) {
                debug!(fd = guard.fd, error = %e, "interest update failed");
                return;
            }
            guard.registered = Some(desired);
        }
    }
}

/// Returns `true` for errors that mean the peer tore the connection down;
/// these close the stream without error-level noise.
fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
    )
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::{Duration, Instant};

    fn reactor() -> Rc<Reactor> {
        Rc::new(Reactor::new().expect("reactor"))
    }

    /// Accepts one connection from `listener` as a mio socket.
    fn accept_mio(listener: &std::net::TcpListener) -> TcpStream {
        listener.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match listener.accept() {
                Ok((sock, _)) => {
                    sock.set_nonblocking(true).unwrap();
                    return TcpStream::from_std(sock);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "accept timed out");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }

    fn socket_pair() -> (std::net::TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let server = accept_mio(&listener);
        (client, server)
    }

    #[test]
    fn read_until_fires_once_across_split_writes() {
        let r = reactor();
        let (mut client, server) = socket_pair();
        let stream = Stream::new(Rc::clone(&r), server).unwrap();

        let got = Rc::new(RefCell::new(Vec::new()));
        {
            let got = Rc::clone(&got);
            let stopper = Rc::clone(&r);
            stream
                .read_until(&b"\r\n\r\n"[..], move |result| {
                    got.borrow_mut().push(result.unwrap());
                    stopper.stop();
                })
                .unwrap();
        }

        let payload = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let writer = std::thread::spawn(move || {
            for chunk in payload.chunks(5) {
                client.write_all(chunk).unwrap();
                client.flush().unwrap();
                std::thread::sleep(Duration::from_millis(5));
            }
            client
        });
        let stopper = Rc::clone(&r);
        r.schedule_timeout(Instant::now() + Duration::from_secs(5), move || {
            stopper.stop()
        });
        r.run().unwrap();
        let _client = writer.join().unwrap();

        let got = got.borrow();
        assert_eq!(got.len(), 1, "read_until must fire exactly once");
        assert_eq!(&got[0][..], &payload[..]);
    }

    #[test]
    fn read_until_leaves_remainder_buffered() {
        let r = reactor();
        let (mut client, server) = socket_pair();
        let stream = Stream::new(Rc::clone(&r), server).unwrap();

        client.write_all(b"first\nsecond\n").unwrap();
        // Let the bytes land in the socket before the inline read.
        std::thread::sleep(Duration::from_millis(20));

        let first = Rc::new(RefCell::new(None));
        {
            let first = Rc::clone(&first);
            stream
                .read_until(&b"\n"[..], move |result| {
                    *first.borrow_mut() = Some(result.unwrap());
                })
                .unwrap();
        }
        // The inline fast path drains the socket, so both lines are
        // available without running the reactor.
        assert_eq!(first.borrow().as_deref(), Some(&b"first\n"[..]));

        let second = Rc::new(RefCell::new(None));
        {
            let second = Rc::clone(&second);
            stream
                .read_until(&b"\n"[..], move |result| {
                    *second.borrow_mut() = Some(result.unwrap());
                })
                .unwrap();
        }
        assert_eq!(second.borrow().as_deref(), Some(&b"second\n"[..]));
    }

    #[test]
    fn read_bytes_zero_completes_synchronously() {
        let r = reactor();
        let (_client, server) = socket_pair();
        let stream = Stream::new(Rc::clone(&r), server).unwrap();

        let fired = Rc::new(RefCell::new(None));
        {
            let fired = Rc::clone(&fired);
            stream
                .read_bytes(0, move |result| {
                    *fired.borrow_mut() = Some(result.unwrap());
                })
                .unwrap();
        }
        assert_eq!(fired.borrow().as_deref(), Some(&b""[..]));
        // The zero-byte read left no pending state behind.
        assert!(!stream.reading());
    }

    #[test]
    fn second_read_while_pending_is_rejected() {
        let r = reactor();
        let (_client, server) = socket_pair();
        let stream = Stream::new(Rc::clone(&r), server).unwrap();

        stream.read_bytes(4, |_| {}).unwrap();
        let err = stream.read_bytes(4, |_| {}).unwrap_err();
        assert!(matches!(err, StreamError::ReadInProgress));
    }

    #[test]
    fn close_is_idempotent_and_fires_close_callback_once() {
        let r = reactor();
        let (_client, server) = socket_pair();
        let stream = Stream::new(Rc::clone(&r), server).unwrap();

        let closes = Rc::new(std::cell::Cell::new(0u32));
        {
            let closes = Rc::clone(&closes);
            stream.set_close_callback(move || closes.set(closes.get() + 1));
        }
        stream.close();
        stream.close();
        assert_eq!(closes.get(), 1);
        assert!(stream.is_closed());
        assert!(matches!(
            stream.read_bytes(1, |_| {}),
            Err(StreamError::Closed)
        ));
        assert!(matches!(stream.write(b"x"), Err(StreamError::Closed)));
    }

    #[test]
    fn pending_read_gets_closed_error_on_peer_disconnect() {
        let r = reactor();
        let (client, server) = socket_pair();
        let stream = Stream::new(Rc::clone(&r), server).unwrap();

        let saw = Rc::new(RefCell::new(None));
        {
            let saw = Rc::clone(&saw);
            let stopper = Rc::clone(&r);
            stream
                .read_bytes(64, move |result| {
                    *saw.borrow_mut() = Some(result);
                    stopper.stop();
                })
                .unwrap();
        }
        drop(client);
        let stopper = Rc::clone(&r);
        r.schedule_timeout(Instant::now() + Duration::from_secs(5), move || {
            stopper.stop()
        });
        r.run().unwrap();
        assert!(matches!(
            saw.borrow().as_ref(),
            Some(Err(StreamError::Closed))
        ));
    }

    #[test]
    fn write_callback_fires_after_full_drain() {
        let r = reactor();
        let (mut client, server) = socket_pair();
        let stream = Stream::new(Rc::clone(&r), server).unwrap();

        let done = Rc::new(std::cell::Cell::new(false));
        {
            let done = Rc::clone(&done);
            let stopper = Rc::clone(&r);
            stream
                .write_with(b"hello, peer", move |result| {
                    result.unwrap();
                    done.set(true);
                    stopper.stop();
                })
                .unwrap();
        }
        let reader = std::thread::spawn(move || {
            use std::io::Read as _;
            let mut buf = [0u8; 64];
            let n = client.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello, peer");
        });
        let stopper = Rc::clone(&r);
        r.schedule_timeout(Instant::now() + Duration::from_secs(5), move || {
            stopper.stop()
        });
        r.run().unwrap();
        reader.join().unwrap();
        assert!(done.get());
    }

    #[test]
    fn oversized_read_buffer_closes_the_stream() {
        let r = reactor();
        let (mut client, server) = socket_pair();
        let config = StreamConfig {
            max_read_buffer: 16,
            read_chunk: 8,
        };
        let stream = Stream::with_config(Rc::clone(&r), server, config).unwrap();

        let closed = Rc::new(std::cell::Cell::new(false));
        {
            let closed = Rc::clone(&closed);
            let stopper = Rc::clone(&r);
            stream.set_close_callback(move || {
                closed.set(true);
                stopper.stop();
            });
        }
        // Ask for a delimiter that never arrives while flooding the buffer.
        stream.read_until(&b"\r\n\r\n"[..], |_| {}).unwrap();
        client.write_all(&[b'x'; 64]).unwrap();
        let stopper = Rc::clone(&r);
        r.schedule_timeout(Instant::now() + Duration::from_secs(5), move || {
            stopper.stop()
        });
        r.run().unwrap();
        assert!(closed.get());
    }
}
