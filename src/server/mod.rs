//! Non-blocking, single-threaded TCP server.
//!
//! [`TcpServer`] binds listening sockets, accepts connections as the
//! reactor reports readiness, and hands each accepted connection to a
//! connection callback as a [`Stream`] (TLS-wrapped when configured).
//!
//! Initialization follows one of two patterns:
//!
//! 1. `listen`: simple single-process, with a reactor you already own:
//!
//!    ```rust,no_run
//!    # use std::rc::Rc;
//!    # use squall::reactor::Reactor;
//!    # use squall::server::TcpServer;
//!    let reactor = Rc::new(Reactor::new()?);
//!    let mut server = TcpServer::new(|stream, peer| {
//!        // speak your protocol over `stream`
//!    });
//!    server.listen(&reactor, 8888, None)?;
//!    reactor.run()?;
//!    # Ok::<(), Box<dyn std::error::Error>>(())
//!    ```
//!
//! 2. `bind`/`start`: multi-process. Sockets are bound before the fork and
//!    each worker creates its own reactor after it:
//!
//!    ```rust,no_run
//!    # use squall::server::{AddressFamily, TcpServer};
//!    let mut server = TcpServer::new(|stream, peer| { /* ... */ });
//!    server.bind(8888, None, AddressFamily::Unspec)?;
//!    if let Some(reactor) = server.start(0)? {
//!        reactor.run()?; // worker process
//!    }
//!    // parent: all workers have exited
//!    # Ok::<(), Box<dyn std::error::Error>>(())
//!    ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::reactor::{Interest, Reactor};
use crate::stream::tls::{TlsAcceptor, TlsOptions};
use crate::stream::{Stream, StreamConfig, Transport};

#[cfg(unix)]
use crate::process;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no addresses matched the requested family")]
    NoAddresses,
}

/// Address family restriction for [`TcpServer::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// Both IPv4 and IPv6 where available.
    #[default]
    Unspec,
    Ipv4,
    Ipv6,
}

/// Callback receiving each accepted connection.
pub type ConnectionCallback = Rc<dyn Fn(Stream, Option<SocketAddr>)>;

/// Restart budget for abnormally exiting workers.
const MAX_WORKER_RESTARTS: u32 = 100;

/// Shared context captured by every accept handler.
struct AcceptContext {
    reactor: Rc<Reactor>,
    callback: ConnectionCallback,
    /// (protocol name, handler) in preference order; consulted after a TLS
    /// handshake negotiates ALPN. Falls back to `callback`.
    alpn_handlers: Vec<(Vec<u8>, ConnectionCallback)>,
    tls: Option<TlsAcceptor>,
    stream_config: StreamConfig,
}

/// A non-blocking, single-threaded TCP server.
pub struct TcpServer {
    callback: ConnectionCallback,
    alpn_handlers: Vec<(Vec<u8>, ConnectionCallback)>,
    tls: Option<TlsAcceptor>,
    stream_config: StreamConfig,
    /// Bound but not yet registered with a reactor.
    pending: Vec<std::net::TcpListener>,
    /// Listening fds registered with a reactor, for `stop`.
    active: Vec<(Rc<Reactor>, RawFd, Option<SocketAddr>)>,
    started: bool,
}

impl TcpServer {
    /// Creates a server that hands every accepted connection to `callback`.
    pub fn new(callback: impl Fn(Stream, Option<SocketAddr>) + 'static) -> TcpServer {
        TcpServer {
            callback: Rc::new(callback),
            alpn_handlers: Vec::new(),
            tls: None,
            stream_config: StreamConfig::default(),
            pending: Vec::new(),
            active: Vec::new(),
            started: false,
        }
    }

    /// Serves TLS using the given certificate/key configuration. Accepted
    /// sockets are wrapped in a server-side session before the connection
    /// callback sees them.
    pub fn set_tls(&mut self, options: &TlsOptions) -> io::Result<()> {
        self.tls = Some(TlsAcceptor::from_options(options)?);
        Ok(())
    }

    /// Dispatches connections that negotiated `protocol` via ALPN to
    /// `callback` instead of the default one. Requires TLS; when the client
    /// declines negotiation the default callback is used.
    pub fn add_alpn_handler(
        &mut self,
        protocol: impl Into<Vec<u8>>,
        callback: impl Fn(Stream, Option<SocketAddr>) + 'static,
    ) {
        assert!(
            self.tls.is_some(),
            "ALPN handlers require TLS to be configured first"
        );
        self.alpn_handlers
            .push((protocol.into(), Rc::new(callback)));
    }

    /// Overrides the per-connection buffer configuration.
    pub fn set_stream_config(&mut self, config: StreamConfig) {
        self.stream_config = config;
    }

    /// Binds listening sockets for the given port.
    ///
    /// `address` may be a hostname or IP; `None` listens on all interfaces.
    /// One socket is created per resolved address, restricted to `family`.
    /// May be called multiple times before [`start`](Self::start) to listen
    /// on several ports.
    pub fn bind(
        &mut self,
        port: u16,
        address: Option<&str>,
        family: AddressFamily,
    ) -> Result<(), ServerError> {
        let addrs = resolve_bind_addrs(address, port, family)?;
        let mut bound = 0usize;
        for addr in addrs {
            match std::net::TcpListener::bind(addr) {
                Ok(listener) => {
                    listener
                        .set_nonblocking(true)
                        .map_err(|source| ServerError::Bind {
                            addr: addr.to_string(),
                            source,
                        })?;
                    debug!(%addr, "listening socket bound");
                    self.pending.push(listener);
                    bound += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && bound > 0 => {
                    // Dual-stack hosts hand v4 traffic to the v6 wildcard
                    // socket; the explicit v4 bind then collides.
                    debug!(%addr, "skipping duplicate wildcard bind");
                }
                Err(source) => {
                    return Err(ServerError::Bind {
                        addr: addr.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Binds and immediately starts accepting on `reactor`: the
    /// single-process shortcut for [`bind`](Self::bind) +
    /// [`add_sockets`](Self::add_sockets).
    pub fn listen(
        &mut self,
        reactor: &Rc<Reactor>,
        port: u16,
        address: Option<&str>,
    ) -> Result<(), ServerError> {
        self.bind(port, address, AddressFamily::Unspec)?;
        self.add_sockets(reactor)?;
        Ok(())
    }

    /// Returns the local addresses of all bound listening sockets, whether
    /// or not they are accepting yet.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.pending
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .chain(self.active.iter().filter_map(|(_, _, addr)| *addr))
            .collect()
    }

    /// Registers accept handlers for every pending socket on `reactor`.
    pub fn add_sockets(&mut self, reactor: &Rc<Reactor>) -> Result<(), ServerError> {
        let context = Rc::new(AcceptContext {
            reactor: Rc::clone(reactor),
            callback: Rc::clone(&self.callback),
            alpn_handlers: self.alpn_handlers.clone(),
            tls: self.tls.clone(),
            stream_config: self.stream_config.clone(),
        });
        for listener in self.pending.drain(..) {
            let fd = listener.as_raw_fd();
            let local = listener.local_addr().ok();
            let listener = mio::net::TcpListener::from_std(listener);
            let context = Rc::clone(&context);
            reactor
                .register(fd, Interest::READABLE, move |_fd, _ready| {
                    accept_until_blocked(&listener, &context);
                })
                .map_err(|e| match e {
                    crate::reactor::ReactorError::Io(e) => ServerError::Io(e),
                    other => ServerError::Io(io::Error::other(other.to_string())),
                })?;
            self.active.push((Rc::clone(reactor), fd, local));
        }
        Ok(())
    }

    /// Starts the server.
    ///
    /// With `num_workers == 1` the current process serves alone. Any other
    /// value forks workers (`<= 0` auto-detects the core count); sockets
    /// are bound before the fork and each worker creates its own reactor
    /// after it, so no reactor may exist in this process beforehand.
    ///
    /// Returns `Some(reactor)` in the serving process (run it), or `None`
    /// in the fork parent once all workers have exited.
    pub fn start(&mut self, num_workers: i32) -> Result<Option<Rc<Reactor>>, ServerError> {
        assert!(!self.started, "server already started");
        self.started = true;
        #[cfg(unix)]
        if num_workers != 1 {
            match process::fork_workers(num_workers, MAX_WORKER_RESTARTS)? {
                None => return Ok(None),
                Some(task_id) => debug!(task_id, "worker process serving"),
            }
        }
        #[cfg(not(unix))]
        if num_workers != 1 {
            warn!("multi-process serving is unix-only; continuing single-process");
        }
        let reactor = Rc::new(Reactor::new().map_err(ServerError::Io)?);
        self.add_sockets(&reactor)?;
        Ok(Some(reactor))
    }

    /// Stops listening for new connections. Connections already accepted
    /// are not touched.
    pub fn stop(&mut self) {
        for (reactor, fd, _) in self.active.drain(..) {
            if let Err(e) = reactor.unregister(fd) {
                debug!(fd, error = %e, "failed to unregister listener");
            }
        }
        self.pending.clear();
        info!("server stopped listening");
    }
}

/// Accepts connections until the socket would block. Level-triggered
/// polling coalesces simultaneous arrivals into one readiness event, so a
/// single `accept` per event would strand queued connections.
fn accept_until_blocked(listener: &mio::net::TcpListener, context: &Rc<AcceptContext>) {
    loop {
        match listener.accept() {
            Ok((socket, peer)) => handle_connection(context, socket, peer),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                // The peer gave up between the kernel queue and our accept.
                debug!(error = %e, "connection aborted before accept");
                continue;
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                return;
            }
        }
    }
}

fn handle_connection(context: &Rc<AcceptContext>, socket: mio::net::TcpStream, peer: SocketAddr) {
    debug!(peer = %peer, "connection accepted");
    let transport = match &context.tls {
        None => Transport::Plain(socket),
        Some(acceptor) => match acceptor.accept(socket) {
            Ok(transport) => Transport::Tls(transport),
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to start TLS session");
                return;
            }
        },
    };
    let stream = match Stream::from_transport(
        Rc::clone(&context.reactor),
        transport,
        false,
        context.stream_config.clone(),
    ) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %peer, error = %e, "failed to set up stream");
            return;
        }
    };
    if context.tls.is_some() && !context.alpn_handlers.is_empty() {
        // The handler choice depends on the negotiated protocol, which is
        // only known once the handshake completes.
        let context = Rc::clone(context);
        let negotiated = stream.clone();
        stream.set_connect_callback(move |result| {
            if result.is_err() {
                return; // handshake failed; the stream is already closed
            }
            let selected = negotiated.alpn_protocol();
            let handler = selected
                .as_deref()
                .and_then(|name| {
                    context
                        .alpn_handlers
                        .iter()
                        .find(|(proto, _)| proto == name)
                        .map(|(_, handler)| handler)
                })
                .unwrap_or(&context.callback);
            run_connection_callback(handler, negotiated.clone(), Some(peer));
        });
    } else {
        run_connection_callback(&context.callback, stream, Some(peer));
    }
}

fn run_connection_callback(
    callback: &ConnectionCallback,
    stream: Stream,
    peer: Option<SocketAddr>,
) {
    if catch_unwind(AssertUnwindSafe(|| callback(stream, peer))).is_err() {
        error!("panic in connection callback");
    }
}

/// Resolves the bind address list, v6 wildcard before v4 so the dual-stack
/// duplicate-bind tolerance in `bind` applies.
fn resolve_bind_addrs(
    address: Option<&str>,
    port: u16,
    family: AddressFamily,
) -> Result<Vec<SocketAddr>, ServerError> {
    let mut addrs: Vec<SocketAddr> = match address {
        Some(host) => (host, port)
            .to_socket_addrs()
            .map_err(ServerError::Io)?
            .collect(),
        None => vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        ],
    };
    addrs.retain(|addr| match family {
        AddressFamily::Unspec => true,
        AddressFamily::Ipv4 => addr.is_ipv4(),
        AddressFamily::Ipv6 => addr.is_ipv6(),
    });
    addrs.dedup();
    if addrs.is_empty() {
        return Err(ServerError::NoAddresses);
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_restricts_family() {
        let v4 = resolve_bind_addrs(None, 0, AddressFamily::Ipv4).unwrap();
        assert!(v4.iter().all(SocketAddr::is_ipv4));
        let v6 = resolve_bind_addrs(None, 0, AddressFamily::Ipv6).unwrap();
        assert!(v6.iter().all(SocketAddr::is_ipv6));
        let both = resolve_bind_addrs(None, 0, AddressFamily::Unspec).unwrap();
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn resolve_loopback_hostname() {
        let addrs = resolve_bind_addrs(Some("localhost"), 1234, AddressFamily::Ipv4).unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 1234));
    }

    #[test]
    fn bind_assigns_an_ephemeral_port() {
        let mut server = TcpServer::new(|_stream, _peer| {});
        server
            .bind(0, Some("127.0.0.1"), AddressFamily::Ipv4)
            .unwrap();
        assert_eq!(server.pending.len(), 1);
        let port = server.pending[0].local_addr().unwrap().port();
        assert_ne!(port, 0);
    }
}
