//! Non-blocking, single-threaded HTTP server.
//!
//! [`HttpServer`] binds the TCP listener to the HTTP/1.x connection state
//! machine: every accepted stream gets an [`Http1Connection`] that parses
//! requests and hands them to the request callback. The callback is
//! responsible for producing the response exactly as it should appear on
//! the wire, then calling [`ServerRequest::finish`].
//!
//! Keep-alive is supported by default (automatically for HTTP/1.1, or for
//! HTTP/1.0 when the client requests it and the response declares
//! `Content-Length`). Applications that cannot frame their responses
//! should set [`HttpServerConfig::no_keep_alive`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use squall::http::{HttpServer, HttpServerConfig};
//! use squall::reactor::Reactor;
//!
//! let reactor = Rc::new(Reactor::new()?);
//! let mut server = HttpServer::new(HttpServerConfig::default(), |request| {
//!     let body = format!("You requested {}\n", request.uri());
//!     request.write(
//!         format!(
//!             "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
//!             body.len(),
//!             body
//!         )
//!         .as_bytes(),
//!     );
//!     request.finish();
//! });
//! server.listen(&reactor, 8888, None)?;
//! reactor.run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::net::SocketAddr;
use std::rc::Rc;

use crate::reactor::Reactor;
use crate::server::{AddressFamily, ServerError, TcpServer};
use crate::stream::StreamConfig;
use crate::stream::tls::TlsOptions;

use super::ServerRequest;
use super::connection::{Http1Connection, RequestCallback};

/// Connection-level configuration shared by every connection the server
/// creates.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Forces `Connection: close` semantics on every request.
    pub no_keep_alive: bool,

    /// Honors `X-Real-Ip`/`X-Forwarded-For` and
    /// `X-Scheme`/`X-Forwarded-Proto` from a trusted reverse proxy,
    /// overriding the request's remote IP and scheme.
    pub trust_proxy_headers: bool,

    /// Overrides the scheme reported to applications (e.g. `"https"` when
    /// running behind an SSL-decoding proxy that sets no headers).
    pub scheme: Option<String>,

    /// Largest `Content-Length` accepted before the request is rejected as
    /// malformed.
    pub max_body_size: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        HttpServerConfig {
            no_keep_alive: false,
            trust_proxy_headers: false,
            scheme: None,
            max_body_size: 100 * 1024 * 1024,
        }
    }
}

/// A non-blocking, single-threaded HTTP server.
///
/// Thin glue over [`TcpServer`]: the listener hands accepted streams to a
/// per-connection [`Http1Connection`] configured with this server's
/// request callback and [`HttpServerConfig`].
pub struct HttpServer {
    tcp: TcpServer,
}

impl HttpServer {
    /// Creates a server dispatching every request to `callback`.
    pub fn new(
        config: HttpServerConfig,
        callback: impl Fn(ServerRequest) + 'static,
    ) -> HttpServer {
        let callback: RequestCallback = Rc::new(callback);
        let config = Rc::new(config);
        let tcp = TcpServer::new(move |stream, peer| {
            Http1Connection::start(stream, peer, Rc::clone(&config), Rc::clone(&callback));
        });
        HttpServer { tcp }
    }

    /// Serves TLS with the given certificate/key configuration.
    pub fn set_tls(&mut self, options: &TlsOptions) -> std::io::Result<()> {
        self.tcp.set_tls(options)
    }

    /// Overrides the per-connection buffer configuration.
    pub fn set_stream_config(&mut self, config: StreamConfig) {
        self.tcp.set_stream_config(config);
    }

    /// Binds listening sockets; see [`TcpServer::bind`].
    pub fn bind(
        &mut self,
        port: u16,
        address: Option<&str>,
        family: AddressFamily,
    ) -> Result<(), ServerError> {
        self.tcp.bind(port, address, family)
    }

    /// Binds and immediately starts accepting on `reactor`; see
    /// [`TcpServer::listen`].
    pub fn listen(
        &mut self,
        reactor: &Rc<Reactor>,
        port: u16,
        address: Option<&str>,
    ) -> Result<(), ServerError> {
        self.tcp.listen(reactor, port, address)
    }

    /// Returns the local addresses of all bound listening sockets.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.tcp.local_addrs()
    }

    /// Registers accept handlers on `reactor` for sockets bound earlier.
    pub fn add_sockets(&mut self, reactor: &Rc<Reactor>) -> Result<(), ServerError> {
        self.tcp.add_sockets(reactor)
    }

    /// Starts serving; see [`TcpServer::start`] for the single- and
    /// multi-process contract.
    pub fn start(&mut self, num_workers: i32) -> Result<Option<Rc<Reactor>>, ServerError> {
        self.tcp.start(num_workers)
    }

    /// Stops listening for new connections; in-flight requests proceed.
    pub fn stop(&mut self) {
        self.tcp.stop();
    }
}
