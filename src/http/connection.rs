//! HTTP/1.x connection state machine.
//!
//! [`Http1Connection`] owns exactly one [`Stream`] and executes requests on
//! it until the connection closes: read the head up to the blank line,
//! parse it, read the body per `Content-Length` (honoring
//! `Expect: 100-continue`), dispatch to the application callback, forward
//! the response the application writes, and once the response has drained
//! either reset for the next request (keep-alive) or close.
//!
//! Per-request transient state is discarded between requests on the same
//! connection.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::stream::{Stream, StreamError};

use super::request::ServerRequest;
use super::server::HttpServerConfig;
use super::{Headers, Method, Version};

/// Errors arising while parsing or framing a request.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Bad start line or unparsable headers; fatal to the connection.
    #[error("malformed HTTP request: {0}")]
    MalformedRequest(String),

    #[error("Content-Length {length} exceeds limit {limit}")]
    ContentLengthTooLarge { length: usize, limit: usize },

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Application callback receiving each parsed request.
pub type RequestCallback = Rc<dyn Fn(ServerRequest)>;

/// Cap on how much of a response head the keep-alive sniffer will buffer
/// before assuming no `Content-Length` was declared.
const MAX_SNIFFED_HEAD: usize = 64 * 1024;

/// Maximum number of headers parsed per request.
const MAX_HEADERS: usize = 100;

/// The parsed request head.
pub(crate) struct ParsedHead {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
}

/// Watches the response bytes the application writes for a declared
/// `Content-Length`, which the HTTP/1.0 keep-alive rule depends on.
#[derive(Default)]
struct ResponseHeadSniffer {
    buf: BytesMut,
    done: bool,
    has_content_length: bool,
}

impl ResponseHeadSniffer {
    fn observe(&mut self, chunk: &[u8]) {
        if self.done {
            return;
        }
        self.buf.extend_from_slice(chunk);
        if let Some(at) = find_subsequence(&self.buf, b"\r\n\r\n") {
            self.has_content_length = self.buf[..at]
                .split(|&b| b == b'\n')
                .skip(1) // status line
                .any(|line| {
                    line.len() >= 15 && line[..15].eq_ignore_ascii_case(b"content-length:")
                });
            self.done = true;
            self.buf.clear();
        } else if self.buf.len() > MAX_SNIFFED_HEAD {
            self.done = true;
            self.buf.clear();
        }
    }

    fn has_content_length(&self) -> bool {
        self.done && self.has_content_length
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.done = false;
        self.has_content_length = false;
    }
}

/// Per-request transient state, cleared between keep-alive requests.
struct ConnState {
    version: Version,
    connection_header_close: bool,
    connection_header_keep_alive: bool,
    request_finished: bool,
    response_head: ResponseHeadSniffer,
    write_callback: Option<Box<dyn FnOnce()>>,
    close_callback: Option<Box<dyn FnOnce()>>,
}

impl ConnState {
    fn reset_request(&mut self) {
        self.version = Version::Http11;
        self.connection_header_close = false;
        self.connection_header_keep_alive = false;
        self.request_finished = false;
        self.response_head.reset();
        self.write_callback = None;
        self.close_callback = None;
    }
}

/// Handles one client connection, executing HTTP requests on its stream
/// until it closes.
pub struct Http1Connection {
    stream: Stream,
    peer: Option<SocketAddr>,
    config: Rc<HttpServerConfig>,
    callback: RequestCallback,
    state: RefCell<ConnState>,
}

impl Http1Connection {
    /// Takes ownership of an accepted stream and starts serving requests
    /// from it.
    pub fn start(
        stream: Stream,
        peer: Option<SocketAddr>,
        config: Rc<HttpServerConfig>,
        callback: RequestCallback,
    ) -> Rc<Http1Connection> {
        let conn = Rc::new(Http1Connection {
            stream,
            peer,
            config,
            callback,
            state: RefCell::new(ConnState {
                version: Version::Http11,
                connection_header_close: false,
                connection_header_keep_alive: false,
                request_finished: false,
                response_head: ResponseHeadSniffer::default(),
                write_callback: None,
                close_callback: None,
            }),
        });
        {
            let weak = Rc::downgrade(&conn);
            conn.stream.set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    Http1Connection::on_connection_close(&conn);
                }
            });
        }
        Self::await_request(&conn);
        conn
    }

    /// Returns the stream this connection owns.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Registers a callback to run when the connection closes. Cleared
    /// between requests, like the rest of the per-request state.
    pub fn set_close_callback(&self, callback: impl FnOnce() + 'static) {
        self.state.borrow_mut().close_callback = Some(Box::new(callback));
    }

    /// Closes the underlying stream.
    pub fn close(&self) {
        self.stream.close();
    }

    /// Writes a chunk of the response to the stream.
    pub fn write(conn: &Rc<Self>, chunk: &[u8]) {
        Self::write_chunk(conn, chunk, None);
    }

    /// Writes a chunk and runs `callback` once it has been flushed to the
    /// socket.
    pub fn write_with(conn: &Rc<Self>, chunk: &[u8], callback: impl FnOnce() + 'static) {
        Self::write_chunk(conn, chunk, Some(Box::new(callback)));
    }

    fn write_chunk(conn: &Rc<Self>, chunk: &[u8], callback: Option<Box<dyn FnOnce()>>) {
        if conn.stream.is_closed() {
            debug!("write on closed connection ignored");
            return;
        }
        {
            let mut state = conn.state.borrow_mut();
            state.response_head.observe(chunk);
            if let Some(cb) = callback {
                state.write_callback = Some(cb);
            }
        }
        let c = Rc::clone(conn);
        let result = conn.stream.write_with(chunk, move |result| {
            if result.is_ok() {
                Self::on_write_complete(&c);
            }
        });
        if let Err(e) = result {
            debug!(error = %e, "response write failed");
        }
    }

    /// Marks the current request complete. Keep-alive is evaluated once
    /// the stream's write buffer fully drains.
    pub fn finish(conn: &Rc<Self>) {
        conn.state.borrow_mut().request_finished = true;
        if !conn.stream.writing() {
            Self::finish_request(conn);
        }
    }

    fn await_request(conn: &Rc<Self>) {
        let c = Rc::clone(conn);
        let result = conn.stream.read_until(&b"\r\n\r\n"[..], move |result| match result {
            Ok(head) => Self::on_head(&c, &head),
            Err(StreamError::Closed) => {
                // The close callback already notified interested parties.
            }
            Err(e) => {
                debug!(error = %e, "error waiting for request head");
                c.close();
            }
        });
        if let Err(e) = result {
            debug!(error = %e, "cannot wait for another request");
            conn.close();
        }
    }

    fn on_head(conn: &Rc<Self>, head: &[u8]) {
        let parsed = match parse_request_head(head) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(peer = ?conn.peer, error = %e, "malformed HTTP request");
                Self::reject(conn);
                return;
            }
        };
        {
            let mut state = conn.state.borrow_mut();
            state.version = parsed.version;
            let connection_header = parsed
                .headers
                .get("Connection")
                .map(|v| v.trim().to_ascii_lowercase());
            state.connection_header_close = connection_header.as_deref() == Some("close");
            state.connection_header_keep_alive = connection_header.as_deref() == Some("keep-alive");
        }

        let content_length = match parsed.headers.get("Content-Length") {
            None => None,
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) => Some(n),
                Err(_) => {
                    warn!(peer = ?conn.peer, value = %value, "unparsable Content-Length");
                    Self::reject(conn);
                    return;
                }
            },
        };

        match content_length {
            None | Some(0) => Self::dispatch(conn, parsed, Bytes::new()),
            Some(length) => {
                let limit = conn.config.max_body_size;
                if length > limit {
                    warn!(peer = ?conn.peer, length, limit, "Content-Length exceeds limit");
                    Self::reject(conn);
                    return;
                }
                if parsed
                    .headers
                    .get("Expect")
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
                {
                    // Interim status before the client will send the body.
                    if let Err(e) = conn.stream.write(b"HTTP/1.1 100 (Continue)\r\n\r\n") {
                        debug!(error = %e, "failed to write 100-continue");
                    }
                }
                let c = Rc::clone(conn);
                let result = conn.stream.read_bytes(length, move |result| match result {
                    Ok(body) => Self::dispatch(&c, parsed, body),
                    Err(e) => {
                        debug!(error = %e, "connection closed while reading body");
                        c.close();
                    }
                });
                if let Err(e) = result {
                    debug!(error = %e, "cannot read request body");
                    conn.close();
                }
            }
        }
    }

    fn dispatch(conn: &Rc<Self>, head: ParsedHead, body: Bytes) {
        let mut remote_ip = conn
            .peer
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let mut scheme = conn.config.scheme.clone().unwrap_or_else(|| {
            if conn.stream.is_tls() {
                "https".to_owned()
            } else {
                "http".to_owned()
            }
        });
        if conn.config.trust_proxy_headers {
            // Squid uses X-Forwarded-For, others use X-Real-Ip.
            if let Some(forwarded) = head.headers.get("X-Forwarded-For") {
                if let Some(last) = forwarded.split(',').next_back() {
                    if let Ok(ip) = last.trim().parse() {
                        remote_ip = ip;
                    }
                }
            }
            if let Some(real) = head.headers.get("X-Real-Ip") {
                if let Ok(ip) = real.trim().parse() {
                    remote_ip = ip;
                }
            }
            let proto = head
                .headers
                .get("X-Scheme")
                .or_else(|| head.headers.get("X-Forwarded-Proto"));
            if let Some(proto) = proto {
                if proto == "http" || proto == "https" {
                    scheme = proto;
                }
            }
        }

        debug!(
            peer = ?conn.peer,
            method = %head.method,
            uri = %head.uri,
            "dispatching request"
        );
        let request = ServerRequest::new(
            head.method,
            head.uri,
            head.version,
            head.headers,
            body,
            remote_ip,
            scheme,
            Rc::clone(conn),
        );
        let callback = Rc::clone(&conn.callback);
        if catch_unwind(AssertUnwindSafe(|| callback(request))).is_err() {
            error!(peer = ?conn.peer, "panic in request callback");
            conn.close();
        }
    }

    fn on_write_complete(conn: &Rc<Self>) {
        let callback = conn.state.borrow_mut().write_callback.take();
        if let Some(callback) = callback {
            callback();
        }
        // A callback running before this one may have queued more data and
        // finished the request; only the drain that really empties the
        // buffer completes it.
        let finished = conn.state.borrow().request_finished;
        if finished && !conn.stream.writing() {
            Self::finish_request(conn);
        }
    }

    fn finish_request(conn: &Rc<Self>) {
        let keep_alive = {
            let mut state = conn.state.borrow_mut();
            let keep_alive = decide_keep_alive(
                conn.config.no_keep_alive,
                state.version,
                state.connection_header_close,
                state.connection_header_keep_alive,
                state.response_head.has_content_length(),
            );
            state.reset_request();
            keep_alive
        };
        if keep_alive {
            Self::await_request(conn);
        } else {
            debug!(peer = ?conn.peer, "closing connection after response");
            conn.close();
        }
    }

    /// Malformed request: best-effort minimal status line, then close.
    fn reject(conn: &Rc<Self>) {
        let c = Rc::clone(conn);
        let result = conn
            .stream
            .write_with(b"HTTP/1.1 400 Bad Request\r\n\r\n", move |_| c.close());
        if result.is_err() {
            conn.close();
        }
    }

    fn on_connection_close(conn: &Rc<Self>) {
        let callback = conn.state.borrow_mut().close_callback.take();
        if let Some(callback) = callback {
            callback();
        }
        conn.state.borrow_mut().reset_request();
    }
}

/// The keep-alive rule: HTTP/1.1 stays open unless the client asked to
/// close; HTTP/1.0 stays open only when the client asked for keep-alive
/// *and* the response declared a `Content-Length` the client can rely on.
fn decide_keep_alive(
    no_keep_alive: bool,
    version: Version,
    close_requested: bool,
    keep_alive_requested: bool,
    response_has_length: bool,
) -> bool {
    if no_keep_alive {
        return false;
    }
    match version {
        Version::Http11 => !close_requested,
        Version::Http10 => keep_alive_requested && response_has_length,
    }
}

/// Parses a complete request head (start line + headers + blank line).
pub(crate) fn parse_request_head(data: &[u8]) -> Result<ParsedHead, HttpError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parser = httparse::Request::new(&mut slots);
    match parser.parse(data) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(HttpError::MalformedRequest("truncated request head".into()));
        }
        Err(e) => return Err(HttpError::MalformedRequest(e.to_string())),
    }
    let method: Method = parser
        .method
        .ok_or_else(|| HttpError::MalformedRequest("missing method".into()))?
        .parse()
        .unwrap(); // Infallible
    let uri = parser
        .path
        .ok_or_else(|| HttpError::MalformedRequest("missing request target".into()))?
        .to_owned();
    let version = match parser.version {
        Some(0) => Version::Http10,
        Some(1) => Version::Http11,
        Some(other) => {
            return Err(HttpError::MalformedRequest(format!(
                "unsupported HTTP version 1.{other}"
            )));
        }
        None => return Err(HttpError::MalformedRequest("missing version".into())),
    };
    let mut headers = Headers::with_capacity(parser.headers.len());
    for header in parser.headers.iter() {
        headers.add(header.name, String::from_utf8_lossy(header.value).into_owned());
    }
    Ok(ParsedHead {
        method,
        uri,
        version,
        headers,
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
