//! The request object surfaced to the application layer.

use std::net::IpAddr;
use std::rc::Rc;

use bytes::Bytes;

use super::connection::Http1Connection;
use super::{Headers, Method, Version};

/// A single parsed HTTP request, handed to the application callback.
///
/// The application produces the response exactly as it should appear on the
/// wire, writing chunks with [`write`](Self::write) and completing the
/// request with [`finish`](Self::finish); both delegate to the owning
/// [`Http1Connection`], which decides keep-alive once the response has
/// drained.
pub struct ServerRequest {
    method: Method,
    uri: String,
    version: Version,
    headers: Headers,
    body: Bytes,
    remote_ip: IpAddr,
    scheme: String,
    connection: Rc<Http1Connection>,
}

impl ServerRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        uri: String,
        version: Version,
        headers: Headers,
        body: Bytes,
        remote_ip: IpAddr,
        scheme: String,
        connection: Rc<Http1Connection>,
    ) -> ServerRequest {
        ServerRequest {
            method,
            uri,
            version,
            headers,
            body,
            remote_ip,
            scheme,
            connection,
        }
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request URI exactly as it appeared in the start line.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes (empty without `Content-Length`).
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the client's IP address, possibly overridden by trusted
    /// proxy headers.
    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    /// Returns `"http"` or `"https"`, possibly overridden by trusted proxy
    /// headers.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the connection this request arrived on.
    pub fn connection(&self) -> &Rc<Http1Connection> {
        &self.connection
    }

    /// Writes a chunk of the response to the connection.
    pub fn write(&self, chunk: &[u8]) {
        Http1Connection::write(&self.connection, chunk);
    }

    /// Marks the response complete. The connection is kept open or closed
    /// once its write buffer drains, per the keep-alive rules.
    pub fn finish(&self) {
        Http1Connection::finish(&self.connection);
    }
}
