//! TLS transport for [`Stream`](super::Stream)s.
//!
//! A TLS stream interposes a handshake state machine before behaving like a
//! plain stream: readiness events are routed to [`TlsTransport::
//! handshake_step`] until the session is established, after which payload
//! I/O goes through the session's record layer instead of the raw socket.
//!
//! Certificates and keys are loaded from PEM files. An ordered ALPN
//! protocol list may be configured; the negotiated protocol is surfaced via
//! [`Stream::alpn_protocol`](super::Stream::alpn_protocol) once the
//! handshake completes.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use super::HandshakeStatus;

/// Server-side TLS settings: certificate/key file paths and an optional
/// ordered ALPN protocol list.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl TlsOptions {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        TlsOptions {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            alpn_protocols: Vec::new(),
        }
    }

    /// Sets the ALPN protocols offered during the handshake, most preferred
    /// first.
    #[must_use]
    pub fn alpn(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }
}

/// Builds server TLS sessions for accepted sockets.
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
}

impl TlsAcceptor {
    /// Loads the certificate chain and private key named by `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read or parsed, or the
    /// certificate/key pair is rejected.
    pub fn from_options(options: &TlsOptions) -> io::Result<TlsAcceptor> {
        let certs = load_certs(&options.cert_file)?;
        let key = load_private_key(&options.key_file)?;
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;
        config.alpn_protocols = options.alpn_protocols.clone();
        Ok(TlsAcceptor {
            config: Arc::new(config),
        })
    }

    /// Starts a server-side TLS session over an accepted socket. The
    /// handshake is driven later by readiness events.
    pub fn accept(&self, socket: TcpStream) -> io::Result<TlsTransport> {
        let session = ServerConnection::new(Arc::clone(&self.config)).map_err(io::Error::other)?;
        Ok(TlsTransport::new(socket, Connection::from(session)))
    }
}

/// Builds client TLS sessions for outbound sockets.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// Builds a connector trusting the CA certificates in the given PEM
    /// file.
    pub fn from_ca_file(
        ca_file: impl AsRef<Path>,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> io::Result<TlsConnector> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file.as_ref())? {
            roots.add(cert).map_err(io::Error::other)?;
        }
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn_protocols;
        Ok(TlsConnector {
            config: Arc::new(config),
        })
    }

    /// Starts a client-side TLS session over a (possibly still connecting)
    /// socket. `server_name` is used for SNI and certificate validation.
    pub fn connect(&self, socket: TcpStream, server_name: &str) -> io::Result<TlsTransport> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let session =
            ClientConnection::new(Arc::clone(&self.config), name).map_err(io::Error::other)?;
        Ok(TlsTransport::new(socket, Connection::from(session)))
    }
}

/// A socket plus a TLS session, pumped by readiness events.
pub struct TlsTransport {
    socket: TcpStream,
    session: Connection,
    handshaking: bool,
}

impl TlsTransport {
    fn new(socket: TcpStream, session: Connection) -> TlsTransport {
        TlsTransport {
            socket,
            session,
            handshaking: true,
        }
    }

    pub(crate) fn socket(&self) -> &TcpStream {
        &self.socket
    }

    pub(crate) fn handshaking(&self) -> bool {
        self.handshaking
    }

    pub(crate) fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.session.alpn_protocol().map(<[u8]>::to_vec)
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    /// Advances the handshake as far as the socket allows.
    ///
    /// Returns which readiness the handshake is waiting on, or `Done` once
    /// the session is established. Any error is fatal to the stream.
    pub(crate) fn handshake_step(&mut self) -> io::Result<HandshakeStatus> {
        loop {
            while self.session.wants_write() {
                match self.session.write_tls(&mut self.socket) {
                    Ok(0) => return Ok(HandshakeStatus::WantsWrite),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::WantsWrite);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            if !self.session.is_handshaking() {
                self.handshaking = false;
                return Ok(HandshakeStatus::Done);
            }
            match self.session.read_tls(&mut self.socket) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during TLS handshake",
                    ));
                }
                Ok(_) => {
                    self.session.process_new_packets().map_err(io::Error::other)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeStatus::WantsRead);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads decrypted payload bytes. Returns `Ok(0)` on end of stream and
    /// `WouldBlock` when no plaintext is available yet.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut tcp_eof = false;
        loop {
            match self.session.read_tls(&mut self.socket) {
                Ok(0) => {
                    tcp_eof = true;
                    break;
                }
                Ok(_) => {
                    self.session.process_new_packets().map_err(io::Error::other)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        match self.session.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if tcp_eof {
                    // Peer went away without close_notify; nothing more is
                    // coming, report end of stream.
                    Ok(0)
                } else {
                    Err(e)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Encrypts `data` into the session and pushes as many records to the
    /// socket as it will take.
    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.session.writer().write(data)?;
        self.flush_pending()?;
        Ok(n)
    }

    /// Pushes buffered TLS records to the socket; a socket that would block
    /// leaves the remainder queued (visible via [`wants_write`](Self::wants_write)).
    pub(crate) fn flush_pending(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.socket) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        io::Error::new(e.kind(), format!("cannot open certificate file {}: {e}", path.display()))
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file)).collect()
}

fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        io::Error::new(e.kind(), format!("cannot open key file {}: {e}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key found in {}", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_file_is_an_error() {
        let options = TlsOptions::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(TlsAcceptor::from_options(&options).is_err());
    }

    #[test]
    fn alpn_builder_preserves_order() {
        let options = TlsOptions::new("c.pem", "k.pem")
            .alpn(vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert_eq!(options.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
