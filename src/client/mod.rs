//! Non-blocking TCP connection factory.
//!
//! [`Connector`] resolves a host, opens a non-blocking outbound connection,
//! optionally wraps it in TLS, and reports the established [`Stream`]
//! through a callback. Connection attempts fall back across the resolved
//! addresses in order, and the whole process races against an optional
//! timeout that yields a synthetic [`ConnectError::TimedOut`] distinct from
//! any remote error.
//!
//! Host resolution is synchronous and runs on the caller's thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::reactor::{Reactor, TimeoutHandle};
use crate::server::AddressFamily;
use crate::stream::tls::TlsConnector;
use crate::stream::{Stream, StreamConfig, StreamError, Transport};

/// Errors produced while establishing an outbound connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no addresses resolved for {0}")]
    NoAddresses(String),

    /// The configured deadline elapsed before any address answered. The
    /// in-flight attempt is aborted, not retried.
    #[error("connect timed out")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Callback receiving the connected stream or the final error.
pub type ConnectResultCallback = Box<dyn FnOnce(Result<Stream, ConnectError>)>;

/// A non-blocking TCP connection factory bound to one reactor.
pub struct Connector {
    reactor: Rc<Reactor>,
    stream_config: StreamConfig,
}

impl Connector {
    pub fn new(reactor: Rc<Reactor>) -> Connector {
        Connector {
            reactor,
            stream_config: StreamConfig::default(),
        }
    }

    /// Overrides the buffer configuration for streams this connector makes.
    pub fn set_stream_config(&mut self, config: StreamConfig) {
        self.stream_config = config;
    }

    /// Connects to `host:port`, invoking `callback` exactly once with the
    /// established stream or the final error.
    ///
    /// Addresses resolved for `host` are tried in order until one answers.
    /// With `tls` set, the stream completes only after the TLS handshake
    /// (using `host` for SNI and certificate validation). With `timeout`
    /// set, the whole attempt is aborted at the deadline.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        family: AddressFamily,
        tls: Option<TlsConnector>,
        timeout: Option<Duration>,
        callback: impl FnOnce(Result<Stream, ConnectError>) + 'static,
    ) {
        let addrs = match resolve(host, port, family) {
            Ok(addrs) => addrs,
            Err(e) => {
                callback(Err(e));
                return;
            }
        };
        let attempt = Rc::new(RefCell::new(Attempt {
            reactor: Rc::clone(&self.reactor),
            host: host.to_owned(),
            addrs,
            tls,
            stream_config: self.stream_config.clone(),
            callback: Some(Box::new(callback)),
            current: None,
            timeout: None,
            last_error: None,
        }));
        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            let weak = Rc::downgrade(&attempt);
            let handle = self.reactor.schedule_timeout(deadline, move || {
                if let Some(attempt) = weak.upgrade() {
                    Attempt::expire(&attempt);
                }
            });
            attempt.borrow_mut().timeout = Some(handle);
        }
        Attempt::try_next(&attempt);
    }
}

/// State of one in-flight connect, shared between the address-fallback
/// logic, the stream's connect callback, and the timeout.
struct Attempt {
    reactor: Rc<Reactor>,
    host: String,
    addrs: VecDeque<SocketAddr>,
    tls: Option<TlsConnector>,
    stream_config: StreamConfig,
    /// Taken when the attempt finishes; `None` means already decided.
    callback: Option<ConnectResultCallback>,
    current: Option<Stream>,
    timeout: Option<TimeoutHandle>,
    last_error: Option<ConnectError>,
}

impl Attempt {
    /// Starts connecting to the next address, or finishes with the last
    /// error when the list is exhausted.
    fn try_next(attempt: &Rc<RefCell<Attempt>>) {
        let next = {
            let mut guard = attempt.borrow_mut();
            if guard.callback.is_none() {
                return; // already decided (e.g. timed out)
            }
            guard.current = None;
            guard.addrs.pop_front()
        };
        let Some(addr) = next else {
            let error = attempt
                .borrow_mut()
                .last_error
                .take()
                .unwrap_or_else(|| ConnectError::Io(io::Error::other("connection failed")));
            Self::finish(attempt, Err(error));
            return;
        };
        debug!(%addr, "connecting");
        let stream = {
            let guard = attempt.borrow();
            Self::open_stream(&guard, addr)
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%addr, error = %e, "connect attempt failed to start");
                attempt.borrow_mut().last_error = Some(e);
                Self::try_next(attempt);
                return;
            }
        };
        attempt.borrow_mut().current = Some(stream.clone());
        // The stream's callback slot carries the only strong reference to
        // the attempt until it is decided; the timeout holds a weak one.
        let attempt = Rc::clone(attempt);
        let connected = stream.clone();
        stream.set_connect_callback(move |result| {
            match result {
                Ok(()) => Self::finish(&attempt, Ok(connected)),
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    attempt.borrow_mut().last_error = Some(ConnectError::Stream(e));
                    Self::try_next(&attempt);
                }
            }
        });
    }

    /// Opens a non-blocking socket to `addr`; `connect` is expected to
    /// report in-progress, completed later by writability.
    fn open_stream(guard: &Attempt, addr: SocketAddr) -> Result<Stream, ConnectError> {
        let socket = mio::net::TcpStream::connect(addr)?;
        let transport = match &guard.tls {
            None => Transport::Plain(socket),
            Some(connector) => Transport::Tls(connector.connect(socket, &guard.host)?),
        };
        let stream = Stream::from_transport(
            Rc::clone(&guard.reactor),
            transport,
            true,
            guard.stream_config.clone(),
        )?;
        Ok(stream)
    }

    /// Timeout path: abort the in-flight stream and report the synthetic
    /// failure.
    fn expire(attempt: &Rc<RefCell<Attempt>>) {
        if attempt.borrow().callback.is_none() {
            return;
        }
        Self::finish(attempt, Err(ConnectError::TimedOut));
    }

    fn finish(attempt: &Rc<RefCell<Attempt>>, result: Result<Stream, ConnectError>) {
        let (callback, timeout, abandoned) = {
            let mut guard = attempt.borrow_mut();
            let callback = guard.callback.take();
            let timeout = guard.timeout.take();
            // On failure, tear down whatever attempt was in flight.
            let abandoned = if result.is_err() {
                guard.current.take()
            } else {
                guard.current = None;
                None
            };
            (callback, timeout, abandoned)
        };
        let Some(callback) = callback else { return };
        if let Some(handle) = timeout {
            attempt.borrow().reactor.cancel_timeout(&handle);
        }
        if let Some(stream) = abandoned {
            stream.close();
        }
        callback(result);
    }
}

fn resolve(host: &str, port: u16, family: AddressFamily) -> Result<VecDeque<SocketAddr>, ConnectError> {
    let addrs: VecDeque<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| ConnectError::Resolve {
            host: host.to_owned(),
            source,
        })?
        .filter(|addr| match family {
            AddressFamily::Unspec => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        })
        .collect();
    if addrs.is_empty() {
        return Err(ConnectError::NoAddresses(host.to_owned()));
    }
    Ok(addrs)
}
