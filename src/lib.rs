//! # squall
//!
//! A single-threaded, non-blocking I/O server stack written from scratch:
//! an event reactor over epoll/kqueue, buffered callback-driven socket
//! streams (plain and TLS), a TCP listener/connector, and an HTTP/1.x
//! connection state machine built directly on top of them.
//!
//! One logical thread per [`reactor::Reactor`] drives all I/O and
//! callbacks for its sockets; "waiting" is represented as pending-operation
//! data, not parked stacks. The only cross-thread operation is
//! [`reactor::ReactorHandle::defer`]. Multi-process scaling forks workers
//! that each own an independent reactor.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use squall::http::{HttpServer, HttpServerConfig};
//! use squall::reactor::Reactor;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let reactor = Rc::new(Reactor::new()?);
//!     let mut server = HttpServer::new(HttpServerConfig::default(), |request| {
//!         let body = "Hello, World!";
//!         request.write(
//!             format!(
//!                 "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
//!                 body.len()
//!             )
//!             .as_bytes(),
//!         );
//!         request.finish();
//!     });
//!     server.listen(&reactor, 8080, None)?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     reactor.run()?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod http;
pub mod process;
pub mod reactor;
pub mod server;
pub mod stream;

pub use client::{ConnectError, Connector};
pub use http::{Headers, HttpServer, HttpServerConfig, Method, ServerRequest, Version};
pub use reactor::{PeriodicTimer, Reactor, ReactorHandle};
pub use server::{AddressFamily, TcpServer};
pub use stream::{Stream, StreamConfig, StreamError};
