//! The keep-alive decision matrix, exercised on the wire.
//!
//! HTTP/1.1 connections stay open unless the client sends
//! `Connection: close`. HTTP/1.0 connections stay open only when the client
//! sends `Connection: keep-alive` *and* the response declares a
//! `Content-Length`. The `no_keep_alive` configuration forces close.

use std::cell::Cell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::time::{Duration, Instant};

use squall::http::{HttpServer, HttpServerConfig};
use squall::reactor::Reactor;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

fn serve<T: Send + 'static>(
    mut server: HttpServer,
    client: impl FnOnce(SocketAddr) -> T + Send + 'static,
) -> T {
    let reactor = Rc::new(Reactor::new().expect("reactor"));
    server
        .listen(&reactor, 0, Some("127.0.0.1"))
        .expect("listen");
    let addr = server.local_addrs()[0];
    let handle = reactor.handle();
    let driver = std::thread::spawn(move || {
        let result = client(addr);
        handle.stop();
        result
    });
    let failsafe = Rc::clone(&reactor);
    reactor.schedule_timeout(Instant::now() + Duration::from_secs(10), move || {
        failsafe.stop();
    });
    reactor.run().expect("reactor run");
    driver.join().expect("client thread")
}

fn connect(addr: SocketAddr) -> TcpStream {
    let sock = TcpStream::connect(addr).expect("connect");
    sock.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    sock
}

fn read_exact(sock: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    sock.read_exact(&mut buf).expect("read_exact");
    buf
}

fn read_to_end(sock: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    sock.read_to_end(&mut buf).expect("read_to_end");
    buf
}

/// Responds with a fixed body and no `Content-Length` (a streamed
/// response).
const STREAMED_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\ndata";

fn streamed_server(requests: &Rc<Cell<u32>>) -> HttpServer {
    let requests = Rc::clone(requests);
    HttpServer::new(HttpServerConfig::default(), move |request| {
        requests.set(requests.get() + 1);
        request.write(STREAMED_RESPONSE);
        request.finish();
    })
}

/// Responds with a declared `Content-Length`.
const SIZED_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nokay";

fn sized_server(config: HttpServerConfig, requests: &Rc<Cell<u32>>) -> HttpServer {
    let requests = Rc::clone(requests);
    HttpServer::new(config, move |request| {
        requests.set(requests.get() + 1);
        request.write(SIZED_RESPONSE);
        request.finish();
    })
}

#[test]
fn test_http11_streamed_response_keeps_connection_open() {
    let requests = Rc::new(Cell::new(0u32));
    let server = streamed_server(&requests);
    let (first, second) = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(b"GET /one HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let first = read_exact(&mut sock, STREAMED_RESPONSE.len());
        // No Connection header and no Content-Length: HTTP/1.1 still keeps
        // the connection open, so a second request must work.
        sock.write_all(b"GET /two HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let second = read_exact(&mut sock, STREAMED_RESPONSE.len());
        (first, second)
    });
    assert_eq!(first, STREAMED_RESPONSE);
    assert_eq!(second, STREAMED_RESPONSE);
    assert_eq!(requests.get(), 2);
}

#[test]
fn test_http11_connection_close_closes() {
    let requests = Rc::new(Cell::new(0u32));
    let server = sized_server(HttpServerConfig::default(), &requests);
    let response = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        read_to_end(&mut sock)
    });
    assert_eq!(response, SIZED_RESPONSE);
    assert_eq!(requests.get(), 1);
}

#[test]
fn test_http10_without_keep_alive_always_closes() {
    let requests = Rc::new(Cell::new(0u32));
    // Even a response with Content-Length closes without the keep-alive
    // token from the client.
    let server = sized_server(HttpServerConfig::default(), &requests);
    let response = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").unwrap();
        read_to_end(&mut sock)
    });
    assert_eq!(response, SIZED_RESPONSE);
    assert_eq!(requests.get(), 1);
}

#[test]
fn test_http10_keep_alive_with_length_stays_open() {
    let requests = Rc::new(Cell::new(0u32));
    let server = sized_server(HttpServerConfig::default(), &requests);
    let (first, second) = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(b"GET /one HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let first = read_exact(&mut sock, SIZED_RESPONSE.len());
        sock.write_all(b"GET /two HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let second = read_exact(&mut sock, SIZED_RESPONSE.len());
        (first, second)
    });
    assert_eq!(first, SIZED_RESPONSE);
    assert_eq!(second, SIZED_RESPONSE);
    assert_eq!(requests.get(), 2);
}

#[test]
fn test_http10_keep_alive_without_length_closes() {
    let requests = Rc::new(Cell::new(0u32));
    // The client asked for keep-alive, but the streamed response gives it
    // no length to rely on; the server must close.
    let server = streamed_server(&requests);
    let response = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(b"GET / HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        read_to_end(&mut sock)
    });
    assert_eq!(response, STREAMED_RESPONSE);
    assert_eq!(requests.get(), 1);
}

#[test]
fn test_no_keep_alive_config_forces_close() {
    let requests = Rc::new(Cell::new(0u32));
    let config = HttpServerConfig {
        no_keep_alive: true,
        ..HttpServerConfig::default()
    };
    let server = sized_server(config, &requests);
    let response = serve(server, |addr| {
        let mut sock = connect(addr);
        // Nothing in the request asks for a close.
        sock.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        read_to_end(&mut sock)
    });
    assert_eq!(response, SIZED_RESPONSE);
    assert_eq!(requests.get(), 1);
}
