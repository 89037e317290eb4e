//! End-to-end HTTP tests driving a real server over loopback sockets.
//!
//! Each test runs the reactor on the test thread while a client thread
//! speaks blocking HTTP/1.x to it, then stops the reactor through its
//! cross-thread handle.

use std::cell::Cell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::time::{Duration, Instant};

use squall::http::{HttpServer, HttpServerConfig};
use squall::reactor::Reactor;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs `server` on a fresh reactor while `client` drives it from another
/// thread; returns the client's result once the reactor has stopped.
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

fn read_to_end(sock: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    sock.read_to_end(&mut buf).expect("read_to_end");
    buf
}

/// Reads a response head byte by byte up to and including the blank line.
fn read_head(sock: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        sock.read_exact(&mut byte).expect("read head byte");
        head.push(byte[0]);
    }
    head
}

fn echo_uri_server() -> HttpServer {
    HttpServer::new(HttpServerConfig::default(), |request| {
        let body = format!("you asked for {}", request.uri());
        request.write(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            )
            .as_bytes(),
        );
        request.finish();
    })
}

#[test]
fn test_get_roundtrip() {
    let response = serve(echo_uri_server(), |addr| {
        let mut sock = connect(addr);
        sock.write_all(b"GET /greet HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        read_to_end(&mut sock)
    });
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.ends_with("you asked for /greet"), "got: {text}");
}

#[test]
fn test_request_head_split_across_writes() {
    let requests = Rc::new(Cell::new(0u32));
    let server = {
        let requests = Rc::clone(&requests);
        HttpServer::new(HttpServerConfig::default(), move |request| {
            requests.set(requests.get() + 1);
            request.write(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n");
            request.finish();
        })
    };
    let response = serve(server, |addr| {
        let mut sock = connect(addr);
        let head = b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        for chunk in head.chunks(5) {
            sock.write_all(chunk).unwrap();
            sock.flush().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        read_to_end(&mut sock)
    });
    assert!(response.starts_with(b"HTTP/1.1 204"));
    // The fragmented head must produce exactly one request.
    assert_eq!(requests.get(), 1);
}

#[test]
fn test_post_body_is_delivered() {
    let server = HttpServer::new(HttpServerConfig::default(), |request| {
        let body = request.body().clone();
        request.write(
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).as_bytes(),
        );
        request.write(&body);
        request.finish();
    });
    let response = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(
            b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
        )
        .unwrap();
        read_to_end(&mut sock)
    });
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.ends_with("hello world"), "got: {text}");
}

#[test]
fn test_expect_100_continue() {
    let server = HttpServer::new(HttpServerConfig::default(), |request| {
        let body = request.body().clone();
        request.write(
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).as_bytes(),
        );
        request.write(&body);
        request.finish();
    });
    let (interim, response) = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(
            b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nExpect: 100-continue\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
        // The interim status arrives before the body is sent.
        let interim = read_head(&mut sock);
        sock.write_all(b"abcde").unwrap();
        let response = read_to_end(&mut sock);
        (interim, response)
    });
    assert!(
        interim.starts_with(b"HTTP/1.1 100"),
        "got interim: {}",
        String::from_utf8_lossy(&interim)
    );
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.ends_with("abcde"), "got: {text}");
}

#[test]
fn test_malformed_request_gets_400_and_close() {
    let requests = Rc::new(Cell::new(0u32));
    let server = {
        let requests = Rc::clone(&requests);
        HttpServer::new(HttpServerConfig::default(), move |request| {
            requests.set(requests.get() + 1);
            request.finish();
        })
    };
    let response = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(b"NOT A VALID REQUEST\r\n\r\n").unwrap();
        read_to_end(&mut sock)
    });
    assert!(
        response.starts_with(b"HTTP/1.1 400"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );
    assert_eq!(requests.get(), 0, "malformed requests must not dispatch");
}

#[test]
fn test_oversized_content_length_is_rejected() {
    let requests = Rc::new(Cell::new(0u32));
    let server = {
        let requests = Rc::clone(&requests);
        let config = HttpServerConfig {
            max_body_size: 16,
            ..HttpServerConfig::default()
        };
        HttpServer::new(config, move |request| {
            requests.set(requests.get() + 1);
            request.finish();
        })
    };
    let response = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 1000\r\n\r\n")
            .unwrap();
        read_to_end(&mut sock)
    });
    assert!(
        response.starts_with(b"HTTP/1.1 400"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );
    assert_eq!(requests.get(), 0);
}

#[test]
fn test_trusted_proxy_headers_override_remote_ip_and_scheme() {
    let config = HttpServerConfig {
        trust_proxy_headers: true,
        ..HttpServerConfig::default()
    };
    let server = HttpServer::new(config, |request| {
        let body = format!("{} {}", request.remote_ip(), request.scheme());
        request.write(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            )
            .as_bytes(),
        );
        request.finish();
    });
    let response = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Real-Ip: 203.0.113.9\r\nX-Forwarded-Proto: https\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
        read_to_end(&mut sock)
    });
    let text = String::from_utf8(response).unwrap();
    assert!(text.ends_with("203.0.113.9 https"), "got: {text}");
}

#[test]
fn test_proxy_headers_ignored_by_default() {
    let server = HttpServer::new(HttpServerConfig::default(), |request| {
        let body = format!("{} {}", request.remote_ip(), request.scheme());
        request.write(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            )
            .as_bytes(),
        );
        request.finish();
    });
    let response = serve(server, |addr| {
        let mut sock = connect(addr);
        sock.write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Real-Ip: 203.0.113.9\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
        read_to_end(&mut sock)
    });
    let text = String::from_utf8(response).unwrap();
    assert!(text.ends_with("127.0.0.1 http"), "got: {text}");
}
