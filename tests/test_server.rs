//! TCP listener behavior: accept bursts and stop semantics.

use std::cell::Cell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use squall::reactor::Reactor;
use squall::server::TcpServer;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

fn read_to_end(sock: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    sock.read_to_end(&mut buf).expect("read_to_end");
    buf
}

#[test]
fn test_accept_burst_serves_every_queued_connection() {
    let reactor = Rc::new(Reactor::new().expect("reactor"));
    let accepted = Rc::new(Cell::new(0u32));
    let mut server = {
        let accepted = Rc::clone(&accepted);
        TcpServer::new(move |stream, _peer| {
            accepted.set(accepted.get() + 1);
            let s = stream.clone();
            stream.write_with(b"hi", move |_| s.close()).unwrap();
        })
    };
    server
        .listen(&reactor, 0, Some("127.0.0.1"))
        .expect("listen");
    let addr = server.local_addrs()[0];

    // All three connections are queued in the kernel backlog before the
    // reactor ever polls, so they arrive under a single readiness
    // notification and the accept loop must drain them all.
    let clients: Vec<TcpStream> = (0..3)
        .map(|_| {
            let sock = TcpStream::connect(addr).expect("connect");
            sock.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
            sock
        })
        .collect();

    let handle = reactor.handle();
    let driver = std::thread::spawn(move || {
        let mut responses = Vec::new();
        for mut sock in clients {
            responses.push(read_to_end(&mut sock));
        }
        handle.stop();
        responses
    });
    let failsafe = Rc::clone(&reactor);
    reactor.schedule_timeout(Instant::now() + Duration::from_secs(10), move || {
        failsafe.stop();
    });
    reactor.run().expect("reactor run");

    let responses = driver.join().expect("client thread");
    assert_eq!(responses.len(), 3);
    for response in &responses {
        assert_eq!(response, b"hi");
    }
    assert_eq!(accepted.get(), 3);
}

#[test]
fn test_stop_refuses_new_connections_but_keeps_accepted_ones() {
    let reactor = Rc::new(Reactor::new().expect("reactor"));
    let mut server = TcpServer::new(|stream, _peer| {
        stream.write(b"welcome\n").unwrap();
        let s = stream.clone();
        stream
            .read_until(&b"\n"[..], move |result| {
                if result.is_ok() {
                    let _ = s.write(b"pong\n");
                }
            })
            .unwrap();
    });
    server
        .listen(&reactor, 0, Some("127.0.0.1"))
        .expect("listen");
    let addr = server.local_addrs()[0];

    // Close the listening socket shortly after the first client is in.
    reactor.schedule_timeout(Instant::now() + Duration::from_millis(200), move || {
        server.stop();
    });

    let handle = reactor.handle();
    let driver = std::thread::spawn(move || {
        let mut sock = TcpStream::connect(addr).expect("connect");
        sock.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
        let mut greeting = [0u8; 8];
        sock.read_exact(&mut greeting).expect("greeting");
        assert_eq!(&greeting, b"welcome\n");

        // Wait until the server has stopped listening, then confirm the
        // accepted connection still answers.
        std::thread::sleep(Duration::from_millis(500));
        sock.write_all(b"ping\n").unwrap();
        let mut pong = [0u8; 5];
        sock.read_exact(&mut pong).expect("pong");
        assert_eq!(&pong, b"pong\n");

        let refused = TcpStream::connect(addr).is_err();
        handle.stop();
        refused
    });
    let failsafe = Rc::clone(&reactor);
    reactor.schedule_timeout(Instant::now() + Duration::from_secs(10), move || {
        failsafe.stop();
    });
    reactor.run().expect("reactor run");

    let refused = driver.join().expect("client thread");
    assert!(refused, "a stopped server must refuse new connections");
}
