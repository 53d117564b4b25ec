// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! End-to-end tests over real sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aioli::{
    Action, Request, RequestCtx, Response, RunMode, Server, TerminationCode, TerminationInfo,
    UploadAction,
};

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.addr().unwrap()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .set_write_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Reads one response: headers, then exactly `Content-Length` body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        assert_eq!(stream.read(&mut byte).unwrap(), 1, "eof inside headers");
        buf.push(byte[0]);
    }
    let head = String::from_utf8(buf).unwrap();

    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("Content-Length")
                .then(|| value.trim().parse::<usize>().unwrap())
        })
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn hello_handler(request: &Request, _: &mut RequestCtx) -> Action {
    Action::Respond(Response::text(format!("hello {}", request.url())).into_shared())
}

#[test]
fn serves_and_keeps_alive() {
    let server = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .handler(hello_handler)
        .start()
        .unwrap();

    let mut stream = connect(&server);

    stream
        .write_all(b"GET /one HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert_eq!(body, b"hello /one");

    // Same socket, second request.
    stream
        .write_all(b"GET /two HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"hello /two");

    server.stop();
    server.wait();
}

#[test]
fn pipelined_requests_on_one_socket() {
    let server = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .handler(hello_handler)
        .start()
        .unwrap();

    let mut stream = connect(&server);
    stream
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: l\r\n\r\nGET /b HTTP/1.1\r\nHost: l\r\n\r\n",
        )
        .unwrap();

    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"hello /a");
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"hello /b");
}

#[test]
fn upload_roundtrip() {
    let handler = |_: &Request, _: &mut RequestCtx| Action::Upload {
        handler: Box::new(|_: &Request, chunk: &[u8]| {
            if chunk.is_empty() {
                UploadAction::Respond(Response::text("received").into_shared())
            } else {
                UploadAction::Continue
            }
        }),
        large_buffer_size: 0,
    };

    let server = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .handler(handler)
        .start()
        .unwrap();

    let mut stream = connect(&server);
    stream
        .write_all(b"POST /up HTTP/1.1\r\nHost: l\r\nContent-Length: 11\r\n\r\nhello world")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"received");
}

#[test]
fn worker_pool_serves_many_connections() {
    let server = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .run_mode(RunMode::WorkerPool(2))
        .handler(hello_handler)
        .start()
        .unwrap();

    for i in 0..6 {
        let mut stream = connect(&server);
        let request = format!("GET /c{i} HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(body, format!("hello /c{i}").into_bytes());
    }

    server.stop();
    server.wait();
}

#[test]
fn thread_per_connection_mode_works() {
    let server = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .run_mode(RunMode::ThreadPerConnection)
        .handler(hello_handler)
        .start()
        .unwrap();

    let mut first = connect(&server);
    let mut second = connect(&server);

    second
        .write_all(b"GET /2 HTTP/1.1\r\nHost: l\r\n\r\n")
        .unwrap();
    let (_, body) = read_response(&mut second);
    assert_eq!(body, b"hello /2");

    first
        .write_all(b"GET /1 HTTP/1.1\r\nHost: l\r\n\r\n")
        .unwrap();
    let (_, body) = read_response(&mut first);
    assert_eq!(body, b"hello /1");
}

#[test]
fn chunked_response_over_the_wire() {
    let handler = |_: &Request, _: &mut RequestCtx| {
        Action::Respond(
            Response::from_producer(|| {
                Box::new(|pos: u64, buf: &mut [u8]| {
                    if pos < 8 {
                        buf[..4].copy_from_slice(b"data");
                        aioli::ProducerAction::chunk(4)
                    } else {
                        aioli::ProducerAction::finish()
                    }
                })
            })
            .into_shared(),
        )
    };

    let server = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .handler(handler)
        .start()
        .unwrap();

    let mut stream = connect(&server);
    stream
        .write_all(b"GET /stream HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).unwrap();
    let wire = String::from_utf8(wire).unwrap();
    assert!(wire.contains("Transfer-Encoding: chunked\r\n"));
    assert_eq!(wire.matches("4\r\ndata\r\n").count(), 2);
    assert!(wire.ends_with("0\r\n\r\n"));
}

#[test]
fn termination_callback_fires_on_completed_requests() {
    struct Recording(Arc<AtomicUsize>);
    impl aioli::ServerHandler for Recording {
        fn on_request(&self, _: &Request, _: &mut RequestCtx) -> Action {
            Action::Respond(Response::text("bye").into_shared())
        }
        fn on_request_terminated(&self, info: &TerminationInfo<'_>) {
            if info.code == TerminationCode::CompletedOk {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    let completed = Arc::new(AtomicUsize::new(0));
    let server = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .handler(Recording(completed.clone()))
        .start()
        .unwrap();

    let mut stream = connect(&server);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n")
        .unwrap();
    let _ = read_response(&mut stream);

    server.stop();
    server.wait();
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[cfg(unix)]
#[test]
fn serves_unix_domain_sockets() {
    use std::os::unix::net::UnixStream;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aioli.sock");

    let server = Server::builder()
        .bind_unix(&path)
        .handler(hello_handler)
        .start()
        .unwrap();

    let mut stream = UnixStream::connect(&path).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET /uds HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).unwrap();
    let wire = String::from_utf8(wire).unwrap();
    assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(wire.ends_with("hello /uds"));

    server.stop();
    server.wait();
}

#[test]
fn idle_connections_time_out() {
    let server = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .timeout(Some(Duration::from_millis(200)))
        .handler(hello_handler)
        .start()
        .unwrap();

    let mut stream = connect(&server);
    // Say nothing; the server should close us.
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected the idle connection to be closed");
}
