// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Drives the engine from an application-owned loop.
//!
//! A real embedder would feed readiness from its own poll; the test stands
//! in for one by reporting every watched descriptor ready each turn — the
//! engine's sticky readiness bits make over-reporting harmless.

#![cfg(unix)]

use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use aioli::{Action, Request, RequestCtx, Response, RunMode, Server, WatchKind};

#[test]
fn request_response_through_external_loop() {
    let watched: Arc<Mutex<HashSet<RawFd>>> = Arc::new(Mutex::new(HashSet::new()));
    let watch_list = watched.clone();

    let mut driver = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .run_mode(RunMode::External {
            edge_triggered: false,
        })
        .handler(|request: &Request, _: &mut RequestCtx| {
            Action::Respond(Response::text(format!("ext {}", request.url())).into_shared())
        })
        .start_external(move |fd, kind| {
            let mut watched = watch_list.lock().unwrap();
            match kind {
                WatchKind::Remove => {
                    watched.remove(&fd);
                }
                _ => {
                    watched.insert(fd);
                }
            }
        })
        .unwrap();

    let addr = driver.addr().unwrap();
    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n")
        .unwrap();
    client.set_nonblocking(true).unwrap();

    let mut wire = Vec::new();
    let mut closed = false;
    for _ in 0..2_000 {
        driver.listener_ready();
        let fds: Vec<RawFd> = watched.lock().unwrap().iter().copied().collect();
        for fd in fds {
            driver.fd_ready(fd, true, true, false);
        }
        driver.process();

        let mut buf = [0u8; 4096];
        match client.read(&mut buf) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => wire.extend_from_slice(&buf[..n]),
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => panic!("client read failed: {err}"),
        }
        thread::sleep(Duration::from_millis(1));
    }

    assert!(closed, "server never closed the connection");
    let wire = String::from_utf8(wire).unwrap();
    assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"), "wire: {wire}");
    assert!(wire.contains("Connection: close\r\n"));
    assert!(wire.ends_with("ext /x"));

    driver.shutdown();
}
