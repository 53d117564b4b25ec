// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Non-blocking socket abstraction.
//!
//! The connection state machine never touches a socket type directly: it
//! talks to the [`Transport`] trait (or to [`Stream`], which layers an
//! optional TLS session on top). Platform differences — `sendfile` variants,
//! `TCP_CORK`, UNIX-domain sockets — live behind this trait and nowhere
//! else.

use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Registry, Token};

use crate::error::SocketError;
use crate::tls::{HandshakeStatus, ShutdownStatus, TlsSession};

mod listener;

pub use self::listener::{BindAddr, Listener};

/// One non-blocking stream socket.
///
/// `recv` and `send` return classified [`SocketError`]s instead of raw
/// `io::Error`s; the two transient kinds (`WouldBlock`, `Interrupted`) are
/// the engine's suspension points.
pub trait Transport: Send {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError>;

    /// Sends bytes. `push` hints that this write completes a message and any
    /// corking should be released afterwards.
    fn send(&mut self, buf: &[u8], push: bool) -> Result<usize, SocketError>;

    /// Vectored send. The default implementation sends the first non-empty
    /// segment only; callers must treat the result as a plain byte count.
    fn send_vectored(&mut self, bufs: &[IoSlice<'_>], push: bool) -> Result<usize, SocketError> {
        for buf in bufs {
            if !buf.is_empty() {
                return self.send(buf, push);
            }
        }
        Ok(0)
    }

    /// Copies up to `count` bytes of `file` starting at `offset` directly to
    /// the socket. Only plaintext TCP on platforms with a usable
    /// `sendfile(2)` supports this; everybody else reports `Unsupported` and
    /// the caller falls back to read-into-buffer.
    fn sendfile(&mut self, file: &File, offset: u64, count: usize) -> Result<usize, SocketError> {
        let _ = (file, offset, count);
        Err(SocketError::Unsupported)
    }

    fn set_nodelay(&mut self, on: bool);

    fn set_cork(&mut self, on: bool);

    /// Arms an immediate-RST close: SO_LINGER with a zero timeout. Used to
    /// signal corruption to the peer after a fatal mid-response error.
    fn set_linger_hard_close(&mut self);

    fn shut_wr(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// The raw descriptor, for externally driven event loops.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        None
    }

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
}

fn classify_read(res: io::Result<usize>) -> Result<usize, SocketError> {
    match res {
        Ok(0) => Err(SocketError::RemoteClosed),
        Ok(n) => Ok(n),
        Err(err) => Err(SocketError::classify(err)),
    }
}

fn classify_write(res: io::Result<usize>) -> Result<usize, SocketError> {
    res.map_err(SocketError::classify)
}

/// TCP transport over a mio stream.
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    corked: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> TcpTransport {
        TcpTransport {
            stream,
            peer,
            corked: false,
        }
    }

    #[cfg(unix)]
    fn set_int_opt(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) {
        use std::os::unix::io::AsRawFd;
        let fd = self.stream.as_raw_fd();
        unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

impl Transport for TcpTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        classify_read(self.stream.read(buf))
    }

    fn send(&mut self, buf: &[u8], push: bool) -> Result<usize, SocketError> {
        let res = classify_write(self.stream.write(buf));
        if push && self.corked {
            self.set_cork(false);
        }
        res
    }

    fn send_vectored(&mut self, bufs: &[IoSlice<'_>], push: bool) -> Result<usize, SocketError> {
        let res = classify_write(self.stream.write_vectored(bufs));
        if push && self.corked {
            self.set_cork(false);
        }
        res
    }

    #[cfg(target_os = "linux")]
    fn sendfile(&mut self, file: &File, offset: u64, count: usize) -> Result<usize, SocketError> {
        use std::os::unix::io::AsRawFd;
        let mut off = offset as libc::off_t;
        let sent = unsafe {
            libc::sendfile(
                self.stream.as_raw_fd(),
                file.as_raw_fd(),
                &mut off,
                count,
            )
        };
        if sent < 0 {
            let err = io::Error::last_os_error();
            // EINVAL/ENOSYS mean this descriptor pair can't sendfile at all;
            // the caller then switches to the buffered path for good.
            match err.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::ENOSYS) => Err(SocketError::Unsupported),
                _ => Err(SocketError::classify(err)),
            }
        } else {
            Ok(sent as usize)
        }
    }

    fn set_nodelay(&mut self, on: bool) {
        if let Err(err) = self.stream.set_nodelay(on) {
            debug!("set_nodelay failed: {}", err);
        }
    }

    #[cfg(target_os = "linux")]
    fn set_cork(&mut self, on: bool) {
        self.set_int_opt(libc::IPPROTO_TCP, libc::TCP_CORK, on as libc::c_int);
        self.corked = on;
    }

    #[cfg(not(target_os = "linux"))]
    fn set_cork(&mut self, on: bool) {
        self.corked = on;
    }

    #[cfg(unix)]
    fn set_linger_hard_close(&mut self) {
        use std::os::unix::io::AsRawFd;
        let fd = self.stream.as_raw_fd();
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const libc::linger as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            );
        }
    }

    #[cfg(not(unix))]
    fn set_linger_hard_close(&mut self) {}

    fn shut_wr(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Write);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        Some(self.stream.as_raw_fd())
    }

    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}

/// UNIX-domain transport. TCP socket options are no-ops here.
#[cfg(unix)]
pub struct UnixTransport {
    stream: UnixStream,
}

#[cfg(unix)]
impl UnixTransport {
    pub fn new(stream: UnixStream) -> UnixTransport {
        UnixTransport { stream }
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        classify_read(self.stream.read(buf))
    }

    fn send(&mut self, buf: &[u8], _push: bool) -> Result<usize, SocketError> {
        classify_write(self.stream.write(buf))
    }

    fn send_vectored(&mut self, bufs: &[IoSlice<'_>], _push: bool) -> Result<usize, SocketError> {
        classify_write(self.stream.write_vectored(bufs))
    }

    fn set_nodelay(&mut self, _on: bool) {}

    fn set_cork(&mut self, _on: bool) {}

    fn set_linger_hard_close(&mut self) {}

    fn shut_wr(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Write);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        Some(self.stream.as_raw_fd())
    }

    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}

/// Transport plus an optional TLS session.
///
/// The state machine reads and writes through this type only. Aside from the
/// handshake suspension points and [`Stream::pending`] (decrypted bytes
/// buffered inside the session while the socket itself is idle), TLS is
/// invisible above this layer.
pub struct Stream {
    io: Box<dyn Transport>,
    tls: Option<Box<dyn TlsSession>>,
    handshaken: bool,
}

impl Stream {
    pub fn plain(io: Box<dyn Transport>) -> Stream {
        Stream {
            io,
            tls: None,
            handshaken: true,
        }
    }

    pub fn tls(io: Box<dyn Transport>, session: Box<dyn TlsSession>) -> Stream {
        Stream {
            io,
            tls: Some(session),
            handshaken: false,
        }
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    #[inline]
    pub fn is_handshaking(&self) -> bool {
        !self.handshaken
    }

    /// Progresses the TLS handshake. Plaintext streams report `Done`.
    pub fn handshake(&mut self) -> Result<HandshakeStatus, SocketError> {
        match self.tls {
            None => Ok(HandshakeStatus::Done),
            Some(ref mut session) => {
                let status = session.handshake(&mut *self.io)?;
                if let HandshakeStatus::Done = status {
                    self.handshaken = true;
                }
                Ok(status)
            }
        }
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        match self.tls {
            None => self.io.recv(buf),
            Some(ref mut session) => session.recv(&mut *self.io, buf),
        }
    }

    pub fn send(&mut self, buf: &[u8], push: bool) -> Result<usize, SocketError> {
        match self.tls {
            None => self.io.send(buf, push),
            Some(ref mut session) => session.send(&mut *self.io, buf),
        }
    }

    pub fn send_vectored(
        &mut self,
        bufs: &[IoSlice<'_>],
        push: bool,
    ) -> Result<usize, SocketError> {
        match self.tls {
            None => self.io.send_vectored(bufs, push),
            Some(ref mut session) => {
                for buf in bufs {
                    if !buf.is_empty() {
                        return session.send(&mut *self.io, buf);
                    }
                }
                Ok(0)
            }
        }
    }

    pub fn sendfile(&mut self, file: &File, offset: u64, count: usize) -> Result<usize, SocketError> {
        match self.tls {
            None => self.io.sendfile(file, offset, count),
            Some(_) => Err(SocketError::Unsupported),
        }
    }

    /// True when the TLS session holds decrypted bytes that `recv` can
    /// return without the socket being recv-ready.
    pub fn pending(&self) -> bool {
        self.tls
            .as_ref()
            .map(|session| session.has_data_pending())
            .unwrap_or(false)
    }

    /// Initiates (or progresses) the TLS close-notify exchange.
    pub fn shutdown(&mut self) -> Result<ShutdownStatus, SocketError> {
        match self.tls {
            None => Ok(ShutdownStatus::Done),
            Some(ref mut session) => session.shutdown(&mut *self.io),
        }
    }

    pub fn io(&self) -> &dyn Transport {
        &*self.io
    }

    pub fn io_mut(&mut self) -> &mut dyn Transport {
        &mut *self.io
    }

    /// Unwraps the transport for a protocol upgrade handoff.
    pub fn into_io(self) -> Box<dyn Transport> {
        self.io
    }
}

/// Turns a bound listener's accepted stream into a transport, applying the
/// default per-stream options.
pub(crate) fn accepted_tcp(stream: TcpStream, peer: SocketAddr, nodelay: bool) -> TcpTransport {
    let mut transport = TcpTransport::new(stream, peer);
    if nodelay {
        transport.set_nodelay(true);
    }
    transport
}

#[cfg(unix)]
pub(crate) fn accepted_unix(stream: UnixStream) -> UnixTransport {
    UnixTransport::new(stream)
}

// Re-exported so the daemon module can name mio's listener types without
// importing mio directly everywhere.
pub(crate) type MioTcpListener = TcpListener;
#[cfg(unix)]
pub(crate) type MioUnixListener = UnixListener;

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory transport for state-machine tests.
    //!
    //! The transport is a handle onto shared state, so a test can keep a
    //! clone after the connection has taken ownership of the original.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub(crate) struct MockState {
        /// Chunks returned by successive `recv` calls; `None` entries yield
        /// `WouldBlock` once.
        pub input: VecDeque<Option<Vec<u8>>>,
        /// Everything the engine sent.
        pub output: Vec<u8>,
        /// After the script runs dry: report an orderly remote close when
        /// true, otherwise `WouldBlock` forever.
        pub eof_when_empty: bool,
        /// Cap on bytes accepted per `send` call; exercises short writes.
        pub max_send: usize,
        pub hard_closed: bool,
        pub shut_wr: bool,
    }

    #[derive(Clone)]
    pub(crate) struct MockTransport {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn new() -> MockTransport {
            MockTransport {
                state: Arc::new(Mutex::new(MockState {
                    max_send: usize::MAX,
                    ..MockState::default()
                })),
            }
        }

        pub fn scripted(chunks: Vec<Vec<u8>>) -> MockTransport {
            let mock = MockTransport::new();
            mock.state.lock().unwrap().input = chunks.into_iter().map(Some).collect();
            mock
        }

        pub fn push_input(&self, bytes: &[u8]) {
            self.state
                .lock()
                .unwrap()
                .input
                .push_back(Some(bytes.to_vec()));
        }

        pub fn output(&self) -> Vec<u8> {
            self.state.lock().unwrap().output.clone()
        }

        pub fn output_str(&self) -> String {
            String::from_utf8_lossy(&self.output()).into_owned()
        }
    }

    impl Transport for MockTransport {
        fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
            let mut state = self.state.lock().unwrap();
            match state.input.pop_front() {
                Some(Some(mut chunk)) => {
                    if chunk.len() > buf.len() {
                        let rest = chunk.split_off(buf.len());
                        state.input.push_front(Some(rest));
                    }
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(None) => Err(SocketError::WouldBlock),
                None => {
                    if state.eof_when_empty {
                        Err(SocketError::RemoteClosed)
                    } else {
                        Err(SocketError::WouldBlock)
                    }
                }
            }
        }

        fn send(&mut self, buf: &[u8], _push: bool) -> Result<usize, SocketError> {
            let mut state = self.state.lock().unwrap();
            let n = buf.len().min(state.max_send);
            state.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn set_nodelay(&mut self, _on: bool) {}

        fn set_cork(&mut self, _on: bool) {}

        fn set_linger_hard_close(&mut self) {
            self.state.lock().unwrap().hard_closed = true;
        }

        fn shut_wr(&mut self) {
            self.state.lock().unwrap().shut_wr = true;
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            Some("127.0.0.1:4000".parse().unwrap())
        }

        fn register(
            &mut self,
            _registry: &Registry,
            _token: Token,
            _interest: Interest,
        ) -> io::Result<()> {
            Ok(())
        }

        fn reregister(
            &mut self,
            _registry: &Registry,
            _token: Token,
            _interest: Interest,
        ) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
            Ok(())
        }
    }
}
