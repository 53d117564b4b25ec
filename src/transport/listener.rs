// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;

use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use super::Transport;

/// Where a server listens.
#[derive(Debug, Clone)]
pub enum BindAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

/// A bound, non-blocking listening socket.
pub enum Listener {
    Tcp(super::MioTcpListener),
    #[cfg(unix)]
    Unix(super::MioUnixListener),
}

impl Listener {
    /// Binds a listener.
    ///
    /// TCP listeners get SO_REUSEADDR, close-on-exec and non-blocking mode;
    /// `reuse_port` additionally sets SO_REUSEPORT so several servers can
    /// share one address. A UNIX listener fails if the socket file already
    /// exists; unlink stale files before binding.
    pub fn bind(addr: &BindAddr, reuse_port: bool) -> io::Result<Listener> {
        match addr {
            BindAddr::Tcp(addr) => {
                let socket = Socket::new(
                    Domain::for_address(*addr),
                    Type::STREAM,
                    Some(Protocol::TCP),
                )?;
                socket.set_reuse_address(true)?;
                #[cfg(unix)]
                if reuse_port {
                    socket.set_reuse_port(true)?;
                }
                #[cfg(unix)]
                socket.set_cloexec(true)?;
                socket.set_nonblocking(true)?;
                socket.bind(&(*addr).into())?;
                socket.listen(1024)?;
                let std_listener: std::net::TcpListener = socket.into();
                Ok(Listener::Tcp(super::MioTcpListener::from_std(std_listener)))
            }
            #[cfg(unix)]
            BindAddr::Unix(path) => {
                let _ = reuse_port;
                let std_listener = std::os::unix::net::UnixListener::bind(path)?;
                std_listener.set_nonblocking(true)?;
                Ok(Listener::Unix(super::MioUnixListener::from_std(
                    std_listener,
                )))
            }
        }
    }

    /// The local TCP address, when this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }

    /// Accepts one pending connection. mio marks the accepted stream
    /// non-blocking (on Linux in the same `accept4` call, together with
    /// close-on-exec).
    pub fn accept(
        &mut self,
        nodelay: bool,
    ) -> io::Result<(Box<dyn Transport>, Option<SocketAddr>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                let transport = super::accepted_tcp(stream, peer, nodelay);
                Ok((Box::new(transport), Some(peer)))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                Ok((Box::new(super::accepted_unix(stream)), None))
            }
        }
    }

    /// The raw listening descriptor, for externally driven event loops.
    #[cfg(unix)]
    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        match self {
            Listener::Tcp(listener) => listener.as_raw_fd(),
            Listener::Unix(listener) => listener.as_raw_fd(),
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => registry.register(listener, token, Interest::READABLE),
            #[cfg(unix)]
            Listener::Unix(listener) => registry.register(listener, token, Interest::READABLE),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => registry.deregister(listener),
            #[cfg(unix)]
            Listener::Unix(listener) => registry.deregister(listener),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BindAddr, Listener};

    #[test]
    fn bind_ephemeral_tcp() {
        let addr = BindAddr::Tcp("127.0.0.1:0".parse().unwrap());
        let listener = Listener::bind(&addr, false).unwrap();
        let local = listener.local_addr().unwrap();
        assert_ne!(local.port(), 0);
    }
}
