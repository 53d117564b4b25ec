// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Server assembly and lifecycle.
//!
//! A [`Server`] owns the listening socket, the worker threads for the chosen
//! [`RunMode`], and the shared pieces every worker sees: the application
//! handler, the runtime clock, the large-buffer budget and the settings.
//! Stopping flips one flag and wakes every worker through its ITC; each
//! worker then drains its own connections and exits.

pub(crate) mod event_loop;
#[cfg(unix)]
mod external;
mod itc;

pub use self::itc::Resumer;
#[cfg(unix)]
pub use self::external::{ExternalDriver, WatchKind};

pub(crate) use self::itc::{Itc, ItcHandle, ItcMsg};

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::action::ServerHandler;
use crate::connection::Strictness;
use crate::daemon::event_loop::{AcceptSink, Worker};
use crate::pool::BufferPool;
use crate::runtime::Runtime;
use crate::tls::TlsSession;
use crate::transport::{BindAddr, Listener, Stream, Transport};

/// Which event-loop/threading model the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One thread owned by the server runs accept and every connection.
    OwnedThread,
    /// A listen thread accepts; each connection runs on a dedicated thread
    /// with its own small poll.
    ThreadPerConnection,
    /// A master thread only accepts; N workers own disjoint connection
    /// shards. `WorkerPool(0)` sizes the pool to the CPU count.
    WorkerPool(usize),
    /// No thread is owned: the application's own event loop drives an
    /// [`ExternalDriver`] (see [`ServerBuilder::start_external`]).
    External {
        /// Whether the application's loop reports edge-triggered readiness.
        edge_triggered: bool,
    },
}

/// Produces one TLS session per accepted connection.
pub(crate) type SessionFactory =
    Box<dyn Fn() -> Result<Box<dyn TlsSession>, String> + Send + Sync>;

/// Tunables resolved at build time.
pub(crate) struct Settings {
    /// Idle timeout in milliseconds; 0 disables.
    pub timeout_ms: u64,
    pub max_connections: usize,
    pub read_buf_size: usize,
    pub arena_size: usize,
    pub scratch_size: usize,
    pub strictness: Strictness,
    pub nodelay: bool,
    pub reuse_port: bool,
    /// Digest-authentication knobs, carried for the external auth helpers.
    #[allow(dead_code)]
    pub nonce_timeout: Duration,
    #[allow(dead_code)]
    pub max_nonce_uses: u32,
}

/// State shared by every worker of one server.
pub(crate) struct Shared {
    pub handler: Arc<dyn ServerHandler>,
    pub runtime: Runtime,
    pub pool: BufferPool,
    pub settings: Settings,
    pub session_factory: Option<SessionFactory>,
}

impl Shared {
    /// Wraps an accepted socket in its stream layer, deriving a TLS session
    /// when the server terminates TLS.
    pub(crate) fn wrap_stream(&self, io: Box<dyn Transport>) -> Result<Stream, ()> {
        match &self.session_factory {
            None => Ok(Stream::plain(io)),
            Some(factory) => match factory() {
                Ok(session) => Ok(Stream::tls(io, session)),
                Err(err) => {
                    warn!("TLS session setup failed: {}", err);
                    Err(())
                }
            },
        }
    }
}

/// Configures and starts a [`Server`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use aioli::{Action, Response, RunMode, Server};
///
/// let server = Server::builder()
///     .bind("0.0.0.0:8000".parse().unwrap())
///     .run_mode(RunMode::WorkerPool(4))
///     .timeout(Some(Duration::from_secs(10)))
///     .handler(|_req: &aioli::Request, _ctx: &mut aioli::RequestCtx| {
///         Action::Respond(Response::text("ok").into_shared())
///     })
///     .start()
///     .unwrap();
/// server.wait();
/// ```
pub struct ServerBuilder {
    bind: Option<BindAddr>,
    run_mode: RunMode,
    handler: Option<Arc<dyn ServerHandler>>,
    timeout: Option<Duration>,
    max_connections: usize,
    memory_pool_size: usize,
    large_buffer_budget: u64,
    strictness: Strictness,
    nodelay: bool,
    reuse_port: bool,
    nonce_timeout: Duration,
    max_nonce_uses: u32,
    session_factory: Option<SessionFactory>,
}

impl Default for ServerBuilder {
    fn default() -> ServerBuilder {
        ServerBuilder {
            bind: None,
            run_mode: RunMode::OwnedThread,
            handler: None,
            timeout: Some(Duration::from_secs(30)),
            max_connections: 1024,
            memory_pool_size: 32 * 1024,
            large_buffer_budget: 8 * 1024 * 1024,
            strictness: Strictness::Strict,
            nodelay: true,
            reuse_port: false,
            nonce_timeout: Duration::from_secs(90),
            max_nonce_uses: 1000,
            session_factory: None,
        }
    }
}

impl ServerBuilder {
    pub fn new() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Listens on a TCP address.
    pub fn bind(mut self, addr: SocketAddr) -> ServerBuilder {
        self.bind = Some(BindAddr::Tcp(addr));
        self
    }

    /// Listens on a UNIX-domain socket path. The path must not exist yet.
    #[cfg(unix)]
    pub fn bind_unix<P: Into<std::path::PathBuf>>(mut self, path: P) -> ServerBuilder {
        self.bind = Some(BindAddr::Unix(path.into()));
        self
    }

    pub fn run_mode(mut self, mode: RunMode) -> ServerBuilder {
        self.run_mode = mode;
        self
    }

    pub fn handler<H>(mut self, handler: H) -> ServerBuilder
    where
        H: ServerHandler + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Idle timeout per connection; `None` disables timeouts entirely.
    pub fn timeout(mut self, timeout: Option<Duration>) -> ServerBuilder {
        self.timeout = timeout;
        self
    }

    pub fn max_connections(mut self, limit: usize) -> ServerBuilder {
        self.max_connections = limit.max(1);
        self
    }

    /// Per-connection memory: half backs the read buffer, half the arena
    /// that holds parsed header data.
    pub fn memory_pool_size(mut self, bytes: usize) -> ServerBuilder {
        self.memory_pool_size = bytes.max(1024);
        self
    }

    /// Server-wide budget for upload staging buffers.
    pub fn large_buffer_budget(mut self, bytes: u64) -> ServerBuilder {
        self.large_buffer_budget = bytes;
        self
    }

    pub fn strictness(mut self, strictness: Strictness) -> ServerBuilder {
        self.strictness = strictness;
        self
    }

    pub fn nodelay(mut self, on: bool) -> ServerBuilder {
        self.nodelay = on;
        self
    }

    /// Sets SO_REUSEPORT on the listener so several servers can share one
    /// address.
    pub fn reuse_port(mut self, on: bool) -> ServerBuilder {
        self.reuse_port = on;
        self
    }

    /// Nonce lifetime for digest-authentication helpers layered on top.
    pub fn digest_nonce_timeout(mut self, timeout: Duration) -> ServerBuilder {
        self.nonce_timeout = timeout;
        self
    }

    /// Highest nonce-count a digest client may present.
    pub fn digest_max_nonce_uses(mut self, count: u32) -> ServerBuilder {
        self.max_nonce_uses = count;
        self
    }

    /// Terminates TLS with the bundled rustls backend.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, config: crate::tls::rustls_backend::TlsConfig) -> ServerBuilder {
        self.session_factory = Some(Box::new(move || {
            config
                .new_session()
                .map(|session| Box::new(session) as Box<dyn TlsSession>)
                .map_err(|err| err.to_string())
        }));
        self
    }

    /// Terminates TLS with a custom session factory.
    pub fn tls_sessions<F>(mut self, factory: F) -> ServerBuilder
    where
        F: Fn() -> Result<Box<dyn TlsSession>, String> + Send + Sync + 'static,
    {
        self.session_factory = Some(Box::new(factory));
        self
    }

    fn into_shared(self) -> io::Result<(Arc<Shared>, BindAddr, RunMode)> {
        let bind = self.bind.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no listen address configured")
        })?;
        let handler = self.handler.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no request handler configured")
        })?;

        let settings = Settings {
            timeout_ms: self.timeout.map(|d| d.as_millis() as u64).unwrap_or(0),
            max_connections: self.max_connections,
            read_buf_size: self.memory_pool_size / 2,
            arena_size: self.memory_pool_size / 2,
            scratch_size: (self.memory_pool_size / 2).min(16 * 1024),
            strictness: self.strictness,
            nodelay: self.nodelay,
            reuse_port: self.reuse_port,
            nonce_timeout: self.nonce_timeout,
            max_nonce_uses: self.max_nonce_uses,
        };

        let shared = Arc::new(Shared {
            handler,
            runtime: Runtime::new(),
            pool: BufferPool::new(self.large_buffer_budget),
            settings,
            session_factory: self.session_factory,
        });

        Ok((shared, bind, self.run_mode))
    }

    /// Binds the listener and starts the worker threads.
    pub fn start(self) -> io::Result<Server> {
        let (shared, bind, run_mode) = self.into_shared()?;
        let reuse_port = shared.settings.reuse_port;
        let listener = Listener::bind(&bind, reuse_port)?;
        let local_addr = listener.local_addr();
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers: Vec<Worker> = Vec::new();
        match run_mode {
            RunMode::OwnedThread => {
                workers.push(Worker::new(
                    shared.clone(),
                    stop.clone(),
                    Some(listener),
                    AcceptSink::Own,
                )?);
            }
            RunMode::ThreadPerConnection => {
                workers.push(Worker::new(
                    shared.clone(),
                    stop.clone(),
                    Some(listener),
                    AcceptSink::SpawnThread,
                )?);
            }
            RunMode::WorkerPool(n) => {
                let n = if n == 0 { num_cpus::get() } else { n };
                let mut targets = Vec::with_capacity(n);
                for _ in 0..n {
                    let worker =
                        Worker::new(shared.clone(), stop.clone(), None, AcceptSink::Own)?;
                    targets.push(worker.itc_handle());
                    workers.push(worker);
                }
                workers.push(Worker::new(
                    shared.clone(),
                    stop.clone(),
                    Some(listener),
                    AcceptSink::Dispatch { targets, next: 0 },
                )?);
            }
            RunMode::External { .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "external run mode is driven through start_external",
                ));
            }
        }

        let itc_handles: Vec<ItcHandle> = workers.iter().map(|w| w.itc_handle()).collect();
        let threads = workers
            .into_iter()
            .enumerate()
            .map(|(i, mut worker)| {
                std::thread::Builder::new()
                    .name(format!("aioli-worker-{}", i))
                    .spawn(move || worker.run())
            })
            .collect::<io::Result<Vec<_>>>()?;

        info!(
            "server listening on {}",
            local_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unix socket".to_owned())
        );

        Ok(Server {
            stop,
            threads,
            itc_handles,
            local_addr,
        })
    }

    /// Binds the listener and hands the loop to the application: no thread
    /// is spawned; readiness flows in through the returned driver.
    #[cfg(unix)]
    pub fn start_external<W>(self, watch: W) -> io::Result<ExternalDriver>
    where
        W: FnMut(std::os::unix::io::RawFd, WatchKind) + Send + 'static,
    {
        let edge = matches!(
            self.run_mode,
            RunMode::External {
                edge_triggered: true
            }
        );
        let (shared, bind, _) = self.into_shared()?;
        let reuse_port = shared.settings.reuse_port;
        let listener = Listener::bind(&bind, reuse_port)?;
        ExternalDriver::new(shared, listener, Box::new(watch), edge)
    }
}

/// A running server.
///
/// Dropping the server stops it: the stop flag is raised, every worker is
/// woken through its ITC, drains its connections (running the termination
/// callbacks with `DaemonShutdown`), and exits.
pub struct Server {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    itc_handles: Vec<ItcHandle>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Shortcut: binds `addr` and serves `handler` on one owned thread.
    pub fn new<A, H>(addr: A, handler: H) -> io::Result<Server>
    where
        A: ToSocketAddrs,
        H: ServerHandler + 'static,
    {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no usable address"))?;
        Server::builder().bind(addr).handler(handler).start()
    }

    /// The bound TCP address (useful with port 0).
    pub fn addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Requests shutdown and returns immediately.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::Relaxed) {
            info!("server stopping");
        }
        for handle in &self.itc_handles {
            handle.send(ItcMsg::Stop);
        }
    }

    /// Blocks until every worker thread has exited.
    pub fn wait(mut self) {
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}
