// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The externally driven event-loop model.
//!
//! Here the application owns the poll loop. The engine tells it which
//! descriptors to watch through the watch callback, the application reports
//! readiness back with [`ExternalDriver::fd_ready`] and
//! [`ExternalDriver::listener_ready`], and calls
//! [`ExternalDriver::process`] once per loop iteration; `process` returns
//! how long the application may sleep before deadlines need attention.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::action::TerminationCode;
use crate::connection::{Connection, EngineCx, Wants};
use crate::daemon::itc::{Itc, ItcHandle, ItcMsg};
use crate::daemon::{Resumer, Shared};
use crate::registry::{ConnId, Registry};
use crate::transport::Listener;

/// What the engine asks the application's loop to do with a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Read,
    Write,
    ReadWrite,
    Remove,
}

/// The engine half of an application-driven event loop.
pub struct ExternalDriver {
    registry: Registry,
    itc: Itc,
    itc_handle: ItcHandle,
    listener: Option<Listener>,
    shared: Arc<Shared>,
    watch: Box<dyn FnMut(RawFd, WatchKind) + Send>,
    fd_index: HashMap<RawFd, u32>,
    /// Whether the application reports edge-triggered readiness. The engine
    /// keeps readiness bits sticky either way, so both disciplines work;
    /// the flag only documents the contract.
    #[allow(dead_code)]
    edge: bool,
    stopped: bool,
}

impl ExternalDriver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        listener: Listener,
        watch: Box<dyn FnMut(RawFd, WatchKind) + Send>,
        edge: bool,
    ) -> io::Result<ExternalDriver> {
        let itc = Itc::unwakeable();
        let itc_handle = itc.handle();
        Ok(ExternalDriver {
            registry: Registry::new(),
            itc,
            itc_handle,
            listener: Some(listener),
            shared,
            watch,
            fd_index: HashMap::new(),
            edge,
            stopped: false,
        })
    }

    /// The listening descriptor; the application watches it for readability.
    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.raw_fd())
    }

    /// The bound TCP address, when listening on TCP.
    pub fn addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr())
    }

    /// Call when the listening descriptor is readable: accepts until
    /// would-block.
    pub fn listener_ready(&mut self) {
        loop {
            if self.registry.len() >= self.shared.settings.max_connections {
                return;
            }
            let accepted = match self.listener.as_mut() {
                Some(listener) => listener.accept(self.shared.settings.nodelay),
                None => return,
            };
            match accepted {
                Ok((io, addr)) => {
                    trace!("accepted connection from {:?}", addr);
                    let stream = match self.shared.wrap_stream(io) {
                        Ok(stream) => stream,
                        Err(()) => continue,
                    };
                    let conn = Connection::new(
                        stream,
                        &self.shared.settings,
                        self.shared.runtime.now_ms(),
                    );
                    let id = self.registry.insert(conn);
                    self.sync_watch(id, Wants::Read);
                    self.registry.push_ready(id);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    return;
                }
            }
        }
    }

    /// Reports readiness of one connection descriptor.
    pub fn fd_ready(&mut self, fd: RawFd, readable: bool, writable: bool, error: bool) {
        let id = match self
            .fd_index
            .get(&fd)
            .copied()
            .and_then(|index| self.registry.id_at(index))
        {
            Some(id) => id,
            None => return,
        };
        if let Some(conn) = self.registry.get_mut(id) {
            if readable {
                conn.readiness.recv = true;
            }
            if writable {
                conn.readiness.send = true;
            }
            if error {
                conn.readiness.error = true;
            }
        }
        self.registry.push_ready(id);
    }

    /// Services everything that has pending work and returns how long the
    /// application may sleep before calling again. `None` means "no
    /// deadline: sleep until a descriptor is ready".
    pub fn process(&mut self) -> Option<Duration> {
        self.drain_itc();

        while let Some(id) = self.registry.pop_ready() {
            self.service(id);
        }

        let now = self.shared.runtime.now_ms();
        let sweep = self.registry.sweep(now, self.shared.settings.timeout_ms);
        for id in sweep.expired {
            debug!("connection timed out");
            if let Some(conn) = self.registry.get_mut(id) {
                conn.abort(&self.shared.handler, TerminationCode::TimeoutReached);
            }
            self.registry.mark_to_clean(id);
        }

        self.clean();

        if self.registry.has_ready() {
            Some(Duration::ZERO)
        } else {
            sweep.next_timeout_ms.map(Duration::from_millis)
        }
    }

    /// Terminates every connection and closes the listener.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(listener) = self.listener.take() {
            (self.watch)(listener.raw_fd(), WatchKind::Remove);
            drop(listener);
        }
        for id in self.registry.all_ids() {
            if let Some(conn) = self.registry.get_mut(id) {
                conn.abort(&self.shared.handler, TerminationCode::DaemonShutdown);
            }
            self.registry.mark_to_clean(id);
        }
        self.clean();
    }

    fn service(&mut self, id: ConnId) {
        let shared = self.shared.clone();
        let resumer = Resumer::new(self.itc_handle.clone(), id.as_u64());
        let outcome = {
            let conn = match self.registry.get_mut(id) {
                Some(conn) => conn,
                None => return,
            };
            let mut cx = EngineCx {
                handler: &shared.handler,
                runtime: &shared.runtime,
                pool: &shared.pool,
                settings: &shared.settings,
                resumer,
            };
            conn.process(&mut cx)
        };

        self.registry.touch(id);

        if outcome.closed {
            self.registry.mark_to_clean(id);
            return;
        }

        if outcome.suspended {
            self.registry.detach_timeout(id);
            self.unwatch(id);
            return;
        }

        if outcome.upgraded {
            if let Some(conn) = self.registry.remove(id) {
                if let Some(fd) = fd_of(&conn) {
                    self.fd_index.remove(&fd);
                    (self.watch)(fd, WatchKind::Remove);
                }
                if let Some((handler, io, leftover)) = conn.into_upgrade() {
                    info!("connection switched protocols");
                    handler.upgraded(io, leftover);
                }
            }
            return;
        }

        self.sync_watch(id, outcome.wants);
        if outcome.more {
            self.registry.push_ready(id);
        }
    }

    fn sync_watch(&mut self, id: ConnId, wants: Wants) {
        let fd = {
            let conn = match self.registry.get_mut(id) {
                Some(conn) => conn,
                None => return,
            };
            if wants == Wants::Nothing || conn.registered == Some(wants) {
                return;
            }
            conn.registered = Some(wants);
            match conn.stream.io_mut().raw_fd() {
                Some(fd) => fd,
                None => return,
            }
        };
        self.fd_index.insert(fd, id.index);
        let kind = match wants {
            Wants::Read => WatchKind::Read,
            Wants::Write => WatchKind::Write,
            Wants::Both => WatchKind::ReadWrite,
            Wants::Nothing => return,
        };
        (self.watch)(fd, kind);
    }

    fn unwatch(&mut self, id: ConnId) {
        let fd = {
            let conn = match self.registry.get_mut(id) {
                Some(conn) => conn,
                None => return,
            };
            conn.registered = None;
            match conn.stream.io_mut().raw_fd() {
                Some(fd) => fd,
                None => return,
            }
        };
        self.fd_index.remove(&fd);
        (self.watch)(fd, WatchKind::Remove);
    }

    fn clean(&mut self) {
        while self.registry.has_to_clean() {
            if let Some(mut conn) = self.registry.pop_to_clean() {
                let code = conn.termination.unwrap_or(TerminationCode::WithError);
                conn.report_termination(&self.shared.handler, code);
                conn.reclaim_buffers(&self.shared.pool);
                if let Some(fd) = fd_of(&conn) {
                    self.fd_index.remove(&fd);
                    (self.watch)(fd, WatchKind::Remove);
                }
            }
        }
    }

    fn drain_itc(&mut self) {
        while let Some(msg) = self.itc.try_recv() {
            match msg {
                ItcMsg::Accept(_) => {
                    // Not used in the external model; sockets arrive through
                    // listener_ready.
                }
                ItcMsg::Resume(raw) => {
                    let id = ConnId::from_u64(raw);
                    let suspended = self
                        .registry
                        .get_mut(id)
                        .map(|conn| conn.is_suspended())
                        .unwrap_or(false);
                    if suspended {
                        if let Some(conn) = self.registry.get_mut(id) {
                            conn.resume();
                            conn.registered = None;
                        }
                        self.sync_watch(id, Wants::Read);
                        self.registry.touch(id);
                        self.registry.push_ready(id);
                    }
                }
                ItcMsg::Stop => self.shutdown(),
            }
        }
    }
}

impl Drop for ExternalDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fd_of(conn: &Connection) -> Option<RawFd> {
    conn.raw_fd()
}
