// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The per-worker event loop.
//!
//! Every cycle runs the same phases regardless of threading model: poll with
//! a timeout capped by the nearest deadline, apply readiness to connections
//! and service them, accept until would-block, sweep timeouts, destroy
//! to-clean connections, drain ITC. A master worker (worker-pool mode) runs
//! the identical loop with an empty connection registry and hands accepted
//! sockets to its workers round-robin.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::action::TerminationCode;
use crate::connection::{Connection, EngineCx, Wants};
use crate::daemon::itc::{Itc, ItcHandle, ItcMsg};
use crate::daemon::{Resumer, Shared};
use crate::registry::{ConnId, Registry};
use crate::transport::{Listener, Transport};

pub(crate) const TOKEN_LISTENER: Token = Token(usize::MAX - 1);
pub(crate) const TOKEN_ITC: Token = Token(usize::MAX - 2);

/// What a worker does with sockets it accepts.
pub(crate) enum AcceptSink {
    /// Own them (single-thread and worker modes).
    Own,
    /// Round-robin them to other workers' ITCs (worker-pool master).
    Dispatch { targets: Vec<ItcHandle>, next: usize },
    /// Spawn a dedicated thread per connection.
    SpawnThread,
}

pub(crate) struct Worker {
    poll: Poll,
    events: Events,
    registry: Registry,
    itc: Itc,
    listener: Option<Listener>,
    accepting: bool,
    accept_sink: AcceptSink,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    /// Exit the loop once the registry drains (thread-per-connection).
    exit_when_empty: bool,
    /// Poll-timeout hint carried over from the last sweep.
    sleep_hint: Option<u64>,
    /// Per-connection threads this worker spawned: an ITC handle so stop can
    /// wake them, and a liveness token to count them.
    spawned: Vec<(ItcHandle, std::sync::Weak<()>)>,
}

impl Worker {
    pub fn new(
        shared: Arc<Shared>,
        stop: Arc<AtomicBool>,
        listener: Option<Listener>,
        accept_sink: AcceptSink,
    ) -> io::Result<Worker> {
        let poll = Poll::new()?;
        let itc = Itc::new(poll.registry(), TOKEN_ITC)?;
        let mut worker = Worker {
            events: Events::with_capacity(256),
            registry: Registry::new(),
            itc,
            listener,
            accepting: false,
            accept_sink,
            shared,
            stop,
            exit_when_empty: false,
            sleep_hint: None,
            spawned: Vec::new(),
            poll,
        };
        if let Some(listener) = worker.listener.as_mut() {
            listener.register(worker.poll.registry(), TOKEN_LISTENER)?;
            worker.accepting = true;
        }
        Ok(worker)
    }

    pub fn itc_handle(&self) -> ItcHandle {
        self.itc.handle()
    }

    /// Seeds the worker with one already-accepted socket (thread-per-
    /// connection workers start this way) and makes the loop exit when the
    /// registry drains.
    pub fn adopt(&mut self, io: Box<dyn Transport>) {
        self.exit_when_empty = true;
        self.take_ownership(io);
    }

    pub fn run(&mut self) {
        debug!("worker loop starting");
        while !self.stop.load(Ordering::Relaxed) {
            if self.exit_when_empty && self.registry.is_empty() {
                break;
            }
            self.cycle();
        }
        self.drain();
        debug!("worker loop finished");
    }

    /// One full cycle of the loop phases.
    fn cycle(&mut self) {
        let timeout = if self.registry.has_ready() || self.registry.has_to_clean() {
            Some(Duration::ZERO)
        } else if !self.accepting && self.listener.is_some() {
            // Paused at the connection limit: wake periodically to see
            // whether capacity freed up.
            Some(Duration::from_millis(
                self.sleep_hint.unwrap_or(500).min(500),
            ))
        } else {
            self.sleep_hint.map(Duration::from_millis)
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return,
            Err(err) => {
                error!("poll failed: {}", err);
                self.stop.store(true, Ordering::Relaxed);
                return;
            }
        }

        let mut accept_pending = false;
        let mut triggered: Vec<(u32, bool, bool, bool)> = Vec::new();

        for event in self.events.iter() {
            match event.token() {
                TOKEN_LISTENER => accept_pending = true,
                TOKEN_ITC => {}
                Token(index) => triggered.push((
                    index as u32,
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable() || event.is_write_closed(),
                    event.is_error(),
                )),
            }
        }

        for (index, readable, writable, error) in triggered {
            if let Some(id) = self.apply_readiness(index, readable, writable, error) {
                self.service(id);
            }
        }

        // Connections queued for buffer-borne work (pipelined requests, TLS
        // plaintext, resumes).
        while let Some(id) = self.registry.pop_ready() {
            self.service(id);
        }

        if accept_pending {
            self.accept_burst();
        }

        self.sweep_timeouts();
        self.clean();
        self.drain_itc();
    }

    fn apply_readiness(
        &mut self,
        index: u32,
        readable: bool,
        writable: bool,
        error: bool,
    ) -> Option<ConnId> {
        let id = self.registry.id_at(index)?;
        let conn = self.registry.get_mut(id)?;
        if readable {
            conn.readiness.recv = true;
        }
        if writable {
            conn.readiness.send = true;
        }
        if error {
            conn.readiness.error = true;
        }
        Some(id)
    }

    fn service(&mut self, id: ConnId) {
        let shared = self.shared.clone();
        let resumer = Resumer::new(self.itc.handle(), id.as_u64());
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
            if let Some(conn) = self.registry.get_mut(id) {
                let _ = conn.stream.io_mut().deregister(self.poll.registry());
                conn.registered = None;
            }
            return;
        }

        if outcome.upgraded {
            if let Some(mut conn) = self.registry.remove(id) {
                let _ = conn.stream.io_mut().deregister(self.poll.registry());
                if let Some((handler, io, leftover)) = conn.into_upgrade() {
                    info!("connection switched protocols");
                    handler.upgraded(io, leftover);
                }
            }
            self.maybe_resume_accepting();
            return;
        }

        self.update_interest(id, outcome.wants);

        if outcome.more {
            self.registry.push_ready(id);
        }
    }

    fn update_interest(&mut self, id: ConnId, wants: Wants) {
        let conn = match self.registry.get_mut(id) {
            Some(conn) => conn,
            None => return,
        };
        if wants == Wants::Nothing || conn.registered == Some(wants) {
            return;
        }
        let interest = match wants {
            Wants::Read => Interest::READABLE,
            Wants::Write => Interest::WRITABLE,
            Wants::Both => Interest::READABLE | Interest::WRITABLE,
            Wants::Nothing => return,
        };
        let token = Token(id.index as usize);
        let result = if conn.registered.is_none() {
            conn.stream.io_mut().register(self.poll.registry(), token, interest)
        } else {
            conn.stream
                .io_mut()
                .reregister(self.poll.registry(), token, interest)
        };
        match result {
            Ok(()) => conn.registered = Some(wants),
            Err(err) => {
                warn!("poll registration failed: {}", err);
                self.registry.mark_to_clean(id);
            }
        }
    }

    fn accept_burst(&mut self) {
        loop {
            if self.at_capacity() {
                self.pause_accepting();
                return;
            }
            let accepted = match self.listener.as_mut() {
                Some(listener) => listener.accept(self.shared.settings.nodelay),
                None => return,
            };
            match accepted {
                Ok((io, addr)) => {
                    trace!("accepted connection from {:?}", addr);
                    let keep = match &mut self.accept_sink {
                        AcceptSink::Dispatch { targets, next } => {
                            let target = &targets[*next % targets.len()];
                            *next = next.wrapping_add(1);
                            target.send(ItcMsg::Accept(io));
                            None
                        }
                        AcceptSink::Own => Some((io, false)),
                        AcceptSink::SpawnThread => Some((io, true)),
                    };
                    match keep {
                        Some((io, true)) => self.spawn_connection_thread(io),
                        Some((io, false)) => self.take_ownership(io),
                        None => {}
                    }
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

    /// Wraps and registers a socket this worker will own.
    fn take_ownership(&mut self, io: Box<dyn Transport>) {
        let stream = match self.shared.wrap_stream(io) {
            Ok(stream) => stream,
            Err(()) => return,
        };
        let conn = Connection::new(stream, &self.shared.settings, self.shared.runtime.now_ms());
        let id = self.registry.insert(conn);
        self.update_interest(id, Wants::Read);
        // The client may have sent bytes before we registered; try once.
        self.registry.push_ready(id);
    }

    fn spawn_connection_thread(&mut self, io: Box<dyn Transport>) {
        let shared = self.shared.clone();
        let stop = self.stop.clone();
        let mut worker = match Worker::new(shared, stop, None, AcceptSink::Own) {
            Ok(worker) => worker,
            Err(err) => {
                warn!("could not set up connection thread: {}", err);
                return;
            }
        };
        let liveness = Arc::new(());
        self.spawned
            .push((worker.itc_handle(), Arc::downgrade(&liveness)));
        worker.adopt(io);
        std::thread::Builder::new()
            .name("aioli-conn".to_owned())
            .spawn(move || {
                let _liveness = liveness;
                worker.run();
            })
            .map(|_| ())
            .unwrap_or_else(|err| warn!("could not spawn connection thread: {}", err));
    }

    fn at_capacity(&mut self) -> bool {
        let max = self.shared.settings.max_connections;
        match self.accept_sink {
            AcceptSink::Own => self.registry.len() >= max,
            AcceptSink::SpawnThread => {
                self.spawned.retain(|(_, live)| live.upgrade().is_some());
                self.spawned.len() >= max
            }
            AcceptSink::Dispatch { .. } => false,
        }
    }

    fn pause_accepting(&mut self) {
        if !self.accepting {
            return;
        }
        if let Some(listener) = self.listener.as_mut() {
            if listener.deregister(self.poll.registry()).is_ok() {
                self.accepting = false;
                info!("connection limit reached; accepting paused");
            }
        }
    }

    fn maybe_resume_accepting(&mut self) {
        if self.accepting || self.at_capacity() {
            return;
        }
        if let Some(listener) = self.listener.as_mut() {
            if listener
                .register(self.poll.registry(), TOKEN_LISTENER)
                .is_ok()
            {
                self.accepting = true;
            }
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = self.shared.runtime.now_ms();
        let sweep = self
            .registry
            .sweep(now, self.shared.settings.timeout_ms);
        for id in sweep.expired {
            debug!("connection timed out");
            if let Some(conn) = self.registry.get_mut(id) {
                conn.abort(&self.shared.handler, TerminationCode::TimeoutReached);
            }
            self.registry.mark_to_clean(id);
        }
        self.sleep_hint = sweep.next_timeout_ms;
    }

    fn clean(&mut self) {
        while self.registry.has_to_clean() {
            if let Some(mut conn) = self.registry.pop_to_clean() {
                let code = conn.termination.unwrap_or(TerminationCode::WithError);
                conn.report_termination(&self.shared.handler, code);
                conn.reclaim_buffers(&self.shared.pool);
                let _ = conn.stream.io_mut().deregister(self.poll.registry());
                // Dropping the connection closes the socket and frees the
                // arena and buffers.
            }
        }
        self.maybe_resume_accepting();
    }

    fn drain_itc(&mut self) {
        while let Some(msg) = self.itc.try_recv() {
            match msg {
                ItcMsg::Accept(io) => self.take_ownership(io),
                ItcMsg::Resume(raw) => self.handle_resume(ConnId::from_u64(raw)),
                ItcMsg::Stop => {
                    self.stop.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    fn handle_resume(&mut self, id: ConnId) {
        let suspended = self
            .registry
            .get_mut(id)
            .map(|conn| conn.is_suspended())
            .unwrap_or(false);
        if !suspended {
            return;
        }
        if let Some(conn) = self.registry.get_mut(id) {
            conn.resume();
            conn.registered = None;
        }
        self.update_interest(id, Wants::Read);
        self.registry.touch(id);
        self.registry.push_ready(id);
    }

    /// Shutdown: close the listener, terminate every connection, run the
    /// callbacks, destroy.
    fn drain(&mut self) {
        if let Some(listener) = self.listener.as_mut() {
            let _ = listener.deregister(self.poll.registry());
        }
        self.listener = None;

        for (handle, _) in self.spawned.drain(..) {
            handle.send(ItcMsg::Stop);
        }

        for id in self.registry.all_ids() {
            if let Some(conn) = self.registry.get_mut(id) {
                conn.abort(&self.shared.handler, TerminationCode::DaemonShutdown);
            }
            self.registry.mark_to_clean(id);
        }
        self.clean();
    }
}
