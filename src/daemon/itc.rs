// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Inter-thread communication.
//!
//! Each worker owns one ITC: a message queue plus a `mio::Waker` that can
//! interrupt the worker's blocked poll. Everything that crosses a thread
//! boundary — accepted sockets, resume requests, stop — goes through here;
//! the connection registries themselves are never shared.

use std::io;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::{Token, Waker};

use crate::transport::Transport;

pub(crate) enum ItcMsg {
    /// A freshly accepted socket for this worker to own.
    Accept(Box<dyn Transport>),
    /// Resume the suspended connection with this raw id.
    Resume(u64),
    Stop,
}

pub(crate) struct Itc {
    rx: Receiver<ItcMsg>,
    handle: ItcHandle,
}

impl Itc {
    /// Creates an ITC whose waker fires `token` on the given poll registry.
    pub fn new(registry: &mio::Registry, token: Token) -> io::Result<Itc> {
        let waker = Arc::new(Waker::new(registry, token)?);
        let (tx, rx) = unbounded();
        Ok(Itc {
            rx,
            handle: ItcHandle {
                tx,
                waker: Some(waker),
            },
        })
    }

    /// An ITC without a waker, for externally driven loops: messages are
    /// picked up at the application's next `process` call.
    pub fn unwakeable() -> Itc {
        let (tx, rx) = unbounded();
        Itc {
            rx,
            handle: ItcHandle { tx, waker: None },
        }
    }

    pub fn handle(&self) -> ItcHandle {
        self.handle.clone()
    }

    pub fn try_recv(&self) -> Option<ItcMsg> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct ItcHandle {
    tx: Sender<ItcMsg>,
    waker: Option<Arc<Waker>>,
}

impl ItcHandle {
    pub fn send(&self, msg: ItcMsg) {
        if self.tx.send(msg).is_ok() {
            if let Some(waker) = &self.waker {
                let _ = waker.wake();
            }
        }
    }
}

/// Brings a suspended connection back to life.
///
/// Obtained from [`RequestCtx::resumer`](crate::RequestCtx::resumer) before
/// returning `Suspend`; may be cloned and sent to any thread. Resuming a
/// connection that already closed (or was never suspended) is harmless.
///
/// With an externally driven server there is no thread to wake: the resume
/// takes effect at the application's next `process` call.
#[derive(Clone)]
pub struct Resumer {
    handle: ItcHandle,
    conn: u64,
}

impl Resumer {
    pub(crate) fn new(handle: ItcHandle, conn: u64) -> Resumer {
        Resumer { handle, conn }
    }

    /// Atomically reinserts the connection into event monitoring and its
    /// timeout list, and schedules it for processing.
    pub fn resume(&self) {
        self.handle.send(ItcMsg::Resume(self.conn));
    }
}

impl std::fmt::Debug for Resumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resumer").field("conn", &self.conn).finish()
    }
}
