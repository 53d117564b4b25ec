// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! An embeddable HTTP/1.1 server engine.
//!
//! Aioli is not a web framework. It is the connection life-cycle engine that a
//! framework (or an application that wants precise control over its sockets)
//! embeds: it accepts TCP, TLS and UNIX-domain connections, parses HTTP/1.0
//! and HTTP/1.1 requests incrementally from a bounded per-connection buffer,
//! hands each request to your handler, and streams the response back while
//! honouring keep-alive, pipelining and timeouts.
//!
//! Routing, templating and middleware are intentionally out of scope: the
//! engine exposes a single request callback and leaves dispatch to you.
//!
//! # Example
//!
//! ```no_run
//! use aioli::{Action, Response, Server};
//!
//! let server = Server::builder()
//!     .bind("127.0.0.1:8000".parse().unwrap())
//!     .handler(|_req: &aioli::Request, _ctx: &mut aioli::RequestCtx| {
//!         Action::Respond(Response::text("hello world").into_shared())
//!     })
//!     .start()
//!     .unwrap();
//! server.wait();
//! ```
//!
//! # Event-loop models
//!
//! The engine runs in one of four modes, chosen at build time with
//! [`ServerBuilder::run_mode`]:
//!
//! - [`RunMode::OwnedThread`]: one thread owned by the server runs accept and
//!   all connections (the default).
//! - [`RunMode::ThreadPerConnection`]: a listen thread accepts; each
//!   connection gets a dedicated thread with its own small poll.
//! - [`RunMode::WorkerPool`]: a master thread only accepts; N workers each
//!   own a disjoint shard of the connections.
//! - [`RunMode::External`]: no thread is owned at all; your own event loop
//!   drives an [`ExternalDriver`].
//!
//! # Responses
//!
//! A [`Response`] carries its body as one of several content sources: an
//! in-memory buffer, an open file (served with `sendfile(2)` on plaintext
//! Linux sockets), an owned I/O vector, or a [`ContentProducer`] that
//! generates chunks on demand (sent with chunked transfer-encoding on
//! HTTP/1.1). Responses are frozen on first use and can then be shared
//! between requests and connections through their [`SharedResponse`] handle.

#[macro_use]
extern crate log;
#[macro_use]
extern crate quick_error;

pub mod action;
pub mod arena;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod input;
pub mod pool;
#[cfg(feature = "post")]
pub mod post;
pub(crate) mod registry;
pub(crate) mod reply;
pub mod request;
pub mod response;
pub mod runtime;
pub mod tls;
pub mod transport;

pub use crate::action::{
    Action, ContentProducer, ProducerAction, ServerHandler, TerminationCode, TerminationInfo,
    UpgradeHandler, UploadAction, UploadHandler,
};
pub use crate::connection::{RequestCtx, Strictness};
pub use crate::daemon::{Resumer, RunMode, Server, ServerBuilder};
#[cfg(unix)]
pub use crate::daemon::{ExternalDriver, WatchKind};
pub use crate::error::{ParseError, ResponseError, SocketError};
pub use crate::request::{HttpVersion, Method, Request};
pub use crate::response::{OwnedIovec, Response, SharedResponse};
pub use crate::transport::Transport;

#[cfg(feature = "post")]
pub use crate::post::PostFieldHandler;
