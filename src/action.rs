// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The application-facing action protocol.
//!
//! The engine calls into the application exactly once per request (plus once
//! per upload chunk, producer chunk or termination); the application answers
//! with one of the tagged actions below. Because actions are returned by
//! value, a callback can never set two of them — misuse that the original
//! callback-and-context designs had to police at run time simply does not
//! typecheck here. Payloads that transfer ownership (responses, upload and
//! producer handlers) are released by the engine when it rejects or abandons
//! an action.

use crate::connection::RequestCtx;
use crate::request::Request;
use crate::response::SharedResponse;
use crate::transport::Transport;

/// What to do with a fully received request.
pub enum Action {
    /// Send this response.
    Respond(SharedResponse),
    /// Consume the request body, feeding each decoded chunk to `handler`.
    ///
    /// The handler is invoked once more with an empty chunk after the last
    /// body byte — exactly once — to signal end of upload. `large_buffer_size`
    /// is claimed from the server's shared buffer budget to stage incoming
    /// body bytes; when the budget is exhausted a smaller staging buffer is
    /// used instead.
    Upload {
        handler: Box<dyn UploadHandler>,
        large_buffer_size: usize,
    },
    /// Let the engine parse an `application/x-www-form-urlencoded` body and
    /// surface it field by field.
    #[cfg(feature = "post")]
    PostParse {
        handler: Box<dyn crate::post::PostFieldHandler>,
        /// Staging cap for a single field; a longer field terminates the
        /// request with 413.
        max_field_size: usize,
    },
    /// Park the connection: it leaves event monitoring and all timeout
    /// lists until [`Resumer::resume`](crate::Resumer::resume) is called,
    /// after which the request callback runs again.
    Suspend,
    /// Terminate the connection immediately.
    Abort,
}

/// Verdict of an upload (or POST field) handler for one chunk.
pub enum UploadAction {
    /// Keep the body coming.
    Continue,
    /// Stop and send this response.
    Respond(SharedResponse),
    /// Park the connection mid-upload until resumed.
    Suspend,
    /// Terminate the connection immediately.
    Abort,
}

/// One step of a dynamically produced body.
pub enum ProducerAction {
    /// `len` bytes were written into the scratch buffer and form the next
    /// chunk. `len` must be non-zero: the zero-length chunk is the wire
    /// terminator and is emitted by the engine itself on `Finish`.
    Chunk {
        len: usize,
        /// Optional chunk extension, sent verbatim after the chunk size.
        extension: Option<String>,
    },
    /// The next chunk as an owned buffer, for producers that already hold
    /// their data and want to skip the copy into the scratch buffer.
    ChunkVec {
        data: Vec<u8>,
        extension: Option<String>,
    },
    /// The body is complete. `trailers` are sent after the chunk terminator
    /// on HTTP/1.1.
    Finish {
        trailers: Vec<(String, String)>,
    },
    /// Park the connection mid-response until resumed.
    Suspend,
    /// Terminate the connection immediately.
    Abort,
}

impl ProducerAction {
    /// Shorthand for a plain data chunk.
    pub fn chunk(len: usize) -> ProducerAction {
        ProducerAction::Chunk {
            len,
            extension: None,
        }
    }

    /// Shorthand for a clean finish without trailers.
    pub fn finish() -> ProducerAction {
        ProducerAction::Finish {
            trailers: Vec::new(),
        }
    }
}

/// Receives decoded upload body chunks.
pub trait UploadHandler: Send {
    /// Called for every decoded chunk, then exactly once with an empty
    /// `chunk` after all body bytes have been delivered.
    fn data(&mut self, request: &Request, chunk: &[u8]) -> UploadAction;
}

impl<F> UploadHandler for F
where
    F: FnMut(&Request, &[u8]) -> UploadAction + Send,
{
    fn data(&mut self, request: &Request, chunk: &[u8]) -> UploadAction {
        self(request, chunk)
    }
}

/// Generates a response body chunk by chunk.
///
/// `produce` is called with the number of body bytes emitted so far and a
/// scratch buffer to fill. The producer is created per use of the response
/// by its factory, so a reusable response can serve concurrent requests.
pub trait ContentProducer: Send {
    fn produce(&mut self, position: u64, buf: &mut [u8]) -> ProducerAction;
}

impl<F> ContentProducer for F
where
    F: FnMut(u64, &mut [u8]) -> ProducerAction + Send,
{
    fn produce(&mut self, position: u64, buf: &mut [u8]) -> ProducerAction {
        self(position, buf)
    }
}

/// Receives the raw connection after a 101 Switching Protocols response.
pub trait UpgradeHandler: Send {
    /// Called once the 101 header block is fully on the wire. `leftover`
    /// holds any bytes the client sent after its upgrade request that the
    /// engine had already buffered; the new protocol must process them
    /// before reading from `io`.
    fn upgraded(self: Box<Self>, io: Box<dyn Transport>, leftover: Vec<u8>);
}

/// Why a request stopped being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCode {
    /// The response was sent completely.
    CompletedOk,
    /// An engine-side or application-side error ended the request.
    WithError,
    /// The per-connection timeout expired.
    TimeoutReached,
    /// The server is shutting down.
    DaemonShutdown,
    /// Reading from the client failed.
    ReadError,
    /// The client went away.
    ClientAbort,
}

/// Payload of the termination callback.
pub struct TerminationInfo<'a> {
    pub code: TerminationCode,
    /// The request being processed when the connection ended, if one had
    /// been started.
    pub request: Option<&'a Request>,
}

/// The application side of the engine.
///
/// One handler serves every connection of a server; it must therefore be
/// shareable between threads. Closures of the right shape implement it
/// directly:
///
/// ```
/// use aioli::{Action, Request, RequestCtx, Response};
///
/// fn build(_: ()) -> impl aioli::ServerHandler {
///     |request: &Request, _: &mut RequestCtx| {
///         Action::Respond(Response::text(request.url().to_owned()).into_shared())
///     }
/// }
/// ```
pub trait ServerHandler: Send + Sync {
    /// Called once per request, after the header block is fully received —
    /// and again after every resume of a suspended request.
    fn on_request(&self, request: &Request, ctx: &mut RequestCtx) -> Action;

    /// Early rejection hook, called with the raw request-target before the
    /// headers are parsed. Returning `false` terminates the connection
    /// without a response.
    fn on_early_uri(&self, _raw_target: &str) -> bool {
        true
    }

    /// Called exactly once for every request that was started, with the
    /// reason it ended.
    fn on_request_terminated(&self, _info: &TerminationInfo<'_>) {}
}

impl<F> ServerHandler for F
where
    F: Fn(&Request, &mut RequestCtx) -> Action + Send + Sync,
{
    fn on_request(&self, request: &Request, ctx: &mut RequestCtx) -> Action {
        self(request, ctx)
    }
}
