// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The per-connection HTTP state machine.
//!
//! One [`Connection`] owns the socket stream, the bounded read buffer, the
//! write staging buffer, the bump arena, and at most one request/reply pair
//! at a time. [`Connection::process`] advances the machine as far as the
//! socket allows and reports what readiness it needs next; the event loop
//! never looks inside.

pub(crate) mod body;
pub(crate) mod parse;

pub use self::parse::Strictness;

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::action::{
    Action, ServerHandler, TerminationCode, TerminationInfo, UpgradeHandler, UploadAction,
};
use crate::arena::Arena;
use crate::connection::body::BodyDecoder;
use crate::connection::parse::{BodyKind, ParsedRequestLine};
use crate::daemon::{Resumer, Settings};
use crate::error::{ParseError, SocketError};
use crate::pool::BufferPool;
use crate::reply::{self, Framing, Reply};
use crate::request::{HttpVersion, Method, Request, UploadProgress};
use crate::response::{Content, SharedResponse};
use crate::runtime::Runtime;
use crate::tls::HandshakeStatus;
use crate::transport::{Stream, Transport};

/// Everything a connection needs from its surroundings while processing.
pub(crate) struct EngineCx<'a> {
    pub handler: &'a Arc<dyn ServerHandler>,
    pub runtime: &'a Runtime,
    pub pool: &'a BufferPool,
    pub settings: &'a Settings,
    /// Resume handle bound to this connection, cloned into request contexts.
    pub resumer: Resumer,
}

/// Handed to [`ServerHandler::on_request`] alongside the request: the
/// per-connection controls the application may exercise during dispatch.
pub struct RequestCtx {
    resumer: Resumer,
    custom_timeout: Option<Option<u64>>,
}

impl RequestCtx {
    /// A handle that can bring this connection back after `Action::Suspend`.
    /// Clone it freely; it stays valid until the connection closes.
    pub fn resumer(&self) -> Resumer {
        self.resumer.clone()
    }

    /// Overrides the idle timeout for this connection. `None` restores the
    /// server default; `Some(Duration::ZERO)` disables the timeout.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.custom_timeout = Some(timeout.map(|d| d.as_millis() as u64));
    }
}

/// Socket readiness as last reported by the poller. Bits are sticky in
/// edge-triggered fashion: the machine clears `recv`/`send` itself when the
/// socket reports `WouldBlock`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness {
    pub recv: bool,
    pub send: bool,
    pub error: bool,
}

/// What the connection needs from the poller next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wants {
    Read,
    Write,
    Both,
    /// Nothing: suspended or closed.
    Nothing,
}

/// Result of one `process` call.
pub(crate) struct Outcome {
    pub closed: bool,
    pub suspended: bool,
    /// Set when a 101 handoff is due; the owner must take the connection
    /// out of its registry and call [`Connection::into_upgrade`].
    pub upgraded: bool,
    pub wants: Wants,
    /// Work remains that needs no socket readiness (pipelined bytes, TLS
    /// plaintext buffered in the session).
    pub more: bool,
}

enum State {
    /// Between requests; nothing received yet.
    Idle,
    /// Accumulating the request line.
    RecvRequestLine,
    /// Accumulating the header block.
    RecvHeaders { head: ParsedRequestLine },
    /// Flushing `100 Continue` before reading the body.
    SendContinue,
    RecvBody,
    /// Consuming the trailer section of a chunked body.
    RecvTrailers,
    /// Request complete; ask the application what to do.
    Dispatch,
    SendHeaders,
    /// Fixed-framing body: next piece needs staging or direct send.
    SendFixedReady,
    /// Fixed-framing body: flushing a staged piece.
    SendFixedFlushing,
    /// Chunked body: the producer owes us the next chunk.
    SendChunkedReady,
    /// Chunked body: flushing a framed chunk.
    SendChunkedFlushing,
    /// Flushing the chunk terminator and trailers.
    SendTrailers,
    /// Parked by the application; resumes into the boxed state.
    Suspended(Box<State>),
    /// 101 headers are on the wire; waiting for the owner to take the
    /// connection away.
    Upgrading,
    Closed,
}

/// Read buffer with a hard capacity and a parse-resume hint.
struct ReadBuf {
    data: Vec<u8>,
    capacity: usize,
    /// Offset where data not yet seen by the parser begins; everything
    /// before it was already scanned in a previous pass.
    new_data_start: usize,
}

impl ReadBuf {
    fn new(capacity: usize) -> ReadBuf {
        ReadBuf {
            data: Vec::new(),
            capacity,
            new_data_start: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    fn consume(&mut self, n: usize) {
        self.data.drain(..n);
        self.new_data_start = 0;
    }

    fn fill(&mut self, stream: &mut Stream) -> Result<usize, SocketError> {
        let old = self.data.len();
        if old >= self.capacity {
            return Ok(0);
        }
        self.data.resize(self.capacity, 0);
        match stream.recv(&mut self.data[old..]) {
            Ok(n) => {
                self.data.truncate(old + n);
                Ok(n)
            }
            Err(err) => {
                self.data.truncate(old);
                Err(err)
            }
        }
    }
}

/// Where decoded body bytes go.
enum BodySink {
    /// No consumer: bytes are decoded and dropped.
    Discard,
    Upload(UploadCtx),
    #[cfg(feature = "post")]
    Post(PostCtx),
}

struct UploadCtx {
    handler: Box<dyn crate::action::UploadHandler>,
    /// Bytes claimed from the shared buffer budget; 0 when the claim failed
    /// and delivery degrades to per-recv chunks.
    claimed: u64,
    staging: Vec<u8>,
    eof_delivered: bool,
}

#[cfg(feature = "post")]
struct PostCtx {
    handler: Box<dyn crate::post::PostFieldHandler>,
    decoder: crate::post::FormDecoder,
}

/// What a sink said about the bytes it was fed.
enum SinkVerdict {
    Continue,
    Respond(SharedResponse),
    Suspend,
    Abort,
}

pub(crate) struct Connection {
    pub(crate) stream: Stream,
    state: State,
    read_buf: ReadBuf,
    write_buf: Vec<u8>,
    write_pos: usize,
    scratch: Vec<u8>,
    arena: Option<Arena>,
    pub(crate) request: Option<Request>,
    reply: Option<Reply>,
    decoder: Option<BodyDecoder>,
    sink: BodySink,
    upgrade: Option<Box<dyn UpgradeHandler>>,
    pub(crate) readiness: Readiness,
    remote_addr: Option<SocketAddr>,
    expects_continue: bool,
    continue_sent: bool,
    want_keep_alive: bool,
    force_close: bool,
    headers_flushed: bool,
    read_eof: bool,
    requests_completed: u64,
    termination_reported: bool,
    /// Set once the connection is doomed; reported to the application when
    /// the owner cleans the connection up.
    pub(crate) termination: Option<TerminationCode>,
    pub(crate) last_activity_ms: u64,
    /// Per-connection timeout override (ms; 0 disables). `None` means the
    /// server default applies.
    pub(crate) custom_timeout_ms: Option<u64>,
    /// Interest bits currently registered with the poller; owned by the
    /// event loop.
    pub(crate) registered: Option<Wants>,
}

impl Connection {
    pub(crate) fn new(stream: Stream, settings: &Settings, now_ms: u64) -> Connection {
        let mut conn = Connection {
            stream,
            state: State::Idle,
            read_buf: ReadBuf::new(settings.read_buf_size),
            write_buf: Vec::new(),
            write_pos: 0,
            scratch: vec![0; settings.scratch_size],
            arena: Some(Arena::new(settings.arena_size)),
            request: None,
            reply: None,
            decoder: None,
            sink: BodySink::Discard,
            upgrade: None,
            // Optimistically assume the socket can take writes (and may
            // already hold client bytes); WouldBlock corrects us.
            readiness: Readiness {
                recv: true,
                send: true,
                error: false,
            },
            remote_addr: None,
            expects_continue: false,
            continue_sent: false,
            want_keep_alive: false,
            force_close: false,
            headers_flushed: false,
            read_eof: false,
            requests_completed: 0,
            termination_reported: false,
            termination: None,
            last_activity_ms: now_ms,
            custom_timeout_ms: None,
            registered: None,
        };
        conn.remote_addr = conn.stream.io_mut().peer_addr();
        conn
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// The raw socket descriptor, for externally driven loops.
    #[cfg(unix)]
    pub(crate) fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.stream.io().raw_fd()
    }

    pub(crate) fn is_suspended(&self) -> bool {
        matches!(self.state, State::Suspended(_))
    }

    /// Number of pipelined requests completed cleanly on this connection.
    #[cfg(test)]
    pub(crate) fn requests_completed(&self) -> u64 {
        self.requests_completed
    }

    /// Reinserts a suspended connection into its normal flow.
    pub(crate) fn resume(&mut self) {
        if let State::Suspended(_) = self.state {
            let prior = mem::replace(&mut self.state, State::Closed);
            if let State::Suspended(inner) = prior {
                self.state = *inner;
            }
        }
    }

    /// Takes the upgrade payload after `Outcome::upgraded`.
    pub(crate) fn into_upgrade(mut self) -> Option<(Box<dyn UpgradeHandler>, Box<dyn Transport>, Vec<u8>)> {
        let handler = self.upgrade.take()?;
        let leftover = mem::take(&mut self.read_buf.data);
        Some((handler, self.stream.into_io(), leftover))
    }

    /// Gives back any staging bytes claimed from the shared buffer budget.
    /// Idempotent; called on every destruction path.
    pub(crate) fn reclaim_buffers(&mut self, pool: &BufferPool) {
        if let BodySink::Upload(ref mut upload) = self.sink {
            if upload.claimed > 0 {
                pool.reclaim(upload.claimed);
                upload.claimed = 0;
            }
        }
    }

    /// Reports the termination callback exactly once per started request.
    pub(crate) fn report_termination(&mut self, handler: &Arc<dyn ServerHandler>, code: TerminationCode) {
        if self.termination_reported {
            return;
        }
        let started = self.request.is_some() || !matches!(self.state, State::Idle | State::Closed);
        if !started {
            return;
        }
        self.termination_reported = true;
        handler.on_request_terminated(&TerminationInfo {
            code,
            request: self.request.as_ref(),
        });
    }

    /// Terminates the connection without emitting anything further.
    pub(crate) fn abort(&mut self, handler: &Arc<dyn ServerHandler>, code: TerminationCode) {
        self.report_termination(handler, code);
        self.termination = Some(code);
        let _ = self.stream.shutdown();
        self.state = State::Closed;
    }

    /// Advances the machine as far as socket readiness allows.
    pub(crate) fn process(&mut self, cx: &mut EngineCx<'_>) -> Outcome {
        if self.stream.is_handshaking() {
            match self.stream.handshake() {
                Ok(HandshakeStatus::Done) => {}
                Ok(HandshakeStatus::NeedsRead) => {
                    self.readiness.recv = false;
                    return self.outcome(Wants::Read);
                }
                Ok(HandshakeStatus::NeedsWrite) => {
                    self.readiness.send = false;
                    return self.outcome(Wants::Write);
                }
                Err(err) => {
                    debug!("TLS handshake failed: {}", err);
                    self.abort(cx.handler, TerminationCode::WithError);
                    return self.outcome(Wants::Nothing);
                }
            }
        }

        loop {
            match self.state {
                State::Idle
                | State::RecvRequestLine
                | State::RecvHeaders { .. }
                | State::RecvBody
                | State::RecvTrailers => match self.step_receive(cx) {
                    Flow::Continue => {}
                    Flow::NeedRead => return self.outcome(Wants::Read),
                    Flow::NeedWrite => return self.outcome(Wants::Write),
                    Flow::Stop => return self.outcome(Wants::Nothing),
                },

                State::SendContinue
                | State::SendHeaders
                | State::SendFixedReady
                | State::SendFixedFlushing
                | State::SendChunkedReady
                | State::SendChunkedFlushing
                | State::SendTrailers => match self.step_send(cx) {
                    Flow::Continue => {}
                    Flow::NeedRead => return self.outcome(Wants::Read),
                    Flow::NeedWrite => return self.outcome(Wants::Write),
                    Flow::Stop => return self.outcome(Wants::Nothing),
                },

                State::Dispatch => match self.dispatch(cx) {
                    Flow::Continue => {}
                    Flow::NeedRead => return self.outcome(Wants::Read),
                    Flow::NeedWrite => return self.outcome(Wants::Write),
                    Flow::Stop => return self.outcome(Wants::Nothing),
                },

                State::Suspended(_) | State::Upgrading | State::Closed => {
                    return self.outcome(Wants::Nothing)
                }
            }
        }
    }

    fn outcome(&self, wants: Wants) -> Outcome {
        let receiving = matches!(
            self.state,
            State::Idle
                | State::RecvRequestLine
                | State::RecvHeaders { .. }
                | State::RecvBody
                | State::RecvTrailers
        );
        Outcome {
            closed: matches!(self.state, State::Closed),
            suspended: matches!(self.state, State::Suspended(_)),
            upgraded: matches!(self.state, State::Upgrading),
            wants: if matches!(self.state, State::Suspended(_) | State::Closed | State::Upgrading)
            {
                Wants::Nothing
            } else {
                wants
            },
            more: receiving && self.stream.pending(),
        }
    }

    // ---- receive path -----------------------------------------------------

    fn step_receive(&mut self, cx: &mut EngineCx<'_>) -> Flow {
        // Drain what the buffer already holds before touching the socket.
        match self.advance_parse(cx) {
            Ok(true) => return Flow::Continue,
            Ok(false) => {}
            Err(err) => return self.parse_failure(cx, err),
        }

        if self.read_eof {
            return self.handle_read_eof(cx);
        }

        if self.read_buf.is_full() {
            let err = match self.state {
                State::RecvRequestLine => ParseError::RequestLineTooLarge,
                State::RecvHeaders { .. } => ParseError::HeaderBlockTooLarge,
                _ => ParseError::HeaderBlockTooLarge,
            };
            return self.parse_failure(cx, err);
        }

        if !self.readiness.recv && !self.stream.pending() {
            return Flow::NeedRead;
        }

        match self.read_buf.fill(&mut self.stream) {
            Ok(0) => Flow::Continue,
            Ok(_) => {
                self.last_activity_ms = cx.runtime.now_ms();
                Flow::Continue
            }
            Err(SocketError::WouldBlock) => {
                self.readiness.recv = false;
                if self.readiness.error {
                    // recv is drained; now the error bit means business.
                    self.abort(cx.handler, TerminationCode::ReadError);
                    return Flow::Stop;
                }
                Flow::NeedRead
            }
            Err(SocketError::Interrupted) => Flow::Continue,
            Err(SocketError::RemoteClosed) => {
                self.read_eof = true;
                Flow::Continue
            }
            Err(err) => {
                debug!("recv failed: {}", err);
                let code = if err.is_disconnect() {
                    TerminationCode::ClientAbort
                } else {
                    TerminationCode::ReadError
                };
                self.abort(cx.handler, code);
                Flow::Stop
            }
        }
    }

    fn handle_read_eof(&mut self, cx: &mut EngineCx<'_>) -> Flow {
        match self.state {
            State::Idle => {
                // Clean end between requests.
                self.state = State::Closed;
                self.termination = Some(TerminationCode::CompletedOk);
                let _ = self.stream.shutdown();
                Flow::Stop
            }
            _ => {
                self.abort(cx.handler, TerminationCode::ClientAbort);
                Flow::Stop
            }
        }
    }

    /// Consumes buffered bytes. `Ok(true)` when the state advanced.
    fn advance_parse(&mut self, cx: &mut EngineCx<'_>) -> Result<bool, ParseError> {
        match self.state {
            State::Idle => {
                if self.read_buf.data.is_empty() {
                    return Ok(false);
                }
                self.state = State::RecvRequestLine;
                Ok(true)
            }

            State::RecvRequestLine => {
                let crlf = match parse::find_crlf(&self.read_buf.data, self.read_buf.new_data_start)
                {
                    Some(pos) => pos,
                    None => {
                        self.read_buf.new_data_start = self.read_buf.data.len();
                        return Ok(false);
                    }
                };

                // An empty line before the request line is tolerated (robust
                // clients send stray CRLFs between pipelined requests).
                if crlf == 0 {
                    self.read_buf.consume(2);
                    return Ok(true);
                }

                let arena = self.arena.as_mut().expect("arena is present while parsing");
                let head = {
                    let line = &self.read_buf.data[..crlf];
                    parse::parse_request_line(line, arena)?
                };

                if !cx.handler.on_early_uri(arena.str(head.raw_target)) {
                    trace!("request rejected by early-target hook");
                    self.abort(cx.handler, TerminationCode::WithError);
                    return Ok(true);
                }

                self.read_buf.consume(crlf + 2);
                self.state = State::RecvHeaders { head };
                Ok(true)
            }

            State::RecvHeaders { .. } => {
                // A CRLF straight away means "no headers at all"; checked
                // first so a pipelined request behind it cannot be mistaken
                // for part of this block.
                let end = if self.read_buf.data.starts_with(b"\r\n") {
                    0
                } else {
                    match parse::find_header_end(
                        &self.read_buf.data,
                        self.read_buf.new_data_start,
                    ) {
                        Some(pos) => pos,
                        None => {
                            self.read_buf.new_data_start = self.read_buf.data.len();
                            return Ok(false);
                        }
                    }
                };

                let head = match mem::replace(&mut self.state, State::Dispatch) {
                    State::RecvHeaders { head } => head,
                    _ => unreachable!(),
                };

                let arena = self.arena.as_mut().expect("arena is present while parsing");
                let block_len = if end == 0 { 2 } else { end + 4 };
                let info = {
                    let block = &mut self.read_buf.data[..block_len];
                    parse::parse_header_block(block, cx.settings.strictness, head.version, arena)?
                };
                self.read_buf.consume(block_len);

                self.expects_continue =
                    info.expect_continue && head.version == HttpVersion::Http11;
                self.continue_sent = false;
                self.want_keep_alive = match head.version {
                    HttpVersion::Http11 => !info.connection_close,
                    HttpVersion::Http10 => {
                        info.connection_keep_alive && !info.connection_close
                    }
                };

                let upload = UploadProgress {
                    expected: match info.body {
                        BodyKind::Length(n) => Some(n),
                        _ => None,
                    },
                    chunked: info.body == BodyKind::Chunked,
                    received: 0,
                };

                self.decoder = Some(BodyDecoder::new(info.body));
                let arena = self.arena.take().expect("arena is present while parsing");
                self.request = Some(Request::new_parsed(
                    arena,
                    head.method,
                    head.raw_method,
                    head.raw_target,
                    head.path,
                    head.query,
                    head.version,
                    info.headers,
                    self.remote_addr,
                    self.stream.is_tls(),
                    upload,
                ));
                trace!(
                    "request parsed: {} {}",
                    self.request.as_ref().unwrap().raw_method(),
                    self.request.as_ref().unwrap().raw_url()
                );
                Ok(true)
            }

            State::RecvBody => self.feed_body(cx),

            State::RecvTrailers => {
                // Either an immediate CRLF (no trailers) or a header-shaped
                // block ending in CRLFCRLF.
                if self.read_buf.data.starts_with(b"\r\n") {
                    self.read_buf.consume(2);
                    self.finish_body(cx);
                    return Ok(true);
                }
                let end = match parse::find_header_end(
                    &self.read_buf.data,
                    self.read_buf.new_data_start,
                ) {
                    Some(pos) => pos,
                    None => {
                        self.read_buf.new_data_start = self.read_buf.data.len();
                        return Ok(false);
                    }
                };
                let block_len = end + 4;
                let trailers = {
                    let block = &mut self.read_buf.data[..block_len];
                    parse::parse_trailer_block(block, cx.settings.strictness)?
                };
                self.read_buf.consume(block_len);
                if let Some(request) = self.request.as_mut() {
                    for (name, value) in &trailers {
                        if !request.append_header(name, value) {
                            return Err(ParseError::HeaderBlockTooLarge);
                        }
                    }
                }
                self.finish_body(cx);
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    /// Runs buffered body bytes through the decoder and the sink.
    fn feed_body(&mut self, cx: &mut EngineCx<'_>) -> Result<bool, ParseError> {
        let decoder = match self.decoder.as_mut() {
            Some(decoder) => decoder,
            None => return Ok(false),
        };

        if decoder.is_trivially_done() && self.read_buf.data.is_empty() {
            self.finish_body(cx);
            return Ok(true);
        }

        if self.read_buf.data.is_empty() && !decoder.is_trivially_done() {
            return Ok(false);
        }

        let out = decoder.feed(&mut self.read_buf.data)?;

        let mut verdict = SinkVerdict::Continue;
        if out.body > 0 {
            if let Some(request) = self.request.as_mut() {
                request.upload.received += out.body as u64;
            }
            let request = self.request.as_ref().expect("request exists during body");
            let chunk = &self.read_buf.data[..out.body];
            verdict = deliver_chunk(&mut self.sink, request, chunk);
        }
        self.read_buf.consume(out.body + out.discard);

        match verdict {
            SinkVerdict::Continue => {}
            SinkVerdict::Respond(response) => {
                // The application cut the upload short: answer and close.
                self.force_close = true;
                self.stage_reply(cx, response);
                return Ok(true);
            }
            SinkVerdict::Suspend => {
                self.park(State::RecvBody);
                return Ok(true);
            }
            SinkVerdict::Abort => {
                self.abort(cx.handler, TerminationCode::WithError);
                return Ok(true);
            }
        }

        if out.finished {
            if self.request.as_ref().map(|r| r.is_chunked()).unwrap_or(false) {
                self.state = State::RecvTrailers;
            } else {
                self.finish_body(cx);
            }
            return Ok(true);
        }

        // More body is coming; report progress if we consumed anything.
        Ok(out.body + out.discard > 0)
    }

    /// All body bytes (and trailers) are in: deliver EOF and move on.
    fn finish_body(&mut self, cx: &mut EngineCx<'_>) {
        let request = self.request.as_ref().expect("request exists during body");
        let verdict = deliver_eof(&mut self.sink, request);
        match verdict {
            Some(SinkVerdict::Respond(response)) => self.stage_reply(cx, response),
            Some(SinkVerdict::Continue) => {
                // After end-of-upload only a response (or suspend/abort)
                // makes sense.
                warn!("upload handler returned Continue after EOF");
                self.abort(cx.handler, TerminationCode::WithError);
            }
            Some(SinkVerdict::Suspend) => {
                // Resuming re-enters the request callback; the EOF marker is
                // never delivered twice.
                self.park(State::Dispatch);
            }
            Some(SinkVerdict::Abort) => {
                self.abort(cx.handler, TerminationCode::WithError);
            }
            None => {
                // No consumer (plain Respond action, or no body at all).
                self.state = State::Dispatch;
            }
        }
    }

    // ---- dispatch ---------------------------------------------------------

    fn dispatch(&mut self, cx: &mut EngineCx<'_>) -> Flow {
        // When a reply was staged straight from the body path, this state
        // was already replaced; getting here means the application owes us
        // an action.
        let (action, custom_timeout) = {
            let request = self.request.as_ref().expect("request exists at dispatch");
            let mut ctx = RequestCtx {
                resumer: cx.resumer.clone(),
                custom_timeout: None,
            };
            let action = cx.handler.on_request(request, &mut ctx);
            (action, ctx.custom_timeout)
        };
        if let Some(timeout) = custom_timeout {
            self.custom_timeout_ms = timeout;
        }

        match action {
            Action::Respond(response) => {
                let body_pending = self
                    .decoder
                    .as_ref()
                    .map(|d| !d.is_trivially_done())
                    .unwrap_or(false)
                    && self
                        .request
                        .as_ref()
                        .map(|r| r.upload.received == 0 && r.has_body())
                        .unwrap_or(false);
                if body_pending {
                    // The body was never consumed; it is still on the wire,
                    // so this connection cannot be reused.
                    self.force_close = true;
                }
                self.stage_reply(cx, response);
                Flow::Continue
            }

            Action::Upload {
                handler,
                large_buffer_size,
            } => {
                let claimed = if large_buffer_size > 0
                    && cx.pool.claim(large_buffer_size as u64)
                {
                    large_buffer_size as u64
                } else {
                    0
                };
                self.sink = BodySink::Upload(UploadCtx {
                    handler,
                    claimed,
                    staging: Vec::new(),
                    eof_delivered: false,
                });
                self.enter_body_phase();
                Flow::Continue
            }

            #[cfg(feature = "post")]
            Action::PostParse {
                handler,
                max_field_size,
            } => {
                let is_form = self
                    .request
                    .as_ref()
                    .and_then(|r| r.header("Content-Type"))
                    .map(|ct| {
                        ct.split(';')
                            .next()
                            .unwrap_or("")
                            .trim()
                            .eq_ignore_ascii_case("application/x-www-form-urlencoded")
                    })
                    .unwrap_or(false);
                if !is_form {
                    debug!("post parse requested for a non-form content type");
                    self.force_close = true;
                    self.stage_reply(cx, reply::error_response(415).into_shared());
                    return Flow::Continue;
                }
                self.sink = BodySink::Post(PostCtx {
                    handler,
                    decoder: crate::post::FormDecoder::new(max_field_size),
                });
                self.enter_body_phase();
                Flow::Continue
            }

            Action::Suspend => {
                self.park(State::Dispatch);
                Flow::Continue
            }

            Action::Abort => {
                self.abort(cx.handler, TerminationCode::WithError);
                Flow::Stop
            }
        }
    }

    /// Moves into body consumption, emitting `100 Continue` first when the
    /// client asked for it.
    fn enter_body_phase(&mut self) {
        if self.expects_continue && !self.continue_sent {
            self.continue_sent = true;
            reply::continue_response(&mut self.write_buf);
            self.state = State::SendContinue;
        } else {
            self.state = State::RecvBody;
        }
    }

    fn park(&mut self, resume_to: State) {
        self.state = State::Suspended(Box::new(resume_to));
    }

    fn stage_reply(&mut self, cx: &mut EngineCx<'_>, response: SharedResponse) {
        let request = self.request.as_ref().expect("request exists when replying");
        let version = request.http_version();
        let is_head = request.method() == Method::Head;
        let want_close = self.force_close || !self.want_keep_alive;

        if response.status_code() == 101 {
            match response.take_upgrade() {
                Some(handler) => self.upgrade = Some(handler),
                None => {
                    // Either the handler was consumed by an earlier use of
                    // this response, or there never was one: a 101 with no
                    // protocol to switch to is an application error.
                    warn!("101 response without a usable upgrade handler");
                    self.abort(cx.handler, TerminationCode::WithError);
                    return;
                }
            }
        }

        let reply = Reply::new(response, version, is_head, want_close);
        self.write_buf.clear();
        self.write_pos = 0;
        reply::serialize_headers(&mut self.write_buf, &reply, version);
        self.reply = Some(reply);
        self.state = State::SendHeaders;
    }

    fn parse_failure(&mut self, cx: &mut EngineCx<'_>, err: ParseError) -> Flow {
        debug!("request rejected: {}", err);
        if self.headers_flushed {
            // Too late for a clean error page.
            self.stream.io_mut().set_linger_hard_close();
            self.abort(cx.handler, TerminationCode::WithError);
            return Flow::Stop;
        }
        self.termination = Some(TerminationCode::WithError);
        self.force_close = true;
        // The request may be half-parsed; a reply needs one to exist.
        if self.request.is_none() {
            let arena = self
                .arena
                .take()
                .unwrap_or_else(|| Arena::new(cx.settings.arena_size));
            self.request = Some(fallback_request(
                arena,
                self.remote_addr,
                self.stream.is_tls(),
            ));
        }
        self.stage_reply(cx, reply::error_response(err.status_code()).into_shared());
        Flow::Continue
    }

    // ---- send path --------------------------------------------------------

    fn step_send(&mut self, cx: &mut EngineCx<'_>) -> Flow {
        if !self.readiness.send {
            return Flow::NeedWrite;
        }

        // Flush whatever is staged first.
        match self.flush_write_buf(cx) {
            Ok(true) => {}
            Ok(false) => {
                self.readiness.send = false;
                return Flow::NeedWrite;
            }
            Err(err) => return self.send_failure(cx, err),
        }

        match self.state {
            State::SendContinue => {
                self.state = State::RecvBody;
                Flow::Continue
            }

            State::SendHeaders => {
                self.headers_flushed = true;
                if self.upgrade.is_some() {
                    self.state = State::Upgrading;
                    return Flow::Stop;
                }
                let reply = self.reply.as_ref().expect("reply exists while sending");
                if !reply.send_body {
                    self.finish_response(cx);
                    return Flow::Continue;
                }
                self.state = match reply.framing {
                    Framing::Chunked => State::SendChunkedReady,
                    _ => State::SendFixedReady,
                };
                Flow::Continue
            }

            State::SendFixedReady => self.send_fixed(cx),

            State::SendFixedFlushing => {
                self.state = State::SendFixedReady;
                Flow::Continue
            }

            State::SendChunkedReady => self.send_chunked(cx),

            State::SendChunkedFlushing => {
                self.state = State::SendChunkedReady;
                Flow::Continue
            }

            State::SendTrailers => {
                self.finish_response(cx);
                Flow::Continue
            }

            _ => Flow::Continue,
        }
    }

    fn flush_write_buf(&mut self, cx: &mut EngineCx<'_>) -> Result<bool, SocketError> {
        while self.write_pos < self.write_buf.len() {
            let push = matches!(self.state, State::SendContinue | State::SendTrailers);
            match self.stream.send(&self.write_buf[self.write_pos..], push) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.write_pos += n;
                    self.last_activity_ms = cx.runtime.now_ms();
                    if !matches!(self.state, State::SendContinue) {
                        // Any response byte on the wire rules out a clean
                        // error page later.
                        self.headers_flushed = true;
                    }
                }
                Err(SocketError::WouldBlock) => return Ok(false),
                Err(SocketError::Interrupted) => continue,
                Err(err) => return Err(err),
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Ok(true)
    }

    fn send_fixed(&mut self, cx: &mut EngineCx<'_>) -> Flow {
        enum Piece {
            Done,
            Buffered,
            Sent(usize),
            WouldBlock,
            Error(SocketError),
            Producer(crate::action::ProducerAction),
        }

        // The reply is taken out for the duration of the step so its content
        // can be borrowed alongside the stream and the scratch buffer.
        let mut reply = self.reply.take().expect("reply exists while sending");
        let response = reply.response.clone();

        let piece = match response.content {
            Content::Empty => Piece::Done,

            Content::Buffer(ref data) => {
                let pos = reply.content_pos as usize;
                if pos >= data.len() {
                    Piece::Done
                } else {
                    match self.stream.send(&data[pos..], true) {
                        Ok(n) => {
                            reply.content_pos += n as u64;
                            Piece::Sent(n)
                        }
                        Err(SocketError::WouldBlock) => Piece::WouldBlock,
                        Err(SocketError::Interrupted) => Piece::Sent(0),
                        Err(err) => Piece::Error(err),
                    }
                }
            }

            Content::Iovec(_) => {
                if reply.iovec_done() {
                    Piece::Done
                } else {
                    let sent = {
                        let slices = reply.iovec_slices();
                        self.stream.send_vectored(&slices, true)
                    };
                    match sent {
                        Ok(n) => {
                            reply.iovec_advance(n);
                            Piece::Sent(n)
                        }
                        Err(SocketError::WouldBlock) => Piece::WouldBlock,
                        Err(SocketError::Interrupted) => Piece::Sent(0),
                        Err(err) => Piece::Error(err),
                    }
                }
            }

            Content::File {
                ref file,
                offset,
                len,
            } => {
                if reply.content_pos >= len {
                    Piece::Done
                } else if reply.sendfile_ok && !self.stream.is_tls() {
                    let remaining = (len - reply.content_pos) as usize;
                    let want = remaining.min(1 << 20);
                    match self.stream.sendfile(file, offset + reply.content_pos, want) {
                        Ok(0) => Piece::Error(SocketError::BrokenPipe),
                        Ok(n) => {
                            reply.content_pos += n as u64;
                            Piece::Sent(n)
                        }
                        Err(SocketError::WouldBlock) => Piece::WouldBlock,
                        Err(SocketError::Interrupted) => Piece::Sent(0),
                        Err(SocketError::Unsupported) => {
                            reply.sendfile_ok = false;
                            Piece::Sent(0)
                        }
                        Err(err) => Piece::Error(err),
                    }
                } else {
                    // Buffered fallback: positioned read into scratch, then
                    // stage for flushing.
                    let remaining = (len - reply.content_pos) as usize;
                    let take = remaining.min(self.scratch.len());
                    match read_file_at(file, offset + reply.content_pos, &mut self.scratch[..take])
                    {
                        Ok(0) => Piece::Error(SocketError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "file shorter than declared response length",
                        ))),
                        Ok(n) => {
                            reply.content_pos += n as u64;
                            self.write_buf.extend_from_slice(&self.scratch[..n]);
                            Piece::Buffered
                        }
                        Err(err) => Piece::Error(SocketError::Io(err)),
                    }
                }
            }

            Content::Producer(_) => {
                // Unknown-length body over a close-delimited connection:
                // raw bytes, no chunk framing.
                let pos = reply.content_pos;
                match reply.producer() {
                    Some(producer) => Piece::Producer(producer.produce(pos, &mut self.scratch)),
                    None => Piece::Done,
                }
            }
        };

        let done_after_send = match response.content {
            Content::Buffer(ref data) => reply.content_pos as usize >= data.len(),
            Content::Iovec(_) => reply.iovec_done(),
            Content::File { len, .. } => reply.content_pos >= len,
            _ => false,
        };

        self.reply = Some(reply);

        match piece {
            Piece::Done => {
                self.finish_response(cx);
                Flow::Continue
            }
            Piece::Buffered => {
                self.state = State::SendFixedFlushing;
                Flow::Continue
            }
            Piece::Sent(n) => {
                if n > 0 {
                    self.last_activity_ms = cx.runtime.now_ms();
                }
                if done_after_send {
                    self.finish_response(cx);
                }
                Flow::Continue
            }
            Piece::WouldBlock => {
                self.readiness.send = false;
                Flow::NeedWrite
            }
            Piece::Error(err) => self.send_failure(cx, err),
            Piece::Producer(action) => self.apply_producer_action(cx, action, false),
        }
    }

    fn send_chunked(&mut self, cx: &mut EngineCx<'_>) -> Flow {
        let mut reply = self.reply.take().expect("reply exists while sending");
        let pos = reply.content_pos;
        let action = match reply.producer() {
            Some(producer) => producer.produce(pos, &mut self.scratch),
            // Non-producer content never enters the chunked path.
            None => crate::action::ProducerAction::finish(),
        };
        self.reply = Some(reply);
        self.apply_producer_action(cx, action, true)
    }

    fn apply_producer_action(
        &mut self,
        cx: &mut EngineCx<'_>,
        action: crate::action::ProducerAction,
        chunked: bool,
    ) -> Flow {
        use crate::action::ProducerAction;

        match action {
            ProducerAction::Chunk { len, extension } => {
                if len == 0 || len > self.scratch.len() {
                    warn!("producer returned an invalid chunk length: {}", len);
                    return self.producer_misbehaved(cx);
                }
                {
                    let reply = self.reply.as_mut().expect("reply exists while sending");
                    reply.content_pos += len as u64;
                }
                if chunked {
                    let (scratch, write_buf) = (&self.scratch[..len], &mut self.write_buf);
                    reply::write_chunk_frame(write_buf, scratch, extension.as_deref());
                    self.state = State::SendChunkedFlushing;
                } else {
                    self.write_buf.extend_from_slice(&self.scratch[..len]);
                    self.state = State::SendFixedFlushing;
                }
                Flow::Continue
            }

            ProducerAction::ChunkVec { data, extension } => {
                if data.is_empty() {
                    warn!("producer returned an empty owned chunk");
                    return self.producer_misbehaved(cx);
                }
                {
                    let reply = self.reply.as_mut().expect("reply exists while sending");
                    reply.content_pos += data.len() as u64;
                }
                if chunked {
                    reply::write_chunk_frame(&mut self.write_buf, &data, extension.as_deref());
                    self.state = State::SendChunkedFlushing;
                } else {
                    self.write_buf.extend_from_slice(&data);
                    self.state = State::SendFixedFlushing;
                }
                Flow::Continue
            }

            ProducerAction::Finish { trailers } => {
                if chunked {
                    reply::write_chunk_terminator(&mut self.write_buf, &trailers);
                    self.state = State::SendTrailers;
                } else {
                    self.finish_response(cx);
                }
                Flow::Continue
            }

            ProducerAction::Suspend => {
                self.park(if chunked {
                    State::SendChunkedReady
                } else {
                    State::SendFixedReady
                });
                Flow::Continue
            }

            ProducerAction::Abort => self.producer_misbehaved(cx),
        }
    }

    fn producer_misbehaved(&mut self, cx: &mut EngineCx<'_>) -> Flow {
        // Mid-body there is no way to signal an error in-band; hard-close so
        // the peer cannot mistake the truncation for a complete message.
        self.stream.io_mut().set_linger_hard_close();
        self.abort(cx.handler, TerminationCode::WithError);
        Flow::Stop
    }

    fn send_failure(&mut self, cx: &mut EngineCx<'_>, err: SocketError) -> Flow {
        debug!("send failed: {}", err);
        if self.headers_flushed {
            self.stream.io_mut().set_linger_hard_close();
        }
        let code = if err.is_disconnect() {
            TerminationCode::ClientAbort
        } else {
            TerminationCode::WithError
        };
        self.abort(cx.handler, code);
        Flow::Stop
    }

    /// The response is fully on the wire: report, then keep alive or close.
    fn finish_response(&mut self, cx: &mut EngineCx<'_>) {
        let close = {
            let reply = self.reply.as_ref().expect("reply exists at finish");
            reply.close_after || self.force_close
        };

        let code = self.termination.unwrap_or(TerminationCode::CompletedOk);
        self.report_termination(cx.handler, code);

        self.reclaim_buffers(cx.pool);
        self.sink = BodySink::Discard;
        self.decoder = None;
        self.reply = None;
        self.headers_flushed = false;
        self.expects_continue = false;
        self.continue_sent = false;

        if close {
            if matches!(self.termination, None) {
                self.termination = Some(TerminationCode::CompletedOk);
            }
            let _ = self.stream.shutdown();
            self.stream.io_mut().shut_wr();
            self.state = State::Closed;
            return;
        }

        // Keep-alive: take the arena back, reset it, return to idle.
        let request = self.request.take().expect("request exists at finish");
        let mut arena = request.into_arena();
        arena.reset();
        self.arena = Some(arena);
        self.requests_completed += 1;
        self.termination_reported = false;
        self.termination = None;
        self.force_close = false;
        self.state = State::Idle;
        trace!(
            "connection idle again ({} requests served)",
            self.requests_completed
        );
    }
}

enum Flow {
    /// State changed; run the loop again.
    Continue,
    NeedRead,
    NeedWrite,
    /// The connection reached a terminal (or parked) state.
    Stop,
}

fn deliver_chunk(sink: &mut BodySink, request: &Request, chunk: &[u8]) -> SinkVerdict {
    match sink {
        BodySink::Discard => SinkVerdict::Continue,
        BodySink::Upload(upload) => {
            if upload.claimed > 0 {
                // Batch into the claimed staging buffer to cut callback
                // pressure for fine-grained senders.
                upload.staging.extend_from_slice(chunk);
                if (upload.staging.len() as u64) < upload.claimed {
                    return SinkVerdict::Continue;
                }
                let staged = mem::take(&mut upload.staging);
                let verdict = upload.handler.data(request, &staged);
                verdict.into()
            } else {
                upload.handler.data(request, chunk).into()
            }
        }
        #[cfg(feature = "post")]
        BodySink::Post(post) => {
            let fields = match post.decoder.feed(chunk) {
                Ok(fields) => fields,
                Err(_) => return SinkVerdict::Abort,
            };
            for (name, value) in fields {
                match post.handler.field(request, &name, &value) {
                    UploadAction::Continue => {}
                    other => return other.into(),
                }
            }
            SinkVerdict::Continue
        }
    }
}

/// Returns `None` when there is no consumer to notify.
fn deliver_eof(sink: &mut BodySink, request: &Request) -> Option<SinkVerdict> {
    match sink {
        BodySink::Discard => None,
        BodySink::Upload(upload) => {
            if upload.eof_delivered {
                return Some(SinkVerdict::Continue);
            }
            if !upload.staging.is_empty() {
                let staged = mem::take(&mut upload.staging);
                match upload.handler.data(request, &staged) {
                    UploadAction::Continue => {}
                    other => return Some(other.into()),
                }
            }
            upload.eof_delivered = true;
            Some(upload.handler.data(request, &[]).into())
        }
        #[cfg(feature = "post")]
        BodySink::Post(post) => {
            if let Some((name, value)) = post.decoder.finish() {
                match post.handler.field(request, &name, &value) {
                    UploadAction::Continue => {}
                    other => return Some(other.into()),
                }
            }
            Some(post.handler.end(request).into())
        }
    }
}

impl From<UploadAction> for SinkVerdict {
    fn from(action: UploadAction) -> SinkVerdict {
        match action {
            UploadAction::Continue => SinkVerdict::Continue,
            UploadAction::Respond(response) => SinkVerdict::Respond(response),
            UploadAction::Suspend => SinkVerdict::Suspend,
            UploadAction::Abort => SinkVerdict::Abort,
        }
    }
}

/// A placeholder request for error replies sent before parsing finished.
fn fallback_request(
    arena: Arena,
    remote_addr: Option<SocketAddr>,
    secure: bool,
) -> Request {
    let mut arena = arena;
    arena.reset();
    let raw = arena.alloc_str("").unwrap_or(crate::arena::StrSpan::EMPTY);
    Request::new_parsed(
        arena,
        Method::Other,
        arrayvec::ArrayString::new(),
        raw,
        raw,
        None,
        HttpVersion::Http11,
        Vec::new(),
        remote_addr,
        secure,
        UploadProgress::default(),
    )
}

#[cfg(unix)]
fn read_file_at(file: &std::fs::File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(not(unix))]
fn read_file_at(file: &std::fs::File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ProducerAction;
    use crate::daemon::{Itc, Settings};
    use crate::response::Response;
    use crate::transport::mock::MockTransport;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_settings() -> Settings {
        Settings {
            timeout_ms: 30_000,
            max_connections: 16,
            read_buf_size: 8 * 1024,
            arena_size: 8 * 1024,
            scratch_size: 4 * 1024,
            strictness: Strictness::Strict,
            nodelay: true,
            reuse_port: false,
            nonce_timeout: Duration::from_secs(90),
            max_nonce_uses: 1000,
        }
    }

    struct Fixture {
        conn: Connection,
        mock: MockTransport,
        handler: Arc<dyn ServerHandler>,
        runtime: Runtime,
        pool: BufferPool,
        settings: Settings,
        itc: Itc,
    }

    impl Fixture {
        fn with_settings<H>(handler: H, input: Vec<Vec<u8>>, settings: Settings) -> Fixture
        where
            H: ServerHandler + 'static,
        {
            let mock = MockTransport::scripted(input);
            let stream = Stream::plain(Box::new(mock.clone()));
            let conn = Connection::new(stream, &settings, 0);
            Fixture {
                conn,
                mock,
                handler: Arc::new(handler),
                runtime: Runtime::new(),
                pool: BufferPool::new(1 << 20),
                settings,
                itc: Itc::unwakeable(),
            }
        }

        fn new<H>(handler: H, input: Vec<Vec<u8>>) -> Fixture
        where
            H: ServerHandler + 'static,
        {
            Fixture::with_settings(handler, input, test_settings())
        }

        fn process(&mut self) -> Outcome {
            let resumer = Resumer::new(self.itc.handle(), 0);
            let mut cx = EngineCx {
                handler: &self.handler,
                runtime: &self.runtime,
                pool: &self.pool,
                settings: &self.settings,
                resumer,
            };
            self.conn.process(&mut cx)
        }

        fn wake(&mut self) {
            self.conn.readiness.recv = true;
            self.conn.readiness.send = true;
        }

        fn output(&self) -> String {
            self.mock.output_str()
        }
    }

    fn respond_text(body: &'static str) -> impl ServerHandler {
        move |_: &Request, _: &mut RequestCtx| Action::Respond(Response::text(body).into_shared())
    }

    #[test]
    fn simple_get_keeps_alive() {
        let mut fx = Fixture::new(
            respond_text("hi"),
            vec![b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()],
        );
        let outcome = fx.process();

        let out = fx.output();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "wire: {out}");
        assert!(out.contains("Content-Length: 2\r\n"));
        assert!(out.contains("Connection: keep-alive\r\n"));
        assert!(out.contains("Date: "));
        assert!(out.ends_with("\r\n\r\nhi"));
        assert!(!outcome.closed);
        assert_eq!(fx.conn.requests_completed(), 1);
    }

    #[test]
    fn upload_sees_body_then_eof() {
        let chunks: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = chunks.clone();
        let handler = move |_: &Request, _: &mut RequestCtx| {
            let seen = seen.clone();
            Action::Upload {
                handler: Box::new(move |_: &Request, chunk: &[u8]| {
                    seen.lock().unwrap().push(chunk.to_vec());
                    if chunk.is_empty() {
                        UploadAction::Respond(Response::empty(204).into_shared())
                    } else {
                        UploadAction::Continue
                    }
                }),
                large_buffer_size: 0,
            }
        };

        let mut fx = Fixture::new(
            handler,
            vec![b"POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello".to_vec()],
        );
        let outcome = fx.process();

        let seen = chunks.lock().unwrap();
        assert_eq!(seen.as_slice(), &[b"hello".to_vec(), Vec::new()]);

        let out = fx.output();
        assert!(out.starts_with("HTTP/1.1 204 No Content\r\n"), "wire: {out}");
        assert!(!out.contains("Content-Length"));
        assert!(out.ends_with("\r\n\r\n"));
        assert!(!outcome.closed);
    }

    #[test]
    fn chunked_upload_is_indistinguishable() {
        let chunks: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = chunks.clone();
        let handler = move |_: &Request, _: &mut RequestCtx| {
            let seen = seen.clone();
            Action::Upload {
                handler: Box::new(move |_: &Request, chunk: &[u8]| {
                    seen.lock().unwrap().push(chunk.to_vec());
                    if chunk.is_empty() {
                        UploadAction::Respond(Response::empty(204).into_shared())
                    } else {
                        UploadAction::Continue
                    }
                }),
                large_buffer_size: 0,
            }
        };

        let mut fx = Fixture::new(
            handler,
            vec![
                b"POST /u HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
                    .to_vec(),
            ],
        );
        fx.process();

        let seen = chunks.lock().unwrap();
        assert_eq!(seen.as_slice(), &[b"hello".to_vec(), Vec::new()]);
        assert!(fx.output().starts_with("HTTP/1.1 204 No Content\r\n"));
    }

    #[test]
    fn producer_body_is_chunk_framed() {
        let handler = |_: &Request, _: &mut RequestCtx| {
            Action::Respond(
                Response::from_producer(|| {
                    Box::new(|pos: u64, buf: &mut [u8]| {
                        if pos < 12 {
                            buf[..4].copy_from_slice(b"XXXX");
                            ProducerAction::chunk(4)
                        } else {
                            ProducerAction::finish()
                        }
                    })
                })
                .into_shared(),
            )
        };

        let mut fx = Fixture::new(handler, vec![b"GET /big HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()]);
        let outcome = fx.process();

        let out = fx.output();
        assert!(out.contains("Transfer-Encoding: chunked\r\n"));
        assert_eq!(out.matches("4\r\nXXXX\r\n").count(), 3);
        assert!(out.ends_with("0\r\n\r\n"));
        assert!(!outcome.closed);
    }

    #[test]
    fn conflicting_framing_is_rejected_before_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let handler = move |_: &Request, _: &mut RequestCtx| {
            counted.fetch_add(1, Ordering::SeqCst);
            Action::Respond(Response::text("nope").into_shared())
        };

        let mut fx = Fixture::new(
            handler,
            vec![
                b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\nhello"
                    .to_vec(),
            ],
        );
        let outcome = fx.process();

        let out = fx.output();
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "wire: {out}");
        assert!(out.contains("Connection: close\r\n"));
        assert!(outcome.closed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pipelined_requests_share_one_recv() {
        let handler = |request: &Request, _: &mut RequestCtx| {
            Action::Respond(Response::text(request.url().to_owned()).into_shared())
        };

        let mut fx = Fixture::new(
            handler,
            vec![b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()],
        );
        let outcome = fx.process();

        let out = fx.output();
        let first = out.find("\r\n\r\n/a").expect("first body on the wire");
        let second = out.find("\r\n\r\n/b").expect("second body on the wire");
        assert!(first < second);
        assert!(!outcome.closed);
        assert_eq!(fx.conn.requests_completed(), 2);
        assert_eq!(fx.conn.arena.as_ref().unwrap().reset_count(), 2);
    }

    #[test]
    fn expect_continue_on_http11() {
        let handler = |_: &Request, _: &mut RequestCtx| Action::Upload {
            handler: Box::new(|_: &Request, chunk: &[u8]| {
                if chunk.is_empty() {
                    UploadAction::Respond(Response::empty(204).into_shared())
                } else {
                    UploadAction::Continue
                }
            }),
            large_buffer_size: 0,
        };

        let mut fx = Fixture::new(
            handler,
            vec![
                b"PUT /u HTTP/1.1\r\nHost: h\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n"
                    .to_vec(),
                b"abc".to_vec(),
            ],
        );
        fx.process();

        let out = fx.output();
        assert!(out.starts_with("HTTP/1.1 100 Continue\r\n\r\n"), "wire: {out}");
        assert!(out.contains("HTTP/1.1 204 No Content\r\n"));
    }

    #[test]
    fn expect_continue_is_ignored_on_http10() {
        let handler = |_: &Request, _: &mut RequestCtx| Action::Upload {
            handler: Box::new(|_: &Request, chunk: &[u8]| {
                if chunk.is_empty() {
                    UploadAction::Respond(Response::empty(204).into_shared())
                } else {
                    UploadAction::Continue
                }
            }),
            large_buffer_size: 0,
        };

        let mut fx = Fixture::new(
            handler,
            vec![b"PUT /u HTTP/1.0\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\nabc".to_vec()],
        );
        let outcome = fx.process();

        let out = fx.output();
        assert!(!out.contains("100 Continue"));
        assert!(out.starts_with("HTTP/1.0 204 No Content\r\n"));
        // HTTP/1.0 without keep-alive closes.
        assert!(outcome.closed);
    }

    #[test]
    fn missing_host_on_http11_is_400() {
        let mut fx = Fixture::new(respond_text("x"), vec![b"GET / HTTP/1.1\r\n\r\n".to_vec()]);
        let outcome = fx.process();
        assert!(fx.output().starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(outcome.closed);
    }

    #[test]
    fn http10_keep_alive_is_opt_in() {
        let mut fx = Fixture::new(respond_text("x"), vec![b"GET / HTTP/1.0\r\n\r\n".to_vec()]);
        let outcome = fx.process();
        assert!(fx.output().contains("Connection: close\r\n"));
        assert!(outcome.closed);

        let mut fx = Fixture::new(
            respond_text("x"),
            vec![b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n".to_vec()],
        );
        let outcome = fx.process();
        assert!(fx.output().contains("Connection: keep-alive\r\n"));
        assert!(!outcome.closed);
    }

    #[test]
    fn unsupported_version_gets_505() {
        let mut fx = Fixture::new(
            respond_text("x"),
            vec![b"GET / HTTP/2.0\r\nHost: h\r\n\r\n".to_vec()],
        );
        let outcome = fx.process();
        assert!(fx.output().starts_with("HTTP/1.1 505 HTTP Version Not Supported\r\n"));
        assert!(outcome.closed);
    }

    #[test]
    fn head_suppresses_body_but_not_length() {
        let mut fx = Fixture::new(
            respond_text("hello"),
            vec![b"HEAD / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()],
        );
        fx.process();
        let out = fx.output();
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
        assert!(!out.contains("hello"));
    }

    #[test]
    fn iovec_body_concatenates_segments() {
        let handler = |_: &Request, _: &mut RequestCtx| {
            let iov = crate::response::OwnedIovec::new(vec![
                b"abc".to_vec().into_boxed_slice(),
                b"def".to_vec().into_boxed_slice(),
            ]);
            Action::Respond(Response::from_iovec(iov).into_shared())
        };
        let mut fx = Fixture::new(handler, vec![b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()]);
        fx.process();
        let out = fx.output();
        assert!(out.contains("Content-Length: 6\r\n"));
        assert!(out.ends_with("\r\n\r\nabcdef"));
    }

    #[test]
    fn file_body_uses_buffered_fallback() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();

        let file = Arc::new(Mutex::new(Some(file)));
        let handler = move |_: &Request, _: &mut RequestCtx| {
            let file = file.lock().unwrap().take().expect("single use");
            Action::Respond(Response::from_file(file, 2, 6).into_shared())
        };

        let mut fx = Fixture::new(handler, vec![b"GET /f HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()]);
        fx.process();
        let out = fx.output();
        assert!(out.contains("Content-Length: 6\r\n"));
        assert!(out.ends_with("\r\n\r\n234567"), "wire: {out}");
    }

    #[test]
    fn producer_on_http10_is_close_delimited() {
        let handler = |_: &Request, _: &mut RequestCtx| {
            Action::Respond(
                Response::from_producer(|| {
                    Box::new(|pos: u64, buf: &mut [u8]| {
                        if pos == 0 {
                            buf[..5].copy_from_slice(b"raw-b");
                            ProducerAction::chunk(5)
                        } else {
                            ProducerAction::finish()
                        }
                    })
                })
                .into_shared(),
            )
        };
        let mut fx = Fixture::new(handler, vec![b"GET / HTTP/1.0\r\n\r\n".to_vec()]);
        let outcome = fx.process();
        let out = fx.output();
        assert!(out.contains("Connection: close\r\n"));
        assert!(!out.contains("Transfer-Encoding"));
        assert!(out.ends_with("\r\n\r\nraw-b"));
        assert!(outcome.closed);
        assert!(fx.mock.state.lock().unwrap().shut_wr);
    }

    #[test]
    fn suspend_then_resume_redispatches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let handler = move |_: &Request, _: &mut RequestCtx| {
            if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                Action::Suspend
            } else {
                Action::Respond(Response::text("later").into_shared())
            }
        };

        let mut fx = Fixture::new(handler, vec![b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()]);
        let outcome = fx.process();
        assert!(outcome.suspended);
        assert!(fx.output().is_empty());

        fx.conn.resume();
        fx.wake();
        let outcome = fx.process();
        assert!(!outcome.closed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(fx.output().ends_with("\r\n\r\nlater"));
    }

    #[test]
    fn early_target_hook_can_reject() {
        struct Rejecting;
        impl ServerHandler for Rejecting {
            fn on_request(&self, _: &Request, _: &mut RequestCtx) -> Action {
                panic!("must not dispatch");
            }
            fn on_early_uri(&self, raw_target: &str) -> bool {
                !raw_target.contains("blocked")
            }
        }

        let mut fx = Fixture::new(
            Rejecting,
            vec![b"GET /blocked HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()],
        );
        let outcome = fx.process();
        assert!(outcome.closed);
        assert!(fx.output().is_empty());
    }

    #[test]
    fn client_abort_reports_termination() {
        struct Recording(Arc<Mutex<Vec<TerminationCode>>>);
        impl ServerHandler for Recording {
            fn on_request(&self, _: &Request, _: &mut RequestCtx) -> Action {
                Action::Respond(Response::text("x").into_shared())
            }
            fn on_request_terminated(&self, info: &TerminationInfo<'_>) {
                self.0.lock().unwrap().push(info.code);
            }
        }

        let codes: Arc<Mutex<Vec<TerminationCode>>> = Arc::new(Mutex::new(Vec::new()));
        let mut fx = Fixture::new(Recording(codes.clone()), vec![b"GET / HT".to_vec()]);
        fx.mock.state.lock().unwrap().eof_when_empty = true;
        let outcome = fx.process();
        assert!(outcome.closed);
        assert_eq!(codes.lock().unwrap().as_slice(), &[TerminationCode::ClientAbort]);
    }

    #[test]
    fn oversized_request_line_is_414() {
        let mut settings = test_settings();
        settings.read_buf_size = 64;
        let long = vec![b'a'; 256];
        let mut input = b"GET /".to_vec();
        input.extend_from_slice(&long);
        let mut fx = Fixture::with_settings(respond_text("x"), vec![input], settings);
        let outcome = fx.process();
        assert!(fx.output().starts_with("HTTP/1.1 414 URI Too Long\r\n"));
        assert!(outcome.closed);
    }

    #[test]
    fn oversized_header_block_is_431() {
        let mut settings = test_settings();
        settings.read_buf_size = 64;
        let mut input = b"GET / HTTP/1.1\r\nHost: h\r\nX-Fill: ".to_vec();
        input.extend_from_slice(&vec![b'a'; 256]);
        let mut fx = Fixture::with_settings(respond_text("x"), vec![input], settings);
        let outcome = fx.process();
        assert!(fx
            .output()
            .starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
        assert!(outcome.closed);
    }

    #[test]
    fn request_filling_buffer_exactly_succeeds() {
        let mut settings = test_settings();
        settings.read_buf_size = 64;
        // Pad the target so the whole request is exactly 64 bytes.
        let mut request = b"GET /".to_vec();
        let tail = b" HTTP/1.1\r\nHost: h\r\n\r\n";
        let pad = 64 - request.len() - tail.len();
        request.extend(std::iter::repeat(b'p').take(pad));
        request.extend_from_slice(tail);
        assert_eq!(request.len(), 64);

        let mut fx = Fixture::with_settings(respond_text("ok"), vec![request], settings);
        let outcome = fx.process();
        assert!(fx.output().starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!outcome.closed);
    }

    #[test]
    fn respond_with_unread_body_forces_close() {
        let mut fx = Fixture::new(
            respond_text("done"),
            vec![b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 100\r\n\r\n".to_vec()],
        );
        let outcome = fx.process();
        let out = fx.output();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(outcome.closed);
    }

    #[test]
    fn stray_crlf_between_pipelined_requests() {
        let mut fx = Fixture::new(
            respond_text("ok"),
            vec![b"\r\nGET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()],
        );
        let outcome = fx.process();
        assert!(fx.output().starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!outcome.closed);
    }

    #[test]
    fn trailers_are_appended_to_request_headers() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let handler = move |_: &Request, _: &mut RequestCtx| {
            let record = record.clone();
            Action::Upload {
                handler: Box::new(move |request: &Request, chunk: &[u8]| {
                    if chunk.is_empty() {
                        *record.lock().unwrap() = request
                            .headers()
                            .map(|(n, v)| (n.to_owned(), v.to_owned()))
                            .collect();
                        UploadAction::Respond(Response::empty(204).into_shared())
                    } else {
                        UploadAction::Continue
                    }
                }),
                large_buffer_size: 0,
            }
        };

        let mut fx = Fixture::new(
            handler,
            vec![
                b"POST /u HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Sum: 99\r\n\r\n"
                    .to_vec(),
            ],
        );
        fx.process();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|(n, v)| n == "X-Sum" && v == "99"));
    }

    #[test]
    fn upgrade_hands_over_the_socket() {
        struct Switcher(Arc<AtomicUsize>);
        impl UpgradeHandler for Switcher {
            fn upgraded(self: Box<Self>, _io: Box<dyn Transport>, leftover: Vec<u8>) {
                assert_eq!(leftover, b"\x81\x00");
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let fired = Arc::new(AtomicUsize::new(0));
        let upgrade_fired = fired.clone();
        let handler = move |_: &Request, _: &mut RequestCtx| {
            Action::Respond(
                Response::upgrade("websocket", Switcher(upgrade_fired.clone())).into_shared(),
            )
        };

        // The client optimistically sends its first frame right behind the
        // upgrade request.
        let mut input =
            b"GET /chat HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n"
                .to_vec();
        input.extend_from_slice(b"\x81\x00");

        let mut fx = Fixture::new(handler, vec![input]);
        let outcome = fx.process();
        assert!(outcome.upgraded);

        let out = fx.output();
        assert!(out.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(out.contains("Connection: Upgrade\r\n"));
        assert!(out.contains("Upgrade: websocket\r\n"));

        let Fixture { conn, .. } = fx;
        let (handler, io, leftover) = conn.into_upgrade().expect("handoff payload");
        handler.upgraded(io, leftover);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[cfg(feature = "post")]
    #[test]
    fn post_parse_surfaces_fields() {
        struct FormSink(Arc<Mutex<Vec<(String, String)>>>);
        impl crate::post::PostFieldHandler for FormSink {
            fn field(&mut self, _: &Request, name: &str, value: &str) -> UploadAction {
                self.0
                    .lock()
                    .unwrap()
                    .push((name.to_owned(), value.to_owned()));
                UploadAction::Continue
            }
            fn end(&mut self, _: &Request) -> UploadAction {
                UploadAction::Respond(Response::empty(204).into_shared())
            }
        }

        let fields: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_fields = fields.clone();
        let handler = move |_: &Request, _: &mut RequestCtx| Action::PostParse {
            handler: Box::new(FormSink(sink_fields.clone())),
            max_field_size: 1024,
        };

        let body = b"name=Jane+Doe&age=42";
        let mut request = format!(
            "POST /form HTTP/1.1\r\nHost: h\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);

        let mut fx = Fixture::new(handler, vec![request]);
        fx.process();

        let fields = fields.lock().unwrap();
        assert_eq!(
            fields.as_slice(),
            &[
                ("name".to_owned(), "Jane Doe".to_owned()),
                ("age".to_owned(), "42".to_owned()),
            ]
        );
        assert!(fx.output().starts_with("HTTP/1.1 204 No Content\r\n"));
    }

    #[cfg(feature = "post")]
    #[test]
    fn post_parse_rejects_other_content_types() {
        struct FormSink;
        impl crate::post::PostFieldHandler for FormSink {
            fn field(&mut self, _: &Request, _: &str, _: &str) -> UploadAction {
                UploadAction::Continue
            }
            fn end(&mut self, _: &Request) -> UploadAction {
                UploadAction::Respond(Response::empty(204).into_shared())
            }
        }

        let handler = |_: &Request, _: &mut RequestCtx| Action::PostParse {
            handler: Box::new(FormSink),
            max_field_size: 1024,
        };

        let mut fx = Fixture::new(
            handler,
            vec![
                b"POST /form HTTP/1.1\r\nHost: h\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}"
                    .to_vec(),
            ],
        );
        let outcome = fx.process();
        assert!(fx
            .output()
            .starts_with("HTTP/1.1 415 Unsupported Media Type\r\n"));
        assert!(outcome.closed);
    }
}
