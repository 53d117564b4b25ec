// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::borrow::Cow;
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::action::{ContentProducer, UpgradeHandler};
use crate::error::ResponseError;

/// Shared handle to a response.
///
/// Responses are reference-counted so one response can serve many requests
/// at once; the content's release hook (if any) runs exactly once, when the
/// last handle drops.
pub type SharedResponse = Arc<Response>;

/// Factory that builds one [`ContentProducer`] per use of the response.
pub type ProducerFactory = Box<dyn Fn() -> Box<dyn ContentProducer> + Send + Sync>;

/// Body of a response.
pub(crate) enum Content {
    Empty,
    Buffer(Vec<u8>),
    File {
        file: File,
        offset: u64,
        len: u64,
    },
    Iovec(OwnedIovec),
    /// Dynamically produced body of unknown length: chunked on HTTP/1.1,
    /// end-by-close on HTTP/1.0.
    Producer(ProducerFactory),
}

impl Content {
    /// Body length when known a priori.
    pub(crate) fn known_len(&self) -> Option<u64> {
        match self {
            Content::Empty => Some(0),
            Content::Buffer(data) => Some(data.len() as u64),
            Content::File { len, .. } => Some(*len),
            Content::Iovec(iov) => Some(iov.total_len()),
            Content::Producer(_) => None,
        }
    }
}

/// An owned scatter list: body segments plus an optional release hook.
///
/// The hook runs exactly once, when the iovec is dropped — that is, when the
/// owning response's last handle goes away, or immediately if the response
/// is rejected before being enqueued.
pub struct OwnedIovec {
    segments: Vec<Box<[u8]>>,
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl OwnedIovec {
    pub fn new(segments: Vec<Box<[u8]>>) -> OwnedIovec {
        OwnedIovec {
            segments,
            release: Mutex::new(None),
        }
    }

    /// Attaches a hook that runs when the iovec is released.
    pub fn with_release<F>(mut self, hook: F) -> OwnedIovec
    where
        F: FnOnce() + Send + 'static,
    {
        self.release = Mutex::new(Some(Box::new(hook)));
        self
    }

    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    pub(crate) fn segments(&self) -> &[Box<[u8]>] {
        &self.segments
    }
}

impl Drop for OwnedIovec {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.release.lock() {
            if let Some(hook) = guard.take() {
                hook();
            }
        }
    }
}

/// A response under construction, immutable once enqueued.
///
/// Build a `Response` with the provided constructors, adjust it with the
/// `with_*` builder methods, then hand it to the engine through
/// [`into_shared`](Response::into_shared). The first time the engine
/// enqueues it the response is *frozen*: from then on it may be served to
/// any number of requests but can never change again.
///
/// # Example
///
/// ```
/// use aioli::Response;
///
/// let response = Response::text("hello world")
///     .with_status_code(201)
///     .with_header("X-Request-Id", "42");
/// assert_eq!(response.status_code(), 201);
/// ```
pub struct Response {
    status_code: u16,
    headers: Vec<(Cow<'static, str>, Cow<'static, str>)>,
    pub(crate) content: Content,
    chunked_eligible: bool,
    frozen: AtomicBool,
    upgrade: Mutex<Option<Box<dyn UpgradeHandler>>>,
}

impl Response {
    fn with_content(status_code: u16, content: Content) -> Response {
        Response {
            status_code,
            headers: Vec::new(),
            content,
            chunked_eligible: true,
            frozen: AtomicBool::new(false),
            upgrade: Mutex::new(None),
        }
    }

    /// Builds a 200 response with a plain text body.
    pub fn text<S>(body: S) -> Response
    where
        S: Into<String>,
    {
        Response::with_content(200, Content::Buffer(body.into().into_bytes()))
            .with_header("Content-Type", "text/plain; charset=utf8")
    }

    /// Builds a 200 response with an HTML body.
    pub fn html<S>(body: S) -> Response
    where
        S: Into<String>,
    {
        Response::with_content(200, Content::Buffer(body.into().into_bytes()))
            .with_header("Content-Type", "text/html; charset=utf8")
    }

    /// Builds a 200 response from raw bytes.
    pub fn from_data<D>(content_type: &'static str, body: D) -> Response
    where
        D: Into<Vec<u8>>,
    {
        Response::with_content(200, Content::Buffer(body.into()))
            .with_header("Content-Type", content_type)
    }

    /// Builds a 200 response that serves `len` bytes of an open file
    /// starting at `offset`.
    ///
    /// The descriptor stays open until the response is destroyed. On
    /// plaintext Linux sockets the body goes out through `sendfile(2)`;
    /// everywhere else it is read into the connection buffer.
    pub fn from_file(file: File, offset: u64, len: u64) -> Response {
        Response::with_content(200, Content::File { file, offset, len })
    }

    /// Builds a 200 response from an owned scatter list.
    pub fn from_iovec(iovec: OwnedIovec) -> Response {
        Response::with_content(200, Content::Iovec(iovec))
    }

    /// Builds a 200 response whose body is generated on demand.
    ///
    /// The factory runs once per use of the response and must return a fresh
    /// [`ContentProducer`]. Because the length is unknown, the body is sent
    /// with chunked transfer-encoding to HTTP/1.1 clients and delimited by
    /// connection close for HTTP/1.0.
    pub fn from_producer<F>(factory: F) -> Response
    where
        F: Fn() -> Box<dyn ContentProducer> + Send + Sync + 'static,
    {
        Response::with_content(200, Content::Producer(Box::new(factory)))
    }

    /// Builds an empty response with the given status code.
    pub fn empty(status_code: u16) -> Response {
        Response::with_content(status_code, Content::Empty)
    }

    /// Builds an empty 400 response.
    #[inline]
    pub fn empty_400() -> Response {
        Response::empty(400)
    }

    /// Builds an empty 404 response.
    #[inline]
    pub fn empty_404() -> Response {
        Response::empty(404)
    }

    /// Builds a 101 response that hands the connection over to `handler`
    /// once the switching-protocols header block is on the wire.
    pub fn upgrade<H>(protocol: &'static str, handler: H) -> Response
    where
        H: UpgradeHandler + 'static,
    {
        let response = Response::with_content(101, Content::Empty)
            .with_header("Upgrade", protocol)
            .with_header("Connection", "Upgrade");
        *response.upgrade.lock().unwrap() = Some(Box::new(handler));
        response
    }

    /// Changes the status code.
    #[inline]
    pub fn with_status_code(mut self, code: u16) -> Response {
        self.status_code = code;
        self
    }

    /// Appends a header.
    ///
    /// `Content-Length`, `Transfer-Encoding` and `Date` are managed by the
    /// engine; values given here for those names are ignored at send time
    /// (except `Date`, which suppresses the generated one).
    pub fn with_header<N, V>(mut self, name: N, value: V) -> Response
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Declares that this response must never be chunk-encoded; an
    /// unknown-length body is then delimited by connection close even on
    /// HTTP/1.1.
    pub fn with_chunking_disabled(mut self) -> Response {
        self.chunked_eligible = false;
        self
    }

    /// Appends a header to an already-built response.
    ///
    /// Fails with [`ResponseError::Frozen`] once the response has been
    /// enqueued.
    pub fn try_add_header<N, V>(&mut self, name: N, value: V) -> Result<(), ResponseError>
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        if self.is_frozen() {
            return Err(ResponseError::Frozen);
        }
        self.headers.push((name.into(), value.into()));
        Ok(())
    }

    /// Wraps the response in its shareable handle.
    #[inline]
    pub fn into_shared(self) -> SharedResponse {
        Arc::new(self)
    }

    #[inline]
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_ref(), v.as_ref()))
    }

    /// Body length when known a priori; `None` for producer-backed bodies.
    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        self.content.known_len()
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn chunked_eligible(&self) -> bool {
        self.chunked_eligible
    }

    /// Marks the response immutable. Called by the engine on first enqueue.
    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Whether this status code never carries a body.
    pub(crate) fn is_bodiless_status(&self) -> bool {
        self.status_code < 200 || self.status_code == 204 || self.status_code == 304
    }

    /// Takes the upgrade handler; at most one request can consume it.
    pub(crate) fn take_upgrade(&self) -> Option<Box<dyn UpgradeHandler>> {
        self.upgrade.lock().ok().and_then(|mut guard| guard.take())
    }

    pub(crate) fn has_upgrade(&self) -> bool {
        self.upgrade
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

/// Returns the phrase conventionally paired with a status code.
pub(crate) fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn builder_chain() {
        let r = Response::text("hi").with_status_code(201).with_header("X-A", "1");
        assert_eq!(r.status_code(), 201);
        assert_eq!(r.content_length(), Some(2));
        assert!(r.headers().any(|(n, v)| n == "X-A" && v == "1"));
    }

    #[test]
    fn freeze_blocks_mutation() {
        let mut r = Response::text("hi");
        r.try_add_header("X-A", "1").unwrap();
        r.freeze();
        assert_eq!(r.try_add_header("X-B", "2"), Err(ResponseError::Frozen));
    }

    #[test]
    fn iovec_release_runs_exactly_once() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let iov = OwnedIovec::new(vec![b"abc".to_vec().into_boxed_slice()])
            .with_release(|| {
                FIRED.fetch_add(1, Ordering::SeqCst);
            });
        let shared = Response::from_iovec(iov).into_shared();
        let clone = shared.clone();
        drop(shared);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bodiless_statuses() {
        assert!(Response::empty(204).is_bodiless_status());
        assert!(Response::empty(304).is_bodiless_status());
        assert!(Response::empty(100).is_bodiless_status());
        assert!(!Response::empty(200).is_bodiless_status());
    }
}
