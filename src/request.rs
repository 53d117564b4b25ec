// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::net::SocketAddr;

use arrayvec::ArrayString;

use crate::arena::{Arena, StrSpan};
use crate::connection::parse::MAX_METHOD_LEN;

/// HTTP request method.
///
/// Comparison against the known tokens is case-sensitive, as the RFC
/// requires: `get` is not `GET` and parses as [`Method::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    /// A syntactically valid token the engine does not recognise. The raw
    /// spelling is kept on the request.
    Other,
}

impl Method {
    pub fn from_token(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            _ => Method::Other,
        }
    }
}

/// HTTP protocol version. Anything else is rejected with 505 at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    /// Whether connections persist by default under this version.
    #[inline]
    pub fn keep_alive_default(&self) -> bool {
        matches!(self, HttpVersion::Http11)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// Body progress bookkeeping, maintained by the state machine.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct UploadProgress {
    /// Declared `Content-Length`, when the body is length-delimited.
    pub expected: Option<u64>,
    pub chunked: bool,
    /// Decoded body bytes delivered so far.
    pub received: u64,
}

/// A parsed HTTP request.
///
/// The request owns the connection's bump arena for the duration of the
/// request: header names and values, the decoded path and the raw target all
/// live in it. When the request completes the arena is taken back and reset
/// for the next pipelined request.
///
/// # Example
///
/// ```
/// use aioli::Request;
///
/// let request = Request::fake("GET", "/hello?name=world", &[("Host", "example.com")]);
/// assert_eq!(request.url(), "/hello");
/// assert_eq!(request.get_param("name").as_deref(), Some("world"));
/// assert_eq!(request.header("host"), Some("example.com"));
/// ```
pub struct Request {
    arena: Arena,
    method: Method,
    raw_method: ArrayString<MAX_METHOD_LEN>,
    raw_target: StrSpan,
    path: StrSpan,
    query: Option<StrSpan>,
    version: HttpVersion,
    headers: Vec<(StrSpan, StrSpan)>,
    remote_addr: Option<SocketAddr>,
    secure: bool,
    pub(crate) upload: UploadProgress,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_parsed(
        arena: Arena,
        method: Method,
        raw_method: ArrayString<MAX_METHOD_LEN>,
        raw_target: StrSpan,
        path: StrSpan,
        query: Option<StrSpan>,
        version: HttpVersion,
        headers: Vec<(StrSpan, StrSpan)>,
        remote_addr: Option<SocketAddr>,
        secure: bool,
        upload: UploadProgress,
    ) -> Request {
        Request {
            arena,
            method,
            raw_method,
            raw_target,
            path,
            query,
            version,
            headers,
            remote_addr,
            secure,
            upload,
        }
    }

    /// Takes the arena back when the request is finished.
    pub(crate) fn into_arena(self) -> Arena {
        self.arena
    }

    pub(crate) fn append_header(&mut self, name: &str, value: &str) -> bool {
        let name = match self.arena.alloc_str(name) {
            Some(span) => span,
            None => return false,
        };
        let value = match self.arena.alloc_str(value) {
            Some(span) => span,
            None => return false,
        };
        self.headers.push((name, value));
        true
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The method token exactly as the client sent it.
    #[inline]
    pub fn raw_method(&self) -> &str {
        self.raw_method.as_str()
    }

    /// The percent-decoded path component of the request target.
    #[inline]
    pub fn url(&self) -> &str {
        self.arena.str(self.path)
    }

    /// The request target exactly as received, undecoded.
    #[inline]
    pub fn raw_url(&self) -> &str {
        self.arena.str(self.raw_target)
    }

    /// The raw query string, without the leading `?`.
    #[inline]
    pub fn raw_query_string(&self) -> &str {
        match self.query {
            Some(span) => self.arena.str(span),
            None => "",
        }
    }

    /// Decodes and returns the first query-string parameter named `name`.
    pub fn get_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.raw_query_string().as_bytes())
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.into_owned())
    }

    #[inline]
    pub fn http_version(&self) -> HttpVersion {
        self.version
    }

    /// Returns the value of the first header named `name`. Lookup is
    /// case-insensitive; the stored spelling is whatever the client sent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| self.arena.str(*n).eq_ignore_ascii_case(name))
            .map(|(_, v)| self.arena.str(*v))
    }

    /// Iterates over all header fields in the order they were received.
    /// Duplicate names are preserved.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(move |(n, v)| (self.arena.str(*n), self.arena.str(*v)))
    }

    /// Address of the remote peer; `None` for UNIX-domain connections.
    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// True when the request arrived over TLS.
    #[inline]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Declared `Content-Length`, if the body is length-delimited.
    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        self.upload.expected
    }

    /// True when the body uses chunked transfer-encoding.
    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.upload.chunked
    }

    /// True when the request carries a body at all.
    #[inline]
    pub fn has_body(&self) -> bool {
        self.upload.chunked || self.upload.expected.map(|n| n > 0).unwrap_or(false)
    }

    /// Decoded body bytes delivered to the application so far.
    #[inline]
    pub fn body_bytes_received(&self) -> u64 {
        self.upload.received
    }

    /// Builds a request out of thin air, for tests.
    ///
    /// The target may carry a query string; headers are copied verbatim.
    pub fn fake(method: &str, target: &str, headers: &[(&str, &str)]) -> Request {
        let mut arena = Arena::new(16 * 1024);
        let raw_method = ArrayString::from(method).expect("method token too long");
        let raw_target = arena.alloc_str(target).expect("arena too small");
        let (path_str, query_str) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };
        let path = arena.alloc_str(path_str).expect("arena too small");
        let query = query_str.map(|q| arena.alloc_str(q).expect("arena too small"));
        let headers = headers
            .iter()
            .map(|(n, v)| {
                (
                    arena.alloc_str(n).expect("arena too small"),
                    arena.alloc_str(v).expect("arena too small"),
                )
            })
            .collect();

        Request {
            method: Method::from_token(method),
            raw_method,
            raw_target,
            path,
            query,
            version: HttpVersion::Http11,
            headers,
            remote_addr: Some("127.0.0.1:4000".parse().unwrap()),
            secure: false,
            upload: UploadProgress::default(),
            arena,
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.raw_method())
            .field("url", &self.raw_url())
            .field("version", &self.version.as_str())
            .field("headers", &self.headers.len())
            .finish()
    }
}
