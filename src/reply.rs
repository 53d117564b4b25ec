// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Response staging.
//!
//! A [`Reply`] couples one use of a (possibly shared) [`Response`] to one
//! connection: it owns the cursors into the response content, the producer
//! instance for dynamic bodies, and the framing decision made against the
//! request's HTTP version. The header block is assembled in one contiguous
//! buffer; body bytes leave through whichever path their content source
//! calls for.

use std::time::SystemTime;

use crate::action::ContentProducer;
use crate::request::HttpVersion;
use crate::response::{reason_phrase, Content, SharedResponse};

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// `Content-Length: n`.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Delimited by closing the connection (HTTP/1.0 dynamic bodies).
    EndByClose,
    /// No body bytes follow the header block at all (1xx/204/304, HEAD).
    None,
}

/// One response being sent on one connection.
pub(crate) struct Reply {
    pub response: SharedResponse,
    pub framing: Framing,
    /// False for HEAD requests and bodiless statuses: headers carry the
    /// framing information but no body byte is emitted.
    pub send_body: bool,
    /// The connection must close once this reply is done.
    pub close_after: bool,
    /// Bytes of content emitted so far (`Length`/file cursor).
    pub content_pos: u64,
    /// Cleared once the kernel refuses `sendfile` for this pairing; the
    /// buffered fallback then takes over for the rest of the body.
    pub sendfile_ok: bool,
    iovec_seg: usize,
    iovec_off: usize,
    producer: Option<Box<dyn ContentProducer>>,
}

impl Reply {
    /// Stages `response` for a request of the given version and method
    /// semantics. `want_close` is the keep-alive decision made upstream;
    /// the framing may force it further.
    pub fn new(
        response: SharedResponse,
        version: HttpVersion,
        is_head: bool,
        want_close: bool,
    ) -> Reply {
        response.freeze();

        let bodiless = response.is_bodiless_status();
        let framing = if bodiless {
            Framing::None
        } else {
            match response.content.known_len() {
                Some(len) => Framing::Length(len),
                None => {
                    if version == HttpVersion::Http11 && response.chunked_eligible() {
                        Framing::Chunked
                    } else {
                        Framing::EndByClose
                    }
                }
            }
        };

        let close_after = want_close || framing == Framing::EndByClose;

        Reply {
            send_body: !is_head && !bodiless && framing != Framing::None,
            framing,
            close_after,
            content_pos: 0,
            sendfile_ok: true,
            iovec_seg: 0,
            iovec_off: 0,
            producer: None,
            response,
        }
    }

    /// Lazily instantiates the per-use producer for dynamic content.
    pub fn producer(&mut self) -> Option<&mut dyn ContentProducer> {
        if self.producer.is_none() {
            if let Content::Producer(ref factory) = self.response.content {
                self.producer = Some(factory());
            }
        }
        match self.producer {
            Some(ref mut producer) => Some(&mut **producer),
            None => None,
        }
    }

    /// The remaining iovec segments as I/O slices, starting at the cursor.
    pub fn iovec_slices(&self) -> Vec<std::io::IoSlice<'_>> {
        match self.response.content {
            Content::Iovec(ref iov) => {
                let segments = iov.segments();
                let mut slices = Vec::with_capacity(segments.len().saturating_sub(self.iovec_seg));
                for (i, seg) in segments.iter().enumerate().skip(self.iovec_seg) {
                    let start = if i == self.iovec_seg { self.iovec_off } else { 0 };
                    slices.push(std::io::IoSlice::new(&seg[start..]));
                }
                slices
            }
            _ => Vec::new(),
        }
    }

    /// Current segment of an iovec body: `(bytes, is_last)`. `None` once the
    /// cursor is past the end.
    #[cfg(test)]
    pub fn iovec_current(&self) -> Option<(&[u8], bool)> {
        match self.response.content {
            Content::Iovec(ref iov) => {
                let segments = iov.segments();
                let seg = segments.get(self.iovec_seg)?;
                let last = self.iovec_seg + 1 == segments.len();
                Some((&seg[self.iovec_off..], last))
            }
            _ => None,
        }
    }

    /// Advances the iovec cursor by `n` sent bytes.
    pub fn iovec_advance(&mut self, mut n: usize) {
        if let Content::Iovec(ref iov) = self.response.content {
            self.content_pos += n as u64;
            let segments = iov.segments();
            while n > 0 && self.iovec_seg < segments.len() {
                let seg_left = segments[self.iovec_seg].len() - self.iovec_off;
                if n < seg_left {
                    self.iovec_off += n;
                    n = 0;
                } else {
                    n -= seg_left;
                    self.iovec_seg += 1;
                    self.iovec_off = 0;
                }
            }
        }
    }

    pub fn iovec_done(&self) -> bool {
        match self.response.content {
            Content::Iovec(ref iov) => self.iovec_seg >= iov.segments().len(),
            _ => true,
        }
    }
}

/// Assembles the status line and header block into `out`.
///
/// The engine owns `Content-Length`, `Transfer-Encoding`, `Connection`,
/// `Trailer` and `Date` (the latter only when the application did not set
/// one); spellings of everything else pass through untouched.
pub(crate) fn serialize_headers(out: &mut Vec<u8>, reply: &Reply, version: HttpVersion) {
    let response = &reply.response;
    let mut itoa_buf = itoa::Buffer::new();

    out.extend_from_slice(version.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(itoa_buf.format(response.status_code()).as_bytes());
    out.push(b' ');
    out.extend_from_slice(reason_phrase(response.status_code()).as_bytes());
    out.extend_from_slice(b"\r\n");

    let mut found_server = false;
    let mut found_date = false;
    for (name, value) in response.headers() {
        if name.eq_ignore_ascii_case("Server") {
            found_server = true;
        }
        if name.eq_ignore_ascii_case("Date") {
            found_date = true;
        }

        // Headers the engine decides itself.
        if name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
            || name.eq_ignore_ascii_case("Connection")
            || name.eq_ignore_ascii_case("Trailer")
        {
            continue;
        }

        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if !found_server {
        out.extend_from_slice(b"Server: aioli\r\n");
    }
    if !found_date {
        out.extend_from_slice(b"Date: ");
        out.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if response.status_code() == 101 {
        out.extend_from_slice(b"Connection: Upgrade\r\n");
    } else if reply.close_after {
        out.extend_from_slice(b"Connection: close\r\n");
    } else {
        out.extend_from_slice(b"Connection: keep-alive\r\n");
    }

    match reply.framing {
        Framing::Length(len) => {
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(itoa_buf.format(len).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Framing::Chunked => {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        Framing::EndByClose | Framing::None => {}
    }

    out.extend_from_slice(b"\r\n");
}

/// Appends one `size[;ext]CRLF data CRLF` chunk frame.
pub(crate) fn write_chunk_frame(out: &mut Vec<u8>, data: &[u8], extension: Option<&str>) {
    debug_assert!(!data.is_empty());
    let mut buf = [0u8; 16];
    out.extend_from_slice(hex(data.len(), &mut buf));
    if let Some(ext) = extension {
        out.push(b';');
        out.extend_from_slice(ext.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Appends the chunk terminator: `0 CRLF trailers CRLF`.
pub(crate) fn write_chunk_terminator(out: &mut Vec<u8>, trailers: &[(String, String)]) {
    out.extend_from_slice(b"0\r\n");
    for (name, value) in trailers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

fn hex(mut n: usize, buf: &mut [u8; 16]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = DIGITS[n % 16];
        n /= 16;
        if n == 0 {
            break;
        }
    }
    &buf[i..]
}

/// The canned header block for `100 Continue`.
pub(crate) fn continue_response(out: &mut Vec<u8>) {
    out.extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
}

/// Builds the canned error page used when parsing fails.
pub(crate) fn error_response(status_code: u16) -> crate::response::Response {
    let phrase = reason_phrase(status_code);
    crate::response::Response::html(format!(
        "<html><head><title>{status_code} {phrase}</title></head>\
         <body><h1>{status_code} {phrase}</h1></body></html>"
    ))
    .with_status_code(status_code)
}
