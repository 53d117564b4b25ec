// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Error taxonomy of the engine.
//!
//! The engine distinguishes *transport* errors (classified from the socket
//! layer, some of which are recoverable), *parse* errors (each mapped to a
//! canned HTTP status), and *response* errors (application misuse of a
//! response object). Recoverable transport errors never escape the event
//! loop; everything else terminates the connection.

use std::io;

quick_error! {
    /// Classified socket-level error.
    ///
    /// `WouldBlock` and `Interrupted` are recoverable: the engine clears the
    /// matching readiness bit and retries on the next loop cycle. All other
    /// kinds terminate the connection.
    #[derive(Debug)]
    pub enum SocketError {
        /// The operation would block; retry when the socket is ready again.
        WouldBlock {
            display("operation would block")
        }
        /// Interrupted by a signal; retry immediately.
        Interrupted {
            display("interrupted")
        }
        /// The peer performed an orderly shutdown.
        RemoteClosed {
            display("remote closed the connection")
        }
        ConnectionReset {
            display("connection reset by peer")
        }
        BrokenPipe {
            display("broken pipe")
        }
        NotConnected {
            display("socket is not connected")
        }
        /// The kernel ran out of socket buffers or memory.
        LowMemory {
            display("out of kernel memory for socket operation")
        }
        /// The operation is not supported on this transport (e.g. `sendfile`
        /// over TLS).
        Unsupported {
            display("operation not supported on this transport")
        }
        Io(err: io::Error) {
            source(err)
            display("I/O error: {}", err)
        }
    }
}

impl SocketError {
    /// Classifies an `io::Error` into a `SocketError` kind.
    pub fn classify(err: io::Error) -> SocketError {
        match err.kind() {
            io::ErrorKind::WouldBlock => SocketError::WouldBlock,
            io::ErrorKind::Interrupted => SocketError::Interrupted,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                SocketError::ConnectionReset
            }
            io::ErrorKind::BrokenPipe => SocketError::BrokenPipe,
            io::ErrorKind::NotConnected => SocketError::NotConnected,
            io::ErrorKind::UnexpectedEof => SocketError::RemoteClosed,
            _ => match err.raw_os_error() {
                Some(libc::ENOBUFS) | Some(libc::ENOMEM) => SocketError::LowMemory,
                _ => SocketError::Io(err),
            },
        }
    }

    /// True for errors that are retried on the next readiness cycle rather
    /// than terminating the connection.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, SocketError::WouldBlock | SocketError::Interrupted)
    }

    /// True when the peer is gone (orderly or not).
    #[inline]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            SocketError::RemoteClosed
                | SocketError::ConnectionReset
                | SocketError::BrokenPipe
                | SocketError::NotConnected
        )
    }
}

quick_error! {
    /// Failure to parse an incoming request.
    ///
    /// Every variant maps to the status code of the canned response emitted
    /// before the connection is closed; see [`ParseError::status_code`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ParseError {
        MalformedRequestLine {
            display("malformed request line")
        }
        /// The request-target is not in a form this server accepts.
        BadRequestTarget {
            display("unacceptable request target")
        }
        /// HTTP version is not 1.0 or 1.1.
        UnsupportedVersion {
            display("unsupported HTTP version")
        }
        BadHeader {
            display("malformed header field")
        }
        /// `obs-fold` line continuation under the default strictness.
        ObsoleteFold {
            display("obsolete header folding")
        }
        /// A second occurrence of a header that must appear at most once.
        DuplicateHeader(name: &'static str) {
            display("duplicate {} header", name)
        }
        /// Both `Content-Length` and `Transfer-Encoding: chunked` present.
        ConflictingFraming {
            display("conflicting body framing headers")
        }
        /// `Transfer-Encoding` names a coding other than chunked.
        UnsupportedTransferEncoding {
            display("unsupported transfer encoding")
        }
        BadContentLength {
            display("invalid Content-Length value")
        }
        /// HTTP/1.1 request without a `Host` header.
        MissingHost {
            display("missing Host header")
        }
        /// The request line did not fit the read buffer.
        RequestLineTooLarge {
            display("request line exceeds buffer capacity")
        }
        /// The header block did not fit the read buffer, or there were too
        /// many fields.
        HeaderBlockTooLarge {
            display("header block exceeds buffer capacity")
        }
        /// The staged body (or a single field of it) exceeded its limit.
        BodyTooLarge {
            display("request body exceeds configured limit")
        }
        InvalidChunk {
            display("invalid chunked framing")
        }
    }
}

impl ParseError {
    /// The status code of the canned response emitted for this error.
    pub fn status_code(&self) -> u16 {
        match *self {
            ParseError::UnsupportedVersion => 505,
            ParseError::UnsupportedTransferEncoding => 501,
            ParseError::RequestLineTooLarge => 414,
            ParseError::HeaderBlockTooLarge => 431,
            ParseError::BodyTooLarge => 413,
            _ => 400,
        }
    }
}

quick_error! {
    /// Application misuse of a [`Response`](crate::Response).
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ResponseError {
        /// The response was already enqueued once and is immutable.
        Frozen {
            display("response is frozen and can no longer be modified")
        }
        /// The upgrade handler of a 101 response was already consumed.
        UpgradeConsumed {
            display("upgrade handler was already taken by an earlier request")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn classify_kinds() {
        let e = SocketError::classify(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(e.is_transient());
        let e = SocketError::classify(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(e.is_disconnect());
        let e = SocketError::classify(io::Error::from_raw_os_error(libc::ENOBUFS));
        assert!(matches!(e, SocketError::LowMemory));
    }

    #[test]
    fn parse_error_statuses() {
        assert_eq!(ParseError::UnsupportedVersion.status_code(), 505);
        assert_eq!(ParseError::RequestLineTooLarge.status_code(), 414);
        assert_eq!(ParseError::HeaderBlockTooLarge.status_code(), 431);
        assert_eq!(ParseError::BodyTooLarge.status_code(), 413);
        assert_eq!(ParseError::ConflictingFraming.status_code(), 400);
        assert_eq!(ParseError::UnsupportedTransferEncoding.status_code(), 501);
    }
}
