// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Request-line and header-block parsing.
//!
//! The request line is split by hand; the header block goes through
//! `httparse` after an obs-fold pre-pass. Everything that survives parsing
//! is copied into the connection arena, so the read buffer can be compacted
//! underneath it.

use std::str;

use arrayvec::ArrayString;
use percent_encoding::percent_decode;

use crate::arena::{Arena, StrSpan};
use crate::error::ParseError;
use crate::request::{HttpVersion, Method};

/// How pedantically request syntax is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Reject everything the RFCs have deprecated (notably obs-fold).
    #[default]
    Strict,
    /// Tolerate obsolete header folding by substituting whitespace.
    Lenient,
}

/// Longest method token the engine stores. Anything longer is treated as a
/// malformed request line.
pub(crate) const MAX_METHOD_LEN: usize = 32;

/// Finds the first CRLF at or after `from.saturating_sub(1)` (the rollback
/// covers a CR that arrived at the end of the previous read).
pub(crate) fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    let off = from.saturating_sub(1);
    buf[off..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| off + pos)
}

/// Finds the first CRLFCRLF at or after `from.saturating_sub(3)`.
pub(crate) fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    let off = from.saturating_sub(3);
    buf[off..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| off + pos)
}

#[derive(Debug)]
pub(crate) struct ParsedRequestLine {
    pub method: Method,
    pub raw_method: ArrayString<MAX_METHOD_LEN>,
    pub raw_target: StrSpan,
    pub path: StrSpan,
    pub query: Option<StrSpan>,
    pub version: HttpVersion,
}

/// Parses `METHOD SP request-target SP HTTP-version` (without the CRLF).
///
/// Accepted target forms: origin-form, authority-form for CONNECT, and the
/// bare asterisk for OPTIONS. Arena exhaustion maps to 414: the line was
/// within buffer capacity but its decoded pieces do not fit the pool.
pub(crate) fn parse_request_line(
    line: &[u8],
    arena: &mut Arena,
) -> Result<ParsedRequestLine, ParseError> {
    let line = str::from_utf8(line).map_err(|_| ParseError::MalformedRequestLine)?;

    let mut words = line.split(' ');
    let (method_token, target, version) = match (words.next(), words.next(), words.next()) {
        (Some(m), Some(t), Some(v)) if words.next().is_none() => (m, t, v),
        _ => return Err(ParseError::MalformedRequestLine),
    };

    if method_token.is_empty()
        || method_token.len() > MAX_METHOD_LEN
        || !method_token.bytes().all(is_token_byte)
    {
        return Err(ParseError::MalformedRequestLine);
    }
    if target.is_empty() {
        return Err(ParseError::MalformedRequestLine);
    }

    let version = parse_version(version)?;
    let method = Method::from_token(method_token);
    let raw_method =
        ArrayString::from(method_token).map_err(|_| ParseError::MalformedRequestLine)?;

    let raw_target = arena
        .alloc_str(target)
        .ok_or(ParseError::RequestLineTooLarge)?;

    let (path, query) = decode_target(method, target, arena)?;

    Ok(ParsedRequestLine {
        method,
        raw_method,
        raw_target,
        path,
        query,
        version,
    })
}

fn parse_version(version: &str) -> Result<HttpVersion, ParseError> {
    match version {
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        v if v.starts_with("HTTP/") => Err(ParseError::UnsupportedVersion),
        _ => Err(ParseError::MalformedRequestLine),
    }
}

fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
        | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

fn decode_target(
    method: Method,
    target: &str,
    arena: &mut Arena,
) -> Result<(StrSpan, Option<StrSpan>), ParseError> {
    if target == "*" {
        if method != Method::Options {
            return Err(ParseError::BadRequestTarget);
        }
        let path = arena
            .alloc_str("*")
            .ok_or(ParseError::RequestLineTooLarge)?;
        return Ok((path, None));
    }

    if method == Method::Connect {
        // Authority form: kept verbatim, no decoding.
        let path = arena
            .alloc_str(target)
            .ok_or(ParseError::RequestLineTooLarge)?;
        return Ok((path, None));
    }

    if !target.starts_with('/') {
        return Err(ParseError::BadRequestTarget);
    }

    let (raw_path, raw_query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };

    let decoded = percent_decode(raw_path.as_bytes())
        .decode_utf8()
        .map_err(|_| ParseError::BadRequestTarget)?;
    if decoded.bytes().any(|b| b == 0) {
        return Err(ParseError::BadRequestTarget);
    }

    let path = arena
        .alloc_str(&decoded)
        .ok_or(ParseError::RequestLineTooLarge)?;
    let query = match raw_query {
        Some(q) => Some(arena.alloc_str(q).ok_or(ParseError::RequestLineTooLarge)?),
        None => None,
    };

    Ok((path, query))
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    None,
    Length(u64),
    Chunked,
}

#[derive(Debug)]
pub(crate) struct HeaderInfo {
    pub headers: Vec<(StrSpan, StrSpan)>,
    pub body: BodyKind,
    pub expect_continue: bool,
    pub connection_close: bool,
    pub connection_keep_alive: bool,
    pub has_host: bool,
}

const MAX_HEADERS: usize = 64;

/// Parses a complete header block (everything between the request line's
/// CRLF and the final CRLFCRLF, inclusive of that terminator).
///
/// The block is taken mutably: under lenient strictness, obs-folds are
/// overwritten in place with spaces before the block is handed to httparse.
pub(crate) fn parse_header_block(
    block: &mut [u8],
    strictness: Strictness,
    version: HttpVersion,
    arena: &mut Arena,
) -> Result<HeaderInfo, ParseError> {
    unfold(block, strictness)?;

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let parsed = match httparse::parse_headers(block, &mut storage) {
        Ok(httparse::Status::Complete((_, headers))) => headers,
        Ok(httparse::Status::Partial) => return Err(ParseError::BadHeader),
        Err(httparse::Error::TooManyHeaders) => return Err(ParseError::HeaderBlockTooLarge),
        Err(_) => return Err(ParseError::BadHeader),
    };

    let mut info = HeaderInfo {
        headers: Vec::with_capacity(parsed.len()),
        body: BodyKind::None,
        expect_continue: false,
        connection_close: false,
        connection_keep_alive: false,
        has_host: false,
    };

    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut seen_te = false;

    for header in parsed {
        let value = str::from_utf8(header.value).map_err(|_| ParseError::BadHeader)?;
        let value = value.trim();

        if header.name.eq_ignore_ascii_case("Content-Length") {
            if content_length.is_some() {
                return Err(ParseError::DuplicateHeader("Content-Length"));
            }
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::BadContentLength);
            }
            content_length =
                Some(atoi::atoi::<u64>(value.as_bytes()).ok_or(ParseError::BadContentLength)?);
        } else if header.name.eq_ignore_ascii_case("Transfer-Encoding") {
            if seen_te {
                return Err(ParseError::DuplicateHeader("Transfer-Encoding"));
            }
            seen_te = true;
            if value.eq_ignore_ascii_case("chunked") {
                chunked = true;
            } else {
                return Err(ParseError::UnsupportedTransferEncoding);
            }
        } else if header.name.eq_ignore_ascii_case("Host") {
            if info.has_host {
                return Err(ParseError::DuplicateHeader("Host"));
            }
            info.has_host = true;
        } else if header.name.eq_ignore_ascii_case("Expect") {
            if value.eq_ignore_ascii_case("100-continue") {
                info.expect_continue = true;
            }
        } else if header.name.eq_ignore_ascii_case("Connection") {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    info.connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    info.connection_keep_alive = true;
                }
            }
        }

        let name = arena
            .alloc_str(header.name)
            .ok_or(ParseError::HeaderBlockTooLarge)?;
        let value = arena
            .alloc_str(value)
            .ok_or(ParseError::HeaderBlockTooLarge)?;
        info.headers.push((name, value));
    }

    if chunked && content_length.is_some() {
        return Err(ParseError::ConflictingFraming);
    }
    if version == HttpVersion::Http11 && !info.has_host {
        return Err(ParseError::MissingHost);
    }

    info.body = if chunked {
        BodyKind::Chunked
    } else {
        match content_length {
            Some(n) => BodyKind::Length(n),
            None => BodyKind::None,
        }
    };

    Ok(info)
}

/// Parses a chunked-body trailer block (same wire shape as headers) and
/// returns the fields.
pub(crate) fn parse_trailer_block(
    block: &mut [u8],
    strictness: Strictness,
) -> Result<Vec<(String, String)>, ParseError> {
    unfold(block, strictness)?;

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let parsed = match httparse::parse_headers(block, &mut storage) {
        Ok(httparse::Status::Complete((_, headers))) => headers,
        Ok(httparse::Status::Partial) => return Err(ParseError::InvalidChunk),
        Err(httparse::Error::TooManyHeaders) => return Err(ParseError::HeaderBlockTooLarge),
        Err(_) => return Err(ParseError::BadHeader),
    };

    parsed
        .iter()
        .map(|header| {
            let value = str::from_utf8(header.value).map_err(|_| ParseError::BadHeader)?;
            Ok((header.name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}

/// Rejects or flattens `obs-fold` line continuations.
fn unfold(block: &mut [u8], strictness: Strictness) -> Result<(), ParseError> {
    let mut i = 0;
    while i + 2 < block.len() {
        if block[i] == b'\r'
            && block[i + 1] == b'\n'
            && (block[i + 2] == b' ' || block[i + 2] == b'\t')
        {
            match strictness {
                Strictness::Strict => return Err(ParseError::ObsoleteFold),
                Strictness::Lenient => {
                    block[i] = b' ';
                    block[i + 1] = b' ';
                }
            }
        }
        i += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        Arena::new(8 * 1024)
    }

    #[test]
    fn request_line_basic() {
        let mut arena = arena();
        let line = parse_request_line(b"GET /hello%20world?x=1 HTTP/1.1", &mut arena).unwrap();
        assert_eq!(line.method, Method::Get);
        assert_eq!(arena.str(line.path), "/hello world");
        assert_eq!(arena.str(line.query.unwrap()), "x=1");
        assert_eq!(line.version, HttpVersion::Http11);
    }

    #[test]
    fn request_line_rejects_bad_shapes() {
        let mut a = arena();
        assert_eq!(
            parse_request_line(b"GET /", &mut a).unwrap_err(),
            ParseError::MalformedRequestLine
        );
        assert_eq!(
            parse_request_line(b"GET  / HTTP/1.1", &mut a).unwrap_err(),
            ParseError::MalformedRequestLine
        );
        assert_eq!(
            parse_request_line(b"GET / HTTP/2.0", &mut a).unwrap_err(),
            ParseError::UnsupportedVersion
        );
        assert_eq!(
            parse_request_line(b"GET example.com HTTP/1.1", &mut a).unwrap_err(),
            ParseError::BadRequestTarget
        );
    }

    #[test]
    fn connect_and_options_targets() {
        let mut a = arena();
        let line = parse_request_line(b"CONNECT example.com:443 HTTP/1.1", &mut a).unwrap();
        assert_eq!(a.str(line.path), "example.com:443");

        let line = parse_request_line(b"OPTIONS * HTTP/1.1", &mut a).unwrap();
        assert_eq!(a.str(line.path), "*");

        assert_eq!(
            parse_request_line(b"GET * HTTP/1.1", &mut a).unwrap_err(),
            ParseError::BadRequestTarget
        );
    }

    #[test]
    fn methods_are_case_sensitive() {
        let mut a = arena();
        let line = parse_request_line(b"get / HTTP/1.1", &mut a).unwrap();
        assert_eq!(line.method, Method::Other);
        assert_eq!(line.raw_method.as_str(), "get");
    }

    fn parse_block(raw: &[u8], strictness: Strictness) -> Result<HeaderInfo, ParseError> {
        let mut a = arena();
        let mut block = raw.to_vec();
        parse_header_block(&mut block, strictness, HttpVersion::Http11, &mut a)
    }

    #[test]
    fn header_block_basic() {
        let info = parse_block(
            b"Host: example.com\r\nContent-Length: 5\r\n\r\n",
            Strictness::Strict,
        )
        .unwrap();
        assert!(info.has_host);
        assert_eq!(info.body, BodyKind::Length(5));
        assert_eq!(info.headers.len(), 2);
    }

    #[test]
    fn missing_host_on_http11() {
        assert_eq!(
            parse_block(b"Accept: */*\r\n\r\n", Strictness::Strict).unwrap_err(),
            ParseError::MissingHost
        );

        // HTTP/1.0 requests are fine without Host.
        let mut a = arena();
        let mut block = b"Accept: */*\r\n\r\n".to_vec();
        let info =
            parse_header_block(&mut block, Strictness::Strict, HttpVersion::Http10, &mut a)
                .unwrap();
        assert!(!info.has_host);
    }

    #[test]
    fn duplicate_singular_headers() {
        assert_eq!(
            parse_block(
                b"Host: a\r\nHost: b\r\n\r\n",
                Strictness::Strict
            )
            .unwrap_err(),
            ParseError::DuplicateHeader("Host")
        );
        assert_eq!(
            parse_block(
                b"Host: a\r\nContent-Length: 1\r\nContent-Length: 1\r\n\r\n",
                Strictness::Strict
            )
            .unwrap_err(),
            ParseError::DuplicateHeader("Content-Length")
        );
    }

    #[test]
    fn conflicting_framing() {
        assert_eq!(
            parse_block(
                b"Host: a\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
                Strictness::Strict
            )
            .unwrap_err(),
            ParseError::ConflictingFraming
        );
    }

    #[test]
    fn unsupported_transfer_encoding() {
        assert_eq!(
            parse_block(
                b"Host: a\r\nTransfer-Encoding: gzip\r\n\r\n",
                Strictness::Strict
            )
            .unwrap_err(),
            ParseError::UnsupportedTransferEncoding
        );
    }

    #[test]
    fn obs_fold_strict_vs_lenient() {
        let raw = b"Host: a\r\nX-Long: part one\r\n part two\r\n\r\n";
        assert_eq!(
            parse_block(raw, Strictness::Strict).unwrap_err(),
            ParseError::ObsoleteFold
        );

        let mut a = arena();
        let mut block = raw.to_vec();
        let info =
            parse_header_block(&mut block, Strictness::Lenient, HttpVersion::Http11, &mut a)
                .unwrap();
        let (_, value) = info
            .headers
            .iter()
            .find(|(n, _)| a.str(*n) == "X-Long")
            .unwrap();
        assert_eq!(a.str(*value), "part one   part two");
    }

    #[test]
    fn connection_tokens() {
        let info = parse_block(b"Host: a\r\nConnection: close\r\n\r\n", Strictness::Strict)
            .unwrap();
        assert!(info.connection_close);

        let info = parse_block(
            b"Host: a\r\nConnection: Keep-Alive, Upgrade\r\n\r\n",
            Strictness::Strict,
        )
        .unwrap();
        assert!(info.connection_keep_alive);
        assert!(!info.connection_close);
    }

    #[test]
    fn expect_continue_flag() {
        let info = parse_block(
            b"Host: a\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n",
            Strictness::Strict,
        )
        .unwrap();
        assert!(info.expect_continue);
    }

    #[test]
    fn header_spelling_is_preserved() {
        let mut a = arena();
        let mut block = b"hOsT: example.com\r\n\r\n".to_vec();
        let info =
            parse_header_block(&mut block, Strictness::Strict, HttpVersion::Http11, &mut a)
                .unwrap();
        assert_eq!(a.str(info.headers[0].0), "hOsT");
    }
}
