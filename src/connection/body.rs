// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Incremental request-body decoding.
//!
//! The decoder works in place on the connection's read buffer: body bytes
//! are compacted to the front of the fed slice, framing bytes are counted as
//! discardable, and anything after that stays untouched for the next feed.
//! The decoding never needs more room than its input.

use std::cmp;

use crate::connection::parse::BodyKind;
use crate::error::ParseError;

/// Result of one [`BodyDecoder::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FeedOutcome {
    /// Bytes at the start of the fed slice that are decoded body data.
    pub body: usize,
    /// Framing bytes following the body data; the caller drops them.
    pub discard: usize,
    /// True once the body is complete. For chunked bodies this means the
    /// zero-size chunk line was consumed; the trailer section (if any) and
    /// the final CRLF are left in the buffer for the caller.
    pub finished: bool,
}

enum Inner {
    Length { remaining: u64 },
    Chunked { state: ChunkState },
}

enum ChunkState {
    /// Waiting for a complete `size[;ext]CRLF` line.
    SizeLine,
    Data { remaining: u64 },
    /// Expecting the CRLF that closes a chunk's data.
    DataEnd,
    Finished,
}

pub(crate) struct BodyDecoder {
    inner: Inner,
}

impl BodyDecoder {
    pub fn new(kind: BodyKind) -> BodyDecoder {
        BodyDecoder {
            inner: match kind {
                BodyKind::Chunked => Inner::Chunked {
                    state: ChunkState::SizeLine,
                },
                BodyKind::Length(n) => Inner::Length { remaining: n },
                BodyKind::None => Inner::Length { remaining: 0 },
            },
        }
    }

    /// True when no body byte is expected at all.
    pub fn is_trivially_done(&self) -> bool {
        matches!(self.inner, Inner::Length { remaining: 0 })
    }

    /// Decodes in place as much of `data` as possible.
    pub fn feed(&mut self, data: &mut [u8]) -> Result<FeedOutcome, ParseError> {
        match self.inner {
            Inner::Length { ref mut remaining } => {
                let take = cmp::min(data.len() as u64, *remaining) as usize;
                *remaining -= take as u64;
                Ok(FeedOutcome {
                    body: take,
                    discard: 0,
                    finished: *remaining == 0,
                })
            }
            Inner::Chunked { ref mut state } => {
                let mut body = 0;
                let mut discard = 0;

                loop {
                    match state {
                        ChunkState::SizeLine => {
                            match parse_size_line(&data[body + discard..])? {
                                None => {
                                    return Ok(FeedOutcome {
                                        body,
                                        discard,
                                        finished: false,
                                    })
                                }
                                Some((consumed, 0)) => {
                                    discard += consumed;
                                    *state = ChunkState::Finished;
                                    return Ok(FeedOutcome {
                                        body,
                                        discard,
                                        finished: true,
                                    });
                                }
                                Some((consumed, size)) => {
                                    discard += consumed;
                                    *state = ChunkState::Data { remaining: size };
                                }
                            }
                        }
                        ChunkState::Data { remaining } => {
                            let avail = data.len() - body - discard;
                            let take = cmp::min(avail as u64, *remaining) as usize;
                            if discard != 0 {
                                data.copy_within(body + discard..body + discard + take, body);
                            }
                            body += take;
                            *remaining -= take as u64;
                            if *remaining == 0 {
                                *state = ChunkState::DataEnd;
                            } else {
                                return Ok(FeedOutcome {
                                    body,
                                    discard,
                                    finished: false,
                                });
                            }
                        }
                        ChunkState::DataEnd => {
                            let tail = &data[body + discard..];
                            if tail.len() < 2 {
                                return Ok(FeedOutcome {
                                    body,
                                    discard,
                                    finished: false,
                                });
                            }
                            if &tail[..2] != b"\r\n" {
                                return Err(ParseError::InvalidChunk);
                            }
                            discard += 2;
                            *state = ChunkState::SizeLine;
                        }
                        ChunkState::Finished => {
                            return Ok(FeedOutcome {
                                body,
                                discard,
                                finished: true,
                            })
                        }
                    }
                }
            }
        }
    }
}

/// Longest size line the decoder tolerates before calling the framing
/// broken: 16 hex digits plus a generous allowance for extensions.
const MAX_SIZE_LINE: usize = 1024;

/// Parses one `size[;extension]CRLF` line. Returns `None` when the line is
/// not complete yet; `Some((consumed, size))` otherwise. Extensions are
/// ignored as the grammar allows.
fn parse_size_line(data: &[u8]) -> Result<Option<(usize, u64)>, ParseError> {
    let crlf = match data.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => pos,
        None => {
            if data.len() > MAX_SIZE_LINE {
                return Err(ParseError::InvalidChunk);
            }
            return Ok(None);
        }
    };

    let line = &data[..crlf];
    let digits = line
        .iter()
        .position(|b| !b.is_ascii_hexdigit())
        .unwrap_or(line.len());
    if digits == 0 || digits > 16 {
        return Err(ParseError::InvalidChunk);
    }
    // After the digits only an extension (introduced by ';') may follow.
    if digits < line.len() && line[digits] != b';' {
        return Err(ParseError::InvalidChunk);
    }

    let mut size: u64 = 0;
    for &b in &line[..digits] {
        let digit = (b as char).to_digit(16).unwrap() as u64;
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit))
            .ok_or(ParseError::InvalidChunk)?;
    }

    Ok(Some((crlf + 2, size)))
}
