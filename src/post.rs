// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Streaming POST form parsing.
//!
//! When the application answers a request with `Action::PostParse`, the
//! engine consumes the body itself: an `application/x-www-form-urlencoded`
//! stream is cut on `&` as bytes arrive, each complete field is decoded and
//! handed to the field handler, and at most one partial field is staged in
//! memory at a time. `multipart/form-data` is not decoded here; fall back
//! to `Action::Upload` for file uploads.

use url::form_urlencoded;

use crate::action::UploadAction;
use crate::error::ParseError;
use crate::request::Request;

/// Receives decoded form fields, one at a time, in request order.
pub trait PostFieldHandler: Send {
    /// Called once per complete field.
    fn field(&mut self, request: &Request, name: &str, value: &str) -> UploadAction;

    /// Called once after the last field. Expected to produce the response.
    fn end(&mut self, request: &Request) -> UploadAction;
}

/// Incremental `application/x-www-form-urlencoded` splitter.
///
/// Keeps at most one field in its staging buffer; a field longer than the
/// configured cap fails with the body-too-large error, which the engine
/// turns into a 413.
pub(crate) struct FormDecoder {
    staging: Vec<u8>,
    max_field: usize,
}

impl FormDecoder {
    pub fn new(max_field: usize) -> FormDecoder {
        FormDecoder {
            staging: Vec::new(),
            max_field: max_field.max(1),
        }
    }

    /// Feeds body bytes; returns the fields completed by this feed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<(String, String)>, ParseError> {
        self.staging.extend_from_slice(bytes);

        let mut fields = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.staging[start..].iter().position(|&b| b == b'&') {
            let segment = &self.staging[start..start + pos];
            if !segment.is_empty() {
                fields.push(decode_field(segment));
            }
            start += pos + 1;
        }
        self.staging.drain(..start);

        if self.staging.len() > self.max_field {
            return Err(ParseError::BodyTooLarge);
        }
        Ok(fields)
    }

    /// Flushes the trailing field at end of body, if any.
    pub fn finish(&mut self) -> Option<(String, String)> {
        if self.staging.is_empty() {
            return None;
        }
        let segment = std::mem::take(&mut self.staging);
        Some(decode_field(&segment))
    }
}

fn decode_field(segment: &[u8]) -> (String, String) {
    form_urlencoded::parse(segment)
        .into_owned()
        .next()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::FormDecoder;
    use crate::error::ParseError;

    #[test]
    fn whole_body_at_once() {
        let mut decoder = FormDecoder::new(1024);
        let fields = decoder.feed(b"name=Jane+Doe&age=42&note=a%26b").unwrap();
        assert_eq!(
            fields,
            vec![
                ("name".to_owned(), "Jane Doe".to_owned()),
                ("age".to_owned(), "42".to_owned()),
            ]
        );
        assert_eq!(
            decoder.finish(),
            Some(("note".to_owned(), "a&b".to_owned()))
        );
    }

    #[test]
    fn fields_split_across_feeds() {
        let mut decoder = FormDecoder::new(1024);
        assert!(decoder.feed(b"gree").unwrap().is_empty());
        assert!(decoder.feed(b"ting=he").unwrap().is_empty());
        let fields = decoder.feed(b"llo&x=").unwrap();
        assert_eq!(fields, vec![("greeting".to_owned(), "hello".to_owned())]);
        assert_eq!(decoder.finish(), Some(("x".to_owned(), "".to_owned())));
    }

    #[test]
    fn bare_name_has_empty_value() {
        let mut decoder = FormDecoder::new(1024);
        let fields = decoder.feed(b"flag&k=v").unwrap();
        assert_eq!(fields[0], ("flag".to_owned(), "".to_owned()));
    }

    #[test]
    fn empty_segments_are_skipped() {
        let mut decoder = FormDecoder::new(1024);
        let fields = decoder.feed(b"a=1&&b=2&").unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn oversized_field_is_rejected() {
        let mut decoder = FormDecoder::new(8);
        assert_eq!(
            decoder.feed(b"toolongfieldname=1").unwrap_err(),
            ParseError::BodyTooLarge
        );
    }
}
