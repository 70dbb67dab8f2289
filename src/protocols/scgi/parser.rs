//! SCGI request decoder.
//!
//! Wire format:
//!
//! ```text
//! <len>:<name>\0<value>\0...<name>\0<value>\0,<CONTENT_LENGTH bytes of body>
//! ```
//!
//! The decoder works incrementally over a growing read buffer: it returns
//! `Incomplete` until the whole netstring and the declared body are present.

use crate::error::{ConnectionError, ProtocolError};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::io::{self, Read};

/// Most digits accepted in the length prefix.
pub const MAX_LENGTH_DIGITS: usize = 20;

/// Decoded header block, before the body has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Header mapping with the `SCGI` marker already removed.
    pub headers: HashMap<String, String>,
    /// Declared body length.
    pub content_length: usize,
}

/// Result of decoding the netstring header block.
#[derive(Debug)]
pub enum ParseResult {
    /// Header block decoded; the second field is the number of bytes it
    /// occupied, including the length prefix and trailing comma.
    Complete(RequestHead, usize),
    /// Need more data.
    Incomplete,
    /// The peer sent nothing before the `:` delimiter.
    Empty,
    /// Malformed framing.
    Error(ProtocolError),
}

/// Decode the netstring header block at the start of `buffer`.
pub fn parse_head(buffer: &[u8], max_request_size: usize) -> ParseResult {
    let colon = match find_colon(buffer) {
        Ok(Some(pos)) => pos,
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    if colon == 0 {
        return ParseResult::Empty;
    }

    // find_colon only lets ASCII digits through
    let digits = std::str::from_utf8(&buffer[..colon]).unwrap_or_default();
    let block_len: usize = match digits.parse() {
        Ok(n) => n,
        Err(_) => {
            return ParseResult::Error(ProtocolError::LengthTooLong {
                max: MAX_LENGTH_DIGITS,
            })
        }
    };

    let head_len = match (colon + 2).checked_add(block_len) {
        Some(n) if n <= max_request_size => n,
        Some(n) => {
            return ParseResult::Error(ProtocolError::TooLarge {
                size: n,
                max: max_request_size,
            })
        }
        None => {
            return ParseResult::Error(ProtocolError::TooLarge {
                size: usize::MAX,
                max: max_request_size,
            })
        }
    };

    // The block plus one terminator byte, whatever its value.
    if buffer.len() < head_len {
        return ParseResult::Incomplete;
    }

    let block = &buffer[colon + 1..colon + 1 + block_len];
    let mut headers = match parse_headers(block) {
        Ok(h) => h,
        Err(e) => return ParseResult::Error(e),
    };

    if headers.get("SCGI").map(String::as_str) != Some("1") {
        return ParseResult::Error(ProtocolError::NotScgi);
    }

    let content_length = match headers.get("CONTENT_LENGTH") {
        None => return ParseResult::Error(ProtocolError::MissingContentLength),
        Some(v) => match v.parse::<usize>() {
            Ok(n) => n,
            Err(_) => return ParseResult::Error(ProtocolError::InvalidContentLength(v.clone())),
        },
    };

    match head_len.checked_add(content_length) {
        Some(total) if total <= max_request_size => {}
        total => {
            return ParseResult::Error(ProtocolError::TooLarge {
                size: total.unwrap_or(usize::MAX),
                max: max_request_size,
            })
        }
    }

    headers.remove("SCGI");

    ParseResult::Complete(
        RequestHead {
            headers,
            content_length,
        },
        head_len,
    )
}

/// Locate the `:` ending the length prefix.
///
/// Returns `Ok(None)` while only digits have been seen.
fn find_colon(buffer: &[u8]) -> Result<Option<usize>, ProtocolError> {
    for (i, &b) in buffer.iter().enumerate() {
        match b {
            b':' => return Ok(Some(i)),
            b'0'..=b'9' if i < MAX_LENGTH_DIGITS => {}
            b'0'..=b'9' => {
                return Err(ProtocolError::LengthTooLong {
                    max: MAX_LENGTH_DIGITS,
                })
            }
            _ => {
                let end = (i + 1).min(MAX_LENGTH_DIGITS);
                return Err(ProtocolError::ExpectedLength(
                    String::from_utf8_lossy(&buffer[..end]).into_owned(),
                ));
            }
        }
    }
    Ok(None)
}

/// Split a header block into name/value pairs.
///
/// Every value is NUL-terminated on the wire, so one trailing NUL is the
/// terminator of the last value rather than the start of another token.
fn parse_headers(block: &[u8]) -> Result<HashMap<String, String>, ProtocolError> {
    let block = block.strip_suffix(b"\0").unwrap_or(block);
    if block.is_empty() {
        return Ok(HashMap::new());
    }

    let tokens: Vec<&[u8]> = block.split(|&b| b == 0).collect();
    if tokens.len() % 2 != 0 {
        return Err(ProtocolError::OddHeaderTokens(tokens.len()));
    }

    let mut headers = HashMap::with_capacity(tokens.len() / 2);
    for pair in tokens.chunks_exact(2) {
        let name = std::str::from_utf8(pair[0]).map_err(|_| ProtocolError::HeaderEncoding)?;
        let value = std::str::from_utf8(pair[1]).map_err(|_| ProtocolError::HeaderEncoding)?;
        headers.insert(name.to_string(), value.to_string());
    }
    Ok(headers)
}

/// A fully received request.
#[derive(Debug)]
pub struct RequestFrame {
    pub headers: HashMap<String, String>,
    pub body: RequestBody,
}

/// Request body exposed as a byte stream over exactly CONTENT_LENGTH bytes.
#[derive(Debug, Clone, Default)]
pub struct RequestBody {
    data: Bytes,
}

impl RequestBody {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Unread bytes, without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.data
    }

    /// Read everything that is left.
    pub fn read_all(&mut self) -> Bytes {
        std::mem::take(&mut self.data)
    }
}

impl Read for RequestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data.advance(n);
        Ok(n)
    }
}

/// Incremental request decoder bound to one connection.
///
/// Remembers the decoded header block so that waiting for a large body does
/// not re-parse headers on every read event.
#[derive(Debug)]
pub struct RequestDecoder {
    max_request_size: usize,
    head: Option<(RequestHead, usize)>,
}

impl RequestDecoder {
    pub fn new(max_request_size: usize) -> Self {
        Self {
            max_request_size,
            head: None,
        }
    }

    /// Try to take one complete request out of `buffer`.
    ///
    /// On success the request bytes are removed from the buffer. Any byte
    /// after the declared body is rejected: there is no pipelining in SCGI/1.
    pub fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<RequestFrame>, ConnectionError> {
        if self.head.is_none() {
            match parse_head(buffer, self.max_request_size) {
                ParseResult::Complete(head, consumed) => self.head = Some((head, consumed)),
                ParseResult::Incomplete => return Ok(None),
                ParseResult::Empty => return Err(ConnectionError::EmptyRequest),
                ParseResult::Error(e) => return Err(e.into()),
            }
        }

        let Some((head, head_len)) = &self.head else {
            return Ok(None);
        };

        let total = head_len + head.content_length;
        if buffer.len() < total {
            return Ok(None);
        }
        if buffer.len() > total {
            return Err(ProtocolError::TrailingData(buffer.len() - total).into());
        }

        let Some((head, head_len)) = self.head.take() else {
            return Ok(None);
        };
        buffer.advance(head_len);
        let body = buffer.split_to(head.content_length).freeze();

        Ok(Some(RequestFrame {
            headers: head.headers,
            body: RequestBody::new(body),
        }))
    }
}

/// Encode a request in SCGI wire format.
///
/// `CONTENT_LENGTH` and `SCGI` are emitted first, as the protocol requires;
/// copies of either in `headers` are ignored.
pub fn encode_request(headers: &[(&str, &str)], body: &[u8]) -> BytesMut {
    let mut block = Vec::new();
    let content_length = body.len().to_string();

    let fixed = [("CONTENT_LENGTH", content_length.as_str()), ("SCGI", "1")];
    let rest = headers
        .iter()
        .filter(|(name, _)| *name != "CONTENT_LENGTH" && *name != "SCGI");

    for (name, value) in fixed.iter().chain(rest) {
        block.extend_from_slice(name.as_bytes());
        block.push(0);
        block.extend_from_slice(value.as_bytes());
        block.push(0);
    }

    let prefix = block.len().to_string();
    let mut out = BytesMut::with_capacity(prefix.len() + block.len() + 2 + body.len());
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(b":");
    out.extend_from_slice(&block);
    out.extend_from_slice(b",");
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAX: usize = 1024 * 1024;

    fn decode_all(input: &[u8]) -> Result<Option<RequestFrame>, ConnectionError> {
        let mut buffer = BytesMut::from(input);
        RequestDecoder::new(MAX).decode(&mut buffer)
    }

    #[test]
    fn test_decode_hello_world() {
        let input = b"44:CONTENT_LENGTH\x0013\x00SCGI\x001\x00REQUEST_METHOD\x00GET\x00,Hello, world!";
        let mut frame = decode_all(input).unwrap().unwrap();

        assert_eq!(frame.headers.len(), 2);
        assert_eq!(frame.headers["CONTENT_LENGTH"], "13");
        assert_eq!(frame.headers["REQUEST_METHOD"], "GET");
        assert!(!frame.headers.contains_key("SCGI"));

        let mut body = String::new();
        frame.body.read_to_string(&mut body).unwrap();
        assert_eq!(body, "Hello, world!");
    }

    #[test]
    fn test_parse_head_consumed() {
        let input = b"24:CONTENT_LENGTH\x000\x00SCGI\x001\x00,";
        match parse_head(input, MAX) {
            ParseResult::Complete(head, consumed) => {
                assert_eq!(head.content_length, 0);
                assert_eq!(consumed, input.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incremental_arrival() {
        let input = encode_request(&[("REQUEST_URI", "/x")], b"abcdef");
        let mut decoder = RequestDecoder::new(MAX);
        let mut buffer = BytesMut::new();

        for (i, byte) in input.iter().enumerate() {
            buffer.extend_from_slice(&[*byte]);
            let result = decoder.decode(&mut buffer).unwrap();
            if i + 1 < input.len() {
                assert!(result.is_none(), "completed early at byte {i}");
            } else {
                let frame = result.unwrap();
                assert_eq!(frame.headers["REQUEST_URI"], "/x");
                assert_eq!(frame.body.peek(), b"abcdef");
            }
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_roundtrip() {
        let headers = [
            ("REQUEST_METHOD", "POST"),
            ("QUERY_STRING", "a=1&b=2"),
            ("HTTP_COOKIE", "sid=xyz"),
            ("EMPTY", ""),
        ];
        let body = b"field=value\x00binary\xff";
        let frame = decode_all(&encode_request(&headers, body)).unwrap().unwrap();

        for (name, value) in headers {
            assert_eq!(frame.headers[name], value);
        }
        assert_eq!(frame.headers["CONTENT_LENGTH"], body.len().to_string());
        assert_eq!(frame.headers.len(), headers.len() + 1);
        assert_eq!(frame.body.peek(), body);
    }

    #[test]
    fn test_duplicate_header_last_wins() {
        let input = b"32:CONTENT_LENGTH\x000\x00SCGI\x001\x00A\x001\x00A\x002\x00,";
        let frame = decode_all(input).unwrap().unwrap();
        assert_eq!(frame.headers["A"], "2");
    }

    #[test]
    fn test_missing_content_length() {
        let input = b"7:SCGI\x001\x00,";
        match decode_all(input) {
            Err(ConnectionError::Protocol(ProtocolError::MissingContentLength)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_scgi_version() {
        let input = b"24:CONTENT_LENGTH\x000\x00SCGI\x002\x00,";
        match decode_all(input) {
            Err(ConnectionError::Protocol(ProtocolError::NotScgi)) => {}
            other => panic!("unexpected: {:?}", other),
        }

        let input = b"17:CONTENT_LENGTH\x000\x00,";
        match decode_all(input) {
            Err(ConnectionError::Protocol(ProtocolError::NotScgi)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_odd_token_count() {
        // Declared length cuts the block after a name with no value.
        let input = b"30:CONTENT_LENGTH\x000\x00SCGI\x001\x00ORPHAN,";
        match decode_all(input) {
            Err(ConnectionError::Protocol(ProtocolError::OddHeaderTokens(5))) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_declared_length_mismatch() {
        // Length one short: the comma check is skipped, but the block loses
        // its final NUL and the body starts one byte early.
        let valid = encode_request(&[], b"");
        let mut bad = b"23".to_vec();
        bad.extend_from_slice(&valid[2..]);
        match decode_all(&bad) {
            Err(ConnectionError::Protocol(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_raw_http_rejected() {
        match decode_all(b"GET / HTTP/1.1\r\n\r\n") {
            Err(ConnectionError::Protocol(ProtocolError::ExpectedLength(got))) => {
                assert_eq!(got, "G");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_length_prefix_too_long() {
        let input = [b'9'; MAX_LENGTH_DIGITS + 1];
        match parse_head(&input, MAX) {
            ParseResult::Error(ProtocolError::LengthTooLong { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse_head(b"1234", MAX) {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_length_is_transient() {
        match parse_head(b":", MAX) {
            ParseResult::Empty => {}
            other => panic!("unexpected: {:?}", other),
        }
        match decode_all(b":whatever") {
            Err(ConnectionError::EmptyRequest) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_content_length() {
        let input = b"25:CONTENT_LENGTH\x00-1\x00SCGI\x001\x00,";
        match decode_all(&input[..]) {
            Err(ConnectionError::Protocol(ProtocolError::InvalidContentLength(v))) => {
                assert_eq!(v, "-1");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_too_large() {
        let input = encode_request(&[], &[b'x'; 100]);
        let mut buffer = BytesMut::from(&input[..]);
        match RequestDecoder::new(64).decode(&mut buffer) {
            Err(ConnectionError::Protocol(ProtocolError::TooLarge { max: 64, .. })) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_trailing_data_rejected() {
        let mut input = encode_request(&[], b"body");
        input.extend_from_slice(b"10:next");
        match decode_all(&input) {
            Err(ConnectionError::Protocol(ProtocolError::TrailingData(7))) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_non_utf8_header() {
        let input = b"27:CONTENT_LENGTH\x000\x00SCGI\x001\x00\xff\x00\x00,";
        match decode_all(input) {
            Err(ConnectionError::Protocol(ProtocolError::HeaderEncoding)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_request_body_reads_in_pieces() {
        let mut body = RequestBody::new(Bytes::from_static(b"0123456789"));
        let mut buf = [0u8; 4];
        assert_eq!(body.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(body.remaining(), 6);
        assert_eq!(&body.read_all()[..], b"456789");
        assert_eq!(body.read(&mut buf).unwrap(), 0);
    }

    fn header_pairs() -> impl Strategy<Value = Vec<(String, String)>> {
        proptest::collection::vec(("[^\\x00]{0,16}", "[^\\x00]{0,24}"), 0..8)
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            headers in header_pairs(),
            body in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let pairs: Vec<(&str, &str)> = headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            let encoded = encode_request(&pairs, &body);
            let frame = decode_all(&encoded).unwrap().unwrap();

            let mut expected = HashMap::new();
            expected.insert("CONTENT_LENGTH".to_string(), body.len().to_string());
            for (name, value) in &headers {
                if name != "CONTENT_LENGTH" && name != "SCGI" {
                    expected.insert(name.clone(), value.clone());
                }
            }
            prop_assert_eq!(frame.headers, expected);
            prop_assert_eq!(frame.body.peek(), &body[..]);
        }

        #[test]
        fn prop_wrong_length_prefix_never_parses(
            headers in header_pairs(),
            body in proptest::collection::vec(any::<u8>(), 0..64),
            declared in 0usize..512,
        ) {
            let pairs: Vec<(&str, &str)> = headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            let encoded = encode_request(&pairs, &body);
            let colon = encoded.iter().position(|&b| b == b':').unwrap();
            let actual: usize = std::str::from_utf8(&encoded[..colon]).unwrap().parse().unwrap();
            prop_assume!(declared != actual);

            let mut mutated = declared.to_string().into_bytes();
            mutated.extend_from_slice(&encoded[colon..]);

            match decode_all(&mutated) {
                Ok(Some(frame)) => prop_assert!(false, "decoded {:?}", frame.headers),
                // A longer claim can only wait for bytes that never come.
                Ok(None) => prop_assert!(declared > actual),
                Err(_) => {}
            }
        }
    }
}
