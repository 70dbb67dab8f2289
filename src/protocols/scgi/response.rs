//! SCGI response encoder.
//!
//! A response is a CGI-style header section followed by the body:
//!
//! ```text
//! Status: 200 OK\r\n
//! Content-Type: text/plain\r\n
//! \r\n
//! <body>
//! ```
//!
//! Headers are emitted in the order given, duplicates included. Stream
//! bodies are pulled in fixed-size chunks so they never have to be held in
//! memory at once.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Default read size for stream bodies.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Response status: numeric code plus reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    code: u16,
    reason: &'static str,
}

impl Status {
    pub const OK: Status = Status::new(200);

    /// Status with the standard reason phrase, or none for unknown codes.
    pub const fn new(code: u16) -> Self {
        Self {
            code,
            reason: reason_phrase(code),
        }
    }

    /// Status with a custom reason phrase.
    pub const fn with_reason(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Status::new(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.reason)
        }
    }
}

const fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Readers usable as a response body.
pub trait BodyReader: Read + Seek + Send {}

impl<T: Read + Seek + Send> BodyReader for T {}

/// Response body.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    /// In-memory bytes.
    Bytes(Bytes),
    /// Lazily read stream, rewound to its start before the first read.
    Stream(Box<dyn BodyReader>),
}

impl Body {
    pub fn stream<R: BodyReader + 'static>(reader: R) -> Self {
        Body::Stream(Box::new(reader))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(b: &'static [u8]) -> Self {
        Body::Bytes(Bytes::from_static(b))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

/// A response ready to be serialized, consumed exactly once.
#[derive(Debug)]
pub struct ResponseFrame {
    pub status: Status,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl ResponseFrame {
    /// Append the status line, headers and header terminator to `buf`.
    pub fn encode_head(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(b"Status: ");
        buf.extend_from_slice(self.status.to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
    }

    /// Split into the encoded header section and a body stream.
    pub fn into_parts(self) -> (BytesMut, BodyStream) {
        let mut head = BytesMut::new();
        self.encode_head(&mut head);
        (head, BodyStream::new(self.body))
    }

    /// Serialize onto a blocking writer. Returns the number of bytes written.
    ///
    /// A stream body is dropped whether or not the write succeeds.
    pub fn write_to<W: Write>(self, writer: &mut W, chunk_size: usize) -> io::Result<u64> {
        let (head, mut body) = self.into_parts();
        writer.write_all(&head)?;
        let mut written = head.len() as u64;
        while let Some(chunk) = body.next_chunk(chunk_size)? {
            writer.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        writer.flush()?;
        Ok(written)
    }

    /// Serialize fully into memory.
    pub fn to_bytes(self, chunk_size: usize) -> io::Result<Bytes> {
        let mut out = Vec::new();
        self.write_to(&mut out, chunk_size)?;
        Ok(Bytes::from(out))
    }
}

/// Pull-based body source.
///
/// In-memory bodies come out as one chunk; streams are read `chunk_size`
/// bytes at a time and released as soon as they reach EOF.
pub struct BodyStream {
    pending: Option<Bytes>,
    reader: Option<Box<dyn BodyReader>>,
    rewound: bool,
}

impl BodyStream {
    pub fn new(body: Body) -> Self {
        let (pending, reader) = match body {
            Body::Empty => (None, None),
            Body::Bytes(b) if b.is_empty() => (None, None),
            Body::Bytes(b) => (Some(b), None),
            Body::Stream(r) => (None, Some(r)),
        };
        Self {
            pending,
            reader,
            rewound: false,
        }
    }

    /// Next piece of body, or `None` once exhausted.
    pub fn next_chunk(&mut self, chunk_size: usize) -> io::Result<Option<Bytes>> {
        if let Some(bytes) = self.pending.take() {
            return Ok(Some(bytes));
        }

        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        if !self.rewound {
            reader.seek(SeekFrom::Start(0))?;
            self.rewound = true;
        }

        let mut chunk = vec![0u8; chunk_size.max(1)];
        let n = loop {
            match reader.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            self.reader = None;
            return Ok(None);
        }
        chunk.truncate(n);
        Ok(Some(Bytes::from(chunk)))
    }

    pub fn is_finished(&self) -> bool {
        self.pending.is_none() && self.reader.is_none()
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("pending", &self.pending.as_ref().map(Bytes::len))
            .field("streaming", &self.reader.is_some())
            .finish()
    }
}
