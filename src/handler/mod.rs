//! Application handler contract.
//!
//! A handler receives a [`Context`] describing one request and returns a
//! [`Response`]: status, ordered headers and body. It never learns which
//! transport or framing protocol delivered the request.
//!
//! Handlers run synchronously on the reactor thread and must not block on
//! further I/O from their own connection.

pub mod form;

use crate::error::{HandlerError, ResponseError};
use crate::logging::Logger;
use crate::protocols::scgi::{Body, RequestBody, RequestFrame, ResponseFrame, Status};
use std::collections::HashMap;
use std::net::SocketAddr;

pub use form::{Cookies, UploadedFile};

/// Outcome of one handler invocation.
pub type HandlerResult = Result<Response, HandlerError>;

/// Application entry point.
pub trait Handler: Send {
    fn call(&self, ctx: &mut Context) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&mut Context) -> HandlerResult + Send,
{
    fn call(&self, ctx: &mut Context) -> HandlerResult {
        self(ctx)
    }
}

/// Everything a handler knows about the request.
#[derive(Debug)]
pub struct Context {
    /// SCGI environment (CGI variables plus `HTTP_*` headers).
    pub env: HashMap<String, String>,
    /// Request body; reading it does not affect `post` or `files`.
    pub body: RequestBody,
    /// Decoded `QUERY_STRING`.
    pub get: HashMap<String, String>,
    /// Decoded form fields of a urlencoded or multipart body.
    pub post: HashMap<String, String>,
    /// File parts of a multipart body, keyed by field name.
    pub files: HashMap<String, UploadedFile>,
    pub cookies: Cookies,
    pub logger: Logger,
    pub remote_addr: Option<SocketAddr>,
}

impl Context {
    /// Build the context for a decoded request.
    pub fn from_request(frame: RequestFrame, logger: Logger, remote_addr: Option<SocketAddr>) -> Self {
        let RequestFrame { headers: env, body } = frame;

        let get = env
            .get("QUERY_STRING")
            .map(|q| form::parse_urlencoded(q))
            .unwrap_or_default();

        let cookies = env
            .get("HTTP_COOKIE")
            .map(|c| Cookies::parse(c))
            .unwrap_or_default();

        let mut post = HashMap::new();
        let mut files = HashMap::new();
        let content_type = env.get("CONTENT_TYPE").map(String::as_str).unwrap_or("");
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        match media_type.as_str() {
            "application/x-www-form-urlencoded" => {
                post = form::parse_urlencoded(&String::from_utf8_lossy(body.peek()));
            }
            "multipart/form-data" => {
                let parsed = form::parse_boundary(content_type)
                    .and_then(|boundary| form::parse_multipart(body.peek(), &boundary));
                match parsed {
                    Ok(multipart) => {
                        post = multipart.fields;
                        files = multipart.files;
                    }
                    Err(e) => logger.log(format!("Ignoring form body: {e}")),
                }
            }
            _ => {}
        }

        Self {
            env,
            body,
            get,
            post,
            files,
            cookies,
            logger,
            remote_addr,
        }
    }

    /// Look up an environment variable.
    pub fn env(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn method(&self) -> Option<&str> {
        self.env("REQUEST_METHOD")
    }

    pub fn log(&self, message: impl AsRef<str>) {
        self.logger.log(message);
    }
}

/// Handler output.
#[derive(Debug)]
pub struct Response {
    pub status: Status,
    /// Emission order is preserved; duplicates are allowed.
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: impl Into<Status>) -> Self {
        Self {
            status: status.into(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// Build from a flat `[name, value, name, value, ...]` header list.
    pub fn from_flat<I, S>(
        status: u16,
        flat_headers: I,
        body: impl Into<Body>,
    ) -> Result<Self, ResponseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let flat: Vec<String> = flat_headers.into_iter().map(Into::into).collect();
        if flat.len() % 2 != 0 {
            return Err(ResponseError::OddHeaderPairs(flat.len()));
        }

        let mut headers = Vec::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
            headers.push((name, value));
        }

        Ok(Self {
            status: Status::new(status),
            headers,
            body: body.into(),
        })
    }

    /// `text/plain` response with the given body.
    pub fn text(status: impl Into<Status>, body: impl Into<Body>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain")
            .body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }
}

impl From<Response> for ResponseFrame {
    fn from(response: Response) -> Self {
        ResponseFrame {
            status: response.status,
            headers: response.headers,
            body: response.body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::scgi::DEFAULT_CHUNK_SIZE;
    use bytes::Bytes;
    use std::io::Read;

    fn request(headers: &[(&str, &str)], body: &'static [u8]) -> RequestFrame {
        RequestFrame {
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: RequestBody::new(Bytes::from_static(body)),
        }
    }

    #[test]
    fn test_context_get_and_cookies() {
        let ctx = Context::from_request(
            request(
                &[
                    ("REQUEST_METHOD", "GET"),
                    ("QUERY_STRING", "q=rust+lang&page=2"),
                    ("HTTP_COOKIE", "sid=42"),
                ],
                b"",
            ),
            Logger::noop(),
            None,
        );
        assert_eq!(ctx.method(), Some("GET"));
        assert_eq!(ctx.get["q"], "rust lang");
        assert_eq!(ctx.get["page"], "2");
        assert_eq!(ctx.cookies.get("sid"), Some("42"));
        assert!(ctx.post.is_empty());
    }

    #[test]
    fn test_context_urlencoded_post_keeps_body() {
        let mut ctx = Context::from_request(
            request(
                &[(
                    "CONTENT_TYPE",
                    "application/x-www-form-urlencoded; charset=UTF-8",
                )],
                b"name=Ada&lang=en",
            ),
            Logger::noop(),
            None,
        );
        assert_eq!(ctx.post["name"], "Ada");
        assert_eq!(ctx.post["lang"], "en");

        let mut raw = String::new();
        ctx.body.read_to_string(&mut raw).unwrap();
        assert_eq!(raw, "name=Ada&lang=en");
    }

    #[test]
    fn test_context_multipart() {
        let ctx = Context::from_request(
            request(
                &[("CONTENT_TYPE", "multipart/form-data; boundary=b")],
                b"--b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.bin\"\r\n\r\n\x01\x02\r\n--b\r\nContent-Disposition: form-data; name=\"k\"\r\n\r\nv\r\n--b--",
            ),
            Logger::noop(),
            None,
        );
        assert_eq!(ctx.post["k"], "v");
        assert_eq!(ctx.files["f"].filename, "x.bin");
        assert_eq!(&ctx.files["f"].data[..], b"\x01\x02");
    }

    #[test]
    fn test_context_bad_multipart_is_logged() {
        let capture = crate::logging::tests::Capture::default();
        let ctx = Context::from_request(
            request(&[("CONTENT_TYPE", "multipart/form-data")], b"junk"),
            capture.logger(),
            None,
        );
        assert!(ctx.files.is_empty());
        assert!(capture.contains("missing multipart boundary"));
    }

    #[test]
    fn test_response_from_flat() {
        let response =
            Response::from_flat(200, ["Content-Type", "text/plain", "X-A", "1"], "OK").unwrap();
        assert_eq!(
            response.headers,
            vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("X-A".to_string(), "1".to_string()),
            ]
        );

        let bytes = ResponseFrame::from(response)
            .to_bytes(DEFAULT_CHUNK_SIZE)
            .unwrap();
        assert_eq!(
            &bytes[..],
            b"Status: 200 OK\r\nContent-Type: text/plain\r\nX-A: 1\r\n\r\nOK"
        );
    }

    #[test]
    fn test_response_from_flat_odd() {
        let err = Response::from_flat(200, ["Content-Type"], Body::Empty).unwrap_err();
        assert_eq!(err, ResponseError::OddHeaderPairs(1));
    }

    #[test]
    fn test_closure_handler() {
        let handler = |ctx: &mut Context| -> HandlerResult {
            Ok(Response::text(Status::OK, format!("{:?}", ctx.method())))
        };
        let mut ctx = Context::from_request(
            request(&[("REQUEST_METHOD", "PUT")], b""),
            Logger::noop(),
            None,
        );
        let response = handler.call(&mut ctx).unwrap();
        assert_eq!(response.status.code(), 200);
        assert!(matches!(response.body, Body::Bytes(ref b) if &b[..] == b"Some(\"PUT\")"));
    }
}
