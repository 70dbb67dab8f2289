//! Decoding of query strings, form bodies and cookies.

use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;

/// Percent-decode a form component. `+` becomes a space; malformed escapes
/// are kept as-is rather than rejected.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Parse `a=1&b=2` into a map. Later duplicates overwrite earlier ones.
pub fn parse_urlencoded(input: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in input.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(url_decode(name), url_decode(value));
    }
    map
}

/// Request cookies, parsed from the `HTTP_COOKIE` variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookies {
    values: HashMap<String, String>,
}

impl Cookies {
    pub fn parse(header: &str) -> Self {
        let mut values = HashMap::new();
        for pair in header.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = value.trim().trim_matches('"');
            values.insert(name.trim().to_string(), url_decode(value));
        }
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A file part of a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Client-supplied file name.
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl UploadedFile {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Decoded `multipart/form-data` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    pub fields: HashMap<String, String>,
    pub files: HashMap<String, UploadedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("missing multipart boundary")]
    MissingBoundary,
    #[error("unexpected end of multipart body")]
    UnexpectedEof,
    #[error("part is missing Content-Disposition")]
    MissingContentDisposition,
    #[error("malformed multipart body: {0}")]
    Malformed(&'static str),
}

/// Extract the boundary from a `multipart/form-data; boundary=...` content type.
pub fn parse_boundary(content_type: &str) -> Result<String, FormError> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or(FormError::MissingBoundary)
}

/// Parse a complete multipart body.
pub fn parse_multipart(body: &[u8], boundary: &str) -> Result<MultipartForm, FormError> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut close = b"\r\n".to_vec();
    close.extend_from_slice(&delimiter);

    let mut form = MultipartForm::default();
    let mut pos = find(body, &delimiter, 0).ok_or(FormError::UnexpectedEof)?;

    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            break;
        }
        if !body[pos..].starts_with(b"\r\n") {
            return Err(FormError::Malformed("expected CRLF after boundary"));
        }
        pos += 2;

        let headers_end = find(body, b"\r\n\r\n", pos).ok_or(FormError::UnexpectedEof)?;
        let headers = std::str::from_utf8(&body[pos..headers_end])
            .map_err(|_| FormError::Malformed("part headers are not UTF-8"))?;

        let mut disposition = None;
        let mut content_type = None;
        for line in headers.split("\r\n") {
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-disposition") {
                    disposition = Some(value.trim());
                } else if name.trim().eq_ignore_ascii_case("content-type") {
                    content_type = Some(value.trim().to_string());
                }
            }
        }
        let (name, filename) =
            parse_disposition(disposition.ok_or(FormError::MissingContentDisposition)?)?;

        let data_start = headers_end + 4;
        let data_end = find(body, &close, data_start).ok_or(FormError::UnexpectedEof)?;
        let data = &body[data_start..data_end];

        match filename {
            Some(filename) => {
                form.files.insert(
                    name,
                    UploadedFile {
                        filename,
                        content_type,
                        data: Bytes::copy_from_slice(data),
                    },
                );
            }
            None => {
                form.fields
                    .insert(name, String::from_utf8_lossy(data).into_owned());
            }
        }

        pos = data_end + 2;
    }

    Ok(form)
}

/// `form-data; name="field"; filename="a.txt"` -> (name, filename)
fn parse_disposition(value: &str) -> Result<(String, Option<String>), FormError> {
    let mut name = None;
    let mut filename = None;
    for param in value.split(';').skip(1) {
        if let Some((key, val)) = param.trim().split_once('=') {
            let val = val.trim().trim_matches('"').to_string();
            match key.trim() {
                "name" => name = Some(val),
                "filename" => filename = Some(val),
                _ => {}
            }
        }
    }
    let name = name.ok_or(FormError::Malformed("part has no name"))?;
    Ok((name, filename))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}
