//! SCGI/1 framing.
//!
//! Pure encode/decode with no I/O:
//! - `parser`: netstring header block and body of an incoming request
//! - `response`: status line, headers and body of the reply
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  <len>:CONTENT_LENGTH\0<n>\0SCGI\01\0<name>\0<value>\0...,<n bytes of body>
//! Response: Status: <code> <reason>\r\n<name>: <value>\r\n...\r\n<body>
//! ```
//!
//! One request per connection: the server closes once the response is
//! written.

pub mod parser;
pub mod response;

pub use parser::{encode_request, RequestBody, RequestDecoder, RequestFrame};
pub use response::{Body, BodyReader, BodyStream, ResponseFrame, Status, DEFAULT_CHUNK_SIZE};
