//! scgi-gateway: serve an application handler over SCGI
//!
//! Components:
//! - SCGI request decoding and response framing (`protocols::scgi`)
//! - Connection state machine, timers and the mio reactor (`runtime`)
//! - Handler contract and request context (`handler`)
//! - Configuration via CLI arguments or TOML file (`config`)

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod logging;
pub mod protocols;
pub mod runtime;

pub use dispatcher::Dispatcher;
pub use error::{ConnectionError, HandlerError, ProtocolError, ResponseError, SetupError};
pub use handler::{Context, Handler, HandlerResult, Response};
pub use logging::{LogSink, Logger};
pub use protocols::scgi::{Body, Status};
pub use runtime::{Reactor, ReactorConfig, StopHandle};
