//! Bridge between decoded requests and the application handler.
//!
//! The dispatcher is the containment boundary for application failures: a
//! handler that returns an error or panics costs one connection, never the
//! reactor thread.

use crate::error::ConnectionError;
use crate::handler::{Context, Handler};
use crate::logging::Logger;
use crate::protocols::scgi::{RequestFrame, ResponseFrame};
use std::any::Any;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};

pub struct Dispatcher {
    handler: Box<dyn Handler>,
    logger: Logger,
}

impl Dispatcher {
    pub fn new<H: Handler + 'static>(handler: H, logger: Logger) -> Self {
        Self {
            handler: Box::new(handler),
            logger,
        }
    }

    pub fn set_logger(&mut self, logger: Logger) {
        self.logger = logger;
    }

    /// Run the handler for one request and frame its result.
    pub fn dispatch(
        &self,
        request: RequestFrame,
        remote_addr: Option<SocketAddr>,
    ) -> Result<ResponseFrame, ConnectionError> {
        let mut ctx = Context::from_request(request, self.logger.clone(), remote_addr);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handler.call(&mut ctx)));

        let message = match outcome {
            Ok(Ok(response)) => return Ok(response.into()),
            Ok(Err(e)) => format!("[Exception] {}: {e}", error_type(e.as_ref())),
            Err(payload) => format!("[Exception] panic: {}", panic_message(payload.as_ref())),
        };

        self.logger.log(&message);
        Err(ConnectionError::Application(message))
    }
}

/// Best-effort name of a handler error's concrete type, taken from its
/// `Debug` output (`ParseIntError { .. }` -> `ParseIntError`).
fn error_type(e: &(dyn Error + 'static)) -> String {
    if e.is::<io::Error>() {
        return "io::Error".to_string();
    }
    let debug = format!("{e:?}");
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if name.is_empty() {
        "Error".to_string()
    } else {
        name
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
