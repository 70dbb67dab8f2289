//! Injected logging capability.
//!
//! The reactor, the dispatcher and every request context share a `Logger`:
//! a cheap, cloneable handle around a single-argument message sink. The
//! default sink discards everything so the core can be exercised without
//! side effects; the binary plugs in `Logger::tracing()`.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Destination for diagnostic messages.
///
/// Implementations must not block the reactor thread.
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn log(&self, message: &str) {
        self(message)
    }
}

struct NoopSink;

impl LogSink for NoopSink {
    fn log(&self, _message: &str) {}
}

struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str) {
        tracing::debug!(target: "scgi_gateway", "{message}");
    }
}

/// Fire-and-forget logging handle.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
}

impl Logger {
    /// Wrap an arbitrary sink.
    pub fn new<S: LogSink + 'static>(sink: S) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// A logger that drops every message.
    pub fn noop() -> Self {
        Self::new(NoopSink)
    }

    /// A logger that forwards to the `tracing` subscriber at debug level.
    pub fn tracing() -> Self {
        Self::new(TracingSink)
    }

    /// Emit a message. A panicking sink is swallowed.
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let _ = panic::catch_unwind(AssertUnwindSafe(|| self.sink.log(message)));
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}
