//! Event-driven transport.
//!
//! - `Reactor`: owns the listener, the connection table and the timers
//! - `Connection`: per-socket state machine and buffers
//! - `TimeoutQueue`: lazily invalidated inactivity deadlines

mod connection;
mod reactor;
mod timer;

pub use connection::{ConnState, Connection, ConnectionRegistry, Progress};
pub use reactor::{Reactor, ReactorConfig, StopHandle};
pub use timer::TimeoutQueue;
