//! Protocol implementations.
//!
//! Each protocol has a parser module used by the runtime event loop.
//!
//! - `scgi`: Simple Common Gateway Interface, version 1

pub mod scgi;
