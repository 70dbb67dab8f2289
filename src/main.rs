//! scgi-gateway: serve an application handler over SCGI
//!
//! Runs a demonstration handler that echoes back what it received:
//! - request method and URI
//! - decoded query and form fields, cookies
//! - uploaded files and body length
//!
//! Configuration via CLI arguments or TOML file.

use scgi_gateway::config::Config;
use scgi_gateway::{Context, HandlerResult, Logger, Reactor, Response, Status};
use std::collections::BTreeMap;
use std::fmt::Write;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;
    let reactor_config = config.reactor_config()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %reactor_config.listen,
        timeout_secs = config.timeout,
        max_connections = config.max_connections,
        chunk_size = config.chunk_size,
        "Starting scgi-gateway"
    );

    let mut reactor = Reactor::new(reactor_config, echo).map(|r| r.with_logger(Logger::tracing()))?;
    let addr = reactor.bind()?;
    info!(addr = %addr, "Listening");

    reactor.start()?;
    info!("Reactor stopped");
    Ok(())
}

/// Plain-text description of the request.
fn echo(ctx: &mut Context) -> HandlerResult {
    let mut out = String::new();
    writeln!(
        out,
        "{} {}",
        ctx.method().unwrap_or("-"),
        ctx.env("REQUEST_URI").unwrap_or("-")
    )?;

    for (label, fields) in [("get", &ctx.get), ("post", &ctx.post)] {
        let sorted: BTreeMap<_, _> = fields.iter().collect();
        for (name, value) in sorted {
            writeln!(out, "{label} {name}={value}")?;
        }
    }
    let cookies: BTreeMap<_, _> = ctx.cookies.iter().collect();
    for (name, value) in cookies {
        writeln!(out, "cookie {name}={value}")?;
    }
    for (name, file) in &ctx.files {
        writeln!(out, "file {name}={} ({} bytes)", file.filename, file.size())?;
    }
    writeln!(out, "body {} bytes", ctx.body.remaining())?;

    Ok(Response::text(Status::OK, out))
}
