//! coop-frame-server: a single-threaded cooperative frame server
//!
//! Clients exchange length-prefixed binary frames over TCP. Every connection
//! is served by its own task on one thread:
//! - Eager tasks with continuation chaining and captured panics
//! - Readiness multiplexing over mio, with explicit cancel and shutdown
//! - Framed reads and writes that suspend instead of blocking
//! - Configuration via CLI arguments or TOML file

mod config;
mod handler;
mod logging;
mod protocol;
mod runtime;
mod server;
mod session;
mod signals;

use config::Config;
use handler::ConfirmHandler;
use server::Server;
use std::rc::Rc;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let sink = logging::init(&config.logging);

    info!(
        host = %config.server.host,
        port = config.server.port,
        max_frame_size = config.server.max_frame_size,
        max_sessions = config.server.max_sessions,
        log = ?sink.destination(),
        "Starting coop-frame-server"
    );

    signals::install()?;

    let mut server = Server::bind(&config.server, Rc::new(ConfirmHandler::new()))?;
    server.run_until(signals::stop_requested)?;
    drop(server);

    info!("Shutdown complete");
    sink.shutdown();
    Ok(())
}
