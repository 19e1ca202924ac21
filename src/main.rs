//! tcpkit-server: echoes every byte each client sends back to that client.

use std::process::ExitCode;
use tcpkit::config::Config;
use tcpkit::logging;
use tcpkit::server::Server;
use tracing::{error, info};

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.log_level);

    info!(
        host = %config.host,
        port = config.port,
        backend = ?config.backend,
        workers = config.workers,
        max_connections = config.max_connections,
        "Starting tcpkit server"
    );

    let mut server = Server::new(config.server_options());
    if let Err(e) = server.initialize(config.port, &config.host) {
        error!(error = %e, "Server initialization failed");
        return ExitCode::FAILURE;
    }

    match server.start() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server stopped with error");
            ExitCode::FAILURE
        }
    }
}
