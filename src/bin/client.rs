//! tcpkit-client: sends one message to the echo server and prints the reply.

use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tcpkit::client::Client;
use tcpkit::logging;
use tracing::error;

/// Command-line arguments for the echo client
#[derive(Parser, Debug)]
#[command(name = "tcpkit-client")]
#[command(version = "0.1.0")]
#[command(about = "Send a message to a tcpkit echo server", long_about = None)]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Message to send
    #[arg(short, long, default_value = "Hello Server!")]
    message: String,

    /// Seconds to wait for connect and reply
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(&args.log_level);

    let mut client = Client::with_timeout(Duration::from_secs(args.timeout));
    if let Err(e) = client.connect(&args.host, args.port) {
        error!(error = %e, "Connection failed");
        return ExitCode::FAILURE;
    }

    let reply = client
        .send(args.message.as_bytes())
        .and_then(|()| client.receive_exact(args.message.len()));

    match reply {
        Ok(bytes) => {
            println!("Server replied: {}", String::from_utf8_lossy(&bytes));
            client.disconnect();
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Echo failed");
            ExitCode::FAILURE
        }
    }
}
