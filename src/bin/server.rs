//! Dedicated server binary.
//!
//! Arguments are `key=value` pairs:
//! - `port=<u16>`   listen port (default 2551)
//! - `save=<path>`  enable world persistence to this file

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use tracing::error;

use stardrift::constants::SERVER_PORT;
use stardrift::server::{Server, ServerConfig};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut port = SERVER_PORT;
    let mut save_path: Option<PathBuf> = None;
    for arg in std::env::args().skip(1) {
        let Some((key, value)) = arg.split_once('=') else {
            error!(%arg, "expected key=value");
            return ExitCode::FAILURE;
        };
        match key {
            "port" => match value.parse() {
                Ok(parsed) => port = parsed,
                Err(err) => {
                    error!(%err, value, "bad port");
                    return ExitCode::FAILURE;
                }
            },
            "save" => save_path = Some(PathBuf::from(value)),
            other => {
                error!(other, "unknown argument");
                return ExitCode::FAILURE;
            }
        }
    }

    let config = ServerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], port)),
        save_path,
    };
    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "server failed to start");
            return ExitCode::FAILURE;
        }
    };

    // Runs until the process is killed.
    let shutdown = AtomicBool::new(false);
    server.run(&shutdown);
    ExitCode::SUCCESS
}
