//! Process entry point: initializes logging, reads configuration from the
//! environment, binds the listener sockets, and drives the tick loop until
//! the process is killed. No CLI arguments — every tunable is an env var,
//! read once at startup and logged (see `runtime_core::Config::from_env`).

use flux::logging;
use runtime_core::{Config, Server};
use std::sync::atomic::AtomicBool;

fn main() {
    let log = logging::init();
    logging::info!(log, "starting runtime host");

    let config = Config::from_env(&log);

    let mut server = match Server::new(config, &log) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "failed to start runtime"; "error" => err.to_string());
            std::process::exit(1);
        }
    };

    let running = AtomicBool::new(true);
    let result = server.run(&running, &log);
    server.shutdown(&log);

    match result {
        Ok(()) => {
            logging::info!(log, "runtime host exiting cleanly");
        }
        Err(err) => {
            logging::error!(log, "runtime host exiting after fatal error"; "error" => err.to_string());
            std::process::exit(1);
        }
    }
}
