//! The fixed command every runtime image starts with.
//!
//! Takes no options of its own: every argument is forwarded verbatim to the
//! image's entrypoint binary, which replaces this process.

use obake::entrypoint::{Dispatcher, LAUNCH_FAILURE_EXIT};
use obake::logging::{self, LogLevel};

const LOG_LEVEL_ENV: &str = "OBAKE_LOG_LEVEL";

fn main() {
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|value| LogLevel::parse(&value))
        .unwrap_or(LogLevel::Warn);
    if let Err(err) = logging::init(level) {
        eprintln!("obake-entrypoint: {err:#}");
    }

    let dispatcher = match Dispatcher::from_env() {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            tracing::error!("{err:#}");
            std::process::exit(LAUNCH_FAILURE_EXIT);
        }
    };

    let err = dispatcher.exec(std::env::args_os().skip(1));
    tracing::error!("{err:#}");
    std::process::exit(LAUNCH_FAILURE_EXIT);
}
