//! siren: the live-coding control shell.
//!
//! Startup walks `ParseOptions → ConfigureLogging → StartRemoteListener` and
//! then hands over to the command handler, which stays alive until the
//! process is signalled. Anything that goes wrong before the listener is open
//! aborts startup; after that, errors are logged and the shell keeps serving.
//!
//! Two fixed contact points:
//! - [`REMOTE_LISTENER_ADDR`]: line-oriented TCP session for external tooling.
//! - [`BACKEND_ADDR`]: the synthesis server, spoken to over OSC/UDP.

pub mod backend;
pub mod bootstrap;
pub mod listener;
pub mod options;
pub mod osc;
pub mod session;

use std::net::SocketAddr;
use thiserror::Error;

pub use bootstrap::{run_command_handler, start, Phase, Settings, Started, Startup};
pub use options::SirenOptions;
pub use session::Session;

/// Where external tooling attaches. Never changes at runtime.
pub const REMOTE_LISTENER_ADDR: &str = "127.0.0.1:4005";

/// The synthesis backend (`scsynth`).
pub const BACKEND_ADDR: &str = "127.0.0.1:57110";

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Bad command line. Carries clap's rendered message and usage.
    #[error("{usage}")]
    Parse { usage: String },

    /// The logging subsystem could not be installed.
    #[error("failed to configure logging: {0}")]
    Logging(String),

    /// The fixed remote listener port could not be bound.
    #[error("cannot open remote listener on {addr}: {source}")]
    Listener {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

impl ControlPlaneError {
    /// Process exit code for a startup failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ControlPlaneError::Parse { .. } => 2,
            ControlPlaneError::Logging(_) | ControlPlaneError::Listener { .. } => 1,
        }
    }
}
