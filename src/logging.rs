//! Process-wide leveled logging.
//!
//! The level is chosen once at startup (from a CLI option or its environment
//! variable) and installed with [`init`]. Every `tracing` call site reads that
//! one value for the rest of the process; there is no per-call override and no
//! second installation. Components that need to report the level receive the
//! read-only [`LogHandle`] returned by [`init`].

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use std::fmt;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Closed set of log levels accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Parse a level name, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(value.trim(), true).ok()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the installed logging configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHandle {
    level: LogLevel,
}

impl LogHandle {
    /// A handle for `level` without installing anything.
    pub fn detached(level: LogLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }
}

/// Build the subscriber used by every binary, writing to `writer`.
pub fn subscriber<W>(level: LogLevel, writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.as_str()))
        .with_writer(writer)
        .with_target(false)
        .finish()
}

/// Install the process-wide subscriber on stderr. Fails if one is already set.
pub fn init(level: LogLevel) -> Result<LogHandle> {
    tracing::subscriber::set_global_default(subscriber(level, std::io::stderr))
        .map_err(|err| anyhow!("logging is already configured: {err}"))?;
    Ok(LogHandle { level })
}

/// Install the subscriber for the current thread only, until the guard drops.
pub fn init_scoped<W>(level: LogLevel, writer: W) -> (LogHandle, DefaultGuard)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let guard = tracing::subscriber::set_default(subscriber(level, writer));
    (LogHandle { level }, guard)
}
