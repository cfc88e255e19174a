//! Command line of `siren`: one option, `--log-level`.

use clap::error::ErrorKind;
use clap::Parser;
use std::ffi::OsString;

use super::ControlPlaneError;
use crate::logging::LogLevel;

/// Environment variable overriding the default log level.
pub const LOG_LEVEL_ENV: &str = "SIREN_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "siren", version, about = "Live-coding control shell")]
pub struct SirenOptions {
    /// Process-wide log level
    #[arg(long, value_enum, env = LOG_LEVEL_ENV, default_value_t = LogLevel::Info, ignore_case = true)]
    pub log_level: LogLevel,
}

/// Result of reading the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Run(SirenOptions),
    /// `--help` or `--version`: print and exit successfully.
    Print(String),
}

pub fn parse<I, T>(args: I) -> Result<Parsed, ControlPlaneError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match SirenOptions::try_parse_from(args) {
        Ok(options) => Ok(Parsed::Run(options)),
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            Ok(Parsed::Print(err.render().to_string()))
        }
        Err(err) => Err(ControlPlaneError::Parse {
            usage: err.render().to_string(),
        }),
    }
}
