//! Typed failures of the build, assembly and launch pipeline.
//!
//! Operations return `anyhow::Result` and attach context as they go. The
//! variants below are the roots of those chains: callers that need to tell a
//! failed build step from an unreachable source recover them with
//! `anyhow::Error::downcast_ref::<PipelineError>()`.
//!
//! Nothing in this taxonomy is retried automatically. A failed build is
//! re-triggered deliberately after the cause has been fixed.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Pinned source unreachable or not matching its pin.
    #[error("fetch failed for shape '{shape}': {reason}")]
    Fetch { shape: String, reason: String },

    /// A build command exited non-zero; remaining steps were not run.
    #[error("build step {index} of shape '{shape}' failed ({status}): {step}{}", stderr_suffix(.stderr_tail))]
    BuildStep {
        shape: String,
        index: usize,
        step: String,
        status: String,
        stderr_tail: String,
    },

    /// A required artifact was absent from the build output.
    #[error("shape '{shape}' is missing required artifact '{path}' after build")]
    Selection { shape: String, path: String },

    /// Runtime dependency installation or fixup failed; nothing was published.
    #[error("assembly of shape '{shape}' failed: {reason}")]
    Assembly { shape: String, reason: String },

    /// Entrypoint binary missing or not executable at instance start.
    #[error("cannot launch '{}': {reason}", .path.display())]
    Launch { path: PathBuf, reason: String },
}

fn stderr_suffix(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\n  stderr: {}", tail)
    }
}

/// A declared device/resource binding that is absent at launch.
///
/// Not an error: the instance still starts, with the named feature degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedModeWarning {
    pub feature: String,
    pub path: PathBuf,
}

impl fmt::Display for DegradedModeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "binding '{}' for feature '{}' is not present; {} is degraded",
            self.path.display(),
            self.feature,
            self.feature
        )
    }
}
