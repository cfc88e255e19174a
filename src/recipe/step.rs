//! Declarative build-step descriptors.
//!
//! Steps describe WHAT runs, not HOW. The build executor interprets them,
//! which is what makes dry-run plans possible without shelling out.
//!
//! # Example
//!
//! ```rust
//! use obake::recipe::step::{exec, shell, BuildStep};
//!
//! let steps: Vec<BuildStep> = vec![
//!     shell("./autogen.sh"),
//!     exec(["make", "-j4"]),
//!     exec(["make", "install"]).in_dir("build"),
//! ];
//! assert_eq!(steps[2].to_string(), "(cd build) make install");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// One ordered build command, opaque to the executor beyond its exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub command: StepCommand,
    /// Working directory relative to the source checkout.
    pub dir: Option<String>,
    /// Extra environment for this step only.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCommand {
    /// A command line interpreted by `sh -c`.
    Shell(String),
    /// An argv executed directly.
    Exec(Vec<String>),
}

impl BuildStep {
    /// Run the step in `dir` (relative to the source checkout).
    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Add an environment variable for this step.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Program and arguments as they will be spawned.
    pub fn argv(&self) -> Vec<String> {
        match &self.command {
            StepCommand::Shell(line) => vec!["sh".into(), "-c".into(), line.clone()],
            StepCommand::Exec(argv) => argv.clone(),
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dir) = &self.dir {
            write!(f, "(cd {}) ", dir)?;
        }
        for (key, value) in &self.env {
            write!(f, "{}={} ", key, value)?;
        }
        match &self.command {
            StepCommand::Shell(line) => write!(f, "{}", line),
            StepCommand::Exec(argv) => write!(f, "{}", argv.join(" ")),
        }
    }
}

/// A step that runs through `sh -c`.
pub fn shell(line: impl Into<String>) -> BuildStep {
    BuildStep {
        command: StepCommand::Shell(line.into()),
        dir: None,
        env: BTreeMap::new(),
    }
}

/// A step that execs an argv directly.
pub fn exec(argv: impl IntoIterator<Item = impl Into<String>>) -> BuildStep {
    BuildStep {
        command: StepCommand::Exec(argv.into_iter().map(Into::into).collect()),
        dir: None,
        env: BTreeMap::new(),
    }
}

/// On-disk form: either a bare command line or a table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum StepToml {
    Line(String),
    Table(StepTableToml),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct StepTableToml {
    exec: Option<Vec<String>>,
    shell: Option<String>,
    dir: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

impl StepToml {
    pub(crate) fn into_step(self, index: usize) -> anyhow::Result<BuildStep> {
        match self {
            StepToml::Line(line) => {
                if line.trim().is_empty() {
                    anyhow::bail!("build step {} is an empty command line", index);
                }
                Ok(shell(line.trim()))
            }
            StepToml::Table(table) => {
                let mut step = match (table.exec, table.shell) {
                    (Some(argv), None) => {
                        if argv.is_empty() || argv[0].trim().is_empty() {
                            anyhow::bail!("build step {} has an empty exec argv", index);
                        }
                        exec(argv)
                    }
                    (None, Some(line)) if !line.trim().is_empty() => shell(line.trim()),
                    (None, Some(_)) => {
                        anyhow::bail!("build step {} is an empty command line", index)
                    }
                    (Some(_), Some(_)) => {
                        anyhow::bail!("build step {} sets both 'exec' and 'shell'", index)
                    }
                    (None, None) => {
                        anyhow::bail!("build step {} needs 'exec' or 'shell'", index)
                    }
                };
                if let Some(dir) = table.dir {
                    let dir = dir.trim();
                    if dir.starts_with('/') || dir.split('/').any(|part| part == "..") {
                        anyhow::bail!(
                            "build step {} dir '{}' must stay inside the source checkout",
                            index,
                            dir
                        );
                    }
                    step = step.in_dir(dir);
                }
                step.env = table.env;
                Ok(step)
            }
        }
    }
}
