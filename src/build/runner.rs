//! Step runners: how a [`BuildStep`] is turned into a process, or not.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use crate::recipe::step::BuildStep;

/// Lines of stderr kept for a failing step's error message.
const STDERR_TAIL_LINES: usize = 20;

/// Paths and identity a step runs against.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub shape: String,
    pub version: String,
    pub src_dir: PathBuf,
    pub sysroot_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl StepContext {
    /// Working directory of a step.
    pub fn cwd(&self, step: &BuildStep) -> PathBuf {
        match &step.dir {
            Some(dir) => self.src_dir.join(dir),
            None => self.src_dir.clone(),
        }
    }

    /// Environment every step sees, before the step's own `env`.
    pub fn base_env(&self) -> BTreeMap<String, String> {
        let display = |p: &Path| p.display().to_string();
        BTreeMap::from([
            ("DESTDIR".to_string(), display(&self.out_dir)),
            ("OBAKE_SHAPE".to_string(), self.shape.clone()),
            ("OBAKE_VERSION".to_string(), self.version.clone()),
            ("OBAKE_SRC".to_string(), display(&self.src_dir)),
            ("OBAKE_SYSROOT".to_string(), display(&self.sysroot_dir)),
            ("OBAKE_OUT".to_string(), display(&self.out_dir)),
        ])
    }

    /// `PATH` with the sysroot's binary directories in front.
    pub fn path_var(&self, host_path: Option<&str>) -> String {
        let mut parts: Vec<String> = ["usr/local/bin", "usr/bin", "bin"]
            .iter()
            .map(|dir| self.sysroot_dir.join(dir).display().to_string())
            .collect();
        if let Some(host) = host_path.filter(|p| !p.is_empty()) {
            parts.push(host.to_string());
        }
        parts.join(":")
    }
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub success: bool,
    /// Human-readable exit status ("exit code 2", "killed by signal 9").
    pub status: String,
    pub stderr_tail: String,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            status: "exit code 0".into(),
            stderr_tail: String::new(),
        }
    }
}

/// Executes build steps. Implementations must not reorder or skip steps.
pub trait StepRunner: Send + Sync {
    fn run(&self, step: &BuildStep, ctx: &StepContext) -> Result<StepOutcome>;
}

/// Runs steps as host processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl StepRunner for HostRunner {
    fn run(&self, step: &BuildStep, ctx: &StepContext) -> Result<StepOutcome> {
        let argv = step.argv();
        let cwd = ctx.cwd(step);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&cwd)
            .envs(ctx.base_env())
            .env("PATH", ctx.path_var(std::env::var("PATH").ok().as_deref()))
            .envs(&step.env);

        let output = match cmd.output() {
            Ok(output) => output,
            Err(err) => {
                return Ok(StepOutcome {
                    success: false,
                    status: format!("failed to spawn '{}' in {}", argv[0], cwd.display()),
                    stderr_tail: err.to_string(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines() {
            tracing::debug!(shape = %ctx.shape, "| {line}");
        }
        for line in stderr.lines() {
            tracing::debug!(shape = %ctx.shape, "! {line}");
        }

        Ok(StepOutcome {
            success: output.status.success(),
            status: describe_status(&output.status),
            stderr_tail: tail(&stderr, STDERR_TAIL_LINES),
        })
    }
}

fn describe_status(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("killed by signal {signal}"),
        (None, None) => status.to_string(),
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// One step as the dry-run runner saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStep {
    pub cwd: PathBuf,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Records steps without executing anything. Every step succeeds.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    recorded: Mutex<Vec<RecordedStep>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<RecordedStep> {
        self.recorded
            .lock()
            .map(|steps| steps.clone())
            .unwrap_or_default()
    }
}

impl StepRunner for DryRunRunner {
    fn run(&self, step: &BuildStep, ctx: &StepContext) -> Result<StepOutcome> {
        let record = RecordedStep {
            cwd: ctx.cwd(step),
            argv: step.argv(),
            env: step.env.clone(),
        };
        self.recorded
            .lock()
            .map_err(|_| anyhow::anyhow!("dry-run recorder poisoned"))?
            .push(record);
        Ok(StepOutcome::ok())
    }
}
