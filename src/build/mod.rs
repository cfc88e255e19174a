//! Build executor and the staged build environment.
//!
//! This module provides:
//! - [`environment`] - the disposable [`BuildEnvironment`] (`src/`, `sysroot/`, `out/`)
//! - [`runner`] - [`StepRunner`] implementations: real processes or a dry-run recorder
//! - [`filesystem`] - tree copy/permission helpers and the runtime skeleton
//! - [`plan`] - a validation view of everything a build would do
//!
//! The executor's only structural guarantees are strict ordering and
//! fail-fast: step N+1 never starts before step N succeeded, and the first
//! failure aborts the build. Steps are numbered from 1; step 0 is the
//! installation of build dependencies into the sysroot.

pub mod environment;
pub mod filesystem;
pub mod plan;
pub mod runner;

use anyhow::Result;
use std::path::PathBuf;

pub use environment::BuildEnvironment;
pub use plan::{plan, BuildPlan};
pub use runner::{DryRunRunner, HostRunner, StepContext, StepOutcome, StepRunner};

use crate::error::PipelineError;
use crate::fetch::SourceTree;
use crate::packages::PackageInstaller;
use crate::recipe::ShapeRecipe;

/// Runs a recipe's build in a fresh environment.
pub struct BuildExecutor<'a> {
    work_dir: PathBuf,
    installer: &'a dyn PackageInstaller,
    runner: &'a dyn StepRunner,
}

impl<'a> BuildExecutor<'a> {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        installer: &'a dyn PackageInstaller,
        runner: &'a dyn StepRunner,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            installer,
            runner,
        }
    }

    /// Install build dependencies, then run every step in order.
    ///
    /// On success the returned environment holds the output tree; the caller
    /// drops it once artifacts are selected. On failure the environment has
    /// already been dropped (and removed) when this returns.
    pub fn execute(&self, recipe: &ShapeRecipe, source: &SourceTree) -> Result<BuildEnvironment> {
        let env = BuildEnvironment::create(&self.work_dir, &recipe.image_id())?;
        env.populate_source(source)?;

        let ctx = StepContext {
            shape: recipe.name.clone(),
            version: recipe.version.clone(),
            src_dir: env.src_dir(),
            sysroot_dir: env.sysroot_dir(),
            out_dir: env.out_dir(),
        };

        if !recipe.build.dependencies.is_empty() {
            tracing::info!(
                shape = %recipe.name,
                "installing build dependencies: {}",
                recipe.build.dependencies.join(", ")
            );
            if let Err(err) = self
                .installer
                .install(&recipe.build.dependencies, &ctx.sysroot_dir)
            {
                return Err(PipelineError::BuildStep {
                    shape: recipe.name.clone(),
                    index: 0,
                    step: format!(
                        "install build dependencies: {}",
                        recipe.build.dependencies.join(", ")
                    ),
                    status: "failed".into(),
                    stderr_tail: format!("{err:#}"),
                }
                .into());
            }
        }

        let total = recipe.build.steps.len();
        for (i, step) in recipe.build.steps.iter().enumerate() {
            let index = i + 1;
            tracing::info!(shape = %recipe.name, "[{index}/{total}] {step}");
            let outcome = self.runner.run(step, &ctx)?;
            if !outcome.success {
                tracing::error!(shape = %recipe.name, "step {index} failed: {}", outcome.status);
                return Err(PipelineError::BuildStep {
                    shape: recipe.name.clone(),
                    index,
                    step: step.to_string(),
                    status: outcome.status,
                    stderr_tail: outcome.stderr_tail,
                }
                .into());
            }
        }

        Ok(env)
    }
}
