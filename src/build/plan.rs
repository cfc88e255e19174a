//! Dry-run view of a recipe: every stage a build would go through, rendered
//! without fetching or spawning anything.

use std::fmt;
use std::path::PathBuf;

use super::runner::{DryRunRunner, RecordedStep, StepContext, StepRunner};
use crate::recipe::{Fixup, ShapeRecipe};

#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub image_id: String,
    pub source: String,
    pub pin: String,
    pub build_dependencies: Vec<String>,
    pub steps: Vec<RecordedStep>,
    pub allow: Vec<String>,
    pub required: Vec<String>,
    pub runtime_dependencies: Vec<String>,
    pub fixups: Vec<String>,
    pub bindings: Vec<String>,
    pub entrypoint: String,
    /// Build dependencies that will not be present at runtime.
    pub build_only: Vec<String>,
}

/// Render the plan for `recipe`. Paths are symbolic (`$OBAKE_SRC`, ...).
pub fn plan(recipe: &ShapeRecipe) -> BuildPlan {
    let ctx = StepContext {
        shape: recipe.name.clone(),
        version: recipe.version.clone(),
        src_dir: PathBuf::from("$OBAKE_SRC"),
        sysroot_dir: PathBuf::from("$OBAKE_SYSROOT"),
        out_dir: PathBuf::from("$OBAKE_OUT"),
    };
    let runner = DryRunRunner::new();
    for step in &recipe.build.steps {
        // The dry-run runner records and never fails.
        let _ = runner.run(step, &ctx);
    }

    BuildPlan {
        image_id: recipe.image_id(),
        source: recipe.source.url().to_string(),
        pin: recipe.source.pin(),
        build_dependencies: recipe.build.dependencies.clone(),
        steps: runner.recorded(),
        allow: recipe.artifacts.allow.clone(),
        required: recipe
            .required_paths()
            .into_iter()
            .map(str::to_string)
            .collect(),
        runtime_dependencies: recipe.runtime.dependencies.clone(),
        fixups: recipe.runtime.fixups.iter().map(describe_fixup).collect(),
        bindings: recipe
            .runtime
            .bindings
            .iter()
            .map(|b| {
                format!(
                    "{} -> {} ({})",
                    b.host.display(),
                    b.target.display(),
                    b.feature
                )
            })
            .collect(),
        entrypoint: recipe.entrypoint.command.clone(),
        build_only: recipe
            .build_only_dependencies()
            .into_iter()
            .map(str::to_string)
            .collect(),
    }
}

pub(crate) fn describe_fixup(fixup: &Fixup) -> String {
    match fixup {
        Fixup::Symlink { link, target } => format!("symlink {link} -> {target}"),
        Fixup::Rename { from, to } => format!("rename {from} -> {to}"),
        Fixup::Write { path, mode, .. } => match mode {
            Some(mode) => format!("write {path} (mode {mode:o})"),
            None => format!("write {path}"),
        },
        Fixup::Replace { path, find, replace } => {
            format!("replace in {path}: {find:?} -> {replace:?}")
        }
    }
}

fn list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

impl fmt::Display for BuildPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Shape: {}", self.image_id)?;
        writeln!(f)?;
        writeln!(f, "Fetch:")?;
        writeln!(f, "  {} ({})", self.source, self.pin)?;
        writeln!(f)?;
        writeln!(f, "Build:")?;
        writeln!(f, "  0. install into sysroot: {}", list(&self.build_dependencies))?;
        for (i, step) in self.steps.iter().enumerate() {
            write!(f, "  {}. ", i + 1)?;
            if step.cwd != PathBuf::from("$OBAKE_SRC") {
                write!(f, "(cd {}) ", step.cwd.display())?;
            }
            for (key, value) in &step.env {
                write!(f, "{key}={value} ")?;
            }
            writeln!(f, "{}", step.argv.join(" "))?;
        }
        writeln!(f)?;
        writeln!(f, "Select:")?;
        for pattern in &self.allow {
            writeln!(f, "  allow {pattern}")?;
        }
        for path in &self.required {
            writeln!(f, "  require {path}")?;
        }
        writeln!(f)?;
        writeln!(f, "Assemble:")?;
        writeln!(f, "  runtime packages: {}", list(&self.runtime_dependencies))?;
        for fixup in &self.fixups {
            writeln!(f, "  fixup: {fixup}")?;
        }
        for binding in &self.bindings {
            writeln!(f, "  binding: {binding}")?;
        }
        writeln!(f, "  entrypoint: {}", self.entrypoint)?;
        if !self.build_only.is_empty() {
            writeln!(f)?;
            writeln!(f, "Not present at runtime: {}", self.build_only.join(", "))?;
        }
        Ok(())
    }
}
