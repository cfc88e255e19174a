//! Preflight checks for build validation.
//!
//! Validates that the host has the tools a recipe needs before anything is
//! fetched, so a missing `git` or `sh` is reported up front instead of as
//! a fetch failure halfway through a multi-shape build.
//!
//! # Example
//!
//! ```rust
//! use obake::preflight::{command_exists, check_required_tools};
//!
//! // Check a single command
//! if !command_exists("git") {
//!     println!("git not installed");
//! }
//!
//! // Check multiple tools
//! let tools = &[("sh", "dash"), ("git", "git")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::recipe::step::StepCommand;
use crate::recipe::{PinnedSource, ShapeRecipe};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that every `(command, package)` pair resolves on `PATH`.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Host tools a recipe needs outside of its own build dependencies.
pub fn recipe_tools(recipe: &ShapeRecipe) -> Vec<(&'static str, &'static str)> {
    let mut tools = Vec::new();
    if let PinnedSource::Git { .. } = &recipe.source {
        tools.push(("git", "git"));
    }
    if recipe
        .build
        .steps
        .iter()
        .any(|step| matches!(step.command, StepCommand::Shell(_)))
    {
        tools.push(("sh", "dash"));
    }
    tools
}

/// Check the host tools for one recipe.
pub fn check_recipe_tools(recipe: &ShapeRecipe) -> Result<()> {
    check_required_tools(&recipe_tools(recipe))
        .map_err(|err| err.context(format!("preflight for shape '{}'", recipe.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::parse_recipe;
    use crate::recipe::tests::SAMPLE;
    use std::path::Path;

    #[test]
    fn test_command_exists() {
        // 'sh' should exist on any Unix system
        assert!(command_exists("sh"));
        // Random garbage should not exist
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }

    #[test]
    fn test_recipe_tools() {
        let local = parse_recipe(SAMPLE, Path::new("shape.toml")).unwrap();
        assert_eq!(recipe_tools(&local), vec![("sh", "dash")]);

        let remote = parse_recipe(
            &SAMPLE.replace(
                "url = \"daemon-1.2.3.tar\"",
                "url = \"https://example.org/daemon-1.2.3.tar.bz2\"",
            ),
            Path::new("shape.toml"),
        )
        .unwrap();
        assert_eq!(recipe_tools(&remote), vec![("sh", "dash")]);

        let git = parse_recipe(
            &SAMPLE.replace("kind = \"tarball\"", "kind = \"git\"").replace(
                &format!("sha256 = \"{}\"", "0".repeat(64)),
                &format!("commit = \"{}\"", "a".repeat(40)),
            ),
            Path::new("shape.toml"),
        )
        .unwrap();
        assert_eq!(recipe_tools(&git), vec![("git", "git"), ("sh", "dash")]);
    }
}
