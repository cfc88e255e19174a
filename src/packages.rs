//! Package installation into an isolated root.
//!
//! Package lists are opaque inputs: the pipeline never interprets a package
//! name, it only hands the list to a [`PackageInstaller`] together with the
//! root directory to populate, and records which files appeared.
//!
//! Two installers exist:
//! - [`PackagePool`]: a directory of pre-extracted package trees
//!   (`<pool>/<package>/...`), copied verbatim. Used for hermetic builds and tests.
//! - [`CommandInstaller`]: an external command such as
//!   `apt-get -o RootDir={root} install {packages}`; the installed file set is
//!   the difference between the root before and after the command.

use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::build::filesystem::copy_dir_recursive;

/// Installs a package list into a root directory.
pub trait PackageInstaller: Send + Sync {
    /// Short description for logs and plans.
    fn describe(&self) -> String;

    /// Install `packages` under `root` and return the installed paths,
    /// relative to `root`, sorted. Any unknown package is an error.
    fn install(&self, packages: &[String], root: &Path) -> Result<Vec<PathBuf>>;
}

/// Pre-extracted package trees, one directory per package.
#[derive(Debug, Clone)]
pub struct PackagePool {
    pub dir: PathBuf,
}

impl PackagePool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn package_dir(&self, package: &str) -> Result<PathBuf> {
        if package.is_empty() || package.contains('/') || package.starts_with('.') {
            bail!("invalid package name '{}'", package);
        }
        let path = self.dir.join(package);
        if !path.is_dir() {
            bail!(
                "package '{}' not found in package pool '{}'",
                package,
                self.dir.display()
            );
        }
        Ok(path)
    }
}

impl PackageInstaller for PackagePool {
    fn describe(&self) -> String {
        format!("package pool {}", self.dir.display())
    }

    fn install(&self, packages: &[String], root: &Path) -> Result<Vec<PathBuf>> {
        // Resolve everything first so a missing package leaves root untouched.
        let dirs = packages
            .iter()
            .map(|package| self.package_dir(package))
            .collect::<Result<Vec<_>>>()?;

        let mut installed = BTreeSet::new();
        for (package, dir) in packages.iter().zip(&dirs) {
            copy_dir_recursive(dir, root)
                .with_context(|| format!("installing package '{}'", package))?;
            installed.extend(list_files(dir)?);
        }
        Ok(installed.into_iter().collect())
    }
}

/// An external installer command.
///
/// `{root}` is substituted inside any argument; an argument that is exactly
/// `{packages}` expands to one argument per package.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    pub argv: Vec<String>,
}

impl CommandInstaller {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            bail!("package install command must not be empty");
        }
        if !argv.iter().any(|arg| arg == "{packages}") {
            bail!("package install command must contain a '{{packages}}' argument");
        }
        Ok(Self { argv })
    }

    /// The concrete argv for one installation.
    pub fn render(&self, packages: &[String], root: &Path) -> Vec<String> {
        let root = root.display().to_string();
        let mut out = Vec::with_capacity(self.argv.len() + packages.len());
        for arg in &self.argv {
            if arg == "{packages}" {
                out.extend(packages.iter().cloned());
            } else {
                out.push(arg.replace("{root}", &root));
            }
        }
        out
    }
}

impl PackageInstaller for CommandInstaller {
    fn describe(&self) -> String {
        format!("command `{}`", self.argv.join(" "))
    }

    fn install(&self, packages: &[String], root: &Path) -> Result<Vec<PathBuf>> {
        if packages.is_empty() {
            return Ok(Vec::new());
        }
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create {}", root.display()))?;

        let before = list_files(root)?;
        let argv = self.render(packages, root);
        tracing::debug!(command = %argv.join(" "), "installing packages");

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .with_context(|| format!("spawning package installer '{}'", argv[0]))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "package installer exited with {} while installing [{}]: {}",
                output.status,
                packages.join(", "),
                stderr.trim()
            );
        }

        let after = list_files(root)?;
        Ok(after.difference(&before).cloned().collect())
    }
}

/// Every non-directory entry under `root`, relative to it.
pub fn list_files(root: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    if !root.exists() {
        return Ok(files);
    }
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", entry.path().display(), root.display()))?;
        files.insert(rel.to_path_buf());
    }
    Ok(files)
}
