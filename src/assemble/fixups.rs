//! Runtime fixup handlers: Fixup::Symlink, Fixup::Rename, Fixup::Write, Fixup::Replace
//!
//! Paths are absolute image paths resolved under the runtime root. Every
//! handler keeps the origin map in step with the tree so the manifest can
//! account for each file.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::build::filesystem::image_path;
use crate::manifest::FileOrigin;
use crate::recipe::Fixup;

pub type Origins = BTreeMap<PathBuf, FileOrigin>;

fn rel(path: &str) -> PathBuf {
    PathBuf::from(path.trim_start_matches('/'))
}

/// Apply one fixup under `root`.
pub fn apply(root: &Path, fixup: &Fixup, origins: &mut Origins) -> Result<()> {
    match fixup {
        Fixup::Symlink { link, target } => handle_symlink(root, link, target, origins),
        Fixup::Rename { from, to } => handle_rename(root, from, to, origins),
        Fixup::Write {
            path,
            content,
            mode,
        } => handle_write(root, path, content, *mode, origins),
        Fixup::Replace {
            path,
            find,
            replace,
        } => handle_replace(root, path, find, replace),
    }
}

/// Create a symlink, replacing whatever file or link is already there.
pub fn handle_symlink(root: &Path, link: &str, target: &str, origins: &mut Origins) -> Result<()> {
    let link_path = image_path(root, link);
    if let Some(parent) = link_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if link_path.is_dir() && !link_path.is_symlink() {
        bail!("cannot replace directory {} with a symlink", link);
    }
    if link_path.is_symlink() || link_path.exists() {
        fs::remove_file(&link_path)?;
    }
    std::os::unix::fs::symlink(target, &link_path)
        .with_context(|| format!("Failed to create symlink {}", link))?;
    origins.insert(rel(link), FileOrigin::Fixup);
    Ok(())
}

/// Move a file, link or directory. The source must exist.
pub fn handle_rename(root: &Path, from: &str, to: &str, origins: &mut Origins) -> Result<()> {
    let src = image_path(root, from);
    let dst = image_path(root, to);
    if fs::symlink_metadata(&src).is_err() {
        bail!("rename source {} does not exist", from);
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&src, &dst).with_context(|| format!("Failed to rename {} to {}", from, to))?;

    let (from_rel, to_rel) = (rel(from), rel(to));
    let moved: Vec<PathBuf> = origins
        .keys()
        .filter(|path| path.starts_with(&from_rel))
        .cloned()
        .collect();
    for old in moved {
        if let Some(origin) = origins.remove(&old) {
            let suffix = old.strip_prefix(&from_rel).unwrap_or(Path::new(""));
            let new = if suffix.as_os_str().is_empty() {
                to_rel.clone()
            } else {
                to_rel.join(suffix)
            };
            origins.insert(new, origin);
        }
    }
    Ok(())
}

/// Write a file, optionally with specific permissions.
pub fn handle_write(
    root: &Path,
    path: &str,
    content: &str,
    mode: Option<u32>,
    origins: &mut Origins,
) -> Result<()> {
    let full_path = image_path(root, path);
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if full_path.is_symlink() {
        fs::remove_file(&full_path)?;
    }
    fs::write(&full_path, content).with_context(|| format!("Failed to write {}", path))?;
    if let Some(mode) = mode {
        fs::set_permissions(&full_path, fs::Permissions::from_mode(mode))?;
    }
    origins.insert(rel(path), FileOrigin::Fixup);
    Ok(())
}

/// Replace every occurrence of `find`. An absent pattern is an error.
pub fn handle_replace(root: &Path, path: &str, find: &str, replace: &str) -> Result<()> {
    let full_path = image_path(root, path);
    let content = fs::read_to_string(&full_path)
        .with_context(|| format!("Failed to read {} for replacement", path))?;
    if find.is_empty() || !content.contains(find) {
        bail!("replace fixup: '{}' not found in {}", find, path);
    }
    fs::write(&full_path, content.replace(find, replace))
        .with_context(|| format!("Failed to write {}", path))?;
    Ok(())
}
