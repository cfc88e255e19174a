//! Filesystem helpers shared by the build and runtime environments.
//!
//! The runtime skeleton is directories only: a runtime image must not gain
//! files from anywhere but the artifact selection, the runtime packages,
//! fixups and its entrypoint declaration.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Mount points and standard directories every runtime image carries.
pub const RUNTIME_SKELETON_DIRS: &[&str] = &[
    "usr/bin",
    "usr/lib",
    "usr/local/bin",
    "usr/local/lib",
    "etc",
    "tmp",
    "var/tmp",
    "run",
    "dev",
    "proc",
    "sys",
];

/// Create the runtime directory skeleton under `root`.
///
/// # Example
///
/// ```rust,ignore
/// use obake::build::filesystem::create_runtime_skeleton;
/// use std::path::Path;
///
/// create_runtime_skeleton(Path::new("/tmp/image-root"))?;
/// ```
pub fn create_runtime_skeleton(root: &Path) -> Result<()> {
    for dir in RUNTIME_SKELETON_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }
    }
    Ok(())
}

/// Join an absolute image path (`/usr/local/bin/x`) onto a root directory.
pub fn image_path(root: &Path, absolute: &str) -> PathBuf {
    root.join(absolute.trim_start_matches('/'))
}

/// Recursively copy a directory, preserving symlinks and permissions.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        copy_entry(&src_path, &dst_path, &entry.file_type()?)?;
    }

    Ok(())
}

/// Copy one filesystem entry, creating parent directories as needed.
pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)
        .with_context(|| format!("Failed to stat {}", src.display()))?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    copy_entry(src, dst, &meta.file_type())
}

fn copy_entry(src: &Path, dst: &Path, file_type: &fs::FileType) -> Result<()> {
    if file_type.is_symlink() {
        let target = fs::read_link(src)?;
        if dst.exists() || dst.is_symlink() {
            fs::remove_file(dst)?;
        }
        std::os::unix::fs::symlink(&target, dst)
            .with_context(|| format!("Failed to create symlink: {}", dst.display()))?;
    } else if file_type.is_dir() {
        copy_dir_recursive(src, dst)?;
    } else {
        // fs::copy carries permission bits along.
        fs::copy(src, dst)
            .with_context(|| format!("Failed to copy file: {}", src.display()))?;
    }
    Ok(())
}

/// Recursively clear write permission below `root`.
pub fn make_read_only(root: &Path) -> Result<()> {
    chmod_tree(root, |mode| mode & !0o222)
}

/// Recursively grant owner write permission below `root`.
pub fn make_writable(root: &Path) -> Result<()> {
    chmod_tree(root, |mode| mode | 0o200)
}

fn chmod_tree(root: &Path, adjust: impl Fn(u32) -> u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let mut perms = entry.metadata()?.permissions();
        perms.set_mode(adjust(perms.mode()));
        fs::set_permissions(entry.path(), perms)
            .with_context(|| format!("Failed to chmod {}", entry.path().display()))?;
    }
    Ok(())
}

/// Remove a tree, restoring owner write permission first so read-only
/// source trees can be cleaned up.
pub fn remove_tree(root: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if !root.exists() && !root.is_symlink() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(root).follow_links(false).into_iter().flatten() {
        if entry.file_type().is_dir() {
            if let Ok(meta) = entry.metadata() {
                let mut perms = meta.permissions();
                perms.set_mode(perms.mode() | 0o700);
                let _ = fs::set_permissions(entry.path(), perms);
            }
        }
    }
    fs::remove_dir_all(root).with_context(|| format!("Failed to remove {}", root.display()))
}
