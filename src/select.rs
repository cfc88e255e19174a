//! Artifact selector: copy exactly the allow-listed paths out of a build.
//!
//! The allow-list is closed. A pattern that matches nothing is not an error
//! by itself (optional artifacts may be absent on some platforms); missing
//! required paths are caught by [`require`].
//!
//! Patterns are absolute image paths with glob syntax (`*`, `**`, `?`,
//! `{a,b}`). A pattern that names a directory selects everything below it.

use anyhow::{Context, Result};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::build::filesystem::copy_path;
use crate::error::PipelineError;

/// Files (and symlinks) copied into the runtime tree, relative to its root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub files: BTreeSet<PathBuf>,
}

impl Selection {
    pub fn contains(&self, absolute: &str) -> bool {
        self.files
            .contains(Path::new(absolute.trim_start_matches('/')))
    }
}

/// Compile one allow-list pattern, relative to the image root.
///
/// `*` and `?` never match `/`; only `**` crosses directories.
pub(crate) fn allow_glob(rel: &str) -> Result<Glob, globset::Error> {
    GlobBuilder::new(rel).literal_separator(true).build()
}

fn compile(allow: &[String]) -> Result<Vec<GlobSet>> {
    allow
        .iter()
        .map(|pattern| {
            let rel = pattern.trim_start_matches('/').trim_end_matches('/');
            let mut builder = GlobSetBuilder::new();
            builder.add(
                allow_glob(rel).with_context(|| format!("invalid allow pattern '{}'", pattern))?,
            );
            // A directory entry selects its contents.
            builder.add(
                allow_glob(&format!("{rel}/**"))
                    .with_context(|| format!("invalid allow pattern '{}'", pattern))?,
            );
            builder
                .build()
                .with_context(|| format!("invalid allow pattern '{}'", pattern))
        })
        .collect()
}

/// Copy every non-directory entry of `out_tree` matched by `allow` into `dest`,
/// preserving relative structure.
pub fn select_artifacts(out_tree: &Path, allow: &[String], dest: &Path) -> Result<Selection> {
    let sets = compile(allow)?;
    let mut hits = vec![0usize; sets.len()];
    let mut selection = Selection::default();

    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(out_tree).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", out_tree.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        entries.push(entry.path().to_path_buf());
    }
    entries.sort();

    for path in entries {
        let rel = path
            .strip_prefix(out_tree)
            .with_context(|| format!("{} is outside {}", path.display(), out_tree.display()))?;
        let mut matched = false;
        for (i, set) in sets.iter().enumerate() {
            if set.is_match(rel) {
                hits[i] += 1;
                matched = true;
            }
        }
        if matched {
            copy_path(&path, &dest.join(rel))?;
            selection.files.insert(rel.to_path_buf());
        }
    }

    for (pattern, count) in allow.iter().zip(&hits) {
        if *count == 0 {
            tracing::debug!(%pattern, "allow-list pattern matched no files");
        } else {
            tracing::debug!(%pattern, count, "allow-list pattern matched");
        }
    }
    Ok(selection)
}

/// Fail with [`PipelineError::Selection`] for the first required path that
/// was not selected.
pub fn require(shape: &str, selection: &Selection, required: &[&str]) -> Result<()> {
    for path in required {
        if !selection.contains(path) {
            return Err(PipelineError::Selection {
                shape: shape.to_string(),
                path: path.to_string(),
            }
            .into());
        }
    }
    Ok(())
}
