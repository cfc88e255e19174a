//! The disposable build environment.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::filesystem::{copy_path, make_writable, remove_tree};
use crate::fetch::{SourceTree, SOURCE_STAMP};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A fresh directory owning every intermediate file of one build.
///
/// Layout:
/// - `src/`: writable copy of the fetched source tree
/// - `sysroot/`: build-time dependencies
/// - `out/`: install destination (`DESTDIR`)
///
/// The directory is removed when the value is dropped, whether the build
/// succeeded or not. Two builds never share an environment.
#[derive(Debug)]
pub struct BuildEnvironment {
    root: PathBuf,
}

impl BuildEnvironment {
    /// Create a new, empty environment under `<work>/build/`.
    pub fn create(work_dir: &Path, image_id: &str) -> Result<Self> {
        let parent = work_dir.join("build");
        fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let root = parent.join(format!(
            "{}-{}-{}-{}",
            image_id,
            std::process::id(),
            nanos,
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        ));
        // create_dir (not _all): an existing directory means a collision.
        fs::create_dir(&root)
            .with_context(|| format!("Failed to create build environment {}", root.display()))?;

        let env = Self { root };
        for dir in [env.src_dir(), env.sysroot_dir(), env.out_dir()] {
            fs::create_dir(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        tracing::debug!(path = %env.root.display(), "created build environment");
        Ok(env)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    pub fn sysroot_dir(&self) -> PathBuf {
        self.root.join("sysroot")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join("out")
    }

    /// Copy the fetched tree into `src/`; the fetched tree itself stays untouched.
    pub fn populate_source(&self, source: &SourceTree) -> Result<()> {
        let dest = self.src_dir();
        for entry in fs::read_dir(&source.path)
            .with_context(|| format!("reading source tree {}", source.path.display()))?
        {
            let entry = entry?;
            if entry.file_name() == SOURCE_STAMP {
                continue;
            }
            copy_path(&entry.path(), &dest.join(entry.file_name()))?;
        }
        make_writable(&dest)
    }
}

impl Drop for BuildEnvironment {
    fn drop(&mut self) {
        match remove_tree(&self.root) {
            Ok(()) => tracing::debug!(path = %self.root.display(), "removed build environment"),
            Err(err) => tracing::warn!(
                path = %self.root.display(),
                "failed to remove build environment: {err:#}"
            ),
        }
    }
}
