//! Artifact fetcher: pinned upstream reference to a local, read-only source tree.
//!
//! Sources land at `<work>/sources/<name>-<version>/`. A `.obake-source.json`
//! stamp inside the tree records the pin it was produced from; fetching the
//! same pin again reuses the tree, a different pin replaces it.
//!
//! Every failure is reported as [`PipelineError::Fetch`] and is never retried.
//! A partially populated tree is removed before the error is returned.

mod git;
mod tarball;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::build::filesystem::{make_read_only, remove_tree};
use crate::error::PipelineError;
use crate::recipe::{PinnedSource, ShapeRecipe};

pub use tarball::sha256_file;

/// Stamp file written into every fetched tree.
pub const SOURCE_STAMP: &str = ".obake-source.json";

/// A fetched, read-only source tree.
#[derive(Debug, Clone)]
pub struct SourceTree {
    pub path: PathBuf,
    pub pin: String,
    /// True when an existing tree with a matching stamp was reused.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SourceStamp {
    shape: String,
    version: String,
    url: String,
    pin: String,
    fetched_at_utc: String,
}

impl SourceStamp {
    fn matches(&self, recipe: &ShapeRecipe) -> bool {
        self.shape == recipe.name
            && self.version == recipe.version
            && self.url == recipe.source.url()
            && self.pin == recipe.source.pin()
    }
}

/// Resolves pinned sources under a work directory.
#[derive(Debug, Clone)]
pub struct Fetcher {
    work_dir: PathBuf,
}

impl Fetcher {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.work_dir.join("sources")
    }

    /// Deterministic location of a recipe's source tree.
    pub fn source_dir(&self, recipe: &ShapeRecipe) -> PathBuf {
        self.sources_dir().join(recipe.image_id())
    }

    pub fn fetch(&self, recipe: &ShapeRecipe) -> Result<SourceTree> {
        self.fetch_inner(recipe).map_err(|err| {
            PipelineError::Fetch {
                shape: recipe.name.clone(),
                reason: format!("{err:#}"),
            }
            .into()
        })
    }

    fn fetch_inner(&self, recipe: &ShapeRecipe) -> Result<SourceTree> {
        let dest = self.source_dir(recipe);
        let pin = recipe.source.pin();

        if dest.exists() {
            if read_stamp(&dest).is_some_and(|stamp| stamp.matches(recipe)) {
                tracing::info!(shape = %recipe.name, path = %dest.display(), "reusing fetched source");
                return Ok(SourceTree {
                    path: dest,
                    pin,
                    reused: true,
                });
            }
            tracing::info!(shape = %recipe.name, "stale source tree, fetching again");
            remove_tree(&dest)?;
        }

        let sources = self.sources_dir();
        fs::create_dir_all(&sources)
            .with_context(|| format!("Failed to create {}", sources.display()))?;

        let staging = sources.join(format!(".{}.partial-{}", recipe.image_id(), std::process::id()));
        if staging.exists() {
            remove_tree(&staging)?;
        }

        match self.populate(recipe, &staging) {
            Ok(()) => {
                fs::rename(&staging, &dest).with_context(|| {
                    format!("Failed to move {} to {}", staging.display(), dest.display())
                })?;
                tracing::info!(shape = %recipe.name, pin = %pin, path = %dest.display(), "fetched source");
                Ok(SourceTree {
                    path: dest,
                    pin,
                    reused: false,
                })
            }
            Err(err) => {
                if let Err(cleanup) = remove_tree(&staging) {
                    tracing::warn!("failed to remove partial source tree: {cleanup:#}");
                }
                Err(err)
            }
        }
    }

    fn populate(&self, recipe: &ShapeRecipe, staging: &Path) -> Result<()> {
        match &recipe.source {
            PinnedSource::Tarball {
                url,
                sha256,
                strip_components,
            } => {
                let scratch = self.work_dir.join("downloads");
                tarball::fetch_tarball(
                    url,
                    sha256,
                    *strip_components,
                    &recipe.recipe_dir,
                    &scratch,
                    staging,
                )?;
            }
            PinnedSource::Git { url, commit, tag } => {
                git::fetch_git(url, commit, tag.as_deref(), &recipe.recipe_dir, staging)?;
            }
        }

        let stamp = SourceStamp {
            shape: recipe.name.clone(),
            version: recipe.version.clone(),
            url: recipe.source.url().to_string(),
            pin: recipe.source.pin(),
            fetched_at_utc: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        };
        let stamp_path = staging.join(SOURCE_STAMP);
        fs::write(&stamp_path, serde_json::to_vec_pretty(&stamp)?)
            .with_context(|| format!("Failed to write {}", stamp_path.display()))?;

        make_read_only(staging)
    }
}

fn read_stamp(dir: &Path) -> Option<SourceStamp> {
    let raw = fs::read(dir.join(SOURCE_STAMP)).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Where a source URL points once resolved against the recipe directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Location {
    Local(PathBuf),
    Remote(String),
}

pub(crate) fn resolve_location(url: &str, recipe_dir: &Path) -> Result<Location> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Location::Local(PathBuf::from(path)));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Location::Remote(url.to_string()));
    }
    if url.contains("://") {
        anyhow::bail!("unsupported source URL scheme in '{}'", url);
    }
    let path = Path::new(url);
    Ok(Location::Local(if path.is_absolute() {
        path.to_path_buf()
    } else {
        recipe_dir.join(path)
    }))
}
