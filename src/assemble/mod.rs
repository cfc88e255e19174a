//! Runtime assembler: build output to a published, immutable runtime image.
//!
//! A published image lives at `<images>/<name>-<version>/`:
//!
//! ```text
//! <images>/daemon-1.2.3/
//!   image.json        copy of the manifest
//!   rootfs/           the runtime tree (read-only)
//!     etc/obake/image.json
//!     usr/local/bin/daemon
//!     ...
//! ```
//!
//! Assembly happens in a hidden staging directory next to the target and is
//! published with a single rename, so a failed assembly never leaves a
//! partial image behind. A published image is never overwritten.

pub mod fixups;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use self::fixups::Origins;
use crate::build::filesystem::{create_runtime_skeleton, image_path, make_read_only, remove_tree};
use crate::error::PipelineError;
use crate::manifest::{artifact_digest, describe_tree, FileOrigin, ImageManifest, MANIFEST_FORMAT};
use crate::packages::PackageInstaller;
use crate::recipe::ShapeRecipe;
use crate::select::{require, select_artifacts};

/// Manifest copy next to `rootfs/`.
pub const IMAGE_MANIFEST_FILENAME: &str = "image.json";

/// A published runtime image.
#[derive(Debug, Clone)]
pub struct RuntimeImage {
    pub id: String,
    pub dir: PathBuf,
    pub manifest: ImageManifest,
}

impl RuntimeImage {
    pub fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs")
    }

    /// Open a published image by id (`<name>-<version>`).
    pub fn open(images_dir: &Path, id: &str) -> Result<Self> {
        let dir = images_dir.join(id);
        if !dir.is_dir() {
            bail!("no image '{}' under {}", id, images_dir.display());
        }
        let manifest = ImageManifest::load_file(&dir.join(IMAGE_MANIFEST_FILENAME))?;
        Ok(Self {
            id: id.to_string(),
            dir,
            manifest,
        })
    }

    /// Every published image, sorted by id. Hidden staging directories are skipped.
    pub fn list(images_dir: &Path) -> Result<Vec<Self>> {
        let mut images = Vec::new();
        if !images_dir.exists() {
            return Ok(images);
        }
        for entry in fs::read_dir(images_dir)
            .with_context(|| format!("reading images directory {}", images_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().join(IMAGE_MANIFEST_FILENAME).is_file() {
                continue;
            }
            images.push(Self::open(images_dir, &name)?);
        }
        images.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(images)
    }

    /// Find the newest published image of a shape (`name`) or an exact id.
    pub fn find(images_dir: &Path, name_or_id: &str) -> Result<Self> {
        let images = Self::list(images_dir)?;
        if let Some(image) = images.iter().find(|i| i.id == name_or_id) {
            return Ok(image.clone());
        }
        images
            .into_iter()
            .filter(|i| i.manifest.shape == name_or_id)
            .max_by(|a, b| a.manifest.built_at_utc.cmp(&b.manifest.built_at_utc))
            .with_context(|| format!("no image for '{}' under {}", name_or_id, images_dir.display()))
    }

    /// Delete a published image.
    pub fn remove(self) -> Result<()> {
        remove_tree(&self.dir)
    }
}

#[derive(Debug, Clone)]
pub enum AssembleOutcome {
    Published(RuntimeImage),
    /// The version was already published; nothing was changed.
    AlreadyBuilt(RuntimeImage),
}

impl AssembleOutcome {
    pub fn image(&self) -> &RuntimeImage {
        match self {
            AssembleOutcome::Published(image) | AssembleOutcome::AlreadyBuilt(image) => image,
        }
    }
}

/// Removes the staging directory unless it was published.
struct Staging {
    dir: PathBuf,
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(err) = remove_tree(&self.dir) {
            tracing::warn!(path = %self.dir.display(), "failed to remove staging directory: {err:#}");
        }
    }
}

pub struct Assembler<'a> {
    images_dir: PathBuf,
    installer: &'a dyn PackageInstaller,
}

impl<'a> Assembler<'a> {
    pub fn new(images_dir: impl Into<PathBuf>, installer: &'a dyn PackageInstaller) -> Self {
        Self {
            images_dir: images_dir.into(),
            installer,
        }
    }

    pub fn image_dir(&self, recipe: &ShapeRecipe) -> PathBuf {
        self.images_dir.join(recipe.image_id())
    }

    /// Assemble and publish the runtime image for `recipe` from a build output tree.
    pub fn assemble(&self, recipe: &ShapeRecipe, out_tree: &Path) -> Result<AssembleOutcome> {
        let id = recipe.image_id();
        let target = self.image_dir(recipe);
        if target.exists() {
            tracing::info!(image = %id, "image already published");
            return Ok(AssembleOutcome::AlreadyBuilt(RuntimeImage::open(
                &self.images_dir,
                &id,
            )?));
        }

        fs::create_dir_all(&self.images_dir)
            .with_context(|| format!("Failed to create {}", self.images_dir.display()))?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let staging = Staging {
            dir: self
                .images_dir
                .join(format!(".{}.assembling-{}-{}", id, std::process::id(), nanos)),
        };
        let rootfs = staging.dir.join("rootfs");
        fs::create_dir_all(&rootfs)
            .with_context(|| format!("Failed to create {}", rootfs.display()))?;

        let manifest = self.populate(recipe, out_tree, &rootfs)?;

        let mut raw = serde_json::to_vec_pretty(&manifest)?;
        raw.push(b'\n');
        fs::write(staging.dir.join(IMAGE_MANIFEST_FILENAME), raw)?;
        make_read_only(&rootfs)?;

        fs::rename(&staging.dir, &target)
            .with_context(|| format!("Failed to publish image {}", target.display()))?;
        tracing::info!(image = %id, path = %target.display(), "published runtime image");

        Ok(AssembleOutcome::Published(RuntimeImage {
            id,
            dir: target,
            manifest,
        }))
    }

    fn populate(&self, recipe: &ShapeRecipe, out_tree: &Path, rootfs: &Path) -> Result<ImageManifest> {
        let assembly_error = |reason: String| -> anyhow::Error {
            PipelineError::Assembly {
                shape: recipe.name.clone(),
                reason,
            }
            .into()
        };

        create_runtime_skeleton(rootfs)?;
        let mut origins = Origins::new();

        // 1. Runtime packages only; build dependencies never reach this root.
        if !recipe.runtime.dependencies.is_empty() {
            tracing::info!(
                shape = %recipe.name,
                "installing runtime dependencies: {}",
                recipe.runtime.dependencies.join(", ")
            );
            let installed = self
                .installer
                .install(&recipe.runtime.dependencies, rootfs)
                .map_err(|err| assembly_error(format!("{err:#}")))?;
            for path in installed {
                origins.insert(path, FileOrigin::Package);
            }
        }

        // 2. Allow-listed artifacts.
        let selection = select_artifacts(out_tree, &recipe.artifacts.allow, rootfs)?;
        require(&recipe.name, &selection, &recipe.required_paths())?;
        let digest = artifact_digest(rootfs, &selection.files)?;
        for path in &selection.files {
            origins.insert(path.clone(), FileOrigin::Artifact);
        }
        tracing::info!(shape = %recipe.name, files = selection.files.len(), "selected artifacts");

        // 3. Fixups, in declaration order.
        for fixup in &recipe.runtime.fixups {
            fixups::apply(rootfs, fixup, &mut origins).map_err(|err| {
                assembly_error(format!(
                    "fixup '{}': {err:#}",
                    crate::build::plan::describe_fixup(fixup)
                ))
            })?;
        }

        // 4. Mount points for declared bindings. Satisfying them is up to the runtime.
        for binding in &recipe.runtime.bindings {
            let mount_point = image_path(rootfs, &binding.target.display().to_string());
            fs::create_dir_all(&mount_point)
                .with_context(|| format!("Failed to create {}", mount_point.display()))?;
        }

        let entrypoint = image_path(rootfs, &recipe.entrypoint.command);
        if fs::symlink_metadata(&entrypoint).is_err() {
            return Err(PipelineError::Selection {
                shape: recipe.name.clone(),
                path: recipe.entrypoint.command.clone(),
            }
            .into());
        }

        let files = describe_tree(rootfs, &origins).map_err(|err| assembly_error(format!("{err:#}")))?;
        let manifest = ImageManifest {
            format: MANIFEST_FORMAT,
            shape: recipe.name.clone(),
            version: recipe.version.clone(),
            source: recipe.source.clone(),
            base: recipe.runtime.base.clone(),
            entrypoint: recipe.entrypoint.command.clone(),
            bindings: recipe.runtime.bindings.clone(),
            runtime_dependencies: recipe.runtime.dependencies.clone(),
            fixups: recipe.runtime.fixups.clone(),
            files,
            artifact_digest: digest,
            built_at_utc: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        };
        manifest.write(rootfs)?;
        Ok(manifest)
    }
}
