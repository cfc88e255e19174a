//! The image manifest: what a runtime image contains and where each file came from.
//!
//! Written into the image at `etc/obake/image.json` (read by the entrypoint
//! dispatcher) and next to the published rootfs as `image.json`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::fetch::sha256_file;
use crate::recipe::{Binding, Fixup, PinnedSource};

/// Manifest location inside a runtime image.
pub const MANIFEST_PATH: &str = "etc/obake/image.json";

/// Current manifest format.
pub const MANIFEST_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileOrigin {
    /// Copied from the build output by the allow-list.
    Artifact,
    /// Installed by a runtime dependency package.
    Package,
    /// Created or moved by a runtime fixup.
    Fixup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub origin: FileOrigin,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub format: u32,
    pub shape: String,
    pub version: String,
    pub source: PinnedSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    pub entrypoint: String,
    pub bindings: Vec<Binding>,
    pub runtime_dependencies: Vec<String>,
    pub fixups: Vec<Fixup>,
    pub files: Vec<FileEntry>,
    /// sha256 over the sorted allow-listed entries as selected from the build.
    pub artifact_digest: String,
    pub built_at_utc: String,
}

impl ImageManifest {
    pub fn image_id(&self) -> String {
        format!("{}-{}", self.shape, self.version)
    }

    /// Read the manifest embedded in an image root.
    pub fn load(root: &Path) -> Result<Self> {
        Self::load_file(&root.join(MANIFEST_PATH))
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("reading image manifest {}", path.display()))?;
        let manifest: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing image manifest {}", path.display()))?;
        if manifest.format != MANIFEST_FORMAT {
            bail!(
                "unsupported image manifest format {} in {} (expected {})",
                manifest.format,
                path.display(),
                MANIFEST_FORMAT
            );
        }
        Ok(manifest)
    }

    /// Write the manifest into an image root.
    pub fn write(&self, root: &Path) -> Result<()> {
        let path = root.join(MANIFEST_PATH);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut raw = serde_json::to_vec_pretty(self)?;
        raw.push(b'\n');
        fs::write(&path, raw).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Compare an image root against the manifest. Returns one line per problem.
    pub fn verify(&self, root: &Path) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        let origins: BTreeMap<PathBuf, FileOrigin> = self
            .files
            .iter()
            .map(|f| (PathBuf::from(&f.path), f.origin.clone()))
            .collect();

        let actual = match describe_tree(root, &origins) {
            Ok(actual) => actual,
            Err(err) => {
                problems.push(format!("{err:#}"));
                return Ok(problems);
            }
        };
        let actual: BTreeMap<&str, &FileEntry> =
            actual.iter().map(|f| (f.path.as_str(), f)).collect();

        for expected in &self.files {
            match actual.get(expected.path.as_str()) {
                None => problems.push(format!("missing: /{}", expected.path)),
                Some(found) if *found != expected => {
                    problems.push(format!("modified: /{}", expected.path))
                }
                Some(_) => {}
            }
        }
        Ok(problems)
    }
}

fn entry_for(root: &Path, rel: &Path, origin: FileOrigin) -> Result<FileEntry> {
    let path = root.join(rel);
    let meta = fs::symlink_metadata(&path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let (sha256, link) = if meta.file_type().is_symlink() {
        (None, Some(fs::read_link(&path)?.display().to_string()))
    } else {
        (Some(sha256_file(&path)?.0), None)
    };
    Ok(FileEntry {
        path: rel.display().to_string(),
        origin,
        // Write bits are cleared when an image is published.
        mode: meta.permissions().mode() & 0o7555,
        sha256,
        link,
    })
}

/// Describe every non-directory entry under `root` except the manifest.
///
/// Each entry must have a recorded origin; an unaccounted file is an error.
pub fn describe_tree(root: &Path, origins: &BTreeMap<PathBuf, FileOrigin>) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for rel in crate::packages::list_files(root)? {
        if rel == Path::new(MANIFEST_PATH) {
            continue;
        }
        let Some(origin) = origins.get(&rel) else {
            bail!("unexpected file in image: /{}", rel.display());
        };
        entries.push(entry_for(root, &rel, origin.clone())?);
    }
    Ok(entries)
}

/// Deterministic digest of the selected artifacts.
///
/// Covers each entry's path, mode and content (or link target), in path order,
/// so two builds from the same pin compare equal iff their artifacts do.
pub fn artifact_digest<'a>(root: &Path, files: impl IntoIterator<Item = &'a PathBuf>) -> Result<String> {
    let mut sorted: Vec<&PathBuf> = files.into_iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for rel in sorted {
        let entry = entry_for(root, rel, FileOrigin::Artifact)?;
        hasher.update(entry.path.as_bytes());
        hasher.update([0]);
        hasher.update(format!("{:o}", entry.mode).as_bytes());
        hasher.update([0]);
        match (&entry.sha256, &entry.link) {
            (Some(sha), _) => hasher.update(sha.as_bytes()),
            (None, Some(link)) => {
                hasher.update(b"->");
                hasher.update(link.as_bytes());
            }
            (None, None) => {}
        }
        hasher.update([b'\n']);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
