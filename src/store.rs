//! Content-addressed archive of published runtime images.
//!
//! Lives at `<images>/.store/`:
//! - `blobs/sha256/<xx>/<sha256>`: deterministic `tar.zst` of an image's rootfs
//! - `index/<name>-<version>.json`: which blob holds which image
//! - `locks/<name>-<version>.lock`: per-image exclusive lock (fs2)
//!
//! The archive lets a removed or damaged image tree be restored without a
//! rebuild, and lets `image verify` compare a tree against what was published.
//! Blobs are verified on read.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::assemble::RuntimeImage;
use crate::fetch::sha256_file;

/// Store directory name inside the images directory.
pub const STORE_DIR: &str = ".store";

/// Index entry mapping an image id to its archived rootfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub image_id: String,
    pub blob_sha256: String,
    pub size_bytes: u64,
    pub stored_at_unix: u64,
    pub artifact_digest: String,
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub entry: IndexEntry,
    pub blob_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

/// Exclusive hold on one image id. The flock is released on drop; the lock
/// file itself stays so every contender locks the same inode.
#[derive(Debug)]
pub struct ImageLock {
    _file: File,
}

impl ImageStore {
    /// Open (and create if needed) the store under `images_dir`.
    pub fn open(images_dir: &Path) -> Result<Self> {
        let store = Self {
            root: images_dir.join(STORE_DIR),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.blobs_dir(),
            self.index_dir(),
            self.tmp_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn index_path(&self, image_id: &str) -> Result<PathBuf> {
        validate_key(image_id)?;
        Ok(self.index_dir().join(format!("{}.json", image_id)))
    }

    fn blob_path(&self, sha256: &str) -> Result<PathBuf> {
        if !is_hex_64(sha256) {
            bail!("invalid sha256: {sha256}");
        }
        Ok(self.blobs_dir().join(&sha256[0..2]).join(sha256))
    }

    /// Take the exclusive lock for an image id. Fails immediately if another
    /// process (or another build in this one) holds it.
    pub fn lock(&self, image_id: &str) -> Result<ImageLock> {
        validate_key(image_id)?;
        let lock_path = self.locks_dir().join(format!("{}.lock", image_id));

        // Lock files are never unlinked.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        if lock_file.try_lock_exclusive().is_err() {
            bail!(
                "image '{}' is locked by another build: {}",
                image_id,
                lock_path.display()
            );
        }
        Ok(ImageLock { _file: lock_file })
    }

    /// Archive a published image. The caller holds the image's lock.
    pub fn put_image(&self, image: &RuntimeImage, _lock: &ImageLock) -> Result<String> {
        let rootfs = image.rootfs();
        if !rootfs.is_dir() {
            bail!("image rootfs not found: {}", rootfs.display());
        }

        let tmp = self.tmp_dir().join(tmp_name("rootfs.tar.zst"));
        create_tar_zst(&rootfs, &tmp)?;
        let (sha256, size_bytes) = sha256_file(&tmp)?;
        let blob_path = self.blob_path(&sha256)?;
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if blob_path.exists() {
            let _ = fs::remove_file(&tmp);
        } else {
            fs::rename(&tmp, &blob_path)
                .with_context(|| format!("Failed to store blob {}", blob_path.display()))?;
        }

        let entry = IndexEntry {
            image_id: image.id.clone(),
            blob_sha256: sha256.clone(),
            size_bytes,
            stored_at_unix: now_unix(),
            artifact_digest: image.manifest.artifact_digest.clone(),
        };
        self.write_index(&entry)?;
        tracing::debug!(image = %image.id, blob = %sha256, size_bytes, "archived image");
        Ok(sha256)
    }

    pub fn get(&self, image_id: &str) -> Result<Option<StoredImage>> {
        let index_path = self.index_path(image_id)?;
        if !index_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&index_path)
            .with_context(|| format!("Failed to read index {}", index_path.display()))?;
        let entry: IndexEntry = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse index {}", index_path.display()))?;
        let blob_path = self.blob_path(&entry.blob_sha256)?;
        Ok(Some(StoredImage { entry, blob_path }))
    }

    /// Check that an archived image's blob exists and matches its hash.
    pub fn verify(&self, image_id: &str) -> Result<StoredImage> {
        let stored = self
            .get(image_id)?
            .with_context(|| format!("no archived image '{}'", image_id))?;
        if !stored.blob_path.exists() {
            bail!(
                "blob missing for image '{}' (expected {})",
                image_id,
                stored.blob_path.display()
            );
        }
        let (actual, _) = sha256_file(&stored.blob_path)?;
        if actual != stored.entry.blob_sha256 {
            bail!(
                "blob hash mismatch for image '{}'\n  expected: {}\n  actual:   {}",
                image_id,
                stored.entry.blob_sha256,
                actual
            );
        }
        Ok(stored)
    }

    /// Unpack an archived rootfs into `dest` (which must not exist).
    pub fn materialize_to(&self, image_id: &str, dest: &Path) -> Result<()> {
        let stored = self.verify(image_id)?;
        if dest.exists() {
            bail!("refusing to overwrite {}", dest.display());
        }
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(".{}", tmp_name("extract")));
        fs::create_dir_all(&tmp)?;

        let decoder = zstd::stream::Decoder::new(File::open(&stored.blob_path)?)?;
        let mut archive = tar::Archive::new(decoder);
        archive.set_preserve_permissions(true);
        if let Err(err) = archive.unpack(&tmp) {
            let _ = crate::build::filesystem::remove_tree(&tmp);
            return Err(err).with_context(|| format!("Failed to unpack {}", stored.blob_path.display()));
        }
        fs::rename(&tmp, dest).with_context(|| {
            format!("Failed to move {} to {}", tmp.display(), dest.display())
        })
    }

    /// Index entries, sorted by image id.
    pub fn list(&self) -> Result<Vec<IndexEntry>> {
        let dir = self.index_dir();
        let mut out = vec![];
        for ent in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
            let path = ent?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            let entry: IndexEntry = serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse index {}", path.display()))?;
            out.push(entry);
        }
        out.sort_by(|a, b| a.image_id.cmp(&b.image_id));
        Ok(out)
    }

    /// Drop an image's index entry. Its blob is reclaimed by [`ImageStore::gc`].
    pub fn remove(&self, image_id: &str, _lock: &ImageLock) -> Result<bool> {
        let path = self.index_path(image_id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(true)
    }

    /// Remove blobs not referenced by any index entry. Returns how many were removed.
    pub fn gc(&self) -> Result<usize> {
        let referenced: BTreeSet<String> =
            self.list()?.into_iter().map(|e| e.blob_sha256).collect();

        let mut removed = 0usize;
        for ent in WalkDir::new(self.blobs_dir()).into_iter().filter_map(Result::ok) {
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            if !is_hex_64(&name) || referenced.contains(&name) {
                continue;
            }
            fs::remove_file(ent.path()).with_context(|| {
                format!("Failed to remove unreferenced blob {}", ent.path().display())
            })?;
            removed += 1;
        }
        Ok(removed)
    }

    fn write_index(&self, entry: &IndexEntry) -> Result<()> {
        let path = self.index_path(&entry.image_id)?;
        let tmp = self.tmp_dir().join(tmp_name("index.json"));
        fs::write(&tmp, serde_json::to_vec_pretty(entry)?)?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to write {}", path.display()))
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("image id must not be empty");
    }
    if key.contains('/') || key.contains('\\') || key.contains("..") || key.starts_with('.') {
        bail!("image id must be a safe filename segment: {key}");
    }
    Ok(())
}

fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Deterministic archive: sorted entries, zero mtime and owner.
fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = TarBuilder::new(encoder);

    let mut entries: Vec<PathBuf> = WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .map(|ent| ent.path().to_path_buf())
        .filter(|p| p != src_dir)
        .collect();
    entries.sort();

    for p in entries {
        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .into_owned();
        let md = fs::symlink_metadata(&p)?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(md.permissions().mode());

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if md.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, &rel, File::open(&p)?)?;
        }
    }

    let encoder = builder
        .into_inner()
        .context("Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ImageManifest, MANIFEST_FORMAT};
    use crate::recipe::PinnedSource;
    use tempfile::TempDir;

    fn image(images: &Path, content: &str) -> RuntimeImage {
        let dir = images.join("daemon-1.2.3");
        let rootfs = dir.join("rootfs");
        fs::create_dir_all(rootfs.join("usr/local/bin")).unwrap();
        fs::write(rootfs.join("usr/local/bin/daemon"), content).unwrap();
        std::os::unix::fs::symlink("daemon", rootfs.join("usr/local/bin/d")).unwrap();
        RuntimeImage {
            id: "daemon-1.2.3".into(),
            dir,
            manifest: ImageManifest {
                format: MANIFEST_FORMAT,
                shape: "daemon".into(),
                version: "1.2.3".into(),
                source: PinnedSource::Git {
                    url: "x".into(),
                    commit: "a".repeat(40),
                    tag: None,
                },
                base: None,
                entrypoint: "/usr/local/bin/daemon".into(),
                bindings: vec![],
                runtime_dependencies: vec![],
                fixups: vec![],
                files: vec![],
                artifact_digest: "digest".into(),
                built_at_utc: String::new(),
            },
        }
    }

    #[test]
    fn test_archive_and_materialize() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::open(temp.path()).unwrap();
        let image = image(temp.path(), "v1");

        let lock = store.lock(&image.id).unwrap();
        let sha = store.put_image(&image, &lock).unwrap();
        assert!(is_hex_64(&sha));
        assert!(store.lock(&image.id).is_err(), "lock must be exclusive");
        drop(lock);

        let dest = temp.path().join("restored");
        store.materialize_to(&image.id, &dest).unwrap();
        assert_eq!(fs::read(dest.join("usr/local/bin/daemon")).unwrap(), b"v1");
        assert!(dest.join("usr/local/bin/d").is_symlink());

        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].artifact_digest, "digest");
    }

    #[test]
    fn test_lock_file_outlives_holder() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::open(temp.path()).unwrap();
        let lock_path = store.locks_dir().join("daemon-1.2.3.lock");

        let holder = store.lock("daemon-1.2.3").unwrap();
        // A contender that opened the file while it was held.
        let waiting = OpenOptions::new().read(true).write(true).open(&lock_path).unwrap();
        assert!(waiting.try_lock_exclusive().is_err());
        drop(holder);

        assert!(lock_path.exists());
        waiting.try_lock_exclusive().unwrap();
        assert!(
            store.lock("daemon-1.2.3").is_err(),
            "a fresh holder must contend on the same inode"
        );
        FileExt::unlock(&waiting).unwrap();
        store.lock("daemon-1.2.3").unwrap();
    }

    #[test]
    fn test_archive_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let a = TempDir::new().unwrap();
        let store = ImageStore::open(temp.path()).unwrap();
        let other = ImageStore::open(a.path()).unwrap();

        let first = image(temp.path(), "same");
        let second = image(a.path(), "same");
        let sha1 = store.put_image(&first, &store.lock(&first.id).unwrap()).unwrap();
        let sha2 = other.put_image(&second, &other.lock(&second.id).unwrap()).unwrap();
        assert_eq!(sha1, sha2);
    }

    #[test]
    fn test_verify_detects_corruption_and_gc() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::open(temp.path()).unwrap();
        let image = image(temp.path(), "v1");
        let lock = store.lock(&image.id).unwrap();
        store.put_image(&image, &lock).unwrap();

        let stored = store.verify(&image.id).unwrap();
        fs::write(&stored.blob_path, b"garbage").unwrap();
        assert!(store.verify(&image.id).is_err());

        assert!(store.remove(&image.id, &lock).unwrap());
        assert_eq!(store.gc().unwrap(), 1);
        assert!(store.get(&image.id).unwrap().is_none());
    }
}
