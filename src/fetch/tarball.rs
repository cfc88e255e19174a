//! Release tarballs: download, checksum verification, unpacking.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{resolve_location, Location};

static NEXT_DOWNLOAD: AtomicU64 = AtomicU64::new(0);

pub(super) fn fetch_tarball(
    url: &str,
    expected_sha256: &str,
    strip_components: usize,
    recipe_dir: &Path,
    scratch: &Path,
    dest: &Path,
) -> Result<()> {
    match resolve_location(url, recipe_dir)? {
        Location::Local(path) => {
            if !path.is_file() {
                bail!("source archive not found: {}", path.display());
            }
            verify_sha256(&path, expected_sha256)?;
            unpack(&path, url, strip_components, dest)
        }
        Location::Remote(url) => {
            fs::create_dir_all(scratch)
                .with_context(|| format!("Failed to create {}", scratch.display()))?;
            // One file per download; concurrent builds of the same release never share it.
            let archive = scratch.join(format!(
                "{}-{}-{}-{}",
                &expected_sha256[..16],
                std::process::id(),
                NEXT_DOWNLOAD.fetch_add(1, Ordering::SeqCst),
                archive_name(&url)
            ));
            let result = download(&url, &archive)
                .and_then(|()| verify_sha256(&archive, expected_sha256))
                .and_then(|()| unpack(&archive, &url, strip_components, dest));
            if let Err(err) = fs::remove_file(&archive) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %archive.display(), "failed to remove download: {err}");
                }
            }
            result
        }
    }
}

fn archive_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("source")
}

fn download(url: &str, dest: &Path) -> Result<()> {
    tracing::info!(%url, "downloading");
    let resp = ureq::get(url)
        .call()
        .with_context(|| format!("GET {url}"))?;
    let mut reader = resp.into_body().into_reader();

    let mut file =
        File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).context("reading download stream")?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .with_context(|| format!("Failed to write {}", dest.display()))?;
    }
    file.flush()?;
    Ok(())
}

fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let (actual, size) = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        bail!(
            "checksum mismatch for {}: expected sha256 {}, got {} ({} bytes)",
            path.display(),
            expected,
            actual,
            size
        );
    }
    Ok(())
}

/// Hex sha256 and byte size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn unpack(archive: &Path, url: &str, strip_components: usize, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    let name = archive_name(url);
    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    if name.ends_with(".tar") {
        unpack_stream(tar::Archive::new(file), strip_components, dest)
    } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
        let decoder = zstd::stream::Decoder::new(file)?;
        unpack_stream(tar::Archive::new(decoder), strip_components, dest)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let decoder = flate2::read::GzDecoder::new(file);
        unpack_stream(tar::Archive::new(decoder), strip_components, dest)
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        let decoder = xz2::read::XzDecoder::new(file);
        unpack_stream(tar::Archive::new(decoder), strip_components, dest)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
        let decoder = bzip2::read::BzDecoder::new(file);
        unpack_stream(tar::Archive::new(decoder), strip_components, dest)
    } else {
        bail!(
            "unsupported archive format '{}' (expected .tar, .tar.zst, .tar.gz, .tar.xz or .tar.bz2)",
            name
        )
    }
}

/// Refuse to write through a symlink that an earlier entry placed in `dest`.
fn ensure_no_symlink_parent(dest: &Path, rel: &Path) -> Result<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut current = dest.to_path_buf();
    for part in parent.components() {
        current.push(part);
        let is_link = fs::symlink_metadata(&current)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            bail!(
                "archive entry '{}' would be written through symlink '{}'",
                rel.display(),
                current.strip_prefix(dest).unwrap_or(&current).display()
            );
        }
    }
    Ok(())
}

fn unpack_stream<R: Read>(mut archive: tar::Archive<R>, strip: usize, dest: &Path) -> Result<()> {
    let mut unpacked = 0usize;
    for entry in archive.entries().context("reading archive")? {
        let mut entry = entry.context("reading archive entry")?;
        let path = entry.path()?.into_owned();
        let Some(rel) = strip_path(&path, strip)? else {
            continue;
        };
        ensure_no_symlink_parent(dest, &rel)?;
        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::Symlink => {
                entry
                    .unpack(&target)
                    .with_context(|| format!("unpacking {}", rel.display()))?;
            }
            tar::EntryType::Link => {
                let Some(link) = entry.link_name()? else {
                    bail!("hard link {} has no target", path.display());
                };
                let Some(link_rel) = strip_path(&link, strip)? else {
                    bail!("hard link {} points outside the archive root", path.display());
                };
                ensure_no_symlink_parent(dest, &link_rel)?;
                fs::hard_link(dest.join(link_rel), &target)
                    .with_context(|| format!("linking {}", rel.display()))?;
            }
            other => {
                tracing::debug!(path = %path.display(), kind = ?other, "skipping archive entry");
                continue;
            }
        }
        unpacked += 1;
    }

    if unpacked == 0 {
        bail!("archive contained no entries below {} leading components", strip);
    }
    Ok(())
}

/// Drop `strip` leading components. `None` for entries that vanish entirely.
fn strip_path(path: &Path, strip: usize) -> Result<Option<PathBuf>> {
    let mut out = PathBuf::new();
    let mut seen = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                if seen >= strip {
                    out.push(part);
                }
                seen += 1;
            }
            Component::CurDir => {}
            _ => bail!("archive entry '{}' escapes the source tree", path.display()),
        }
    }
    Ok(if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    })
}
