use std::path::Path;

use anyhow::{bail, Result};
use obake::assemble::RuntimeImage;
use obake::store::ImageStore;

use super::layout::Layout;

pub(crate) fn image_list(config: Option<&Path>) -> Result<()> {
    let layout = Layout::load(config)?;
    let images = RuntimeImage::list(&layout.images_dir)?;
    if images.is_empty() {
        bail!("no images found under {}", layout.images_dir.display());
    }
    let store = ImageStore::open(&layout.images_dir)?;
    for image in images {
        let archived = store.get(&image.id)?.is_some();
        println!(
            "{:<28} {:<24} {:>5} files  {}",
            image.id,
            image.manifest.built_at_utc,
            image.manifest.files.len(),
            if archived { "archived" } else { "not archived" }
        );
    }
    Ok(())
}

pub(crate) fn image_verify(config: Option<&Path>, name: &str) -> Result<()> {
    let layout = Layout::load(config)?;
    let image = RuntimeImage::find(&layout.images_dir, name)?;
    let mut problems = image.manifest.verify(&image.rootfs())?;

    let store = ImageStore::open(&layout.images_dir)?;
    match store.get(&image.id)? {
        Some(_) => {
            if let Err(err) = store.verify(&image.id) {
                problems.push(format!("archive: {err:#}"));
            }
        }
        None => tracing::warn!(image = %image.id, "image has no archive"),
    }

    if !problems.is_empty() {
        for problem in &problems {
            println!("[image:{}] {}", image.id, problem);
        }
        bail!("image '{}' failed verification ({} problem(s))", image.id, problems.len());
    }
    println!("[image:{}] ok ({} files)", image.id, image.manifest.files.len());
    Ok(())
}

pub(crate) fn image_remove(config: Option<&Path>, name: &str) -> Result<()> {
    let layout = Layout::load(config)?;
    let image = RuntimeImage::find(&layout.images_dir, name)?;
    let store = ImageStore::open(&layout.images_dir)?;
    let lock = store.lock(&image.id)?;
    let id = image.id.clone();

    image.remove()?;
    let archived = store.remove(&id, &lock)?;
    println!(
        "[image:{id}] removed{}",
        if archived { " (archive released; run `image gc` to reclaim)" } else { "" }
    );
    Ok(())
}

pub(crate) fn image_gc(config: Option<&Path>) -> Result<()> {
    let layout = Layout::load(config)?;
    let store = ImageStore::open(&layout.images_dir)?;
    let removed = store.gc()?;
    println!("removed {removed} unreferenced archive(s)");
    Ok(())
}
