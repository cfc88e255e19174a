//! The per-shape pipeline: fetch, build, select, assemble, archive.
//!
//! Independent shapes share nothing but this read-only [`Pipeline`] value, so
//! [`Pipeline::build_many`] runs them on plain threads without coordination.
//! The only cross-build exclusion is the per-image store lock, which stops two
//! processes from building the same `<name>-<version>` at once.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::assemble::{AssembleOutcome, Assembler, RuntimeImage};
use crate::build::{BuildExecutor, HostRunner, StepRunner};
use crate::fetch::Fetcher;
use crate::packages::PackageInstaller;
use crate::preflight;
use crate::recipe::ShapeRecipe;
use crate::store::ImageStore;

pub struct Pipeline {
    work_dir: PathBuf,
    images_dir: PathBuf,
    installer: Arc<dyn PackageInstaller>,
    runner: Arc<dyn StepRunner>,
    preflight: bool,
}

impl Pipeline {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        images_dir: impl Into<PathBuf>,
        installer: Arc<dyn PackageInstaller>,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            images_dir: images_dir.into(),
            installer,
            runner: Arc::new(HostRunner),
            preflight: true,
        }
    }

    /// Replace the step runner (tests, dry runs).
    pub fn with_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Skip host tool checks.
    pub fn without_preflight(mut self) -> Self {
        self.preflight = false;
        self
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Build one shape. An already published version is returned untouched.
    pub fn build(&self, recipe: &ShapeRecipe) -> Result<AssembleOutcome> {
        let _span = tracing::info_span!("build", shape = %recipe.name).entered();
        let id = recipe.image_id();

        if self.images_dir.join(&id).exists() {
            tracing::info!(image = %id, "already built; remove it first to rebuild");
            return Ok(AssembleOutcome::AlreadyBuilt(RuntimeImage::open(
                &self.images_dir,
                &id,
            )?));
        }

        let store = ImageStore::open(&self.images_dir)?;
        let lock = store.lock(&id)?;

        if self.preflight {
            preflight::check_recipe_tools(recipe)?;
        }

        let source = Fetcher::new(&self.work_dir).fetch(recipe)?;
        let env = BuildExecutor::new(&self.work_dir, self.installer.as_ref(), self.runner.as_ref())
            .execute(recipe, &source)?;

        let outcome = Assembler::new(&self.images_dir, self.installer.as_ref())
            .assemble(recipe, &env.out_dir());
        // The build environment goes away whether or not assembly succeeded.
        drop(env);
        let outcome = outcome?;

        if let AssembleOutcome::Published(image) = &outcome {
            if let Err(err) = store.put_image(image, &lock) {
                tracing::warn!(image = %id, "published but not archived: {err:#}");
            }
        }
        Ok(outcome)
    }

    /// Build several shapes with up to `jobs` in parallel.
    ///
    /// Results come back in input order. One shape failing does not stop the
    /// others.
    pub fn build_many(
        &self,
        recipes: &[ShapeRecipe],
        jobs: usize,
    ) -> Vec<(String, Result<AssembleOutcome>)> {
        let jobs = jobs.clamp(1, recipes.len().max(1));
        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<Option<Result<AssembleOutcome>>>> =
            Mutex::new((0..recipes.len()).map(|_| None).collect());

        std::thread::scope(|scope| {
            for _ in 0..jobs {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(recipe) = recipes.get(i) else {
                        break;
                    };
                    let result = self.build(recipe);
                    if let Err(err) = &result {
                        tracing::error!(shape = %recipe.name, "build failed: {err:#}");
                    }
                    if let Ok(mut slots) = results.lock() {
                        slots[i] = Some(result);
                    }
                });
            }
        });

        let slots = results.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        recipes
            .iter()
            .zip(slots)
            .map(|(recipe, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(anyhow::anyhow!("build of '{}' did not complete", recipe.name))
                });
                (recipe.name.clone(), result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::DryRunRunner;
    use crate::error::PipelineError;
    use crate::fetch::sha256_file;
    use crate::packages::PackagePool;
    use crate::recipe::parse_recipe;
    use crate::recipe::tests::SAMPLE;
    use std::fs::{self, File};
    use tempfile::TempDir;

    /// A shape directory with a one-file tarball; returns the recipe.
    fn shape(temp: &TempDir, name: &str, steps: &str) -> ShapeRecipe {
        let dir = temp.path().join("shapes").join(name);
        fs::create_dir_all(&dir).unwrap();
        let archive = dir.join("daemon-1.2.3.tar");
        let mut builder = tar::Builder::new(File::create(&archive).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, "top/daemon", &b"ok"[..])
            .unwrap();
        builder.finish().unwrap();
        drop(builder);

        let (sha, _) = sha256_file(&archive).unwrap();
        let raw = SAMPLE
            .replace("name = \"daemon\"", &format!("name = \"{name}\""))
            .replace(&"0".repeat(64), &sha)
            .replace("steps = [\"fetch v1.2.3\", \"make\", \"make install\"]", steps)
            .replace("dependencies = [\"wget\", \"build-essential\"]", "dependencies = []")
            .replace("dependencies = [\"libfoo1\"]", "dependencies = []");
        parse_recipe(&raw, &dir.join("shape.toml")).unwrap()
    }

    const INSTALL: &str = r#"steps = ["mkdir -p $DESTDIR/usr/local/bin && cp daemon $DESTDIR/usr/local/bin/daemon"]"#;

    fn pipeline(temp: &TempDir) -> Pipeline {
        fs::create_dir_all(temp.path().join("pool")).unwrap();
        Pipeline::new(
            temp.path().join("work"),
            temp.path().join("images"),
            Arc::new(PackagePool::new(temp.path().join("pool"))),
        )
        .without_preflight()
    }

    #[test]
    fn test_build_publishes_archives_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let recipe = shape(&temp, "daemon", INSTALL);
        let pipeline = pipeline(&temp);

        let outcome = pipeline.build(&recipe).unwrap();
        assert!(matches!(outcome, AssembleOutcome::Published(_)));
        assert!(outcome
            .image()
            .rootfs()
            .join("usr/local/bin/daemon")
            .is_file());
        assert!(ImageStore::open(pipeline.images_dir())
            .unwrap()
            .get("daemon-1.2.3")
            .unwrap()
            .is_some());
        assert_eq!(
            fs::read_dir(temp.path().join("work/build")).unwrap().count(),
            0
        );

        let again = pipeline.build(&recipe).unwrap();
        assert!(matches!(again, AssembleOutcome::AlreadyBuilt(_)));
    }

    #[test]
    fn test_dry_run_build_publishes_nothing() {
        let temp = TempDir::new().unwrap();
        let recipe = shape(&temp, "daemon", INSTALL);
        let pipeline = pipeline(&temp).with_runner(Arc::new(DryRunRunner::new()));

        let err = pipeline.build(&recipe).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Selection { .. })
        ));
        assert!(!temp.path().join("images/daemon-1.2.3").exists());
    }

    #[test]
    fn test_build_many_isolates_failures() {
        let temp = TempDir::new().unwrap();
        let recipes = vec![
            shape(&temp, "alpha", INSTALL),
            shape(&temp, "broken", r#"steps = ["exit 7"]"#),
            shape(&temp, "gamma", INSTALL),
        ];

        let results = pipeline(&temp).build_many(&recipes, 3);

        let names: Vec<_> = results.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["alpha", "broken", "gamma"]);
        assert!(results[0].1.is_ok());
        assert!(matches!(
            results[1].1.as_ref().unwrap_err().downcast_ref::<PipelineError>(),
            Some(PipelineError::BuildStep { index: 1, .. })
        ));
        assert!(results[2].1.is_ok());
        assert!(!temp.path().join("images/broken-1.2.3").exists());
    }
}
