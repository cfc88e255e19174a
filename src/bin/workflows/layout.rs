use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use obake::config::Config;
use obake::pipeline::Pipeline;

/// Host directories resolved from the config file.
pub(crate) struct Layout {
    pub(crate) config: Config,
    pub(crate) shapes_dir: PathBuf,
    pub(crate) images_dir: PathBuf,
    pub(crate) work_dir: PathBuf,
}

impl Layout {
    pub(crate) fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = Config::load(config_path).context("loading host configuration")?;
        tracing::debug!(path = %config.path.display(), "using configuration");
        Ok(Self {
            shapes_dir: config.shapes_dir(),
            images_dir: config.images_dir().to_path_buf(),
            work_dir: config.work_dir(),
            config,
        })
    }

    pub(crate) fn pipeline(&self) -> Result<Pipeline> {
        let installer = self.config.package_installer()?;
        tracing::debug!(installer = %installer.describe(), "runtime package installer");
        Ok(Pipeline::new(&self.work_dir, &self.images_dir, installer))
    }
}
