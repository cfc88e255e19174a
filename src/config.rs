//! Host configuration for the `obake` CLI.
//!
//! One TOML file describes where images, setups and shapes live, which audio
//! interfaces the host has, and how runtime packages are installed into images.
//!
//! # Config File Locations
//!
//! The first file found wins; nothing is merged:
//! 1. `--config <path>`
//! 2. `$OBAKE_CONFIG_FILE`
//! 3. `~/.config/obake/config.toml`
//! 4. `/etc/obake/config.toml`
//!
//! An explicit path (flag or environment) is the only candidate: if it does
//! not exist, loading fails instead of falling back to the defaults.
//!
//! # Example Config
//!
//! ```toml
//! [audio]
//! default-interface = "mixpre"
//!
//! [audio.interfaces.mixpre]
//! type = "jack"
//! unit = "jack@mixpre.service"
//! profile = "/etc/obake/interfaces/mixpre.conf"
//!
//! [data]
//! images-dir = "~/.local/share/obake/images"
//! setups-dir = "~/.config/obake/setups"
//! data-dir = "~/.local/share/obake"
//!
//! [packages]
//! kind = "command"
//! install = ["apt-get", "install", "-y", "-o", "RootDir={root}", "{packages}"]
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::packages::{CommandInstaller, PackageInstaller, PackagePool};

/// Environment variable naming an explicit config file.
pub const CONFIG_FILE_ENV: &str = "OBAKE_CONFIG_FILE";

const SYSTEM_CONFIG: &str = "/etc/obake/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file found; searched: {}", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to read config file {}: {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid config file {}: {message}", .path.display())]
    Invalid { path: PathBuf, message: String },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub audio: AudioConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub packages: PackagesConfig,
    /// File this config was read from.
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct AudioConfig {
    pub default_interface: String,
    #[serde(default)]
    pub interfaces: BTreeMap<String, AudioInterface>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioInterface {
    #[serde(rename = "type")]
    pub interface_type: String,
    /// systemd user unit that brings the interface up.
    pub unit: Option<String>,
    /// Driver profile (`KEY=value` text) read by the audio backend.
    pub profile: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DataConfig {
    pub images_dir: PathBuf,
    pub setups_dir: PathBuf,
    pub data_dir: PathBuf,
    pub shapes_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackagesConfig {
    #[serde(default)]
    pub kind: PackagesKind,
    /// Pool directory (`kind = "pool"`).
    pub dir: Option<PathBuf>,
    /// Installer argv template (`kind = "command"`).
    pub install: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagesKind {
    #[default]
    Pool,
    Command,
}

impl Config {
    /// Locate and load the host config.
    pub fn load(cli_path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_FILE_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::load_from_candidates(candidate_paths(cli_path, env_path, dirs::config_dir()))
    }

    fn load_from_candidates(candidates: Vec<PathBuf>) -> Result<Self, ConfigError> {
        let path = candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or(ConfigError::NotFound {
                searched: candidates.clone(),
            })?;
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path.display(), "loading configuration");
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&contents, path)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.path = path.to_path_buf();
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) {
        let data = &mut self.data;
        for p in [&mut data.images_dir, &mut data.setups_dir, &mut data.data_dir] {
            *p = expand_path(p);
        }
        for p in [&mut data.shapes_dir, &mut data.work_dir, &mut self.packages.dir]
            .into_iter()
            .flatten()
        {
            *p = expand_path(p);
        }
        for interface in self.audio.interfaces.values_mut() {
            if let Some(profile) = &mut interface.profile {
                *profile = expand_path(profile);
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            path: self.path.clone(),
            message,
        };
        if !self.audio.interfaces.is_empty()
            && !self.audio.interfaces.contains_key(&self.audio.default_interface)
        {
            return Err(invalid(format!(
                "default-interface '{}' is not listed under [audio.interfaces]",
                self.audio.default_interface
            )));
        }
        match self.packages.kind {
            PackagesKind::Pool if self.packages.install.is_some() => Err(invalid(
                "[packages] install is only valid with kind = \"command\"".into(),
            )),
            PackagesKind::Command if self.packages.install.is_none() => Err(invalid(
                "[packages] kind = \"command\" requires an install argv".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.data.images_dir
    }

    pub fn setups_dir(&self) -> &Path {
        &self.data.setups_dir
    }

    pub fn shapes_dir(&self) -> PathBuf {
        self.data
            .shapes_dir
            .clone()
            .unwrap_or_else(|| self.data.data_dir.join("shapes"))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.data
            .work_dir
            .clone()
            .unwrap_or_else(|| self.data.data_dir.join("work"))
    }

    pub fn default_audio_interface(&self) -> &str {
        &self.audio.default_interface
    }

    pub fn audio_interface(&self, name: &str) -> Option<&AudioInterface> {
        self.audio.interfaces.get(name)
    }

    /// Interface names, sorted.
    pub fn audio_interfaces(&self) -> Vec<&str> {
        self.audio.interfaces.keys().map(String::as_str).collect()
    }

    /// The installer that puts runtime packages into images.
    pub fn package_installer(&self) -> anyhow::Result<Arc<dyn PackageInstaller>> {
        Ok(match self.packages.kind {
            PackagesKind::Pool => {
                let dir = self
                    .packages
                    .dir
                    .clone()
                    .unwrap_or_else(|| self.data.data_dir.join("packages"));
                Arc::new(PackagePool::new(dir))
            }
            PackagesKind::Command => {
                let argv = self.packages.install.clone().unwrap_or_default();
                Arc::new(CommandInstaller::new(argv)?)
            }
        })
    }
}

/// Search order for the config file.
fn candidate_paths(
    cli_path: Option<&Path>,
    env_path: Option<PathBuf>,
    user_config_dir: Option<PathBuf>,
) -> Vec<PathBuf> {
    if let Some(path) = cli_path {
        return vec![path.to_path_buf()];
    }
    if let Some(path) = env_path {
        return vec![path];
    }
    let mut paths = Vec::new();
    paths.extend(user_config_dir.map(|d| d.join("obake/config.toml")));
    paths.push(PathBuf::from(SYSTEM_CONFIG));
    paths
}

/// Expand a leading `~/` to the home directory.
pub fn expand_path(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[audio]
default-interface = "mixpre"

[audio.interfaces.mixpre]
type = "jack"
unit = "jack@mixpre.service"
profile = "/etc/obake/interfaces/mixpre.conf"

[audio.interfaces.builtin]
type = "alsa"

[data]
images-dir = "/srv/obake/images"
setups-dir = "/srv/obake/setups"
data-dir = "/srv/obake"
"#;

    #[test]
    fn test_parse_and_defaults() {
        let config = Config::parse(SAMPLE, Path::new("config.toml")).unwrap();
        assert_eq!(config.default_audio_interface(), "mixpre");
        assert_eq!(config.audio_interfaces(), vec!["builtin", "mixpre"]);
        let mixpre = config.audio_interface("mixpre").unwrap();
        assert_eq!(mixpre.interface_type, "jack");
        assert_eq!(mixpre.unit.as_deref(), Some("jack@mixpre.service"));
        assert!(config.audio_interface("builtin").unwrap().unit.is_none());
        assert_eq!(config.shapes_dir(), PathBuf::from("/srv/obake/shapes"));
        assert_eq!(config.work_dir(), PathBuf::from("/srv/obake/work"));
        assert_eq!(config.packages.kind, PackagesKind::Pool);
        assert!(config
            .package_installer()
            .unwrap()
            .describe()
            .contains("/srv/obake/packages"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = SAMPLE.replace("data-dir", "data-directory");
        assert!(matches!(
            Config::parse(&raw, Path::new("c.toml")),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_default_interface_must_be_listed() {
        let raw = SAMPLE.replace("default-interface = \"mixpre\"", "default-interface = \"x\"");
        assert!(matches!(
            Config::parse(&raw, Path::new("c.toml")),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_command_installer_requires_argv() {
        let raw = format!("{SAMPLE}\n[packages]\nkind = \"command\"\n");
        assert!(Config::parse(&raw, Path::new("c.toml")).is_err());

        let raw = format!(
            "{SAMPLE}\n[packages]\nkind = \"command\"\ninstall = [\"inst\", \"--root\", \"{{root}}\", \"{{packages}}\"]\n"
        );
        let config = Config::parse(&raw, Path::new("c.toml")).unwrap();
        assert!(config.package_installer().is_ok());
    }

    #[test]
    fn test_candidate_order() {
        let cli = candidate_paths(Some(Path::new("/x.toml")), Some("/env.toml".into()), None);
        assert_eq!(cli, vec![PathBuf::from("/x.toml")]);

        let env = candidate_paths(None, Some("/env.toml".into()), Some("/home/u/.config".into()));
        assert_eq!(env, vec![PathBuf::from("/env.toml")]);

        let searched = candidate_paths(None, None, Some("/home/u/.config".into()));
        assert_eq!(
            searched,
            vec![
                PathBuf::from("/home/u/.config/obake/config.toml"),
                PathBuf::from(SYSTEM_CONFIG),
            ]
        );
    }

    #[test]
    fn test_missing_cli_path_lists_search() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.toml");
        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn test_missing_env_path_does_not_fall_back() {
        let temp = TempDir::new().unwrap();
        let user_dir = temp.path().join("xdg");
        std::fs::create_dir_all(user_dir.join("obake")).unwrap();
        std::fs::write(user_dir.join("obake/config.toml"), SAMPLE).unwrap();
        let missing = temp.path().join("does-not-exist.toml");

        let err = Config::load_from_candidates(candidate_paths(
            None,
            Some(missing.clone()),
            Some(user_dir.clone()),
        ))
        .unwrap_err();
        match err {
            ConfigError::NotFound { searched } => assert_eq!(searched, vec![missing]),
            other => panic!("expected NotFound, got {other:?}"),
        }

        let config =
            Config::load_from_candidates(candidate_paths(None, None, Some(user_dir.clone())))
                .unwrap();
        assert_eq!(config.path, user_dir.join("obake/config.toml"));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.path, path);
        assert_eq!(config.images_dir(), Path::new("/srv/obake/images"));
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path(Path::new("~/a/b")), home.join("a/b"));
        }
        assert_eq!(expand_path(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
