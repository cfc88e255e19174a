//! Setups: an audio interface plus an ordered list of shape instances.
//!
//! ```toml
//! [setup]
//! interface = "mixpre"
//! shapes = ["serialosc", "scsynth"]
//!
//! [shapes.serialosc]
//! image = "serialosc"
//! unit = "obake@serialosc.service"
//!
//! [shapes.serialosc.env]
//! OBAKE_BIND = "/run/udev:/run/udev"
//! ```
//!
//! Starting a setup brings the interface unit up first, then every listed
//! shape in order; stopping walks the shapes in reverse and takes the
//! interface down last.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::assemble::RuntimeImage;
use crate::config::Config;
use crate::entrypoint::binding_present;
use crate::error::DegradedModeWarning;
use crate::units::UnitControl;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupConfig {
    pub setup: SetupSection,
    #[serde(default)]
    pub shapes: BTreeMap<String, ShapeInstance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupSection {
    pub interface: String,
    pub shapes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShapeInstance {
    /// Image name or id; defaults to the shape's own name.
    pub image: Option<String>,
    /// systemd user unit running the instance.
    pub unit: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
}

impl SetupConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading setup");
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading setup {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing setup {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let setup: SetupConfig = toml::from_str(raw)?;
        for name in &setup.setup.shapes {
            if !setup.shapes.contains_key(name) {
                bail!("shape '{}' is listed in [setup] but has no [shapes.{}] table", name, name);
            }
        }
        Ok(setup)
    }

    pub fn shape(&self, name: &str) -> Option<&ShapeInstance> {
        self.shapes.get(name)
    }

    /// Shapes this setup starts, in start order.
    pub fn managed_shapes(&self) -> &[String] {
        &self.setup.shapes
    }

    fn image_name<'a>(&'a self, shape: &'a str) -> &'a str {
        self.shape(shape)
            .and_then(|s| s.image.as_deref())
            .unwrap_or(shape)
    }
}

/// Setup files (`*.toml`) in `setups_dir`, sorted.
pub fn list_setups(setups_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(setups_dir)
        .with_context(|| format!("reading setups directory {}", setups_dir.display()))?;
    let mut setups = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            setups.push(path);
        }
    }
    setups.sort();
    Ok(setups)
}

/// Resolve a setup argument: an existing path, or a name under `setups_dir`
/// with or without `.toml`.
pub fn resolve_setup(setups_dir: &Path, name: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.is_file() {
        return Ok(direct);
    }
    for candidate in [setups_dir.join(name), setups_dir.join(format!("{name}.toml"))] {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!("no setup '{}' (looked in {})", name, setups_dir.display())
}

/// A shape instance ready to start.
#[derive(Debug, Clone)]
pub struct ResolvedShape {
    pub name: String,
    pub image: RuntimeImage,
    pub unit: Option<String>,
    pub degraded: Vec<DegradedModeWarning>,
}

/// Check every listed shape against the published images before anything is
/// started. A missing image is an error; an absent host binding is a warning.
pub fn resolve_shapes(setup: &SetupConfig, images_dir: &Path) -> Result<Vec<ResolvedShape>> {
    setup
        .managed_shapes()
        .iter()
        .map(|name| {
            let image = RuntimeImage::find(images_dir, setup.image_name(name))
                .with_context(|| format!("resolving image for shape '{}'", name))?;
            let degraded = image
                .manifest
                .bindings
                .iter()
                .filter(|binding| !binding_present(&binding.host))
                .map(|binding| DegradedModeWarning {
                    feature: binding.feature.clone(),
                    path: binding.host.clone(),
                })
                .collect::<Vec<_>>();
            for warning in &degraded {
                tracing::warn!(shape = %name, "{warning}");
            }
            Ok(ResolvedShape {
                name: name.clone(),
                image,
                unit: setup.shape(name).and_then(|s| s.unit.clone()),
                degraded,
            })
        })
        .collect()
}

/// Interface unit first, then each shape's unit in order.
pub fn start_setup(
    config: &Config,
    setup: &SetupConfig,
    units: &dyn UnitControl,
) -> Result<Vec<ResolvedShape>> {
    let interface_name = &setup.setup.interface;
    let interface = config
        .audio_interface(interface_name)
        .with_context(|| format!("interface '{}' not found in configuration", interface_name))?;
    let shapes = resolve_shapes(setup, config.images_dir())?;

    match &interface.unit {
        Some(unit) => units
            .start(unit)
            .with_context(|| format!("starting interface '{}'", interface_name))?,
        None => tracing::info!(interface = %interface_name, "interface has no unit to start"),
    }

    for shape in &shapes {
        match &shape.unit {
            Some(unit) => units
                .start(unit)
                .with_context(|| format!("starting shape '{}'", shape.name))?,
            None => tracing::info!(shape = %shape.name, image = %shape.image.id, "shape has no unit to start"),
        }
    }
    Ok(shapes)
}

/// Shapes in reverse order, then the interface. Every unit gets a stop
/// attempt; failures are reported together at the end.
pub fn stop_setup(config: &Config, setup: &SetupConfig, units: &dyn UnitControl) -> Result<()> {
    let mut failures = Vec::new();

    for name in setup.managed_shapes().iter().rev() {
        if let Some(unit) = setup.shape(name).and_then(|s| s.unit.as_deref()) {
            if let Err(err) = units.stop(unit) {
                tracing::error!(shape = %name, "stop failed: {err:#}");
                failures.push(name.clone());
            }
        }
    }

    let interface_name = &setup.setup.interface;
    match config.audio_interface(interface_name) {
        Some(interface) => {
            if let Some(unit) = &interface.unit {
                if let Err(err) = units.stop(unit) {
                    tracing::error!(interface = %interface_name, "stop failed: {err:#}");
                    failures.push(interface_name.clone());
                }
            }
        }
        None => tracing::warn!(interface = %interface_name, "interface not found in configuration"),
    }

    if !failures.is_empty() {
        bail!("failed to stop: {}", failures.join(", "));
    }
    Ok(())
}
