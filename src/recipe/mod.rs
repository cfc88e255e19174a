//! Shape recipes: the declarative input of the build pipeline.
//!
//! A recipe lives at `<shapes-dir>/<name>/shape.toml` and pins exactly one
//! upstream source, the ordered build steps, the closed artifact allow-list,
//! the runtime package list, runtime fixups, device bindings and the
//! entrypoint binary. Everything is validated eagerly at load time so that a
//! bad recipe fails before any fetch or build starts.

pub mod step;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use self::step::{BuildStep, StepToml};
use crate::select::allow_glob;

/// Recipe filename inside each shape directory.
pub const RECIPE_FILENAME: &str = "shape.toml";

/// A fully validated shape recipe.
#[derive(Debug, Clone)]
pub struct ShapeRecipe {
    pub name: String,
    pub version: String,
    pub source: PinnedSource,
    pub build: BuildSection,
    pub artifacts: ArtifactPolicy,
    pub runtime: RuntimeSection,
    pub entrypoint: EntrypointDecl,
    /// Directory the recipe was loaded from; relative source paths resolve here.
    pub recipe_dir: PathBuf,
}

/// Exact upstream reference. Moving branches are not expressible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PinnedSource {
    Tarball {
        url: String,
        sha256: String,
        strip_components: usize,
    },
    Git {
        url: String,
        commit: String,
        tag: Option<String>,
    },
}

impl PinnedSource {
    pub fn url(&self) -> &str {
        match self {
            PinnedSource::Tarball { url, .. } | PinnedSource::Git { url, .. } => url,
        }
    }

    /// The immutable part of the pin (checksum or commit).
    pub fn pin(&self) -> String {
        match self {
            PinnedSource::Tarball { sha256, .. } => format!("sha256:{}", sha256),
            PinnedSource::Git { commit, .. } => format!("commit:{}", commit),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildSection {
    pub dependencies: Vec<String>,
    pub steps: Vec<BuildStep>,
}

/// Closed allow-list of absolute path patterns copied into the runtime image.
#[derive(Debug, Clone, Default)]
pub struct ArtifactPolicy {
    pub allow: Vec<String>,
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeSection {
    pub base: Option<String>,
    pub dependencies: Vec<String>,
    pub fixups: Vec<Fixup>,
    pub bindings: Vec<Binding>,
}

/// Environment-specific runtime fix applied after packages and artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fixup {
    /// Create (or replace) a symlink, e.g. a library-name compatibility shim.
    Symlink { link: String, target: String },
    /// Move a path to another location inside the image.
    Rename { from: String, to: String },
    /// Write a small file.
    Write {
        path: String,
        content: String,
        mode: Option<u32>,
    },
    /// Textual patch: replace every occurrence of `find` in a file.
    Replace {
        path: String,
        find: String,
        replace: String,
    },
}

impl Fixup {
    fn paths(&self) -> Vec<&str> {
        match self {
            Fixup::Symlink { link, .. } => vec![link],
            Fixup::Rename { from, to } => vec![from, to],
            Fixup::Write { path, .. } | Fixup::Replace { path, .. } => vec![path],
        }
    }
}

/// Host resource that must be made visible to a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Binding {
    pub host: PathBuf,
    pub target: PathBuf,
    pub feature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrypointDecl {
    pub command: String,
}

impl ShapeRecipe {
    /// `<name>-<version>`, the published image identifier.
    pub fn image_id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Build-time dependencies that are not re-declared for runtime.
    pub fn build_only_dependencies(&self) -> Vec<&str> {
        self.build
            .dependencies
            .iter()
            .filter(|dep| !self.runtime.dependencies.contains(dep))
            .map(String::as_str)
            .collect()
    }

    /// Every path that must exist in the build output: the entrypoint plus
    /// the explicitly required artifacts.
    pub fn required_paths(&self) -> Vec<&str> {
        let mut paths = vec![self.entrypoint.command.as_str()];
        for path in &self.artifacts.required {
            if !paths.contains(&path.as_str()) {
                paths.push(path);
            }
        }
        paths
    }

    fn validate(&self) -> Result<()> {
        validate_segment(&self.name, "shape.name")?;
        validate_segment(&self.version, "shape.version")?;

        match &self.source {
            PinnedSource::Tarball { url, sha256, .. } => {
                if url.trim().is_empty() {
                    bail!("source.url must not be empty");
                }
                if !is_hex(sha256, 64) {
                    bail!(
                        "source.sha256 must be a 64-character hex digest for kind='tarball', got '{}'",
                        sha256
                    );
                }
            }
            PinnedSource::Git { url, commit, tag } => {
                if url.trim().is_empty() {
                    bail!("source.url must not be empty");
                }
                if !is_hex(commit, 40) {
                    bail!(
                        "source.commit must be a full 40-character commit hash for kind='git', got '{}'",
                        commit
                    );
                }
                if let Some(tag) = tag {
                    if tag.trim().is_empty() || tag.contains("..") || tag.starts_with('-') {
                        bail!("source.tag '{}' is not a valid tag name", tag);
                    }
                }
            }
        }

        if self.build.steps.is_empty() {
            bail!("build.steps must list at least one step");
        }

        if self.artifacts.allow.is_empty() {
            bail!("artifacts.allow must list at least one path pattern");
        }
        for pattern in &self.artifacts.allow {
            require_absolute(pattern, "artifacts.allow")?;
            allow_glob(pattern.trim_start_matches('/'))
                .with_context(|| format!("invalid artifacts.allow pattern '{}'", pattern))?;
        }
        for path in &self.artifacts.required {
            require_absolute(path, "artifacts.required")?;
        }

        for fixup in &self.runtime.fixups {
            for path in fixup.paths() {
                require_absolute(path, "runtime.fixups")?;
            }
        }
        for binding in &self.runtime.bindings {
            if !binding.host.is_absolute() || !binding.target.is_absolute() {
                bail!(
                    "runtime.bindings entry for feature '{}' must use absolute host and target paths",
                    binding.feature
                );
            }
            if binding.feature.trim().is_empty() {
                bail!("runtime.bindings entries must name the feature they enable");
            }
            require_absolute(&binding.host.to_string_lossy(), "runtime.bindings host")?;
            require_absolute(&binding.target.to_string_lossy(), "runtime.bindings target")?;
        }

        let command = self.entrypoint.command.trim();
        if command.split_whitespace().count() != 1 {
            bail!(
                "entrypoint.command must be a single binary path without default arguments, got '{}'",
                self.entrypoint.command
            );
        }
        require_absolute(command, "entrypoint.command")?;

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeToml {
    shape: ShapeToml,
    source: SourceToml,
    build: BuildToml,
    artifacts: ArtifactsToml,
    #[serde(default)]
    runtime: RuntimeToml,
    entrypoint: EntrypointDecl,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShapeToml {
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct SourceToml {
    kind: String,
    url: String,
    sha256: Option<String>,
    strip_components: Option<usize>,
    commit: Option<String>,
    tag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    #[serde(default)]
    dependencies: Vec<String>,
    steps: Vec<StepToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArtifactsToml {
    allow: Vec<String>,
    #[serde(default)]
    required: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeToml {
    base: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    fixups: Vec<Fixup>,
    #[serde(default)]
    bindings: Vec<Binding>,
}

fn parse_source(source: SourceToml, config_path: &Path) -> Result<PinnedSource> {
    match source.kind.trim().to_ascii_lowercase().as_str() {
        "tarball" => {
            let sha256 = source.sha256.ok_or_else(|| {
                anyhow::anyhow!(
                    "invalid recipe '{}': source.sha256 is required for kind='tarball'",
                    config_path.display()
                )
            })?;
            if source.commit.is_some() || source.tag.is_some() {
                bail!(
                    "invalid recipe '{}': source.commit/source.tag only apply to kind='git'",
                    config_path.display()
                );
            }
            Ok(PinnedSource::Tarball {
                url: source.url.trim().to_string(),
                sha256: sha256.trim().to_ascii_lowercase(),
                strip_components: source.strip_components.unwrap_or(1),
            })
        }
        "git" => {
            let commit = source.commit.ok_or_else(|| {
                anyhow::anyhow!(
                    "invalid recipe '{}': source.commit is required for kind='git'",
                    config_path.display()
                )
            })?;
            if source.sha256.is_some() || source.strip_components.is_some() {
                bail!(
                    "invalid recipe '{}': source.sha256/source.strip-components only apply to kind='tarball'",
                    config_path.display()
                );
            }
            Ok(PinnedSource::Git {
                url: source.url.trim().to_string(),
                commit: commit.trim().to_ascii_lowercase(),
                tag: source.tag.map(|t| t.trim().to_string()),
            })
        }
        other => bail!(
            "invalid recipe '{}': unsupported source.kind '{}' (expected 'tarball' or 'git')",
            config_path.display(),
            other
        ),
    }
}

/// Parse a recipe from TOML text. `recipe_dir` anchors relative source paths.
pub fn parse_recipe(raw: &str, recipe_path: &Path) -> Result<ShapeRecipe> {
    let parsed: RecipeToml = toml::from_str(raw)
        .with_context(|| format!("parsing shape recipe '{}'", recipe_path.display()))?;

    let source = parse_source(parsed.source, recipe_path)?;
    let steps = parsed
        .build
        .steps
        .into_iter()
        .enumerate()
        .map(|(index, step)| step.into_step(index))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("invalid build steps in '{}'", recipe_path.display()))?;

    let recipe = ShapeRecipe {
        name: parsed.shape.name.trim().to_string(),
        version: parsed.shape.version.trim().to_string(),
        source,
        build: BuildSection {
            dependencies: normalize_packages(parsed.build.dependencies),
            steps,
        },
        artifacts: ArtifactPolicy {
            allow: parsed.artifacts.allow,
            required: parsed.artifacts.required,
        },
        runtime: RuntimeSection {
            base: parsed.runtime.base,
            dependencies: normalize_packages(parsed.runtime.dependencies),
            fixups: parsed.runtime.fixups,
            bindings: parsed.runtime.bindings,
        },
        entrypoint: EntrypointDecl {
            command: parsed.entrypoint.command.trim().to_string(),
        },
        recipe_dir: recipe_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    recipe
        .validate()
        .with_context(|| format!("invalid shape recipe '{}'", recipe_path.display()))?;
    Ok(recipe)
}

/// Load and validate one recipe file.
pub fn load_recipe(path: &Path) -> Result<ShapeRecipe> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading shape recipe '{}'", path.display()))?;
    parse_recipe(&raw, path)
}

/// Load every `<dir>/<name>/shape.toml` under `shapes_dir`, sorted by name.
pub fn discover_recipes(shapes_dir: &Path) -> Result<Vec<ShapeRecipe>> {
    let entries = fs::read_dir(shapes_dir)
        .with_context(|| format!("reading shapes directory '{}'", shapes_dir.display()))?;

    let mut recipes = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| {
            format!("reading entry under shapes directory '{}'", shapes_dir.display())
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let recipe_path = path.join(RECIPE_FILENAME);
        if !recipe_path.is_file() {
            continue;
        }
        let Some(dir_name) = path.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        let recipe = load_recipe(&recipe_path)?;
        if recipe.name != dir_name {
            bail!(
                "shape recipe '{}' declares name '{}' but lives in directory '{}'",
                recipe_path.display(),
                recipe.name,
                dir_name
            );
        }
        recipes.push(recipe);
    }

    recipes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(recipes)
}

/// Find one recipe by shape name.
pub fn find_recipe(shapes_dir: &Path, name: &str) -> Result<ShapeRecipe> {
    validate_segment(name, "shape name")?;
    let path = shapes_dir.join(name).join(RECIPE_FILENAME);
    if !path.is_file() {
        bail!(
            "unknown shape '{}': no {} under '{}'",
            name,
            RECIPE_FILENAME,
            shapes_dir.join(name).display()
        );
    }
    load_recipe(&path)
}

fn normalize_packages(packages: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(packages.len());
    for package in packages {
        let package = package.trim().to_string();
        if !package.is_empty() && !out.contains(&package) {
            out.push(package);
        }
    }
    out
}

fn validate_segment(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{field} must not be empty");
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") || value.starts_with('.')
    {
        bail!("{field} must be a safe path segment, got '{}'", value);
    }
    if value.chars().any(char::is_whitespace) {
        bail!("{field} must not contain whitespace, got '{}'", value);
    }
    Ok(())
}

fn require_absolute(path: &str, field: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("{field} entries must be absolute paths, got '{}'", path);
    }
    if path.split('/').any(|part| part == "..") {
        bail!("{field} entry '{}' contains '..'", path);
    }
    Ok(())
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const SAMPLE: &str = r#"
[shape]
name = "daemon"
version = "1.2.3"

[source]
kind = "tarball"
url = "daemon-1.2.3.tar"
sha256 = "0000000000000000000000000000000000000000000000000000000000000000"

[build]
dependencies = ["wget", "build-essential"]
steps = ["fetch v1.2.3", "make", "make install"]

[artifacts]
allow = ["/usr/local/bin/daemon"]

[runtime]
dependencies = ["libfoo1"]

[entrypoint]
command = "/usr/local/bin/daemon"
"#;

    #[test]
    fn parses_sample_recipe() {
        let recipe = parse_recipe(SAMPLE, Path::new("shapes/daemon/shape.toml")).unwrap();
        assert_eq!(recipe.image_id(), "daemon-1.2.3");
        assert_eq!(recipe.build.steps.len(), 3);
        assert_eq!(recipe.build.steps[0].to_string(), "fetch v1.2.3");
        assert_eq!(recipe.runtime.dependencies, vec!["libfoo1"]);
        assert_eq!(recipe.build_only_dependencies(), vec!["wget", "build-essential"]);
        assert_eq!(recipe.required_paths(), vec!["/usr/local/bin/daemon"]);
        assert_eq!(recipe.recipe_dir, PathBuf::from("shapes/daemon"));
        assert!(matches!(
            recipe.source,
            PinnedSource::Tarball {
                strip_components: 1,
                ..
            }
        ));
    }

    #[test]
    fn tarball_requires_checksum() {
        let raw = SAMPLE.replace(
            "sha256 = \"0000000000000000000000000000000000000000000000000000000000000000\"\n",
            "",
        );
        let err = parse_recipe(&raw, Path::new("shape.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("source.sha256 is required"));
    }

    #[test]
    fn git_requires_full_commit() {
        let raw = SAMPLE
            .replace("kind = \"tarball\"", "kind = \"git\"")
            .replace(
                "sha256 = \"0000000000000000000000000000000000000000000000000000000000000000\"",
                "commit = \"main\"",
            );
        let err = parse_recipe(&raw, Path::new("shape.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("40-character commit hash"));
    }

    #[test]
    fn entrypoint_rejects_injected_arguments() {
        let raw = SAMPLE.replace(
            "command = \"/usr/local/bin/daemon\"",
            "command = \"/usr/local/bin/daemon -u 57110\"",
        );
        let err = parse_recipe(&raw, Path::new("shape.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("without default arguments"));
    }

    #[test]
    fn allow_list_must_be_absolute() {
        let raw = SAMPLE.replace(
            "allow = [\"/usr/local/bin/daemon\"]",
            "allow = [\"usr/local/bin/daemon\"]",
        );
        assert!(parse_recipe(&raw, Path::new("shape.toml")).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = SAMPLE.replace("[runtime]", "[runtime]\nprivileged = true");
        assert!(parse_recipe(&raw, Path::new("shape.toml")).is_err());
    }

    #[test]
    fn fixups_and_bindings_parse() {
        let raw = format!(
            "{}{}",
            SAMPLE.replace("[entrypoint]\ncommand = \"/usr/local/bin/daemon\"\n", ""),
            r#"fixups = [
  { kind = "symlink", link = "/usr/lib/libmonome.so.1", target = "libmonome.so.1.4" },
  { kind = "replace", path = "/etc/daemon.conf", find = "a", replace = "b" },
]
bindings = [{ host = "/run/udev", target = "/run/udev", feature = "hotplug" }]

[entrypoint]
command = "/usr/local/bin/daemon"
"#
        );
        let recipe = parse_recipe(&raw, Path::new("shape.toml")).unwrap();
        assert_eq!(recipe.runtime.fixups.len(), 2);
        assert_eq!(recipe.runtime.bindings[0].feature, "hotplug");
    }

    #[test]
    fn binding_target_cannot_climb_out_of_the_image() {
        let raw = SAMPLE.replace(
            "[runtime]",
            "[runtime]\nbindings = [{ host = \"/run/udev\", target = \"/../../etc\", feature = \"hotplug\" }]",
        );
        let err = parse_recipe(&raw, Path::new("shape.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("contains '..'"));
    }

    #[test]
    fn discover_sorts_and_checks_directory_names() {
        let temp = TempDir::new().unwrap();
        for name in ["zeta", "alpha"] {
            let dir = temp.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join(RECIPE_FILENAME),
                SAMPLE.replace("name = \"daemon\"", &format!("name = \"{name}\"")),
            )
            .unwrap();
        }
        fs::create_dir_all(temp.path().join("not-a-shape")).unwrap();

        let recipes = discover_recipes(temp.path()).unwrap();
        let names: Vec<_> = recipes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        let mismatched = temp.path().join("beta");
        fs::create_dir_all(&mismatched).unwrap();
        fs::write(mismatched.join(RECIPE_FILENAME), SAMPLE).unwrap();
        assert!(discover_recipes(temp.path()).is_err());
    }

    #[test]
    fn find_recipe_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        assert!(find_recipe(temp.path(), "../etc").is_err());
        assert!(find_recipe(temp.path(), "missing").is_err());
    }
}
