//! Entrypoint dispatcher: the one fixed command an instance runs on start.
//!
//! It reads the image manifest, checks the declared bindings (absent ones are
//! reported as degraded, never fatal) and invokes the declared binary with the
//! instance's arguments appended unmodified. The binary's exit status becomes
//! the instance's exit status. Nothing daemon-specific lives here.

use anyhow::Result;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use crate::build::filesystem::image_path;
use crate::error::{DegradedModeWarning, PipelineError};
use crate::manifest::ImageManifest;

/// Environment variable naming the image root (default `/`).
pub const IMAGE_ROOT_ENV: &str = "OBAKE_IMAGE_ROOT";

/// Exit code used when the entrypoint cannot be launched at all.
pub const LAUNCH_FAILURE_EXIT: i32 = 127;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    root: PathBuf,
    manifest: ImageManifest,
}

impl Dispatcher {
    /// Dispatcher for the image at `$OBAKE_IMAGE_ROOT`, or `/`.
    pub fn from_env() -> Result<Self> {
        let root = std::env::var_os(IMAGE_ROOT_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_manifest(&root)
    }

    pub fn from_manifest(root: &Path) -> Result<Self> {
        let manifest = ImageManifest::load(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            manifest,
        })
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// The wrapped daemon binary, resolved under the image root.
    pub fn binary(&self) -> PathBuf {
        image_path(&self.root, &self.manifest.entrypoint)
    }

    /// One warning per declared binding that is not present in this instance.
    pub fn check_bindings(&self) -> Vec<DegradedModeWarning> {
        let warnings: Vec<DegradedModeWarning> = self
            .manifest
            .bindings
            .iter()
            .filter(|binding| {
                !binding_present(&image_path(&self.root, &binding.target.display().to_string()))
            })
            .map(|binding| DegradedModeWarning {
                feature: binding.feature.clone(),
                path: binding.target.clone(),
            })
            .collect();
        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        warnings
    }

    fn launchable(&self) -> Result<PathBuf> {
        let binary = self.binary();
        let launch_error = |reason: &str| -> anyhow::Error {
            PipelineError::Launch {
                path: binary.clone(),
                reason: reason.to_string(),
            }
            .into()
        };
        let meta = fs::metadata(&binary).map_err(|_| launch_error("no such file"))?;
        if !meta.is_file() {
            return Err(launch_error("not a regular file"));
        }
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(launch_error("not executable"));
        }
        Ok(binary)
    }

    fn command<I, S>(&self, binary: &Path, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(binary);
        cmd.args(args);
        cmd
    }

    /// Run the daemon to completion and return its exit code.
    /// Death by signal N is reported as `128 + N`.
    pub fn run<I, S>(&self, args: I) -> Result<i32>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let binary = self.launchable()?;
        self.check_bindings();
        tracing::debug!(binary = %binary.display(), "launching");

        let status = self.command(&binary, args).status().map_err(|err| {
            anyhow::Error::from(PipelineError::Launch {
                path: binary.clone(),
                reason: err.to_string(),
            })
        })?;
        Ok(exit_code(&status))
    }

    /// Replace the current process with the daemon. Only returns on failure.
    pub fn exec<I, S>(&self, args: I) -> anyhow::Error
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        use std::os::unix::process::CommandExt;

        let binary = match self.launchable() {
            Ok(binary) => binary,
            Err(err) => return err,
        };
        self.check_bindings();
        tracing::debug!(binary = %binary.display(), "exec");

        let err = self.command(&binary, args).exec();
        PipelineError::Launch {
            path: binary,
            reason: err.to_string(),
        }
        .into()
    }
}

/// A binding counts as present when its target exists and is not an empty
/// directory (an unmounted mount point).
pub fn binding_present(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => path.exists(),
    }
}

/// Exit code of a finished process, shell style.
pub fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MANIFEST_FORMAT;
    use crate::recipe::{Binding, PinnedSource};
    use tempfile::TempDir;

    fn image(temp: &TempDir, script: &str) -> PathBuf {
        let root = temp.path().join("rootfs");
        let bin = root.join("usr/local/bin/daemon");
        fs::create_dir_all(bin.parent().unwrap()).unwrap();
        fs::write(&bin, script).unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
        fs::create_dir_all(root.join("run/udev")).unwrap();

        ImageManifest {
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
            bindings: vec![Binding {
                host: "/run/udev".into(),
                target: "/run/udev".into(),
                feature: "hotplug".into(),
            }],
            runtime_dependencies: vec![],
            fixups: vec![],
            files: vec![],
            artifact_digest: String::new(),
            built_at_utc: String::new(),
        }
        .write(&root)
        .unwrap();
        root
    }

    #[test]
    fn test_forwards_arguments_verbatim() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("args.txt");
        let root = image(
            &temp,
            &format!("#!/bin/sh\nfor a in \"$@\"; do echo \"$a\"; done > {}\n", out.display()),
        );

        let code = Dispatcher::from_manifest(&root)
            .unwrap()
            .run(["-u", "57110", "two words", ""])
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(fs::read_to_string(out).unwrap(), "-u\n57110\ntwo words\n\n");
    }

    #[test]
    fn test_exit_codes_propagate() {
        for (script, expected) in [
            ("#!/bin/sh\nexit 0\n", 0),
            ("#!/bin/sh\nexit 1\n", 1),
            ("#!/bin/sh\nkill -9 $$\n", 137),
        ] {
            let temp = TempDir::new().unwrap();
            let root = image(&temp, script);
            let code = Dispatcher::from_manifest(&root)
                .unwrap()
                .run(Vec::<String>::new())
                .unwrap();
            assert_eq!(code, expected, "script: {script}");
        }
    }

    #[test]
    fn test_missing_or_non_executable_binary_is_launch_error() {
        let temp = TempDir::new().unwrap();
        let root = image(&temp, "#!/bin/sh\n");
        let bin = root.join("usr/local/bin/daemon");
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o644)).unwrap();

        let dispatcher = Dispatcher::from_manifest(&root).unwrap();
        let err = dispatcher.run(["x"]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Launch { reason, .. }) if reason == "not executable"
        ));

        fs::remove_file(&bin).unwrap();
        assert!(dispatcher.run(["x"]).is_err());
    }

    #[test]
    fn test_absent_binding_is_degraded_not_fatal() {
        let temp = TempDir::new().unwrap();
        let root = image(&temp, "#!/bin/sh\nexit 0\n");
        let dispatcher = Dispatcher::from_manifest(&root).unwrap();

        let warnings = dispatcher.check_bindings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].feature, "hotplug");
        assert_eq!(dispatcher.run(Vec::<String>::new()).unwrap(), 0);

        fs::write(root.join("run/udev/control"), "").unwrap();
        assert!(dispatcher.check_bindings().is_empty());
    }
}
