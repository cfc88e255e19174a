#![allow(dead_code)]

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use obake::fetch::sha256_file;
use obake::packages::PackagePool;
use obake::pipeline::Pipeline;
use obake::recipe::{parse_recipe, ShapeRecipe};
use tempfile::TempDir;

const FETCH: &str = "#!/bin/sh\necho \"$1\" > .fetched\n";

const MAKE: &str = r#"#!/bin/sh
set -e
case "$1" in
  "")
    cp daemon.in daemon
    chmod 755 daemon
    ;;
  install)
    test -f .fetched
    mkdir -p "$DESTDIR/usr/local/bin" "$DESTDIR/usr/local/share/doc/daemon" "$DESTDIR/usr/include"
    cp daemon "$DESTDIR/usr/local/bin/daemon"
    echo docs > "$DESTDIR/usr/local/share/doc/daemon/README"
    echo '#define DAEMON 1' > "$DESTDIR/usr/include/daemon.h"
    ;;
  *)
    echo "no rule to make target '$1'" >&2
    exit 2
    ;;
esac
"#;

const DAEMON: &str = r#"#!/bin/sh
for a in "$@"; do echo "arg:$a"; done
case "${DAEMON_EXIT:-0}" in
  kill) kill -9 $$ ;;
  *) exit "${DAEMON_EXIT:-0}" ;;
esac
"#;

pub const RECIPE: &str = r#"
[shape]
name = "daemon"
version = "1.2.3"

[source]
kind = "tarball"
url = "daemon-1.2.3.tar"
sha256 = "@SHA@"

[build]
dependencies = ["wget", "build-essential"]
steps = ["fetch v1.2.3", "make", "make install"]

[artifacts]
allow = ["/usr/local/bin/daemon"]

[runtime]
dependencies = ["libfoo1"]

[[runtime.bindings]]
host = "/run/udev"
target = "/run/udev"
feature = "hotplug"

[entrypoint]
command = "/usr/local/bin/daemon"
"#;

/// A host with a package pool and one shape directory.
pub struct Fixture {
    pub temp: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let fixture = Self { temp };
        fixture.package("wget", "usr/bin/fetch", FETCH, 0o755);
        fixture.package("build-essential", "usr/bin/make", MAKE, 0o755);
        fixture.package("libfoo1", "usr/lib/libfoo.so.1", "libfoo\n", 0o644);
        fixture.tarball();
        fixture
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn shape_dir(&self) -> PathBuf {
        self.root().join("shapes/daemon")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root().join("images")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root().join("work")
    }

    fn package(&self, name: &str, rel: &str, content: &str, mode: u32) {
        let path = self.root().join("pool").join(name).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    fn tarball(&self) {
        fs::create_dir_all(self.shape_dir()).unwrap();
        let file = File::create(self.shape_dir().join("daemon-1.2.3.tar")).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(DAEMON.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder
            .append_data(&mut header, "daemon-1.2.3/daemon.in", DAEMON.as_bytes())
            .unwrap();
        builder.finish().unwrap();
    }

    /// The recipe text with the real checksum filled in.
    pub fn recipe_text(&self) -> String {
        let (sha, _) = sha256_file(&self.shape_dir().join("daemon-1.2.3.tar")).unwrap();
        RECIPE.replace("@SHA@", &sha)
    }

    pub fn recipe(&self) -> ShapeRecipe {
        self.recipe_with(|raw| raw)
    }

    pub fn recipe_with(&self, edit: impl FnOnce(String) -> String) -> ShapeRecipe {
        let raw = edit(self.recipe_text());
        let path = self.shape_dir().join("shape.toml");
        fs::write(&path, &raw).unwrap();
        parse_recipe(&raw, &path).unwrap()
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.work_dir(),
            self.images_dir(),
            Arc::new(PackagePool::new(self.root().join("pool"))),
        )
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        // Published images are read-only.
        let _ = obake::build::filesystem::remove_tree(&self.images_dir());
    }
}
