use std::env;
use std::fs;
use std::path::Path;

use git2::{DescribeFormatOptions, DescribeOptions, Repository, StatusOptions};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR");
    let version = match Repository::discover(&manifest_dir) {
        Ok(repo) => {
            // Only watch git state that exists; a missing path reruns every build.
            for name in ["HEAD", "index"] {
                let path = repo.path().join(name);
                if path.exists() {
                    println!("cargo:rerun-if-changed={}", path.display());
                }
            }
            describe(&repo).unwrap_or_else(|| "unknown".to_string())
        }
        Err(_) => "unknown".to_string(),
    };

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR");
    let dest_path = Path::new(&out_dir).join("version.rs");
    fs::write(&dest_path, format!("pub const VERSION: &str = {version:?};\n"))
        .expect("writing version.rs");
}

/// Nearest tag reachable from HEAD, else the short commit id, with `-dirty`
/// when tracked files differ from HEAD.
fn describe(repo: &Repository) -> Option<String> {
    let commit = repo.head().ok()?.peel_to_commit().ok()?;
    let dirty = is_dirty(repo);

    let mut format_opts = DescribeFormatOptions::new();
    format_opts.abbreviated_size(0);
    let tag = repo
        .describe(DescribeOptions::new().describe_tags())
        .and_then(|d| d.format(Some(&format_opts)))
        .ok();
    let base = match tag {
        Some(tag) => tag,
        None => commit.id().to_string()[..8].to_string(),
    };

    Some(if dirty { format!("{base}-dirty") } else { base })
}

fn is_dirty(repo: &Repository) -> bool {
    let mut opts = StatusOptions::new();
    opts.include_untracked(false).include_ignored(false);
    repo.statuses(Some(&mut opts))
        .map(|statuses| !statuses.is_empty())
        .unwrap_or(false)
}
